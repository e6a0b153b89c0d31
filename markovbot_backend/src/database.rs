use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// Which per-community channel list an entry belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelList {
    Whitelist,
    Blacklist,
}

impl ChannelList {
    fn as_db_str(self) -> &'static str {
        match self {
            ChannelList::Whitelist => "white",
            ChannelList::Blacklist => "black",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChannelList::Whitelist => "whitelist",
            ChannelList::Blacklist => "blacklist",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommunityPermissions {
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub simulation_channel: Option<String>,
}

/// Result of adding or removing a channel list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionChange {
    Added,
    AlreadyPresent,
    Removed,
    NotPresent,
}

const MARKOV_OPTION_KEY: &str = "markov";

/// Persistent bot state: channel permissions, the simulator output channel and
/// per-user options.
pub struct BotDatabase {
    conn: Mutex<Connection>,
}

impl BotDatabase {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS channel_permissions (
                community_id TEXT NOT NULL,
                list_kind TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                added_at TEXT NOT NULL,
                PRIMARY KEY (community_id, list_kind, channel_id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS simulation_channels (
                community_id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS user_servers (
                user_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                PRIMARY KEY (user_id, server_id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS user_options (
                user_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (user_id, key)
            )"#,
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // Channel permissions
    // ========================================================================

    pub fn add_channel(
        &self,
        community_id: &str,
        list: ChannelList,
        channel_id: &str,
    ) -> Result<PermissionChange> {
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO channel_permissions (community_id, list_kind, channel_id, added_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                community_id,
                list.as_db_str(),
                channel_id,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(if inserted > 0 {
            PermissionChange::Added
        } else {
            PermissionChange::AlreadyPresent
        })
    }

    pub fn remove_channel(
        &self,
        community_id: &str,
        list: ChannelList,
        channel_id: &str,
    ) -> Result<PermissionChange> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM channel_permissions
             WHERE community_id = ?1 AND list_kind = ?2 AND channel_id = ?3",
            params![community_id, list.as_db_str(), channel_id],
        )?;
        Ok(if removed > 0 {
            PermissionChange::Removed
        } else {
            PermissionChange::NotPresent
        })
    }

    /// Remove every entry of one list. Returns how many were dropped.
    pub fn clear_list(&self, community_id: &str, list: ChannelList) -> Result<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM channel_permissions WHERE community_id = ?1 AND list_kind = ?2",
            params![community_id, list.as_db_str()],
        )?;
        Ok(removed)
    }

    fn list_channels(&self, community_id: &str, list: ChannelList) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT channel_id FROM channel_permissions
             WHERE community_id = ?1 AND list_kind = ?2
             ORDER BY added_at ASC, channel_id ASC",
        )?;
        let channels = stmt
            .query_map(params![community_id, list.as_db_str()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(channels)
    }

    pub fn list_permissions(&self, community_id: &str) -> Result<CommunityPermissions> {
        Ok(CommunityPermissions {
            whitelist: self.list_channels(community_id, ChannelList::Whitelist)?,
            blacklist: self.list_channels(community_id, ChannelList::Blacklist)?,
            simulation_channel: self.get_simulation_channel(community_id)?,
        })
    }

    /// A blacklisted channel is always denied. A non-empty whitelist denies
    /// every channel it does not name.
    pub fn has_post_permission(&self, community_id: &str, channel_id: &str) -> Result<bool> {
        let permissions = self.list_permissions(community_id)?;
        if permissions.blacklist.iter().any(|c| c == channel_id) {
            return Ok(false);
        }
        if !permissions.whitelist.is_empty()
            && !permissions.whitelist.iter().any(|c| c == channel_id)
        {
            return Ok(false);
        }
        Ok(true)
    }

    // ========================================================================
    // Simulation channel
    // ========================================================================

    pub fn get_simulation_channel(&self, community_id: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT channel_id FROM simulation_channels WHERE community_id = ?1",
            [community_id],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_simulation_channel(&self, community_id: &str, channel_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO simulation_channels (community_id, channel_id, updated_at)
             VALUES (?1, ?2, ?3)",
            params![community_id, channel_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ========================================================================
    // User options
    // ========================================================================

    pub fn user_servers(&self, user_id: &str) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT server_id FROM user_servers WHERE user_id = ?1 ORDER BY server_id ASC",
        )?;
        let servers = stmt
            .query_map([user_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(servers)
    }

    /// Flip a server in the user's model selection. Returns `true` if it was added.
    pub fn toggle_server(&self, user_id: &str, server_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM user_servers WHERE user_id = ?1 AND server_id = ?2",
            params![user_id, server_id],
        )?;
        if removed > 0 {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO user_servers (user_id, server_id) VALUES (?1, ?2)",
            params![user_id, server_id],
        )?;
        Ok(true)
    }

    fn get_user_option(&self, user_id: &str, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT value FROM user_options WHERE user_id = ?1 AND key = ?2",
            params![user_id, key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_user_option(&self, user_id: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO user_options (user_id, key, value) VALUES (?1, ?2, ?3)",
            params![user_id, key, value],
        )?;
        Ok(())
    }

    /// Whether the user allows their corpus to be used. Defaults to enabled.
    pub fn markov_enabled(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .get_user_option(user_id, MARKOV_OPTION_KEY)?
            .map(|value| value != "false")
            .unwrap_or(true))
    }

    /// Flip the markov opt-in flag. Returns the new value.
    pub fn toggle_markov(&self, user_id: &str) -> Result<bool> {
        let enabled = !self.markov_enabled(user_id)?;
        self.set_user_option(
            user_id,
            MARKOV_OPTION_KEY,
            if enabled { "true" } else { "false" },
        )?;
        Ok(enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn temp_db() -> (tempfile::TempDir, BotDatabase) {
        let dir = tempdir().expect("tempdir");
        let db = BotDatabase::new(dir.path().join("markovbot.db")).expect("db init");
        (dir, db)
    }

    #[test]
    fn empty_lists_allow_every_channel() {
        let (_dir, db) = temp_db();
        assert!(db.has_post_permission("guild", "general").unwrap());
    }

    #[test]
    fn blacklist_denies_channel() {
        let (_dir, db) = temp_db();
        db.add_channel("guild", ChannelList::Blacklist, "spam")
            .unwrap();
        assert!(!db.has_post_permission("guild", "spam").unwrap());
        assert!(db.has_post_permission("guild", "general").unwrap());
    }

    #[test]
    fn whitelist_restricts_to_listed_channels() {
        let (_dir, db) = temp_db();
        db.add_channel("guild", ChannelList::Whitelist, "bots")
            .unwrap();
        assert!(db.has_post_permission("guild", "bots").unwrap());
        assert!(!db.has_post_permission("guild", "general").unwrap());
        assert!(db.has_post_permission("other-guild", "general").unwrap());
    }

    #[test]
    fn blacklist_wins_over_whitelist() {
        let (_dir, db) = temp_db();
        db.add_channel("guild", ChannelList::Whitelist, "bots")
            .unwrap();
        db.add_channel("guild", ChannelList::Blacklist, "bots")
            .unwrap();
        assert!(!db.has_post_permission("guild", "bots").unwrap());
    }

    #[test]
    fn add_and_remove_report_changes() {
        let (_dir, db) = temp_db();
        assert_eq!(
            db.add_channel("g", ChannelList::Whitelist, "c").unwrap(),
            PermissionChange::Added
        );
        assert_eq!(
            db.add_channel("g", ChannelList::Whitelist, "c").unwrap(),
            PermissionChange::AlreadyPresent
        );
        assert_eq!(
            db.remove_channel("g", ChannelList::Whitelist, "c").unwrap(),
            PermissionChange::Removed
        );
        assert_eq!(
            db.remove_channel("g", ChannelList::Whitelist, "c").unwrap(),
            PermissionChange::NotPresent
        );
    }

    #[test]
    fn clear_list_only_touches_one_list() {
        let (_dir, db) = temp_db();
        db.add_channel("g", ChannelList::Whitelist, "a").unwrap();
        db.add_channel("g", ChannelList::Whitelist, "b").unwrap();
        db.add_channel("g", ChannelList::Blacklist, "c").unwrap();
        assert_eq!(db.clear_list("g", ChannelList::Whitelist).unwrap(), 2);
        let permissions = db.list_permissions("g").unwrap();
        assert!(permissions.whitelist.is_empty());
        assert_eq!(permissions.blacklist, vec!["c".to_string()]);
    }

    #[test]
    fn simulation_channel_round_trips_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("markovbot.db");
        {
            let db = BotDatabase::new(&path).unwrap();
            assert_eq!(db.get_simulation_channel("g").unwrap(), None);
            db.set_simulation_channel("g", "sim-1").unwrap();
            db.set_simulation_channel("g", "sim-2").unwrap();
        }
        let reopened = BotDatabase::new(&path).unwrap();
        assert_eq!(
            reopened.get_simulation_channel("g").unwrap(),
            Some("sim-2".to_string())
        );
    }

    #[test]
    fn toggle_server_flips_membership() {
        let db = BotDatabase::in_memory().unwrap();
        assert!(db.toggle_server("u", "s1").unwrap());
        assert!(db.toggle_server("u", "s2").unwrap());
        assert_eq!(db.user_servers("u").unwrap(), vec!["s1", "s2"]);
        assert!(!db.toggle_server("u", "s1").unwrap());
        assert_eq!(db.user_servers("u").unwrap(), vec!["s2"]);
    }

    #[test]
    fn markov_flag_defaults_on_and_toggles() {
        let db = BotDatabase::in_memory().unwrap();
        assert!(db.markov_enabled("u").unwrap());
        assert!(!db.toggle_markov("u").unwrap());
        assert!(!db.markov_enabled("u").unwrap());
        assert!(db.toggle_markov("u").unwrap());
    }
}
