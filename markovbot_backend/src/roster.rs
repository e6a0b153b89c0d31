use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::corpus::NameDirectory;

/// Everything the simulator needs to impersonate one community member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerProfile {
    pub id: String,
    pub display_name: String,
    /// Names that count as a mention of this speaker in generated text.
    pub aliases: Vec<String>,
    pub avatar_url: Option<String>,
}

pub trait SpeakerRoster: Send + Sync {
    fn resolve(&self, speaker_id: &str) -> Option<SpeakerProfile>;
    fn profiles(&self) -> Vec<SpeakerProfile>;
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BotEntry {
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

/// Roster built from the name directory, minus ignored users, optionally
/// enriched with per-speaker aliases and avatars from `bots.json`:
///
/// ```json
/// { "1234": { "names": ["alice", "Al"], "avatar_url": "https://..." } }
/// ```
#[derive(Debug, Clone, Default)]
pub struct DirectoryRoster {
    profiles: BTreeMap<String, SpeakerProfile>,
}

impl DirectoryRoster {
    pub fn new(names: &NameDirectory, ignore_users: &[String]) -> Self {
        let ignored: HashSet<&str> = ignore_users.iter().map(String::as_str).collect();
        let profiles = names
            .entries()
            .filter(|(id, _)| !ignored.contains(id))
            .map(|(id, name)| {
                (
                    id.to_string(),
                    SpeakerProfile {
                        id: id.to_string(),
                        display_name: name.to_string(),
                        aliases: vec![name.to_string()],
                        avatar_url: None,
                    },
                )
            })
            .collect();
        Self { profiles }
    }

    /// Apply `bots.json` overrides. A missing file leaves the roster unchanged.
    pub fn with_profiles_file(mut self, path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(self),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let entries: BTreeMap<String, BotEntry> = serde_json::from_str(raw.trim_start_matches('\u{feff}'))
            .with_context(|| format!("Invalid speaker profiles in {}", path.display()))?;
        self.apply_entries(entries);
        Ok(self)
    }

    fn apply_entries(&mut self, entries: BTreeMap<String, BotEntry>) {
        for (id, entry) in entries {
            let Some(profile) = self.profiles.get_mut(&id) else {
                continue;
            };
            let aliases: Vec<String> = entry
                .names
                .into_iter()
                .filter(|name| !name.trim().is_empty())
                .collect();
            if !aliases.is_empty() {
                profile.aliases = aliases;
            }
            if entry.avatar_url.is_some() {
                profile.avatar_url = entry.avatar_url;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl SpeakerRoster for DirectoryRoster {
    fn resolve(&self, speaker_id: &str) -> Option<SpeakerProfile> {
        self.profiles.get(speaker_id).cloned()
    }

    fn profiles(&self) -> Vec<SpeakerProfile> {
        self.profiles.values().cloned().collect()
    }
}
