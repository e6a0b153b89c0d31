//! Chat commands: parsing a prefixed line into a [`Command`] and running it.
//!
//! Front ends (the Telegram poller, the control API) build a
//! [`CommandContext`] describing who spoke where and hand the raw line to
//! [`CommandRouter::dispatch`], which returns the replies to send back.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex_lite::Regex;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::BotConfig;
use crate::corpus::{CorpusStore, LinkPool, NameDirectory, ServerDirectory};
use crate::database::{BotDatabase, ChannelList, PermissionChange};
use crate::deathmatch::Deathmatch;
use crate::fun;
use crate::markov::MarkovChain;
use crate::names::{generate_nick, page_names, parse_names, remove_mentions, INCLUSIVE_TAG, REFLEXIVE_TAG};
use crate::roster::SpeakerRoster;
use crate::simulator::SimulatorHandle;

const MAX_MULTI: usize = 10;

/// Who issued a command, and where.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    pub community_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_name: String,
    pub is_admin: bool,
    /// Ids of the community's members, when the front end knows them. Name
    /// lookups are restricted to these.
    pub members: Option<HashSet<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Markov {
        person: String,
        root: Option<String>,
        count: usize,
    },
    NotANumber(String),
    List {
        search: Option<String>,
    },
    Toggle {
        server: Option<String>,
    },
    ToggleMarkov,
    LinkMe,
    Ship(Vec<String>),
    ShipAll {
        word: String,
        bottom: bool,
    },
    Snap {
        name: Option<String>,
    },
    Deathmatch {
        first: String,
        second: String,
        bet: Option<u64>,
    },
    ToggleSim,
    SetSim {
        channels: Vec<String>,
    },
    ListChannels,
    AddChannels {
        list: ChannelList,
        channels: Vec<String>,
    },
    RemoveChannels {
        list: ChannelList,
        channels: Vec<String>,
    },
}

impl Command {
    /// Parse a chat line. Lines without the prefix, unknown commands and
    /// commands missing a required argument yield `None`.
    pub fn parse(prefix: &str, line: &str) -> Option<Command> {
        let body = line.trim().strip_prefix(prefix)?;
        let mut args = body.split_whitespace();
        let name = args.next()?.to_lowercase();
        let args: Vec<&str> = args.collect();
        let arg = |i: usize| args.get(i).map(|s| s.to_string());
        let person = |i: usize| arg(i).unwrap_or_else(|| REFLEXIVE_TAG.to_string());

        let command = match name.as_str() {
            "do" | "mk" => Command::Markov {
                person: person(0),
                root: arg(1),
                count: 1,
            },
            "do10" => Command::Markov {
                person: person(0),
                root: arg(1),
                count: MAX_MULTI,
            },
            "domulti" => match args.first() {
                None => Command::Markov {
                    person: REFLEXIVE_TAG.to_string(),
                    root: None,
                    count: 1,
                },
                Some(raw) => match raw.parse::<i64>() {
                    Ok(n) => Command::Markov {
                        person: person(1),
                        root: arg(2),
                        count: n.clamp(1, MAX_MULTI as i64) as usize,
                    },
                    Err(_) => Command::NotANumber(raw.to_string()),
                },
            },
            "list" => Command::List { search: arg(0) },
            "toggle" => Command::Toggle {
                server: (!args.is_empty()).then(|| args.join(" ")),
            },
            "togglemarkov" => Command::ToggleMarkov,
            "linkme" | "randlink" | "lonk" => Command::LinkMe,
            "ship" => Command::Ship(args.iter().map(|s| s.to_string()).collect()),
            "shipall" => Command::ShipAll {
                word: arg(0)?,
                bottom: args.len() > 1,
            },
            "snap" => Command::Snap {
                name: (!args.is_empty()).then(|| args.join(" ")),
            },
            "deathmatch" => Command::Deathmatch {
                first: arg(0)?,
                second: arg(1)?,
                bet: args.get(2).and_then(|raw| raw.parse().ok()),
            },
            "togglesim" => Command::ToggleSim,
            "setsim" | "setsimulator" => Command::SetSim {
                channels: channel_ids(&args),
            },
            "listchannels" => Command::ListChannels,
            "addwhitelist" => Command::AddChannels {
                list: ChannelList::Whitelist,
                channels: channel_ids(&args),
            },
            "addblacklist" => Command::AddChannels {
                list: ChannelList::Blacklist,
                channels: channel_ids(&args),
            },
            "removewhitelist" => Command::RemoveChannels {
                list: ChannelList::Whitelist,
                channels: channel_ids(&args),
            },
            "removeblacklist" => Command::RemoveChannels {
                list: ChannelList::Blacklist,
                channels: channel_ids(&args),
            },
            _ => return None,
        };
        Some(command)
    }

    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::ToggleSim
                | Command::SetSim { .. }
                | Command::ListChannels
                | Command::AddChannels { .. }
                | Command::RemoveChannels { .. }
        )
    }
}

fn channel_regex() -> &'static Regex {
    static CHANNEL: OnceLock<Regex> = OnceLock::new();
    CHANNEL.get_or_init(|| Regex::new(r"^<#(\d+)>$").expect("channel regex is valid"))
}

/// Channel ids from `<#id>` mentions or bare numeric ids. Anything else is
/// ignored.
fn channel_ids(args: &[&str]) -> Vec<String> {
    args.iter()
        .filter_map(|arg| {
            if let Some(caps) = channel_regex().captures(arg) {
                return caps.get(1).map(|id| id.as_str().to_string());
            }
            let bare = arg.trim_start_matches('-');
            (!bare.is_empty() && bare.chars().all(|c| c.is_ascii_digit())).then(|| arg.to_string())
        })
        .collect()
}

fn channel_mention(channel_id: &str) -> String {
    format!("<#{}>", channel_id)
}

#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub prefix: String,
    pub default_name: String,
    pub max_markov_attempts: usize,
    pub max_message_length: usize,
    pub max_nickname_length: usize,
    pub max_num_names: usize,
}

impl CommandSettings {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            prefix: config.command_prefix.clone(),
            default_name: config.default_name.clone(),
            max_markov_attempts: config.max_markov_attempts.max(1),
            max_message_length: config.max_message_length,
            max_nickname_length: config.max_nickname_length,
            max_num_names: config.max_num_names,
        }
    }
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self::from_config(&BotConfig::default())
    }
}

pub struct CommandRouter {
    settings: CommandSettings,
    db: Arc<BotDatabase>,
    store: Arc<CorpusStore>,
    names: Arc<NameDirectory>,
    servers: Arc<ServerDirectory>,
    roster: Arc<dyn SpeakerRoster>,
    links: LinkPool,
    deathmatch: Option<Deathmatch>,
    simulator: Option<SimulatorHandle>,
    rng: Mutex<StdRng>,
}

impl CommandRouter {
    pub fn new(
        settings: CommandSettings,
        db: Arc<BotDatabase>,
        store: Arc<CorpusStore>,
        names: Arc<NameDirectory>,
        servers: Arc<ServerDirectory>,
        roster: Arc<dyn SpeakerRoster>,
    ) -> Self {
        Self {
            settings,
            db,
            store,
            names,
            servers,
            roster,
            links: LinkPool::default(),
            deathmatch: None,
            simulator: None,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_links(mut self, links: LinkPool) -> Self {
        self.links = links;
        self
    }

    pub fn with_deathmatch(mut self, deathmatch: Deathmatch) -> Self {
        self.deathmatch = Some(deathmatch);
        self
    }

    pub fn with_simulator(mut self, simulator: SimulatorHandle) -> Self {
        self.simulator = Some(simulator);
        self
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.settings.prefix
    }

    /// Run one chat line and return the replies. Failures are logged and
    /// reported back as a single reply.
    pub fn dispatch(&self, ctx: &CommandContext, line: &str) -> Vec<String> {
        let Some(command) = Command::parse(&self.settings.prefix, line) else {
            return Vec::new();
        };
        tracing::debug!("Command from {} in {}: {:?}", ctx.author_id, ctx.channel_id, command);

        match self.execute(ctx, command) {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!("Command '{}' failed: {:#}", line.trim(), e);
                vec![format!("Command failed: {}", e)]
            }
        }
    }

    fn execute(&self, ctx: &CommandContext, command: Command) -> Result<Vec<String>> {
        if command.requires_admin() {
            if !ctx.is_admin {
                return Ok(vec![
                    "You need to manage this community to use that command.".to_string(),
                ]);
            }
        } else if !self.db.has_post_permission(&ctx.community_id, &ctx.channel_id)? {
            tracing::debug!("No post permission in channel {}", ctx.channel_id);
            return Ok(Vec::new());
        }

        match command {
            Command::Markov {
                person,
                root,
                count,
            } => self.markov(ctx, &person, root.as_deref(), count),
            Command::NotANumber(raw) => Ok(vec![format!("{} is not a number.", raw)]),
            Command::List { search } => Ok(self.list(ctx, search.as_deref())),
            Command::Toggle { server } => self.toggle_server(ctx, server.as_deref()),
            Command::ToggleMarkov => {
                let enabled = self.db.toggle_markov(&ctx.author_id)?;
                Ok(vec![if enabled {
                    "Your messages will be used in Markov chains.".to_string()
                } else {
                    "Your messages will no longer be used in Markov chains.".to_string()
                }])
            }
            Command::LinkMe => {
                let mut rng = self.rng();
                Ok(vec![self
                    .links
                    .random(&mut *rng)
                    .unwrap_or("No links.")
                    .to_string()])
            }
            Command::Ship(args) => Ok(match args.as_slice() {
                [other] => vec![fun::ship_message(&ctx.author_name, other)],
                [first, second] => vec![fun::ship_message(first, second)],
                _ => Vec::new(),
            }),
            Command::ShipAll { word, bottom } => {
                let names = self.member_names(ctx);
                if names.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![fun::ship_all(&word, &names, bottom)])
            }
            Command::Snap { name } => Ok(vec![fun::snap(
                name.as_deref().unwrap_or(&ctx.author_name),
            )]),
            Command::Deathmatch { first, second, bet } => {
                let Some(deathmatch) = &self.deathmatch else {
                    return Ok(vec!["Deathmatch is unavailable.".to_string()]);
                };
                let mut rng = self.rng();
                let result = deathmatch.fight(&first, &second, bet, &mut *rng);
                tracing::debug!("Deathmatch {} vs {} won by {}", first, second, result.winner);
                Ok(vec![result.transcript().to_string()])
            }
            Command::ToggleSim => Ok(vec![self.toggle_simulation()?]),
            Command::SetSim { channels } => {
                let Some(channel) = channels.first() else {
                    return Ok(Vec::new());
                };
                self.db.set_simulation_channel(&ctx.community_id, channel)?;
                tracing::info!("Simulation channel for {} set to {}", ctx.community_id, channel);
                Ok(vec![format!(
                    "{} set as simulation channel.",
                    channel_mention(channel)
                )])
            }
            Command::ListChannels => Ok(vec![self.list_channels(&ctx.community_id)?]),
            Command::AddChannels { list, channels } => {
                if channels.is_empty() {
                    return Ok(Vec::new());
                }
                for channel in &channels {
                    if self.db.add_channel(&ctx.community_id, list, channel)?
                        == PermissionChange::AlreadyPresent
                    {
                        tracing::debug!("{} already on the {}", channel, list.label());
                    }
                }
                Ok(vec![format!(
                    "{} added to {}!",
                    join_mentions(&channels),
                    list.label()
                )])
            }
            Command::RemoveChannels { list, channels } => {
                if channels.is_empty() {
                    return Ok(Vec::new());
                }
                let mut removed = Vec::new();
                for channel in channels {
                    if self.db.remove_channel(&ctx.community_id, list, &channel)?
                        == PermissionChange::Removed
                    {
                        removed.push(channel);
                    }
                }
                if removed.is_empty() {
                    return Ok(vec![format!("No channels were removed from {}!", list.label())]);
                }
                Ok(vec![format!(
                    "{} removed from {}!",
                    join_mentions(&removed),
                    list.label()
                )])
            }
        }
    }

    fn rng(&self) -> std::sync::MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─── Markov ───────────────────────────────────────────────────────────

    fn markov(
        &self,
        ctx: &CommandContext,
        person: &str,
        root: Option<&str>,
        count: usize,
    ) -> Result<Vec<String>> {
        let ids = {
            let mut rng = self.rng();
            parse_names(
                person,
                &ctx.author_id,
                ctx.members.as_ref(),
                &self.names,
                self.settings.max_num_names,
                &mut *rng,
            )
        };
        let ids = match ids {
            Ok(ids) => ids,
            Err(e) => return Ok(vec![e.to_string()]),
        };

        let (mut nick, text) = self.generate_markov(ctx, &ids, root, count)?;
        if person.eq_ignore_ascii_case(INCLUSIVE_TAG) && nick != self.settings.default_name {
            nick = fun::title_case(
                self.servers
                    .name_of(&ctx.community_id)
                    .unwrap_or(&self.settings.default_name),
            );
        }
        let text = remove_mentions(&text, self.roster.as_ref());
        Ok(vec![format!("**{}**: {}", nick, text)])
    }

    /// Returns the nickname to post under and the generated text.
    fn generate_markov(
        &self,
        ctx: &CommandContext,
        ids: &[String],
        root: Option<&str>,
        count: usize,
    ) -> Result<(String, String)> {
        let Some(chain) = self.load_model_for(ctx, ids)? else {
            return Ok((self.settings.default_name.clone(), "No output.".to_string()));
        };

        let mut rng = self.rng();
        let sentences: Vec<String> = (0..count)
            .filter_map(|_| self.generate_sentence(&chain, root, &mut rng))
            .collect();
        if sentences.is_empty() {
            return Ok((
                self.settings.default_name.clone(),
                "Insufficient data for Markov chain.".to_string(),
            ));
        }

        let nick = generate_nick(ids, &self.names, self.settings.max_nickname_length);
        Ok((nick, sentences.join("\n")))
    }

    fn generate_sentence(
        &self,
        chain: &MarkovChain,
        root: Option<&str>,
        rng: &mut StdRng,
    ) -> Option<String> {
        let tries = self.settings.max_markov_attempts;
        match root {
            Some(root) => chain.make_sentence_with_start(root, rng, tries),
            None => chain.make_sentence(rng, tries),
        }
    }

    /// Combine every model of the given users across the servers each has
    /// toggled on. Users with nothing toggled use the current community.
    fn load_model_for(&self, ctx: &CommandContext, ids: &[String]) -> Result<Option<MarkovChain>> {
        let mut chains = Vec::new();
        for id in ids {
            if !self.db.markov_enabled(id)? {
                tracing::debug!("{} has opted out of Markov chains", id);
                continue;
            }
            let mut servers = self.db.user_servers(id)?;
            if servers.is_empty() {
                servers.push(ctx.community_id.clone());
            }
            if let Some(chain) = self.store.load_combined(std::slice::from_ref(id), &servers)? {
                chains.push(chain);
            }
        }
        Ok(MarkovChain::combine(&chains))
    }

    // ─── Names and servers ────────────────────────────────────────────────

    fn member_names(&self, ctx: &CommandContext) -> Vec<String> {
        self.names
            .entries()
            .filter(|(id, _)| ctx.members.as_ref().map_or(true, |m| m.contains(*id)))
            .map(|(_, name)| name.to_string())
            .collect()
    }

    fn list(&self, ctx: &CommandContext, search: Option<&str>) -> Vec<String> {
        let names = self.member_names(ctx);
        let pages = page_names(&names, search, self.settings.max_message_length);
        if pages.is_empty() {
            return vec!["No names found.".to_string()];
        }
        pages
    }

    fn toggle_server(&self, ctx: &CommandContext, server: Option<&str>) -> Result<Vec<String>> {
        let Some(server) = server else {
            return Ok(vec![self.list_servers(&ctx.author_id)?]);
        };
        let Some(server_id) = self.servers.id_for(server) else {
            return Ok(vec![format!(
                "{} is not a valid server. Type `{}toggle` to see a list of valid servers.",
                server, self.settings.prefix
            )]);
        };
        let added = self.db.toggle_server(&ctx.author_id, server_id)?;
        Ok(vec![if added {
            format!("{} added to list of your Markov servers.", server)
        } else {
            format!("{} removed from list of your Markov servers.", server)
        }])
    }

    fn list_servers(&self, user_id: &str) -> Result<String> {
        let toggled = self.db.user_servers(user_id)?;
        let mut out = "List of MarkovBot Servers:\n".to_string();
        for (server_id, name) in self.servers.entries() {
            if !self.store.has_model(server_id, user_id) {
                continue;
            }
            if toggled.contains(server_id) {
                out.push_str(&format!("**{}**\n", name));
            } else {
                out.push_str(name);
                out.push('\n');
            }
        }
        out.push_str(&format!(
            "**Bolded** servers have been toggled on. To toggle a specific server, type `{}toggle <server>`.",
            self.settings.prefix
        ));
        Ok(out)
    }

    // ─── Admin ────────────────────────────────────────────────────────────

    fn toggle_simulation(&self) -> Result<String> {
        let Some(simulator) = &self.simulator else {
            return Ok("The simulator is not running.".to_string());
        };
        if simulator.switch.is_on() {
            simulator.switch.set(false);
            tracing::info!("Simulation stopped by command");
            return Ok("Simulation ended.".to_string());
        }
        if self
            .db
            .get_simulation_channel(&simulator.community_id())?
            .is_none()
        {
            return Ok(format!(
                "No channel set for simulation. Please set the channel using `{}setsim [channel mention]`",
                self.settings.prefix
            ));
        }
        simulator.switch.set(true);
        tracing::info!("Simulation started by command");
        Ok("Simulation started.".to_string())
    }

    fn list_channels(&self, community_id: &str) -> Result<String> {
        let permissions = self.db.list_permissions(community_id)?;
        let render = |channels: &[String]| {
            if channels.is_empty() {
                "(none)".to_string()
            } else {
                join_mentions(channels)
            }
        };
        Ok(format!(
            "Whitelist: {}\nBlacklist: {}\nSimulation: {}",
            render(&permissions.whitelist),
            render(&permissions.blacklist),
            permissions
                .simulation_channel
                .as_deref()
                .map(channel_mention)
                .unwrap_or_else(|| "(none)".to_string())
        ))
    }
}

fn join_mentions(channels: &[String]) -> String {
    channels
        .iter()
        .map(|c| channel_mention(c))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::DirectoryRoster;
    use crate::simulator::SimulationSwitch;
    use tempfile::TempDir;

    const CORPUS: &str = "the cat sat on the mat\n\
                          the dog sat on the rug\n\
                          a cat ran to the dog\n\
                          the bird sat on a cat\n";

    struct Fixture {
        _dir: TempDir,
        db: Arc<BotDatabase>,
        router: CommandRouter,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = CorpusStore::new(dir.path().join("models"), dir.path().join("messages"));
        let chain = MarkovChain::from_corpus(CORPUS, 2).with_overlap_check(false);
        store.save_model("guild", "1", &chain).unwrap();
        store.save_model("other", "2", &chain).unwrap();

        let names = NameDirectory::parse("1;Alice\n2;Bob\n3;Carol\n");
        let servers = ServerDirectory::parse("guild;Guild Town\nother;Elsewhere\n");
        let roster = DirectoryRoster::new(&names, &[]);
        let db = Arc::new(BotDatabase::in_memory().unwrap());
        let router = CommandRouter::new(
            CommandSettings::default(),
            db.clone(),
            Arc::new(store),
            Arc::new(names),
            Arc::new(servers),
            Arc::new(roster),
        )
        .with_links(LinkPool::parse("https://example.com/a\n"))
        .with_rng(StdRng::seed_from_u64(11));
        Fixture {
            _dir: dir,
            db,
            router,
        }
    }

    fn ctx() -> CommandContext {
        CommandContext {
            community_id: "guild".to_string(),
            channel_id: "chan".to_string(),
            author_id: "1".to_string(),
            author_name: "alice".to_string(),
            is_admin: false,
            members: None,
        }
    }

    fn admin() -> CommandContext {
        CommandContext {
            is_admin: true,
            ..ctx()
        }
    }

    #[test]
    fn parse_recognises_aliases_and_defaults() {
        assert_eq!(
            Command::parse("$", "$mk"),
            Some(Command::Markov {
                person: "me".to_string(),
                root: None,
                count: 1
            })
        );
        assert_eq!(
            Command::parse("$", "$domulti 50 bob hello"),
            Some(Command::Markov {
                person: "bob".to_string(),
                root: Some("hello".to_string()),
                count: 10
            })
        );
        assert_eq!(
            Command::parse("$", "$domulti x"),
            Some(Command::NotANumber("x".to_string()))
        );
        assert_eq!(
            Command::parse("$", "$setsim <#42>"),
            Some(Command::SetSim {
                channels: vec!["42".to_string()]
            })
        );
        assert_eq!(Command::parse("$", "hello"), None);
        assert_eq!(Command::parse("$", "$nonsense"), None);
        assert_eq!(Command::parse("$", "$shipall"), None);
    }

    #[test]
    fn admin_commands_are_flagged() {
        assert!(Command::ToggleSim.requires_admin());
        assert!(Command::ListChannels.requires_admin());
        assert!(!Command::LinkMe.requires_admin());
    }

    #[test]
    fn do_generates_attributed_text() {
        let f = fixture();
        let replies = f.router.dispatch(&ctx(), "$do alice");
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("**Alice**: "), "{}", replies[0]);
    }

    #[test]
    fn do10_produces_ten_lines() {
        let f = fixture();
        let replies = f.router.dispatch(&ctx(), "$do10 alice");
        assert_eq!(replies[0].lines().count(), 10);
    }

    #[test]
    fn do_without_model_reports_no_output() {
        let f = fixture();
        let replies = f.router.dispatch(&ctx(), "$do carol");
        assert_eq!(replies, vec!["**MarkovBot**: No output.".to_string()]);
    }

    #[test]
    fn do_uses_toggled_servers() {
        let f = fixture();
        // Bob only has a model in "other".
        assert_eq!(
            f.router.dispatch(&ctx(), "$do bob"),
            vec!["**MarkovBot**: No output.".to_string()]
        );
        f.db.toggle_server("2", "other").unwrap();
        assert!(f.router.dispatch(&ctx(), "$do bob")[0].starts_with("**Bob**: "));
    }

    #[test]
    fn do_reports_name_errors() {
        let f = fixture();
        assert_eq!(
            f.router.dispatch(&ctx(), "$do zed"),
            vec!["Name not found zed.".to_string()]
        );
        assert_eq!(
            f.router.dispatch(&ctx(), "$do a+b+c+d+e+f"),
            vec!["Too many inputs (6).".to_string()]
        );
    }

    #[test]
    fn opted_out_users_produce_no_output() {
        let f = fixture();
        let replies = f.router.dispatch(&ctx(), "$togglemarkov");
        assert!(replies[0].contains("no longer"));
        assert_eq!(
            f.router.dispatch(&ctx(), "$do"),
            vec!["**MarkovBot**: No output.".to_string()]
        );
    }

    #[test]
    fn blacklisted_channel_gets_no_reply() {
        let f = fixture();
        f.db
            .add_channel("guild", ChannelList::Blacklist, "chan")
            .unwrap();
        assert!(f.router.dispatch(&ctx(), "$snap").is_empty());
        // Admin commands still work there.
        assert!(!f.router.dispatch(&admin(), "$listchannels").is_empty());
    }

    #[test]
    fn admin_commands_require_admin() {
        let f = fixture();
        let replies = f.router.dispatch(&ctx(), "$addwhitelist <#5>");
        assert!(replies[0].contains("manage this community"));
        assert!(f.db.list_permissions("guild").unwrap().whitelist.is_empty());
    }

    #[test]
    fn whitelist_round_trip() {
        let f = fixture();
        assert_eq!(
            f.router.dispatch(&admin(), "$addwhitelist <#5> 6"),
            vec!["<#5>, <#6> added to whitelist!".to_string()]
        );
        assert_eq!(
            f.router.dispatch(&admin(), "$removewhitelist <#6> <#7>"),
            vec!["<#6> removed from whitelist!".to_string()]
        );
        assert_eq!(
            f.router.dispatch(&admin(), "$removewhitelist <#7>"),
            vec!["No channels were removed from whitelist!".to_string()]
        );
        let listing = f.router.dispatch(&admin(), "$listchannels");
        assert_eq!(
            listing,
            vec!["Whitelist: <#5>\nBlacklist: (none)\nSimulation: (none)".to_string()]
        );
    }

    #[test]
    fn togglesim_needs_a_channel() {
        let f = fixture();
        let switch = SimulationSwitch::new(false);
        let router = f
            .router
            .with_simulator(SimulatorHandle::detached("guild", switch.clone()));

        let replies = router.dispatch(&admin(), "$togglesim");
        assert!(replies[0].starts_with("No channel set for simulation."));
        assert!(!switch.is_on());

        router.dispatch(&admin(), "$setsim <#99>");
        assert_eq!(
            router.dispatch(&admin(), "$togglesim"),
            vec!["Simulation started.".to_string()]
        );
        assert!(switch.is_on());
        assert_eq!(
            router.dispatch(&admin(), "$togglesim"),
            vec!["Simulation ended.".to_string()]
        );
        assert!(!switch.is_on());
    }

    #[test]
    fn toggle_lists_and_flips_servers() {
        let f = fixture();
        let listing = f.router.dispatch(&ctx(), "$toggle");
        assert!(listing[0].contains("Guild Town\n"));
        assert!(!listing[0].contains("Elsewhere"));

        assert_eq!(
            f.router.dispatch(&ctx(), "$toggle guild town"),
            vec!["guild town added to list of your Markov servers.".to_string()]
        );
        assert!(f.router.dispatch(&ctx(), "$toggle")[0].contains("**Guild Town**"));
        assert!(f.router.dispatch(&ctx(), "$toggle nowhere")[0].contains("not a valid server"));
    }

    #[test]
    fn fun_commands_reply() {
        let f = fixture();
        assert!(f.router.dispatch(&ctx(), "$ship bob")[0].contains("`alice`"));
        assert!(f.router.dispatch(&ctx(), "$ship a b c").is_empty());
        assert!(f.router.dispatch(&ctx(), "$snap")[0].starts_with("Alice, you were"));
        assert_eq!(
            f.router.dispatch(&ctx(), "$linkme"),
            vec!["https://example.com/a".to_string()]
        );
        assert_eq!(
            f.router.dispatch(&ctx(), "$deathmatch a b"),
            vec!["Deathmatch is unavailable.".to_string()]
        );
        let list = f.router.dispatch(&ctx(), "$list")[0].clone();
        assert_eq!(list, "Alice, Bob, Carol");
    }
}
