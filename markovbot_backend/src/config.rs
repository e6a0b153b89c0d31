use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

pub const DEBUG_POST_AVG_SECS: f64 = 25.0;
pub const DEBUG_POST_STDDEV_SECS: f64 = 10.0;
pub const DEBUG_EMBED_RATE: f64 = 0.9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Community whose members and models are simulated.
    #[serde(default)]
    pub community_id: String,
    /// Output channel. When unset, the one stored in the database is used.
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default = "default_post_avg_secs")]
    pub post_avg_secs: f64,
    #[serde(default = "default_post_stddev_secs")]
    pub post_stddev_secs: f64,
    /// Fraction of posts that carry an image embed, 0.0..=1.0.
    #[serde(default = "default_embed_rate")]
    pub embed_rate: f64,
    #[serde(default = "default_topic_reset_interval")]
    pub topic_reset_interval: u64,
    #[serde(default = "default_topic_attempts")]
    pub topic_attempts: usize,
    #[serde(default = "default_max_consecutive_skips")]
    pub max_consecutive_skips: usize,
    #[serde(default = "default_max_fill_attempts")]
    pub max_fill_attempts: usize,
    #[serde(default = "default_max_failed_generations")]
    pub max_failed_generations: usize,
    #[serde(default)]
    pub ignore_users: Vec<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_true")]
    pub start_enabled: bool,
    /// Use short delays and frequent embeds for testing against a live channel.
    #[serde(default)]
    pub debug_values: bool,
}

fn default_post_avg_secs() -> f64 {
    1800.0
}

fn default_post_stddev_secs() -> f64 {
    900.0
}

fn default_embed_rate() -> f64 {
    0.04
}

fn default_topic_reset_interval() -> u64 {
    20
}

fn default_topic_attempts() -> usize {
    3
}

fn default_max_consecutive_skips() -> usize {
    50
}

fn default_max_fill_attempts() -> usize {
    25
}

fn default_max_failed_generations() -> usize {
    3
}

fn default_true() -> bool {
    true
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            community_id: String::new(),
            channel_id: None,
            post_avg_secs: default_post_avg_secs(),
            post_stddev_secs: default_post_stddev_secs(),
            embed_rate: default_embed_rate(),
            topic_reset_interval: default_topic_reset_interval(),
            topic_attempts: default_topic_attempts(),
            max_consecutive_skips: default_max_consecutive_skips(),
            max_fill_attempts: default_max_fill_attempts(),
            max_failed_generations: default_max_failed_generations(),
            ignore_users: Vec::new(),
            webhook_url: None,
            start_enabled: true,
            debug_values: false,
        }
    }
}

impl SimulatorConfig {
    /// Swap in the debug pacing preset.
    pub fn apply_debug_values(&mut self) {
        self.post_avg_secs = DEBUG_POST_AVG_SECS;
        self.post_stddev_secs = DEBUG_POST_STDDEV_SECS;
        self.embed_rate = DEBUG_EMBED_RATE;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_messages_dir")]
    pub messages_dir: String,
    #[serde(default = "default_models_dir")]
    pub models_dir: String,
    #[serde(default = "default_server_json_dir")]
    pub server_json_dir: String,
    #[serde(default = "default_names_file")]
    pub names_file: String,
    #[serde(default = "default_servers_file")]
    pub servers_file: String,
    #[serde(default = "default_links_file")]
    pub links_file: String,
    #[serde(default = "default_deathmatch_file")]
    pub deathmatch_file: String,
    #[serde(default = "default_profiles_file")]
    pub profiles_file: String,
    #[serde(default = "default_sim_model_file")]
    pub sim_model_file: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default = "default_name")]
    pub default_name: String,
    #[serde(default = "default_max_markov_attempts")]
    pub max_markov_attempts: usize,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "default_max_nickname_length")]
    pub max_nickname_length: usize,
    #[serde(default = "default_max_num_names")]
    pub max_num_names: usize,

    #[serde(default)]
    pub simulator: SimulatorConfig,
}

fn default_messages_dir() -> String {
    "messages".to_string()
}

fn default_models_dir() -> String {
    "models".to_string()
}

fn default_server_json_dir() -> String {
    "server_json".to_string()
}

fn default_names_file() -> String {
    "names.txt".to_string()
}

fn default_servers_file() -> String {
    "servers.txt".to_string()
}

fn default_links_file() -> String {
    "links.txt".to_string()
}

fn default_deathmatch_file() -> String {
    "deathmatch.txt".to_string()
}

fn default_profiles_file() -> String {
    "bots.json".to_string()
}

fn default_sim_model_file() -> String {
    "sim_model.json".to_string()
}

fn default_database_path() -> String {
    "markovbot.db".to_string()
}

fn default_command_prefix() -> String {
    "$".to_string()
}

fn default_name() -> String {
    "MarkovBot".to_string()
}

fn default_max_markov_attempts() -> usize {
    10
}

fn default_max_message_length() -> usize {
    1800
}

fn default_max_nickname_length() -> usize {
    30
}

fn default_max_num_names() -> usize {
    5
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            messages_dir: default_messages_dir(),
            models_dir: default_models_dir(),
            server_json_dir: default_server_json_dir(),
            names_file: default_names_file(),
            servers_file: default_servers_file(),
            links_file: default_links_file(),
            deathmatch_file: default_deathmatch_file(),
            profiles_file: default_profiles_file(),
            sim_model_file: default_sim_model_file(),
            database_path: default_database_path(),
            command_prefix: default_command_prefix(),
            default_name: default_name(),
            max_markov_attempts: default_max_markov_attempts(),
            max_message_length: default_max_message_length(),
            max_nickname_length: default_max_nickname_length(),
            max_num_names: default_max_num_names(),
            simulator: SimulatorConfig::default(),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
}

impl BotConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("markovbot_config.toml")
    }

    /// Load config from markovbot_config.toml (next to executable), then apply
    /// environment overrides.
    pub fn load() -> Self {
        let path = Self::config_path();

        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<BotConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file found, using defaults + env vars");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults plus environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let sim = &mut self.simulator;

        if let Some(id) = lookup("MARKOVBOT_COMMUNITY_ID") {
            if !id.trim().is_empty() {
                sim.community_id = id.trim().to_string();
            }
        }

        if let Some(id) = lookup("MARKOVBOT_CHANNEL_ID") {
            if !id.trim().is_empty() {
                sim.channel_id = Some(id.trim().to_string());
            }
        }

        if let Some(url) = lookup("MARKOVBOT_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                sim.webhook_url = Some(url.trim().to_string());
            }
        }

        if let Some(enabled) = lookup("MARKOVBOT_DEBUG") {
            sim.debug_values = parse_flag(&enabled);
        }
        if sim.debug_values {
            sim.apply_debug_values();
        }

        // Explicit values win over the debug preset.
        if let Some(avg) = lookup("MARKOVBOT_POST_AVG") {
            if let Ok(seconds) = avg.trim().parse() {
                sim.post_avg_secs = seconds;
            }
        }

        if let Some(stddev) = lookup("MARKOVBOT_POST_STDDEV") {
            if let Ok(seconds) = stddev.trim().parse() {
                sim.post_stddev_secs = seconds;
            }
        }

        if let Some(rate) = lookup("MARKOVBOT_EMBED_RATE") {
            if let Ok(rate) = rate.trim().parse() {
                sim.embed_rate = rate;
            }
        }

        if let Some(path) = lookup("MARKOVBOT_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }
    }

    /// Reject settings the simulator cannot run with.
    pub fn validate(&self) -> Result<()> {
        let sim = &self.simulator;
        if !(0.0..=1.0).contains(&sim.embed_rate) {
            anyhow::bail!("Embed rate must be between 0 and 1 (got {})", sim.embed_rate);
        }
        if !(sim.post_avg_secs > 0.0) {
            anyhow::bail!("Post average must be positive (got {})", sim.post_avg_secs);
        }
        if !sim.post_stddev_secs.is_finite() || sim.post_stddev_secs < 0.0 {
            anyhow::bail!(
                "Post standard deviation must be a non-negative number (got {})",
                sim.post_stddev_secs
            );
        }
        if sim.max_fill_attempts == 0 {
            anyhow::bail!("max_fill_attempts must be at least 1");
        }
        if self.command_prefix.trim().is_empty() {
            anyhow::bail!("Command prefix must not be empty");
        }
        Ok(())
    }
}
