//! On-disk corpora, chain models and the plain-text directories that describe
//! who and where they belong to.
//!
//! Layout under the configured roots:
//!
//! ```text
//! messages/<community>/<speaker>.txt   one message per line
//! models/<community>/<speaker>.json    serialized MarkovChain
//! names.txt                            id;display name
//! servers.txt                          id;server name
//! links.txt                            one URL per line
//! ```

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::markov::{MarkovChain, SentenceGenerator};

/// Reads and writes per-speaker chain models.
#[derive(Debug, Clone)]
pub struct CorpusStore {
    models_dir: PathBuf,
    messages_dir: PathBuf,
}

impl CorpusStore {
    pub fn new(models_dir: impl Into<PathBuf>, messages_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            messages_dir: messages_dir.into(),
        }
    }

    pub fn model_path(&self, community_id: &str, speaker_id: &str) -> PathBuf {
        self.models_dir
            .join(community_id)
            .join(format!("{}.json", speaker_id))
    }

    pub fn corpus_path(&self, community_id: &str, speaker_id: &str) -> PathBuf {
        self.messages_dir
            .join(community_id)
            .join(format!("{}.txt", speaker_id))
    }

    /// A missing model file is `Ok(None)`; an unreadable or corrupt one is an error.
    pub fn load_model(&self, community_id: &str, speaker_id: &str) -> Result<Option<MarkovChain>> {
        let path = self.model_path(community_id, speaker_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read model {}", path.display()))
            }
        };
        let chain = MarkovChain::from_json(&raw)
            .with_context(|| format!("Corrupt model {}", path.display()))?;
        Ok(Some(chain))
    }

    pub fn save_model(&self, community_id: &str, speaker_id: &str, chain: &MarkovChain) -> Result<PathBuf> {
        let path = self.model_path(community_id, speaker_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, chain.to_json()?)
            .with_context(|| format!("Failed to write model {}", path.display()))?;
        Ok(path)
    }

    pub fn has_model(&self, community_id: &str, speaker_id: &str) -> bool {
        self.model_path(community_id, speaker_id).is_file()
    }

    /// Speaker ids that have a model in the community, sorted.
    pub fn list_speakers(&self, community_id: &str) -> Result<Vec<String>> {
        let dir = self.models_dir.join(community_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", dir.display()))
            }
        };

        let mut speakers = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                speakers.push(stem.to_string());
            }
        }
        speakers.sort();
        Ok(speakers)
    }

    /// Load every available model for the speakers across the communities and
    /// merge them. Returns `None` when nothing was found.
    pub fn load_combined(
        &self,
        speaker_ids: &[String],
        community_ids: &[String],
    ) -> Result<Option<MarkovChain>> {
        let mut chains = Vec::new();
        for community_id in community_ids {
            for speaker_id in speaker_ids {
                if let Some(chain) = self.load_model(community_id, speaker_id)? {
                    chains.push(chain);
                }
            }
        }
        Ok(MarkovChain::combine(&chains))
    }
}

/// Loads a speaker's generator for one community.
pub trait ModelSource: Send + Sync {
    fn load_generator(
        &self,
        community_id: &str,
        speaker_id: &str,
    ) -> Result<Option<Box<dyn SentenceGenerator>>>;
}

impl ModelSource for CorpusStore {
    fn load_generator(
        &self,
        community_id: &str,
        speaker_id: &str,
    ) -> Result<Option<Box<dyn SentenceGenerator>>> {
        Ok(self
            .load_model(community_id, speaker_id)?
            .map(|chain| Box::new(chain) as Box<dyn SentenceGenerator>))
    }
}

/// Parse `id;value` lines. Blank and malformed lines are skipped.
fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim_start_matches('\u{feff}').trim_end();
            let (id, value) = line.split_once(';')?;
            let id = id.trim();
            if id.is_empty() {
                return None;
            }
            Some((id.to_string(), value.to_string()))
        })
        .collect()
}

fn read_optional(path: &Path, what: &str) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("{} file {} not found; starting empty", what, path.display());
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Maps user ids to display names (`names.txt`).
#[derive(Debug, Clone, Default)]
pub struct NameDirectory {
    names: BTreeMap<String, String>,
}

impl NameDirectory {
    pub fn parse(raw: &str) -> Self {
        Self {
            names: parse_pairs(raw).into_iter().collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(read_optional(path, "Names")?
            .map(|raw| Self::parse(&raw))
            .unwrap_or_default())
    }

    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.names.contains_key(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.names.iter().map(|(id, name)| (id.as_str(), name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn random_id<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        let ids: Vec<&String> = self.names.keys().collect();
        ids.choose(rng).map(|id| id.as_str())
    }

    /// Add entries for ids not seen yet. Existing names are kept. Returns how
    /// many ids were new.
    pub fn merge<I>(&mut self, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut added = 0;
        for (id, name) in entries {
            if !self.names.contains_key(&id) {
                self.names.insert(id, name);
                added += 1;
            }
        }
        added
    }

    pub fn to_file_contents(&self) -> String {
        let mut out = String::new();
        for (id, name) in &self.names {
            out.push_str(id);
            out.push(';');
            out.push_str(name);
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_file_contents())
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

/// Known server ids and names (`servers.txt`).
#[derive(Debug, Clone, Default)]
pub struct ServerDirectory {
    servers: Vec<(String, String)>,
}

impl ServerDirectory {
    pub fn parse(raw: &str) -> Self {
        Self {
            servers: parse_pairs(raw),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(read_optional(path, "Servers")?
            .map(|raw| Self::parse(&raw))
            .unwrap_or_default())
    }

    /// Resolve a server by id or case-insensitive name.
    pub fn id_for(&self, name_or_id: &str) -> Option<&str> {
        let wanted = name_or_id.trim();
        self.servers
            .iter()
            .find(|(id, name)| id == wanted || name.eq_ignore_ascii_case(wanted))
            .map(|(id, _)| id.as_str())
    }

    pub fn is_server(&self, name_or_id: &str) -> bool {
        self.id_for(name_or_id).is_some()
    }

    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.servers
            .iter()
            .find(|(server_id, _)| server_id == id)
            .map(|(_, name)| name.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.servers
    }
}

const MAX_IMAGE_LINK_DRAWS: usize = 32;

/// Links harvested from chat history (`links.txt`), used for embeds.
#[derive(Debug, Clone, Default)]
pub struct LinkPool {
    links: Vec<String>,
}

impl LinkPool {
    pub fn new(links: Vec<String>) -> Self {
        Self { links }
    }

    pub fn parse(raw: &str) -> Self {
        Self::new(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(read_optional(path, "Links")?
            .map(|raw| Self::parse(&raw))
            .unwrap_or_default())
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        self.links.choose(rng).map(String::as_str)
    }

    /// Draw until an attachment-style link turns up, giving up after a
    /// bounded number of draws.
    pub fn random_image<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        if !self.links.iter().any(|link| is_attachment_link(link)) {
            return None;
        }
        (0..MAX_IMAGE_LINK_DRAWS)
            .filter_map(|_| self.random(rng))
            .find(|link| is_attachment_link(link))
    }
}

fn is_attachment_link(link: &str) -> bool {
    link.contains("discordapp")
}
