//! Offline corpus tooling: chat-log exports in, per-speaker corpora and chain
//! models out.
//!
//! Exports look like:
//!
//! ```json
//! {
//!   "meta": {
//!     "users": { "<id>": { "name": "..." } },
//!     "userindex": ["<id>", ...]
//!   },
//!   "data": { "<channel>": { "<message id>": { "u": 0, "m": "text" } } }
//! }
//! ```
//!
//! `u` indexes into `userindex`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::corpus::{CorpusStore, NameDirectory};
use crate::markov::{MarkovChain, DEFAULT_STATE_SIZE};

/// Buffered messages are appended to disk once this many have accumulated.
const FLUSH_EVERY_MESSAGES: usize = 100_000;
/// Social-order lines are wrapped once they pass this many bytes.
const SOCIAL_ORDER_LINE_LEN: usize = 1000;

#[derive(Debug, Deserialize)]
struct Export {
    meta: ExportMeta,
    #[serde(default)]
    data: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct ExportMeta {
    #[serde(default)]
    users: BTreeMap<String, ExportUser>,
    #[serde(default)]
    userindex: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ExportUser {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ExportMessage {
    u: serde_json::Value,
    m: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseReport {
    pub server_id: String,
    pub users: usize,
    pub new_names: usize,
    pub messages: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertReport {
    pub server_id: String,
    pub converted: Vec<String>,
    pub skipped_blank: usize,
}

fn load_export(path: &Path) -> Result<Export> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read export {}", path.display()))?;
    serde_json::from_str(raw.trim_start_matches('\u{feff}'))
        .with_context(|| format!("Invalid export {}", path.display()))
}

/// Numeric-looking ids sort by length first so that "10" follows "9".
fn id_order(a: &String, b: &String) -> std::cmp::Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Messages of one export in channel then message-id order, paired with the
/// author's index. Malformed entries are reported through `on_skip`.
fn ordered_messages<'a>(
    export: &'a Export,
    mut on_skip: impl FnMut(&str, &str),
) -> Vec<(usize, String)> {
    let mut channels: Vec<&String> = export.data.keys().collect();
    channels.sort_by(|a, b| id_order(a, b));

    let mut out = Vec::new();
    for channel in channels {
        let messages = &export.data[channel];
        let mut ids: Vec<&String> = messages.keys().collect();
        ids.sort_by(|a, b| id_order(a, b));
        for id in ids {
            let parsed = serde_json::from_value::<ExportMessage>(messages[id].clone())
                .ok()
                .and_then(|msg| user_index(&msg.u).map(|index| (index, msg.m)));
            match parsed {
                Some(entry) => out.push(entry),
                None => on_skip(channel, id),
            }
        }
    }
    out
}

fn user_index(value: &serde_json::Value) -> Option<usize> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().map(|n| n as usize),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub struct Ingestor {
    messages_dir: PathBuf,
    models_dir: PathBuf,
    names_file: PathBuf,
}

impl Ingestor {
    pub fn new(
        messages_dir: impl Into<PathBuf>,
        models_dir: impl Into<PathBuf>,
        names_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            messages_dir: messages_dir.into(),
            models_dir: models_dir.into(),
            names_file: names_file.into(),
        }
    }

    /// Split an export into one corpus file per author under
    /// `messages/<server_id>/`, replacing any previous corpus for those
    /// authors, and merge the export's names into the names file.
    pub fn parse_export(&self, export_path: &Path, server_id: &str) -> Result<ParseReport> {
        let export = load_export(export_path)?;
        let server_dir = self.messages_dir.join(server_id);
        fs::create_dir_all(&server_dir)
            .with_context(|| format!("Failed to create {}", server_dir.display()))?;

        for user_id in &export.meta.userindex {
            let path = server_dir.join(format!("{}.txt", user_id));
            fs::write(&path, "").with_context(|| format!("Failed to reset {}", path.display()))?;
        }

        let new_names = self.merge_names(&export)?;

        let mut skipped = 0;
        let entries = ordered_messages(&export, |channel, id| {
            tracing::warn!("Skipping malformed message {} in channel {}", id, channel);
            skipped += 1;
        });

        let mut buffered: HashMap<&str, String> = HashMap::new();
        let mut pending = 0;
        let mut written = 0;
        for (index, text) in &entries {
            let Some(user_id) = export.meta.userindex.get(*index) else {
                tracing::warn!("Message author index {} is out of range", index);
                skipped += 1;
                continue;
            };
            let corpus = buffered.entry(user_id.as_str()).or_default();
            corpus.push_str(text);
            corpus.push('\n');
            pending += 1;
            written += 1;

            if pending >= FLUSH_EVERY_MESSAGES {
                append_corpora(&server_dir, &mut buffered)?;
                pending = 0;
            }
        }
        append_corpora(&server_dir, &mut buffered)?;

        tracing::info!(
            "Parsed {} messages for server {} ({} skipped)",
            written,
            server_id,
            skipped
        );

        Ok(ParseReport {
            server_id: server_id.to_string(),
            users: export.meta.userindex.len(),
            new_names,
            messages: written,
            skipped,
        })
    }

    fn merge_names(&self, export: &Export) -> Result<usize> {
        let mut names = NameDirectory::load(&self.names_file)?;
        let added = names.merge(
            export
                .meta
                .users
                .iter()
                .map(|(id, user)| (id.clone(), user.name.replace(';', ":"))),
        );
        if added > 0 {
            names.save(&self.names_file)?;
        }
        Ok(added)
    }

    /// Build a chain model for every non-blank corpus of the server.
    pub fn convert_server(&self, server_id: &str) -> Result<ConvertReport> {
        let server_dir = self.messages_dir.join(server_id);
        let entries = fs::read_dir(&server_dir)
            .with_context(|| format!("No messages for server {} in {}", server_id, server_dir.display()))?;
        let store = CorpusStore::new(&self.models_dir, &self.messages_dir);

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("txt"))
            .collect();
        files.sort();

        let mut report = ConvertReport {
            server_id: server_id.to_string(),
            converted: Vec::new(),
            skipped_blank: 0,
        };
        for path in files {
            let Some(user_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let corpus = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if corpus.trim().is_empty() {
                report.skipped_blank += 1;
                continue;
            }
            let chain = MarkovChain::from_corpus(&corpus, DEFAULT_STATE_SIZE);
            store.save_model(server_id, user_id, &chain)?;
            tracing::debug!("Converted {} ({} sentences)", user_id, chain.sentence_count());
            report.converted.push(user_id.to_string());
        }

        tracing::info!(
            "Converted {} corpora for server {}",
            report.converted.len(),
            server_id
        );
        Ok(report)
    }
}

fn append_corpora(server_dir: &Path, buffered: &mut HashMap<&str, String>) -> Result<()> {
    for (user_id, corpus) in buffered.drain() {
        if corpus.is_empty() {
            continue;
        }
        let path = server_dir.join(format!("{}.txt", user_id));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(corpus.as_bytes())
            .with_context(|| format!("Failed to append to {}", path.display()))?;
    }
    Ok(())
}

/// The author-id sequence of an export as newline-wrapped text.
pub fn social_order_corpus(export_path: &Path) -> Result<String> {
    let export = load_export(export_path)?;
    let entries = ordered_messages(&export, |channel, id| {
        tracing::warn!("Skipping malformed message {} in channel {}", id, channel);
    });

    let mut out = String::new();
    let mut line = String::new();
    for (index, _) in entries {
        let Some(user_id) = export.meta.userindex.get(index) else {
            continue;
        };
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(user_id);
        if line.len() > SOCIAL_ORDER_LINE_LEN {
            out.push_str(&line);
            out.push('\n');
            line.clear();
        }
    }
    if !line.is_empty() {
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Train and write the social-order model. Returns the number of sequences
/// it was trained on.
pub fn build_social_order_model(export_path: &Path, out_path: &Path) -> Result<usize> {
    let corpus = social_order_corpus(export_path)?;
    // Author sequences repeat heavily; copying runs is expected here.
    let chain = MarkovChain::from_corpus(&corpus, DEFAULT_STATE_SIZE).with_overlap_check(false);
    if chain.is_empty() {
        anyhow::bail!("Export {} has no messages to order", export_path.display());
    }
    if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(out_path, chain.to_json()?)
        .with_context(|| format!("Failed to write {}", out_path.display()))?;
    tracing::info!(
        "Wrote social order model {} from {} sequences",
        out_path.display(),
        chain.sentence_count()
    );
    Ok(chain.sentence_count())
}

/// Load a previously built social-order model.
pub fn load_social_order_model(path: &Path) -> Result<MarkovChain> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Social order model {} not found", path.display()))?;
    MarkovChain::from_json(&raw)
        .with_context(|| format!("Corrupt social order model {}", path.display()))
}
