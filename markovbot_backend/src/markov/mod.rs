//! Word-level Markov chain text model.
//!
//! A chain is trained from a newline-delimited corpus where every line is one
//! sentence. States are the previous `state_size` words (order 2 by default),
//! padded with [`BEGIN`] at the start of a sentence and terminated by [`END`].
//!
//! Generated sentences that reproduce too long a run of an original sentence
//! are rejected, so a model built from very little text may never produce
//! output. Callers treat that as "insufficient data".

pub mod generator;

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub use generator::SentenceGenerator;

pub const BEGIN: &str = "___BEGIN__";
pub const END: &str = "___END__";
pub const DEFAULT_STATE_SIZE: usize = 2;
/// Attempts per `make_sentence*` call before giving up.
pub const DEFAULT_TRIES: usize = 10;

const MAX_OVERLAP_RATIO: f64 = 0.7;
const MAX_OVERLAP_TOTAL: usize = 15;
const MAX_WALK_WORDS: usize = 512;

fn default_reject_overlap() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkovChain {
    state_size: usize,
    /// State key (words joined by a single space) -> follower word -> count.
    transitions: HashMap<String, BTreeMap<String, u32>>,
    /// Original sentences, used to reject verbatim reproductions.
    #[serde(default)]
    sentences: Vec<String>,
    #[serde(default = "default_reject_overlap")]
    reject_overlap: bool,
    /// `sentences` joined by spaces, built on the first overlap check.
    #[serde(skip)]
    corpus_text: OnceLock<String>,
}

impl MarkovChain {
    /// Train a chain from newline-delimited text.
    pub fn from_corpus(text: &str, state_size: usize) -> Self {
        let state_size = state_size.max(1);
        let mut chain = Self {
            state_size,
            transitions: HashMap::new(),
            sentences: Vec::new(),
            reject_overlap: true,
            corpus_text: OnceLock::new(),
        };

        for line in text.lines() {
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.is_empty() {
                continue;
            }
            chain.add_run(&words);
            chain.sentences.push(words.join(" "));
        }

        chain
    }

    /// Disable or enable rejection of sentences that copy the corpus.
    pub fn with_overlap_check(mut self, enabled: bool) -> Self {
        self.reject_overlap = enabled;
        self
    }

    pub fn state_size(&self) -> usize {
        self.state_size
    }

    pub fn sentence_count(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize Markov chain")
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let chain: Self = serde_json::from_str(raw).context("Failed to parse Markov chain")?;
        Ok(chain)
    }

    /// Merge several chains by summing their transition counts.
    ///
    /// Chains whose state size differs from the first one are skipped.
    pub fn combine(chains: &[MarkovChain]) -> Option<MarkovChain> {
        let first = chains.first()?;
        let mut combined = MarkovChain {
            state_size: first.state_size,
            transitions: HashMap::new(),
            sentences: Vec::new(),
            reject_overlap: first.reject_overlap,
            corpus_text: OnceLock::new(),
        };

        for chain in chains {
            if chain.state_size != combined.state_size {
                tracing::warn!(
                    "Skipping chain with state size {} while combining (expected {})",
                    chain.state_size,
                    combined.state_size
                );
                continue;
            }
            for (state, followers) in &chain.transitions {
                let entry = combined.transitions.entry(state.clone()).or_default();
                for (word, count) in followers {
                    *entry.entry(word.clone()).or_insert(0) += count;
                }
            }
            combined.sentences.extend(chain.sentences.iter().cloned());
        }

        Some(combined)
    }

    /// Generate a sentence from the beginning of the chain.
    pub fn make_sentence<R: Rng + ?Sized>(&self, rng: &mut R, tries: usize) -> Option<String> {
        let init = vec![BEGIN.to_string(); self.state_size];
        for _ in 0..tries.max(1) {
            let words = self.walk(init.clone(), rng);
            if let Some(sentence) = self.accept(words) {
                return Some(sentence);
            }
        }
        None
    }

    /// Generate a sentence whose first word is `word`.
    ///
    /// Any state whose non-BEGIN words start with `word` is a candidate start,
    /// so the word does not need to have opened a sentence in the corpus.
    /// Returns `None` if the word never appears in a state.
    pub fn make_sentence_with_start<R: Rng + ?Sized>(
        &self,
        word: &str,
        rng: &mut R,
        tries: usize,
    ) -> Option<String> {
        let word = word.trim();
        if word.is_empty() {
            return None;
        }

        let mut candidates: Vec<&String> = self
            .transitions
            .keys()
            .filter(|key| key.split(' ').find(|w| *w != BEGIN) == Some(word))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort();
        candidates.shuffle(rng);

        for key in candidates {
            let init: Vec<String> = key.split(' ').map(str::to_string).collect();
            let prefix: Vec<String> = init.iter().filter(|w| *w != BEGIN).cloned().collect();
            for _ in 0..tries.max(1) {
                let mut words = prefix.clone();
                words.extend(self.walk(init.clone(), rng));
                if let Some(sentence) = self.accept(words) {
                    return Some(sentence);
                }
            }
        }
        None
    }

    fn add_run(&mut self, words: &[&str]) {
        let mut items: Vec<&str> = vec![BEGIN; self.state_size];
        items.extend_from_slice(words);
        items.push(END);

        for i in 0..=words.len() {
            let state = items[i..i + self.state_size].join(" ");
            let follower = items[i + self.state_size];
            *self
                .transitions
                .entry(state)
                .or_default()
                .entry(follower.to_string())
                .or_insert(0) += 1;
        }
    }

    fn walk<R: Rng + ?Sized>(&self, mut state: Vec<String>, rng: &mut R) -> Vec<String> {
        let mut out = Vec::new();
        while out.len() < MAX_WALK_WORDS {
            let Some(followers) = self.transitions.get(&state.join(" ")) else {
                break;
            };
            let Some(next) = weighted_choice(followers, rng) else {
                break;
            };
            if next == END {
                break;
            }
            out.push(next.to_string());
            state.remove(0);
            state.push(next.to_string());
        }
        out
    }

    fn accept(&self, words: Vec<String>) -> Option<String> {
        if words.is_empty() {
            return None;
        }
        if self.reject_overlap && self.overlaps_corpus(&words) {
            return None;
        }
        Some(words.join(" "))
    }

    fn overlaps_corpus(&self, words: &[String]) -> bool {
        let overlap_ratio = (MAX_OVERLAP_RATIO * words.len() as f64).round() as usize;
        let overlap_max = MAX_OVERLAP_TOTAL.min(overlap_ratio);
        let overlap_over = overlap_max + 1;
        let gram_count = words.len().saturating_sub(overlap_max).max(1);

        let rejoined = self.corpus_text.get_or_init(|| self.sentences.join(" "));

        (0..gram_count).any(|i| {
            let end = (i + overlap_over).min(words.len());
            rejoined.contains(&words[i..end].join(" "))
        })
    }
}

fn weighted_choice<'a, R: Rng + ?Sized>(
    followers: &'a BTreeMap<String, u32>,
    rng: &mut R,
) -> Option<&'a str> {
    let total: u64 = followers.values().map(|c| *c as u64).sum();
    if total == 0 {
        return None;
    }
    let mut pick = rng.gen_range(0..total);
    for (word, count) in followers {
        let count = *count as u64;
        if pick < count {
            return Some(word.as_str());
        }
        pick -= count;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const CORPUS: &str = "the cat sat on the mat\n\
                          the dog sat on the log\n\
                          a bird sang in the tree\n";

    #[test]
    fn builds_transitions_from_each_line() {
        let chain = MarkovChain::from_corpus(CORPUS, DEFAULT_STATE_SIZE);
        assert_eq!(chain.sentence_count(), 3);
        assert_eq!(chain.state_size(), 2);
        let start = chain
            .transitions
            .get(&format!("{} {}", BEGIN, BEGIN))
            .expect("start state");
        assert_eq!(start.get("the"), Some(&2));
        assert_eq!(start.get("a"), Some(&1));
    }

    #[test]
    fn corpus_text_is_joined_once_and_not_serialized() {
        let chain = MarkovChain::from_corpus(CORPUS, DEFAULT_STATE_SIZE);
        assert!(chain.corpus_text.get().is_none());

        let copied: Vec<String> = "the cat sat on the mat".split(' ').map(str::to_string).collect();
        assert!(chain.overlaps_corpus(&copied));
        let cached = chain.corpus_text.get().expect("joined corpus cached");
        assert!(cached.starts_with("the cat sat on the mat the dog"));

        let fresh: Vec<String> = "the cat sang".split(' ').map(str::to_string).collect();
        assert!(!chain.overlaps_corpus(&fresh));

        let json = chain.to_json().unwrap();
        assert!(!json.contains("corpus_text"));
        let restored = MarkovChain::from_json(&json).unwrap();
        assert!(restored.corpus_text.get().is_none());
        assert!(restored.overlaps_corpus(&copied));
    }

    #[test]
    fn blank_corpus_never_generates() {
        let chain = MarkovChain::from_corpus("\n   \n", DEFAULT_STATE_SIZE);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(chain.is_empty());
        assert!(chain.make_sentence(&mut rng, 5).is_none());
    }

    #[test]
    fn single_sentence_corpus_is_rejected_as_a_copy() {
        let chain = MarkovChain::from_corpus("just one line of text here", DEFAULT_STATE_SIZE);
        let mut rng = StdRng::seed_from_u64(7);
        assert!(chain.make_sentence(&mut rng, 20).is_none());
    }

    #[test]
    fn generates_words_from_corpus_without_overlap_check() {
        let chain =
            MarkovChain::from_corpus(CORPUS, DEFAULT_STATE_SIZE).with_overlap_check(false);
        let mut rng = StdRng::seed_from_u64(42);
        let sentence = chain.make_sentence(&mut rng, 5).expect("sentence");
        for word in sentence.split(' ') {
            assert!(CORPUS.contains(word), "unexpected word {word}");
        }
    }

    #[test]
    fn start_word_may_come_from_middle_of_sentence() {
        let chain =
            MarkovChain::from_corpus(CORPUS, DEFAULT_STATE_SIZE).with_overlap_check(false);
        let mut rng = StdRng::seed_from_u64(3);
        let sentence = chain
            .make_sentence_with_start("sat", &mut rng, 5)
            .expect("sentence starting with sat");
        assert!(sentence.starts_with("sat "));
    }

    #[test]
    fn unknown_start_word_yields_none() {
        let chain =
            MarkovChain::from_corpus(CORPUS, DEFAULT_STATE_SIZE).with_overlap_check(false);
        let mut rng = StdRng::seed_from_u64(3);
        assert!(chain
            .make_sentence_with_start("zebra", &mut rng, 5)
            .is_none());
    }

    #[test]
    fn combine_sums_counts() {
        let a = MarkovChain::from_corpus("hello there friend", 2);
        let b = MarkovChain::from_corpus("hello there stranger", 2);
        let combined = MarkovChain::combine(&[a, b]).expect("combined");
        let followers = combined.transitions.get("hello there").expect("state");
        assert_eq!(followers.get("friend"), Some(&1));
        assert_eq!(followers.get("stranger"), Some(&1));
        let start = combined
            .transitions
            .get(&format!("{} {}", BEGIN, BEGIN))
            .expect("start");
        assert_eq!(start.get("hello"), Some(&2));
        assert_eq!(combined.sentence_count(), 2);
    }

    #[test]
    fn combine_of_nothing_is_none() {
        assert!(MarkovChain::combine(&[]).is_none());
    }

    #[test]
    fn json_round_trip_preserves_generation() {
        let chain =
            MarkovChain::from_corpus(CORPUS, DEFAULT_STATE_SIZE).with_overlap_check(false);
        let restored = MarkovChain::from_json(&chain.to_json().unwrap()).unwrap();
        let mut rng_a = StdRng::seed_from_u64(9);
        let mut rng_b = StdRng::seed_from_u64(9);
        assert_eq!(
            chain.make_sentence(&mut rng_a, 5),
            restored.make_sentence(&mut rng_b, 5)
        );
    }

    #[test]
    fn overlap_check_rejects_long_copied_runs() {
        let chain = MarkovChain::from_corpus(CORPUS, DEFAULT_STATE_SIZE);
        let copied: Vec<String> = "the cat sat on the mat"
            .split(' ')
            .map(str::to_string)
            .collect();
        assert!(chain.overlaps_corpus(&copied));
        let novel: Vec<String> = "bird dog tree mat cat log"
            .split(' ')
            .map(str::to_string)
            .collect();
        assert!(!chain.overlaps_corpus(&novel));
    }
}
