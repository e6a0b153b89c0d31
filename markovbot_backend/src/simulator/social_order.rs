use anyhow::{bail, Result};
use rand::RngCore;

use crate::markov::SentenceGenerator;

/// Produces plausible "who posts next" sequences from a chain trained over
/// author-id sequences rather than words.
pub struct SocialOrder {
    generator: Box<dyn SentenceGenerator>,
    max_attempts: usize,
}

impl SocialOrder {
    pub fn new(generator: Box<dyn SentenceGenerator>, max_attempts: usize) -> Self {
        Self {
            generator,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Generate a non-empty id sequence, retrying up to `max_attempts` times.
    /// Exhaustion is fatal for the simulation.
    pub fn generate_order(&self, rng: &mut dyn RngCore) -> Result<Vec<String>> {
        for attempt in 1..=self.max_attempts {
            let Some(sentence) = self.generator.generate(None, rng) else {
                tracing::debug!("Social order attempt {} produced nothing", attempt);
                continue;
            };
            match tokenize_order(&sentence) {
                Some(ids) => return Ok(ids),
                None => tracing::warn!(
                    "Social order attempt {} produced a malformed sequence: {:?}",
                    attempt,
                    sentence
                ),
            }
        }
        bail!(
            "Social order model produced no usable sequence after {} attempts",
            self.max_attempts
        )
    }
}

/// Split on single spaces. Any empty token (leading, trailing or doubled
/// spaces) makes the whole sequence unusable.
pub fn tokenize_order(sentence: &str) -> Option<Vec<String>> {
    if sentence.is_empty() {
        return None;
    }
    let ids: Vec<String> = sentence.split(' ').map(str::to_string).collect();
    if ids.iter().any(|id| id.is_empty()) {
        return None;
    }
    Some(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Mutex;

    struct Scripted(Mutex<Vec<Option<&'static str>>>);

    impl SentenceGenerator for Scripted {
        fn generate(&self, _start: Option<&str>, _rng: &mut dyn RngCore) -> Option<String> {
            let mut script = self.0.lock().unwrap();
            if script.is_empty() {
                return None;
            }
            script.remove(0).map(str::to_string)
        }
    }

    #[test]
    fn tokenizer_rejects_empty_tokens() {
        assert_eq!(
            tokenize_order("1 2 3"),
            Some(vec!["1".to_string(), "2".to_string(), "3".to_string()])
        );
        assert_eq!(tokenize_order(""), None);
        assert_eq!(tokenize_order("1  2"), None);
        assert_eq!(tokenize_order(" 1"), None);
        assert_eq!(tokenize_order("1 "), None);
    }

    #[test]
    fn retries_past_empty_and_malformed_output() {
        let order = SocialOrder::new(
            Box::new(Scripted(Mutex::new(vec![None, Some("4  5"), Some("4 5")]))),
            5,
        );
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(order.generate_order(&mut rng).unwrap(), vec!["4", "5"]);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let order = SocialOrder::new(Box::new(Scripted(Mutex::new(vec![None; 10]))), 3);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(order.generate_order(&mut rng).is_err());
    }
}
