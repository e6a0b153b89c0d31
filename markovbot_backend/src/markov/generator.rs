use rand::RngCore;

use super::{MarkovChain, DEFAULT_TRIES};

/// Something that can produce a sentence, optionally starting from a word.
///
/// The simulator only talks to this trait, so tests can script the output.
pub trait SentenceGenerator: Send + Sync {
    /// With `Some(word)`, the sentence must start with that word or `None` is
    /// returned. With `None`, any sentence the model can produce is fine.
    fn generate(&self, start: Option<&str>, rng: &mut dyn RngCore) -> Option<String>;
}

impl SentenceGenerator for MarkovChain {
    fn generate(&self, start: Option<&str>, rng: &mut dyn RngCore) -> Option<String> {
        match start {
            Some(word) => self.make_sentence_with_start(word, rng, DEFAULT_TRIES),
            None => self.make_sentence(rng, DEFAULT_TRIES),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn chain_generator_honours_start_word() {
        let chain = MarkovChain::from_corpus("red fish blue fish\none fish two fish", 2)
            .with_overlap_check(false);
        let generator: &dyn SentenceGenerator = &chain;
        let mut rng = StdRng::seed_from_u64(11);
        let text = generator.generate(Some("blue"), &mut rng).expect("text");
        assert!(text.starts_with("blue"));
        assert!(generator.generate(Some("green"), &mut rng).is_none());
    }
}
