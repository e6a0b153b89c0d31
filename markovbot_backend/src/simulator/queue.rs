use anyhow::Result;
use rand::Rng;
use std::collections::VecDeque;

use super::social_order::SocialOrder;

/// Highest insertion slot for speakers named in generated text.
pub const NAME_MENTION_MAX_SLOT: usize = 2;
/// Highest insertion slot for speakers referenced by a mention token.
pub const TOKEN_MENTION_MAX_SLOT: usize = 1;

/// Pending speakers, refilled from the social-order model when it runs dry.
///
/// Ids may repeat. Mentioned speakers are pushed near the front rather than
/// appended, so a named speaker tends to reply soon.
#[derive(Debug, Clone, Default)]
pub struct SpeakerQueue {
    pending: VecDeque<String>,
}

impl SpeakerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pending: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    /// Remove the head of the queue, refilling first if it is empty.
    ///
    /// An empty queue triggers exactly one refill. Refill exhaustion is an
    /// error and leaves the queue empty.
    pub fn pop_next<R: Rng>(&mut self, order: &SocialOrder, rng: &mut R) -> Result<String> {
        if self.pending.is_empty() {
            let refill = order.generate_order(rng)?;
            tracing::debug!("Refilled speaker queue with {} ids", refill.len());
            self.pending = refill.into();
        }
        self.pending
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("Speaker queue is empty after refill"))
    }

    /// Insert each id somewhere in the first three slots.
    pub fn notify_mentioned<R: Rng + ?Sized>(&mut self, ids: &[String], rng: &mut R) {
        self.notify_mentioned_within(ids, NAME_MENTION_MAX_SLOT, rng);
    }

    /// Insert each id at a uniformly random slot in `0..=max_slot`, clamped to
    /// the current length. Repeated ids are inserted repeatedly.
    pub fn notify_mentioned_within<R: Rng + ?Sized>(
        &mut self,
        ids: &[String],
        max_slot: usize,
        rng: &mut R,
    ) {
        for id in ids {
            let slot = rng.gen_range(0..=max_slot.min(self.pending.len()));
            self.pending.insert(slot, id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markov::SentenceGenerator;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingOrder {
        calls: Arc<AtomicUsize>,
        output: &'static str,
    }

    impl SentenceGenerator for CountingOrder {
        fn generate(&self, _start: Option<&str>, _rng: &mut dyn RngCore) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(self.output.to_string())
        }
    }

    fn order(output: &'static str) -> (SocialOrder, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = CountingOrder {
            calls: calls.clone(),
            output,
        };
        (SocialOrder::new(Box::new(generator), 5), calls)
    }

    #[test]
    fn pop_from_non_empty_queue_does_not_refill() {
        let (order, calls) = order("9 9 9");
        let mut rng = StdRng::seed_from_u64(0);
        let mut queue = SpeakerQueue::from_ids(["a", "b", "c"]);
        assert_eq!(queue.pop_next(&order, &mut rng).unwrap(), "a");
        assert_eq!(queue.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_queue_refills_exactly_once() {
        let (order, calls) = order("1 2 3");
        let mut rng = StdRng::seed_from_u64(0);
        let mut queue = SpeakerQueue::new();
        assert_eq!(queue.pop_next(&order, &mut rng).unwrap(), "1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.snapshot(), vec!["2", "3"]);
    }

    #[test]
    fn mentioned_id_lands_in_first_three_slots() {
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..500 {
            let mut queue = SpeakerQueue::from_ids(["a", "b", "c", "d", "e"]);
            queue.notify_mentioned(&["x".to_string()], &mut rng);
            assert_eq!(queue.len(), 6);
            let pos = queue.snapshot().iter().position(|id| id == "x").unwrap();
            assert!(pos <= 2, "x landed at {pos}");
        }
    }

    #[test]
    fn mention_into_empty_queue_goes_to_front() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut queue = SpeakerQueue::new();
        queue.notify_mentioned(&["x".to_string()], &mut rng);
        assert_eq!(queue.snapshot(), vec!["x"]);
    }

    #[test]
    fn duplicate_mentions_are_inserted_twice() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut queue = SpeakerQueue::from_ids(["a", "b"]);
        queue.notify_mentioned(&["x".to_string(), "x".to_string()], &mut rng);
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.iter().filter(|id| *id == "x").count(), 2);
        assert_eq!(snapshot.len(), 4);
    }

    #[test]
    fn token_mentions_use_tighter_window() {
        let mut rng = StdRng::seed_from_u64(6);
        for _ in 0..200 {
            let mut queue = SpeakerQueue::from_ids(["a", "b", "c"]);
            queue.notify_mentioned_within(&["x".to_string()], TOKEN_MENTION_MAX_SLOT, &mut rng);
            let pos = queue.snapshot().iter().position(|id| id == "x").unwrap();
            assert!(pos <= 1);
        }
    }
}
