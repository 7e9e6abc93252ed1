//! In-process sorted-set store.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use jobhub_core::result::AppResult;

use super::store::{QueueDepth, SortedSetStore};
use crate::fanout::{EventStream, LocalBus};

#[derive(Debug, Default)]
struct ScoredSet {
    order: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl ScoredSet {
    fn insert(&mut self, score: i64, member: &str) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.order.remove(&(old, member.to_string()));
        }
        self.order.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> Option<i64> {
        let score = self.scores.remove(member)?;
        self.order.remove(&(score, member.to_string()));
        Some(score)
    }

    fn due(&self, now: i64, limit: usize) -> Vec<(i64, String)> {
        self.order
            .iter()
            .take_while(|(score, _)| *score <= now)
            .take(limit)
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

#[derive(Debug, Default)]
struct QueueSets {
    ready: ScoredSet,
    processing: ScoredSet,
}

/// Sorted sets held in process memory.
///
/// Suitable for a single process and for tests; nothing survives a
/// restart.
#[derive(Debug, Default)]
pub struct MemorySortedSetStore {
    queues: Mutex<HashMap<String, QueueSets>>,
    bus: LocalBus,
}

impl MemorySortedSetStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueSets>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SortedSetStore for MemorySortedSetStore {
    fn driver(&self) -> &'static str {
        "memory"
    }

    async fn push(&self, queue: &str, score: i64, member: &str) -> AppResult<()> {
        self.queues()
            .entry(queue.to_string())
            .or_default()
            .ready
            .insert(score, member);
        Ok(())
    }

    async fn pop_due(
        &self,
        queue: &str,
        now: i64,
        count: usize,
        invisible_until: Option<i64>,
    ) -> AppResult<Vec<String>> {
        let mut queues = self.queues();
        let Some(sets) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let due = sets.ready.due(now, count);
        let mut members = Vec::with_capacity(due.len());
        for (_, member) in due {
            sets.ready.remove(&member);
            if let Some(until) = invisible_until {
                sets.processing.insert(until, &member);
            }
            members.push(member);
        }
        Ok(members)
    }

    async fn touch(&self, queue: &str, member: &str, score: i64) -> AppResult<bool> {
        let mut queues = self.queues();
        let Some(sets) = queues.get_mut(queue) else {
            return Ok(false);
        };
        if sets.processing.remove(member).is_none() {
            return Ok(false);
        }
        sets.processing.insert(score, member);
        Ok(true)
    }

    async fn complete(&self, queue: &str, member: &str) -> AppResult<bool> {
        Ok(self
            .queues()
            .get_mut(queue)
            .and_then(|sets| sets.processing.remove(member))
            .is_some())
    }

    async fn requeue(&self, queue: &str, member: &str, score: i64) -> AppResult<()> {
        let mut queues = self.queues();
        let sets = queues.entry(queue.to_string()).or_default();
        sets.processing.remove(member);
        sets.ready.insert(score, member);
        Ok(())
    }

    async fn recover(&self, queue: &str, now: i64) -> AppResult<usize> {
        let mut queues = self.queues();
        let Some(sets) = queues.get_mut(queue) else {
            return Ok(0);
        };
        let expired = sets.processing.due(now, usize::MAX);
        for (score, member) in &expired {
            sets.processing.remove(member);
            sets.ready.insert(*score, member);
        }
        Ok(expired.len())
    }

    async fn remove(&self, queue: &str, member: &str) -> AppResult<bool> {
        let mut queues = self.queues();
        let Some(sets) = queues.get_mut(queue) else {
            return Ok(false);
        };
        let ready = sets.ready.remove(member).is_some();
        let processing = sets.processing.remove(member).is_some();
        Ok(ready || processing)
    }

    async fn depth(&self, queue: &str) -> AppResult<QueueDepth> {
        Ok(self
            .queues()
            .get(queue)
            .map(|sets| QueueDepth {
                ready: sets.ready.len(),
                processing: sets.processing.len(),
            })
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, raw: String) -> AppResult<()> {
        self.bus.publish(channel, raw);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> AppResult<EventStream> {
        Ok(self.bus.subscribe(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pop_returns_due_members_in_score_then_insertion_order() {
        let store = MemorySortedSetStore::new();
        store.push("q", 10, "b-second").await.unwrap();
        store.push("q", 10, "a-first").await.unwrap();
        store.push("q", 5, "z-earliest").await.unwrap();
        store.push("q", 99, "future").await.unwrap();

        let popped = store.pop_due("q", 50, 10, None).await.unwrap();
        assert_eq!(popped, vec!["z-earliest", "a-first", "b-second"]);
        assert_eq!(store.depth("q").await.unwrap(), QueueDepth { ready: 1, processing: 0 });
    }

    #[tokio::test]
    async fn test_visibility_moves_to_processing_and_recovers() {
        let store = MemorySortedSetStore::new();
        store.push("q", 1, "m").await.unwrap();

        let popped = store.pop_due("q", 1, 1, Some(200)).await.unwrap();
        assert_eq!(popped, vec!["m"]);
        assert_eq!(store.depth("q").await.unwrap(), QueueDepth { ready: 0, processing: 1 });

        assert_eq!(store.recover("q", 199).await.unwrap(), 0);
        assert!(store.touch("q", "m", 400).await.unwrap());
        assert_eq!(store.recover("q", 300).await.unwrap(), 0);
        assert_eq!(store.recover("q", 400).await.unwrap(), 1);
        assert_eq!(store.depth("q").await.unwrap(), QueueDepth { ready: 1, processing: 0 });
        assert!(!store.touch("q", "m", 500).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_requeue_and_remove() {
        let store = MemorySortedSetStore::new();
        store.push("q", 1, "m").await.unwrap();
        store.pop_due("q", 1, 1, Some(100)).await.unwrap();

        store.requeue("q", "m", 50).await.unwrap();
        assert_eq!(store.depth("q").await.unwrap(), QueueDepth { ready: 1, processing: 0 });
        assert!(store.pop_due("q", 49, 1, None).await.unwrap().is_empty());

        store.pop_due("q", 50, 1, Some(100)).await.unwrap();
        assert!(store.complete("q", "m").await.unwrap());
        assert!(!store.complete("q", "m").await.unwrap());

        store.push("q", 1, "n").await.unwrap();
        assert!(store.remove("q", "n").await.unwrap());
        assert_eq!(store.depth("q").await.unwrap(), QueueDepth::default());
        assert!(!store.remove("missing", "n").await.unwrap());
    }
}
