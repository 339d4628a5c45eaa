//! PR review-comment debounce (spec §4.5 Debouncing, §8 Scenario C): comments
//! arriving on the same PR within the configured window collapse into one
//! analyzer run. Unlike [`crate::chat::outbound`]'s notification batching —
//! first-arrival-wins, fixed window — this timer *resets* on every new
//! comment, so a burst of comments only ever fires once the PR goes quiet.

use super::{Dispatcher, ReviewComment, Trigger};
use crate::RepoFullName;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct PrKey {
    repo: RepoFullName,
    pr_number: u64,
}

struct PendingBatch {
    comments: Vec<ReviewComment>,
    /// Bumped on every new comment; a pending flush task checks this before
    /// firing so a stale timer from an earlier comment is a no-op.
    generation: u64,
}

/// Per-PR debounce state. One instance is shared across the code-hosting
/// poll loop.
pub struct PrCommentDebouncer {
    window: Duration,
    pending: Mutex<HashMap<PrKey, PendingBatch>>,
}

impl PrCommentDebouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, pending: Mutex::new(HashMap::new()) }
    }

    /// Record a newly observed comment and (re)arm its flush timer. The
    /// timer set by the *last* call to reach its deadline is the one that
    /// actually flushes; earlier timers find a bumped generation and exit
    /// quietly (spec §8 Scenario C: 4 comments at t/t+5s/t+20s/t+45s yield
    /// one dispatch at t+105s, i.e. 60s after the last one).
    pub async fn record(
        self: &Arc<Self>,
        dispatcher: Arc<Dispatcher>,
        repo: RepoFullName,
        pr_number: u64,
        comment: ReviewComment,
    ) {
        let key = PrKey { repo: repo.clone(), pr_number };
        let generation = {
            let mut pending = self.pending.lock().await;
            let batch = pending.entry(key.clone()).or_insert_with(|| PendingBatch { comments: Vec::new(), generation: 0 });
            batch.comments.push(comment);
            batch.generation += 1;
            batch.generation
        };

        let debouncer = self.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            debouncer.try_flush(dispatcher, key, generation).await;
        });
    }

    async fn try_flush(&self, dispatcher: Arc<Dispatcher>, key: PrKey, observed_generation: u64) {
        let comments = {
            let mut pending = self.pending.lock().await;
            let Some(batch) = pending.get(&key) else { return };
            if batch.generation != observed_generation {
                // A newer comment arrived since this timer was armed; the
                // timer it armed will flush instead.
                return;
            }
            pending.remove(&key).expect("just matched above").comments
        };

        let trigger = Trigger::PrReviewComments { repo: key.repo, pr_number: key.pr_number, comments };
        if let Err(error) = dispatcher.dispatch_with_retry(trigger).await {
            tracing::warn!(%error, "debounced PR review-comment dispatch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_generation_wins_over_earlier_timer() {
        // A purely logical check of the generation-gating rule, without
        // spinning up tokio: an earlier observed_generation never matches a
        // batch that has since been bumped by a newer comment.
        let mut batch = PendingBatch { comments: Vec::new(), generation: 0 };
        batch.generation += 1; // comment 1 at t
        let first_generation = batch.generation;
        batch.generation += 1; // comment 2 at t+5s, rearms
        assert_ne!(first_generation, batch.generation);
    }
}
