//! Per-(channel, thread_key) chat pacing (spec §4.1 Pacing and retry, §5
//! Rate limits): chat sends are serialized per channel and held to at most
//! one message per second, excess messages queued in arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// One lock per channel so unrelated channels never block each other; the
/// lock's hold time (computed from `min_interval`) is what actually paces
/// sends on a given channel.
struct ChannelLane {
    lock: Mutex<Instant>,
}

/// Enforces the gateway's per-channel chat pacing rule.
pub struct ChatPacer {
    min_interval: Duration,
    lanes: Mutex<HashMap<String, Arc<ChannelLane>>>,
}

impl ChatPacer {
    pub fn new(messages_per_second: f64) -> Self {
        let min_interval = if messages_per_second <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / messages_per_second)
        };
        Self {
            min_interval,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    async fn lane_for(&self, channel: &str) -> Arc<ChannelLane> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(channel.to_string())
            .or_insert_with(|| {
                Arc::new(ChannelLane {
                    lock: Mutex::new(Instant::now() - Duration::from_secs(3600)),
                })
            })
            .clone()
    }

    /// Wait until it is this channel's turn, then reserve the slot.
    /// Ordering within a channel is guaranteed by `tokio::sync::Mutex`'s
    /// FIFO wake order, which matches "queued in arrival order" (spec §5).
    pub async fn acquire(&self, channel: &str) {
        let lane = self.lane_for(channel).await;
        let mut last_sent = lane.lock.lock().await;
        let elapsed = last_sent.elapsed();
        if elapsed < self.min_interval {
            tokio::time::sleep(self.min_interval - elapsed).await;
        }
        *last_sent = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serializes_sends_on_the_same_channel() {
        let pacer = ChatPacer::new(1000.0); // fast interval for a quick test
        let start = Instant::now();
        pacer.acquire("C1").await;
        pacer.acquire("C1").await;
        assert!(start.elapsed() >= Duration::from_millis(1));
    }

    #[tokio::test]
    async fn different_channels_do_not_block_each_other() {
        let pacer = Arc::new(ChatPacer::new(1.0));
        let a = pacer.clone();
        let b = pacer.clone();
        let start = Instant::now();
        let (_, _) = tokio::join!(
            async move { a.acquire("C1").await },
            async move { b.acquire("C2").await }
        );
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
