//! Outbound messages held while a channel is down.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Instant;

use protocol::Message;
use tracing::{debug, warn};

use crate::error::{RelayError, RelayResult};

/// A message is dropped after this many per-message delivery failures.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub enqueued_at: Instant,
    pub attempts: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub failed: usize,
    pub dropped: usize,
    pub remaining: usize,
}

/// FIFO with drop-oldest eviction at capacity.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self { items: VecDeque::new(), capacity: capacity.max(1) }
    }

    /// Queue `message`. Returns the evicted oldest entry when full.
    pub fn enqueue(&mut self, message: Message) -> Option<QueuedMessage> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            warn!(msg_type = %old.message.msg_type(), "outbound queue full, dropping oldest");
        }
        self.items.push_back(QueuedMessage { message, enqueued_at: Instant::now(), attempts: 0 });
        evicted
    }

    /// Try every queued message in order.
    ///
    /// Successes are removed. A per-message failure keeps the message in
    /// place and moves on; `ChannelUnavailable` ends the pass with everything
    /// not yet sent still queued in order.
    pub async fn flush<F, Fut>(&mut self, mut send: F) -> FlushReport
    where
        F: FnMut(Message) -> Fut,
        Fut: Future<Output = RelayResult<()>>,
    {
        let mut report = FlushReport::default();
        let mut kept = VecDeque::with_capacity(self.items.len());

        while let Some(mut item) = self.items.pop_front() {
            match send(item.message.clone()).await {
                Ok(()) => report.sent += 1,
                Err(RelayError::ChannelUnavailable) => {
                    kept.push_back(item);
                    break;
                }
                Err(e) => {
                    item.attempts += 1;
                    if item.attempts >= MAX_DELIVERY_ATTEMPTS {
                        warn!(msg_type = %item.message.msg_type(), error = %e, "dropping undeliverable message");
                        report.dropped += 1;
                    } else {
                        debug!(msg_type = %item.message.msg_type(), error = %e, attempts = item.attempts, "send failed, keeping queued");
                        report.failed += 1;
                        kept.push_back(item);
                    }
                }
            }
        }

        kept.append(&mut self.items);
        self.items = kept;
        report.remaining = self.items.len();
        report
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(n: u32) -> Message {
        Message::new("EMOTION_UPDATE", json!({ "n": n }))
    }

    fn n_of(m: &Message) -> u64 {
        m.payload()["n"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn flushes_in_enqueue_order() {
        let mut queue = OutboundQueue::new(10);
        for i in 1..=3 {
            queue.enqueue(msg(i));
        }
        let mut seen = Vec::new();
        let report = queue
            .flush(|m| {
                seen.push(n_of(&m));
                async { Ok(()) }
            })
            .await;
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(report, FlushReport { sent: 3, failed: 0, dropped: 0, remaining: 0 });
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn per_message_failure_does_not_block_later_ones() {
        let mut queue = OutboundQueue::new(10);
        for i in 1..=3 {
            queue.enqueue(msg(i));
        }
        let report = queue
            .flush(|m| {
                let n = n_of(&m);
                async move {
                    if n == 2 {
                        Err(RelayError::NoReceiver("background".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 1);
        let left: Vec<_> = queue.iter().map(|q| n_of(&q.message)).collect();
        assert_eq!(left, vec![2]);
    }

    #[tokio::test]
    async fn unavailable_stops_the_pass() {
        let mut queue = OutboundQueue::new(10);
        for i in 1..=4 {
            queue.enqueue(msg(i));
        }
        let report = queue
            .flush(|m| {
                let n = n_of(&m);
                async move {
                    if n >= 2 {
                        Err(RelayError::ChannelUnavailable)
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert_eq!(report.sent, 1);
        assert_eq!(report.remaining, 3);
        let left: Vec<_> = queue.iter().map(|q| n_of(&q.message)).collect();
        assert_eq!(left, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn gives_up_after_repeated_failures() {
        let mut queue = OutboundQueue::new(10);
        queue.enqueue(msg(1));
        for _ in 0..MAX_DELIVERY_ATTEMPTS {
            queue.flush(|_| async { Err(RelayError::Remote("nope".into())) }).await;
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut queue = OutboundQueue::new(2);
        queue.enqueue(msg(1));
        queue.enqueue(msg(2));
        let evicted = queue.enqueue(msg(3)).unwrap();
        assert_eq!(n_of(&evicted.message), 1);
        assert_eq!(queue.len(), 2);
    }
}
