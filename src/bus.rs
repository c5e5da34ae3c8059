//! Change-notification bus.
//!
//! Single producer, many subscribers, each behind a bounded queue. A slow
//! subscriber loses messages rather than applying backpressure to the
//! pipeline; the loss is counted and the subscriber sees a `resync` marker
//! the next time it reads, so clients know to refetch state.

use crate::models::{now_ts, Alert, StoreStats, Trade};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Queue depth per subscriber.
pub const SUBSCRIBER_QUEUE_SLOTS: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BusMessage {
    NewTrade(Trade),
    NewAlert(Alert),
    Stats(StoreStats),
    AnalysisStats(serde_json::Value),
    SuspiciousTrade(Trade),
    Connected { server_time: i64 },
    Pong { timestamp: i64 },
    Resync { dropped: u64 },
}

impl BusMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::NewTrade(_) => "new_trade",
            BusMessage::NewAlert(_) => "new_alert",
            BusMessage::Stats(_) => "stats",
            BusMessage::AnalysisStats(_) => "analysis_stats",
            BusMessage::SuspiciousTrade(_) => "suspicious_trade",
            BusMessage::Connected { .. } => "connected",
            BusMessage::Pong { .. } => "pong",
            BusMessage::Resync { .. } => "resync",
        }
    }

    /// Wire frame: `{type, data, timestamp}`.
    pub fn frame(&self) -> serde_json::Value {
        let mut v = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(obj) = v.as_object_mut() {
            obj.insert("timestamp".to_string(), serde_json::json!(now_ts()));
        }
        v
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<BusMessage>,
    dropped: Arc<AtomicU64>,
}

/// Receiving side of one bus subscription.
pub struct BusSubscription {
    pub id: u64,
    rx: mpsc::Receiver<BusMessage>,
    dropped: Arc<AtomicU64>,
    acked_drops: u64,
}

impl BusSubscription {
    /// Next message. After overflow, the first read yields a `resync`
    /// marker carrying the number of messages lost since the last one.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        if let Some(marker) = self.pending_resync() {
            return Some(marker);
        }
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`].
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        if let Some(marker) = self.pending_resync() {
            return Some(marker);
        }
        self.rx.try_recv().ok()
    }

    fn pending_resync(&mut self) -> Option<BusMessage> {
        let drops = self.dropped.load(Ordering::Relaxed);
        if drops > self.acked_drops {
            let delta = drops - self.acked_drops;
            self.acked_drops = drops;
            return Some(BusMessage::Resync { dropped: delta });
        }
        None
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// In-process broadcast hub for trades, alerts and stats events.
#[derive(Default)]
pub struct AlertBus {
    subscribers: RwLock<Vec<Subscriber>>,
    dropped_total: AtomicU64,
    next_id: AtomicU64,
}

impl AlertBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> BusSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_SLOTS);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.write().push(Subscriber {
            id,
            tx,
            dropped: dropped.clone(),
        });
        debug!(subscriber = id, "bus subscriber attached");
        BusSubscription {
            id,
            rx,
            dropped,
            acked_drops: 0,
        }
    }

    /// Fan a message out. Full queues drop the message for that subscriber
    /// only; nothing here ever blocks the producer.
    pub fn publish(&self, msg: BusMessage) {
        let mut saw_closed = false;
        {
            let subs = self.subscribers.read();
            for sub in subs.iter() {
                match sub.tx.try_send(msg.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        sub.dropped.fetch_add(1, Ordering::Relaxed);
                        self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Closed(_)) => saw_closed = true,
                }
            }
        }
        if saw_closed {
            let mut subs = self.subscribers.write();
            subs.retain(|s| !s.tx.is_closed());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_msg(n: u64) -> BusMessage {
        BusMessage::Stats(StoreStats {
            total_trades: n,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn slow_subscriber_drops_beyond_queue_capacity() {
        let bus = AlertBus::new();
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        let mut fast_received = 0usize;
        for chunk in 0..4u64 {
            for i in 0..50u64 {
                bus.publish(stats_msg(chunk * 50 + i));
            }
            // The fast subscriber keeps up between bursts; the slow one never reads.
            while let Some(msg) = fast.try_recv() {
                assert!(!matches!(msg, BusMessage::Resync { .. }));
                fast_received += 1;
            }
        }

        assert_eq!(fast_received, 200);
        assert_eq!(fast.dropped(), 0);
        assert_eq!(slow.dropped(), 136);
        assert_eq!(bus.dropped_total(), 136);

        // First read after overflow is the resync marker, then the 64 queued.
        match slow.try_recv() {
            Some(BusMessage::Resync { dropped }) => assert_eq!(dropped, 136),
            other => panic!("expected resync, got {other:?}"),
        }
        let mut queued = 0usize;
        while let Some(msg) = slow.try_recv() {
            assert!(!matches!(msg, BusMessage::Resync { .. }));
            queued += 1;
        }
        assert_eq!(queued, 64);
    }

    #[tokio::test]
    async fn per_kind_ordering_is_fifo() {
        let bus = AlertBus::new();
        let mut sub = bus.subscribe();

        for i in 0..5u64 {
            bus.publish(stats_msg(i));
            bus.publish(BusMessage::Pong { timestamp: i as i64 });
        }

        let mut stats_seen = Vec::new();
        let mut pongs_seen = Vec::new();
        while let Some(msg) = sub.try_recv() {
            match msg {
                BusMessage::Stats(s) => stats_seen.push(s.total_trades),
                BusMessage::Pong { timestamp } => pongs_seen.push(timestamp),
                _ => {}
            }
        }
        assert_eq!(stats_seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(pongs_seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let bus = AlertBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        bus.publish(stats_msg(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn frame_carries_type_data_timestamp() {
        let frame = BusMessage::Connected { server_time: 42 }.frame();
        assert_eq!(frame["type"], "connected");
        assert_eq!(frame["data"]["server_time"], 42);
        assert!(frame["timestamp"].is_i64());
    }
}
