// In-process pub/sub delivery engine.
// Topics own a bounded ingress queue, a replay ring, and a single delivery
// worker that batches messages and fans them out to subscribers
// concurrently. The transport is abstracted behind the EventSink seam so
// the engine never touches a socket directly.
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod dispatch;
pub mod limiter;
pub mod manager;
pub mod metrics;
pub mod ring;
pub mod subscriber;
pub mod topic;

pub use dispatch::Dispatcher;
pub use manager::TopicManager;
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use ring::RingBuffer;
pub use subscriber::{EventSink, SendError, Subscriber};
pub use topic::{Topic, TopicStats};

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("topic is not accepting operations: {0}")]
    TopicClosed(String),
    #[error("bus is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Engine tuning knobs, shared by every topic.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Ingress queue capacity per topic (Q).
    pub queue_capacity: usize,
    /// Replay ring capacity per topic (R).
    pub ring_capacity: usize,
    /// Flush a batch once it holds this many messages.
    pub batch_size: usize,
    /// Flush a non-empty batch after this long regardless of size.
    pub batch_timeout: Duration,
    /// Wall-clock bound on a single send to one subscriber.
    pub send_deadline: Duration,
    /// Total bound on draining every topic during shutdown.
    pub shutdown_deadline: Duration,
    /// Token bucket refill rate per subscriber, tokens per second.
    pub rate_limit_per_sec: u64,
    /// Token bucket burst allowance per subscriber.
    pub rate_limit_burst: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            ring_capacity: 100,
            batch_size: 10,
            batch_timeout: Duration::from_millis(20),
            send_deadline: Duration::from_millis(500),
            shutdown_deadline: Duration::from_secs(5),
            rate_limit_per_sec: 1000,
            rate_limit_burst: 500,
        }
    }
}

/// One published message. Immutable after creation; shared as
/// `Arc<Message>` between the replay ring and in-flight batches so
/// eviction and delivery never copy the payload.
#[derive(Debug)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub data: Value,
    /// Monotonic publish instant for latency accounting.
    pub published_at: Instant,
    /// Wall-clock publish time for external reporting.
    pub ts: DateTime<Utc>,
}

impl Message {
    pub fn new(topic: impl Into<String>, data: Value) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            data,
            published_at: Instant::now(),
            ts: Utc::now(),
        })
    }

    pub fn to_event_frame(&self) -> murmur_wire::ServerFrame {
        murmur_wire::ServerFrame::Event {
            topic: self.topic.clone(),
            data: self.data.clone(),
            message_id: self.id.clone(),
            ts: self.ts.to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_get_unique_ids() {
        let a = Message::new("t", json!({"i": 1}));
        let b = Message::new("t", json!({"i": 1}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn event_frame_carries_payload_and_id() {
        let msg = Message::new("orders", json!({"n": 7}));
        match msg.to_event_frame() {
            murmur_wire::ServerFrame::Event {
                topic,
                data,
                message_id,
                ts,
            } => {
                assert_eq!(topic, "orders");
                assert_eq!(data, json!({"n": 7}));
                assert_eq!(message_id, msg.id);
                assert!(!ts.is_empty());
            }
            other => panic!("expected event frame, got {other:?}"),
        }
    }
}
