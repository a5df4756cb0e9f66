// Fixed-capacity replay buffer, oldest-out on overflow.
use crate::Message;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A message paired with its topic sequence number. Shared by the
/// replay ring and the ingress queue: the sequence lets subscribe-time
/// replay and live delivery agree on a cut point so no message is
/// replayed and then delivered again.
#[derive(Debug, Clone)]
pub struct SequencedMessage {
    pub seq: u64,
    pub msg: Arc<Message>,
}

/// Fixed-capacity FIFO retaining the most recent messages for replay.
///
/// Single writer (the publish path), concurrent readers (subscribe-time
/// replay); both go through the internal mutex.
///
/// ```
/// use murmur_core::{Message, RingBuffer};
/// use serde_json::json;
///
/// let ring = RingBuffer::new(2);
/// for i in 0..3 {
///     ring.append(i, Message::new("t", json!({ "i": i })));
/// }
/// let tail = ring.tail(10);
/// assert_eq!(tail.len(), 2);
/// assert_eq!(tail[0].seq, 1);
/// assert_eq!(tail[1].seq, 2);
/// ```
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<VecDeque<SequencedMessage>>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn append(&self, seq: u64, msg: Arc<Message>) {
        let mut buffer = self.inner.lock().expect("ring lock");
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(SequencedMessage { seq, msg });
    }

    /// Last `min(n, len)` entries in insertion order, oldest first.
    /// Requests beyond capacity are clamped silently; `tail(0)` is empty.
    pub fn tail(&self, n: usize) -> Vec<SequencedMessage> {
        let buffer = self.inner.lock().expect("ring lock");
        let skip = buffer.len().saturating_sub(n);
        buffer.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ring lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
