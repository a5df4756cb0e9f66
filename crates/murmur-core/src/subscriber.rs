// Subscriber connection abstraction: one per streaming connection.
// Carries no message queue; topic workers hand batches in synchronously
// and the send deadline bounds how long a slow connection can hold a
// flush. Every write goes through the send gate so a subscribe-time
// replay excludes concurrent live batches.
use crate::limiter::{RateLimited, TokenBucket};
use crate::{BusConfig, Message};
use async_trait::async_trait;
use murmur_wire::ServerFrame;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Transport seam: the engine pushes ordered frames through this and the
/// transport (or a test double) writes them out. An error means the
/// connection is unusable and the subscriber will be closed.
#[async_trait]
pub trait EventSink: Debug + Send + Sync {
    async fn send(&self, frames: Vec<ServerFrame>) -> std::io::Result<()>;
}

#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("subscriber is closed")]
    Closed,
    #[error("send deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct Subscriber {
    id: Uuid,
    sink: Arc<dyn EventSink>,
    closed: AtomicBool,
    // Names only; topics hold the subscriber, never the reverse.
    topics: StdMutex<HashSet<String>>,
    limiter: TokenBucket,
    last_send_started: StdMutex<Option<Instant>>,
    // Serialises all writes to the sink. Acquired by the subscribe path
    // before the subscriber becomes visible to the topic worker, which
    // is what makes replay strictly precede live delivery.
    send_gate: Mutex<()>,
    send_deadline: Duration,
}

impl Subscriber {
    pub fn new(sink: Arc<dyn EventSink>, config: &BusConfig) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            sink,
            closed: AtomicBool::new(false),
            topics: StdMutex::new(HashSet::new()),
            limiter: TokenBucket::new(config.rate_limit_per_sec, config.rate_limit_burst),
            last_send_started: StdMutex::new(None),
            send_gate: Mutex::new(()),
            send_deadline: config.send_deadline,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent; subsequent sends return [`SendError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Charge one publish against this connection's token bucket.
    pub fn check_rate(&self) -> Result<(), RateLimited> {
        self.limiter.try_acquire()
    }

    pub fn track_topic(&self, name: &str) {
        self.topics
            .lock()
            .expect("topic set lock")
            .insert(name.to_string());
    }

    pub fn untrack_topic(&self, name: &str) {
        self.topics.lock().expect("topic set lock").remove(name);
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.topics
            .lock()
            .expect("topic set lock")
            .iter()
            .cloned()
            .collect()
    }

    pub fn last_send_started(&self) -> Option<Instant> {
        *self.last_send_started.lock().expect("send instant lock")
    }

    /// Deliver one batch of live messages in order. The deadline covers
    /// gate acquisition too: a subscriber stuck mid-replay long enough
    /// counts as slow and is closed like any other slow consumer.
    pub async fn send_batch(&self, batch: &[Arc<Message>]) -> Result<(), SendError> {
        let frames = batch.iter().map(|msg| msg.to_event_frame()).collect();
        self.send_frames(frames).await
    }

    /// Send protocol frames (acks, errors, info, pongs) under the same
    /// gate and deadline as live batches.
    pub async fn send_frames(&self, frames: Vec<ServerFrame>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.mark_send_start();
        let write = async {
            let _gate = self.send_gate.lock().await;
            self.sink.send(frames).await
        };
        self.bounded(write).await
    }

    /// Gate handle for the subscribe path; must be taken while holding
    /// no other lock.
    pub(crate) async fn acquire_gate(&self) -> MutexGuard<'_, ()> {
        self.send_gate.lock().await
    }

    /// Send while already holding the gate (subscribe ack + replay).
    pub(crate) async fn send_behind_gate(
        &self,
        gate: MutexGuard<'_, ()>,
        frames: Vec<ServerFrame>,
    ) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.mark_send_start();
        let result = self.bounded(self.sink.send(frames)).await;
        drop(gate);
        result
    }

    fn mark_send_start(&self) {
        *self.last_send_started.lock().expect("send instant lock") = Some(Instant::now());
    }

    async fn bounded(
        &self,
        write: impl std::future::Future<Output = std::io::Result<()>>,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(self.send_deadline, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.close();
                Err(SendError::Transport(err))
            }
            Err(_) => {
                self.close();
                Err(SendError::DeadlineExceeded(self.send_deadline))
            }
        }
    }
}
