//! Topic lifecycle and the per-topic delivery worker.
//!
//! Each topic owns a bounded ingress queue, a replay ring, its
//! subscriber map, and exactly one delivery worker. Publishers enqueue
//! without ever awaiting a subscriber; the worker accumulates a batch by
//! size or timeout, snapshots the subscriber set under the topic lock,
//! releases it, and fans the batch out concurrently with a per-send
//! deadline. Subscribers that fail or breach the deadline are removed.
//!
//! Queue overflow evicts the oldest queued message (the bus is
//! latency-oriented; fresh data beats stale data) and counts the drop.
//!
//! Lifecycle: `Active ──shutdown/delete──▶ Draining ──worker exits──▶
//! Closed`. In Draining the worker performs one final drain-and-flush.
//! A supervisor task observes the worker's join handle: a panic is
//! logged and surfaced to subscribers as an `INTERNAL` error frame;
//! normal exit notifies them the topic is gone.
use crate::metrics::TopicMetrics;
use crate::ring::{RingBuffer, SequencedMessage};
use crate::subscriber::Subscriber;
use crate::{BusConfig, BusError, Message, Result};
use murmur_wire::{ErrorCode, ServerFrame};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{Notify, watch};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Draining,
    Closed,
}

/// Point-in-time counts for the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicStats {
    pub message_count: u64,
    pub subscriber_count: usize,
}

#[derive(Debug)]
struct SubscriberEntry {
    sub: Arc<Subscriber>,
    // Live delivery starts at this sequence; everything older was
    // offered through replay. Prevents replay/live duplication for
    // subscribers that join while messages are still queued.
    first_live_seq: u64,
}

#[derive(Debug)]
struct TopicState {
    lifecycle: Lifecycle,
    next_seq: u64,
    queue: VecDeque<SequencedMessage>,
    subscribers: HashMap<Uuid, SubscriberEntry>,
}

#[derive(Debug)]
pub struct Topic {
    name: String,
    config: BusConfig,
    // Guards lifecycle, subscriber map, and the ingress queue. Never
    // held across an await; the ring has its own lock underneath.
    state: StdMutex<TopicState>,
    ring: RingBuffer,
    ingress: Notify,
    shutdown_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    worker_abort: StdMutex<Option<AbortHandle>>,
    metrics: Arc<TopicMetrics>,
}

impl Topic {
    /// Create the topic and start its delivery worker.
    pub(crate) fn spawn(name: &str, config: BusConfig, metrics: Arc<TopicMetrics>) -> Arc<Self> {
        let ring_capacity = config.ring_capacity;
        let topic = Arc::new(Self {
            name: name.to_string(),
            config,
            state: StdMutex::new(TopicState {
                lifecycle: Lifecycle::Active,
                next_seq: 0,
                queue: VecDeque::new(),
                subscribers: HashMap::new(),
            }),
            ring: RingBuffer::new(ring_capacity),
            ingress: Notify::new(),
            shutdown_tx: watch::channel(false).0,
            done_tx: watch::channel(false).0,
            worker_abort: StdMutex::new(None),
            metrics,
        });
        let handle = tokio::spawn(Self::worker_loop(topic.clone()));
        *topic.worker_abort.lock().expect("abort lock") = Some(handle.abort_handle());
        tokio::spawn(Self::supervise(topic.clone(), handle));
        tracing::info!(topic = %topic.name, "started delivery worker");
        topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().expect("topic lock").lifecycle
    }

    /// Enqueue one message for delivery and retain it for replay.
    /// O(1), never awaits a subscriber. Returns the current subscriber
    /// count for the publish ack.
    pub fn publish(&self, msg: Arc<Message>) -> Result<usize> {
        let subscriber_count;
        {
            let mut state = self.state.lock().expect("topic lock");
            if state.lifecycle != Lifecycle::Active {
                return Err(BusError::TopicClosed(self.name.clone()));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            self.ring.append(seq, msg.clone());
            if state.queue.len() >= self.config.queue_capacity {
                // Full-queue policy: evict the oldest, keep the newest.
                state.queue.pop_front();
                self.metrics.record_dropped();
                tracing::warn!(topic = %self.name, "ingress queue full, evicted oldest message");
            }
            state.queue.push_back(SequencedMessage { seq, msg });
            self.metrics.set_queue_depth(state.queue.len() as u64);
            subscriber_count = state.subscribers.len();
        }
        self.metrics.record_published();
        self.ingress.notify_one();
        Ok(subscriber_count)
    }

    /// Add a subscriber, sending the subscribe ack followed by the last
    /// `last_n` retained messages before any live delivery.
    ///
    /// The subscriber's send gate is acquired before it becomes visible
    /// to the worker and held through the replay write, so the first
    /// live batch it can observe serialises strictly after the replay.
    pub async fn subscribe(&self, sub: Arc<Subscriber>, last_n: usize) -> Result<()> {
        let gate = sub.acquire_gate().await;
        let replay = {
            let mut state = self.state.lock().expect("topic lock");
            if state.lifecycle != Lifecycle::Active {
                return Err(BusError::TopicClosed(self.name.clone()));
            }
            let replay = self.ring.tail(last_n);
            let first_live_seq = state.next_seq;
            state.subscribers.insert(
                sub.id(),
                SubscriberEntry {
                    sub: sub.clone(),
                    first_live_seq,
                },
            );
            self.metrics
                .set_subscriber_count(state.subscribers.len() as u64);
            replay
        };
        sub.track_topic(&self.name);
        tracing::info!(topic = %self.name, subscriber = %sub.id(), replay = replay.len(), "subscribed");

        let mut frames = Vec::with_capacity(replay.len() + 1);
        frames.push(ServerFrame::Ack {
            request_type: "subscribe".to_string(),
            topic: Some(self.name.clone()),
            message: format!("subscribed to topic '{}'", self.name),
        });
        frames.extend(replay.iter().map(|entry| entry.msg.to_event_frame()));
        if let Err(err) = sub.send_behind_gate(gate, frames).await {
            // The connection died under us; take the subscriber back out.
            self.unsubscribe(sub.id());
            return Err(err.into());
        }
        Ok(())
    }

    /// Remove a subscriber. Idempotent; no-op when not subscribed.
    pub fn unsubscribe(&self, client_id: Uuid) -> bool {
        let removed = {
            let mut state = self.state.lock().expect("topic lock");
            let removed = state.subscribers.remove(&client_id);
            self.metrics
                .set_subscriber_count(state.subscribers.len() as u64);
            removed
        };
        match removed {
            Some(entry) => {
                entry.sub.untrack_topic(&self.name);
                tracing::info!(topic = %self.name, subscriber = %client_id, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Current subscribers, freshly allocated.
    pub fn snapshot_subscribers(&self) -> Vec<Arc<Subscriber>> {
        let state = self.state.lock().expect("topic lock");
        state.subscribers.values().map(|e| e.sub.clone()).collect()
    }

    pub fn stats(&self) -> TopicStats {
        let state = self.state.lock().expect("topic lock");
        TopicStats {
            message_count: self.metrics.published(),
            subscriber_count: state.subscribers.len(),
        }
    }

    /// Transition to Draining and wait until the worker has drained the
    /// queue, flushed, and exited. Safe to call more than once.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().expect("topic lock");
            if state.lifecycle == Lifecycle::Active {
                state.lifecycle = Lifecycle::Draining;
            }
        }
        let _ = self.shutdown_tx.send(true);
        let mut done = self.done_tx.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Forced cancellation once the shutdown deadline has passed.
    pub(crate) fn abort_worker(&self) {
        if let Some(handle) = self.worker_abort.lock().expect("abort lock").take() {
            handle.abort();
        }
    }

    fn pop_ingress(&self) -> Option<SequencedMessage> {
        let mut state = self.state.lock().expect("topic lock");
        let entry = state.queue.pop_front();
        self.metrics.set_queue_depth(state.queue.len() as u64);
        entry
    }

    async fn worker_loop(topic: Arc<Topic>) {
        eprintln!("DEBUG worker_loop started");
        let mut shutdown = topic.shutdown_tx.subscribe();
        let mut batch: Vec<SequencedMessage> = Vec::new();
        let mut flush_deadline = tokio::time::Instant::now() + topic.config.batch_timeout;
        loop {
            eprintln!("DEBUG loop top, shutdown={}", *shutdown.borrow());
            if *shutdown.borrow_and_update() {
                eprintln!("DEBUG breaking on shutdown");
                break;
            }
            match topic.pop_ingress() {
                Some(entry) => {
                    batch.push(entry);
                    if batch.len() >= topic.config.batch_size {
                        topic.flush(&mut batch).await;
                        flush_deadline = tokio::time::Instant::now() + topic.config.batch_timeout;
                    }
                }
                None if batch.is_empty() => {
                    // Idle: the flush deadline starts when work arrives.
                    tokio::select! {
                        _ = topic.ingress.notified() => {
                            flush_deadline =
                                tokio::time::Instant::now() + topic.config.batch_timeout;
                        }
                        _ = shutdown.changed() => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = topic.ingress.notified() => {}
                        _ = tokio::time::sleep_until(flush_deadline) => {
                            topic.flush(&mut batch).await;
                            flush_deadline =
                                tokio::time::Instant::now() + topic.config.batch_timeout;
                        }
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        // Draining: one final best-effort flush of everything queued.
        eprintln!("DEBUG final drain start, batch.len()={}", batch.len());
        while let Some(entry) = topic.pop_ingress() {
            batch.push(entry);
        }
        eprintln!("DEBUG final flush start, batch.len()={}", batch.len());
        topic.flush(&mut batch).await;
        eprintln!("DEBUG worker_loop exiting");
    }

    /// One delivery cycle: snapshot subscribers under the lock, release,
    /// send to all of them concurrently, then remove the casualties.
    async fn flush(&self, batch: &mut Vec<SequencedMessage>) {
        if batch.is_empty() {
            return;
        }
        let flush_started = Instant::now();
        for entry in batch.iter() {
            self.metrics
                .record_delivery_latency(flush_started - entry.msg.published_at);
        }

        let subscribers: Vec<(Arc<Subscriber>, u64)> = {
            let state = self.state.lock().expect("topic lock");
            state
                .subscribers
                .values()
                .filter(|entry| !entry.sub.is_closed())
                .map(|entry| (entry.sub.clone(), entry.first_live_seq))
                .collect()
        };
        if subscribers.is_empty() {
            batch.clear();
            return;
        }

        let mut sends = JoinSet::new();
        for (sub, first_live_seq) in subscribers {
            // Skip anything this subscriber already saw through replay.
            let messages: Vec<Arc<Message>> = batch
                .iter()
                .filter(|entry| entry.seq >= first_live_seq)
                .map(|entry| entry.msg.clone())
                .collect();
            if messages.is_empty() {
                continue;
            }
            sends.spawn(async move {
                let delivered = messages.len() as u64;
                let result = sub.send_batch(&messages).await;
                (sub, delivered, result)
            });
        }

        let mut delivered_total = 0u64;
        while let Some(joined) = sends.join_next().await {
            let Ok((sub, delivered, result)) = joined else {
                continue;
            };
            match result {
                Ok(()) => delivered_total += delivered,
                Err(err) => {
                    tracing::warn!(
                        topic = %self.name,
                        subscriber = %sub.id(),
                        error = %err,
                        "removing subscriber after failed send"
                    );
                    sub.close();
                    self.unsubscribe(sub.id());
                }
            }
        }
        self.metrics.record_delivered(delivered_total);
        batch.clear();
    }

    async fn supervise(topic: Arc<Topic>, worker: JoinHandle<()>) {
        let panicked = match worker.await {
            Ok(()) => false,
            Err(err) if err.is_panic() => {
                tracing::error!(topic = %topic.name, "delivery worker panicked");
                true
            }
            // Aborted by the shutdown deadline; nothing left to flush.
            Err(_) => false,
        };

        let subscribers: Vec<Arc<Subscriber>> = {
            let mut state = topic.state.lock().expect("topic lock");
            state.lifecycle = Lifecycle::Closed;
            state.queue.clear();
            state
                .subscribers
                .drain()
                .map(|(_, entry)| entry.sub)
                .collect()
        };
        topic.metrics.set_subscriber_count(0);
        topic.metrics.set_queue_depth(0);

        let farewell = if panicked {
            ServerFrame::Error {
                code: ErrorCode::Internal,
                message: format!("topic '{}' delivery worker failed", topic.name),
                details: None,
            }
        } else {
            ServerFrame::Info {
                message: format!("topic '{}' is no longer available", topic.name),
            }
        };
        let mut notifications = JoinSet::new();
        for sub in subscribers {
            let name = topic.name.clone();
            let frame = farewell.clone();
            notifications.spawn(async move {
                sub.untrack_topic(&name);
                if let Err(err) = sub.send_frames(vec![frame]).await {
                    tracing::debug!(subscriber = %sub.id(), error = %err, "farewell not delivered");
                }
            });
        }
        while notifications.join_next().await.is_some() {}

        tracing::info!(topic = %topic.name, "delivery worker stopped");
        let _ = topic.done_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::EventSink;
    use async_trait::async_trait;
    use serde_json::json;
    use std::io;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingSink {
        frames: StdMutex<Vec<ServerFrame>>,
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<ServerFrame> {
            self.frames.lock().expect("frames").clone()
        }

        fn event_data(&self) -> Vec<serde_json::Value> {
            self.frames()
                .into_iter()
                .filter_map(|frame| match frame {
                    ServerFrame::Event { data, .. } => Some(data),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn send(&self, frames: Vec<ServerFrame>) -> io::Result<()> {
            self.frames.lock().expect("frames").extend(frames);
            Ok(())
        }
    }

    fn test_config() -> BusConfig {
        BusConfig {
            batch_timeout: Duration::from_millis(5),
            send_deadline: Duration::from_millis(100),
            ..BusConfig::default()
        }
    }

    fn spawn_topic(config: BusConfig) -> Arc<Topic> {
        let registry = crate::MetricsRegistry::new();
        Topic::spawn("t", config, registry.topic("t"))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn live_messages_arrive_in_publish_order() {
        let topic = spawn_topic(test_config());
        let sink = Arc::new(RecordingSink::default());
        let sub = Subscriber::new(sink.clone(), &test_config());
        topic.subscribe(sub, 0).await.expect("subscribe");

        for i in 0..25 {
            topic.publish(Message::new("t", json!({ "i": i }))).expect("publish");
        }
        settle().await;

        let data = sink.event_data();
        assert_eq!(data.len(), 25);
        for (i, value) in data.iter().enumerate() {
            assert_eq!(value, &json!({ "i": i }));
        }
    }

    #[tokio::test]
    async fn replay_precedes_live_and_respects_last_n() {
        let topic = spawn_topic(test_config());
        for i in 1..=5 {
            topic.publish(Message::new("t", json!({ "i": i }))).expect("publish");
        }
        settle().await;

        let sink = Arc::new(RecordingSink::default());
        let sub = Subscriber::new(sink.clone(), &test_config());
        topic.subscribe(sub, 3).await.expect("subscribe");
        topic.publish(Message::new("t", json!({ "i": 6 }))).expect("publish");
        settle().await;

        assert_eq!(
            sink.event_data(),
            vec![
                json!({"i": 3}),
                json!({"i": 4}),
                json!({"i": 5}),
                json!({"i": 6})
            ]
        );
        // First frame on the connection is the subscribe ack.
        assert!(matches!(
            sink.frames().first(),
            Some(ServerFrame::Ack { request_type, .. }) if request_type == "subscribe"
        ));
    }

    #[tokio::test]
    async fn late_joiner_is_not_sent_replayed_messages_twice() {
        // Publish while the worker has not yet drained the queue, then
        // subscribe with replay: the queued messages are already in the
        // ring, so live delivery must skip them for this subscriber.
        let topic = spawn_topic(test_config());
        for i in 0..4 {
            topic.publish(Message::new("t", json!({ "i": i }))).expect("publish");
        }
        // No settle: messages are still queued on a current-thread runtime.
        let sink = Arc::new(RecordingSink::default());
        let sub = Subscriber::new(sink.clone(), &test_config());
        topic.subscribe(sub, 10).await.expect("subscribe");
        settle().await;

        assert_eq!(
            sink.event_data(),
            vec![
                json!({"i": 0}),
                json!({"i": 1}),
                json!({"i": 2}),
                json!({"i": 3})
            ]
        );
    }

    #[tokio::test]
    async fn queue_overflow_evicts_oldest() {
        let config = BusConfig {
            queue_capacity: 2,
            ..test_config()
        };
        let topic = spawn_topic(config.clone());
        let sink = Arc::new(RecordingSink::default());
        let sub = Subscriber::new(sink.clone(), &config);
        topic.subscribe(sub, 0).await.expect("subscribe");

        // Publishes land before the worker runs on a current-thread
        // runtime, so the third one evicts the first.
        for i in 0..3 {
            topic.publish(Message::new("t", json!({ "i": i }))).expect("publish");
        }
        settle().await;

        assert_eq!(sink.event_data(), vec![json!({"i": 1}), json!({"i": 2})]);
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_rejected() {
        let topic = spawn_topic(test_config());
        topic.shutdown().await;
        assert_eq!(topic.lifecycle(), Lifecycle::Closed);
        let err = topic
            .publish(Message::new("t", json!(1)))
            .expect_err("closed");
        assert!(matches!(err, BusError::TopicClosed(_)));
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_messages() {
        let topic = spawn_topic(test_config());
        let sink = Arc::new(RecordingSink::default());
        let sub = Subscriber::new(sink.clone(), &test_config());
        topic.subscribe(sub, 0).await.expect("subscribe");

        for i in 0..20 {
            topic.publish(Message::new("t", json!({ "i": i }))).expect("publish");
        }
        topic.shutdown().await;

        let data = sink.event_data();
        assert_eq!(data.len(), 20);
        for (i, value) in data.iter().enumerate() {
            assert_eq!(value, &json!({ "i": i }));
        }
        // Farewell info frame follows the flushed events.
        assert!(matches!(
            sink.frames().last(),
            Some(ServerFrame::Info { .. })
        ));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let topic = spawn_topic(test_config());
        let sub = Subscriber::new(Arc::new(RecordingSink::default()), &test_config());
        let id = sub.id();
        topic.subscribe(sub, 0).await.expect("subscribe");
        assert_eq!(topic.snapshot_subscribers().len(), 1);

        assert!(topic.unsubscribe(id));
        assert!(!topic.unsubscribe(id));
        assert_eq!(topic.stats().subscriber_count, 0);
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_is_rejected() {
        let topic = spawn_topic(test_config());
        topic.shutdown().await;
        let sub = Subscriber::new(Arc::new(RecordingSink::default()), &test_config());
        let err = topic.subscribe(sub, 0).await.expect_err("closed");
        assert!(matches!(err, BusError::TopicClosed(_)));
    }
}
