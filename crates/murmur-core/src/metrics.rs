// Per-topic and global delivery counters with a lock-free snapshot.
// The registry is the source of truth for the control plane's /stats and
// /metrics endpoints; the `metrics` facade mirrors the hot-path counters
// for the Prometheus exporter. Nothing here blocks the delivery path.
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Upper bounds (ms) of the delivery latency histogram buckets.
const LATENCY_BOUNDS_MS: [u64; 10] = [1, 2, 5, 10, 20, 50, 100, 250, 500, 1000];

#[derive(Debug, Default)]
struct GlobalCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Counters and gauges for one topic. Held by the topic itself; the
/// registry keeps a second handle for snapshotting.
#[derive(Debug)]
pub struct TopicMetrics {
    name: String,
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
    queue_depth: AtomicU64,
    subscriber_count: AtomicU64,
    latency: LatencyHistogram,
    global: Arc<GlobalCounters>,
}

impl TopicMetrics {
    fn new(name: String, global: Arc<GlobalCounters>) -> Self {
        Self {
            name,
            messages_published: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            subscriber_count: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
            global,
        }
    }

    pub fn record_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.global.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("murmur_messages_published_total", "topic" => self.name.clone())
            .increment(1);
    }

    pub fn record_delivered(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.messages_delivered.fetch_add(count, Ordering::Relaxed);
        self.global.delivered.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("murmur_messages_delivered_total", "topic" => self.name.clone())
            .increment(count);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        self.global.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("murmur_messages_dropped_total", "topic" => self.name.clone())
            .increment(1);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
        metrics::gauge!("murmur_queue_depth", "topic" => self.name.clone()).set(depth as f64);
    }

    pub fn set_subscriber_count(&self, count: u64) {
        self.subscriber_count.store(count, Ordering::Relaxed);
        metrics::gauge!("murmur_subscribers", "topic" => self.name.clone()).set(count as f64);
    }

    /// Record one publish-to-send-start latency sample at flush time.
    pub fn record_delivery_latency(&self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        self.latency.record(ms);
        metrics::histogram!("murmur_delivery_latency_ms", "topic" => self.name.clone()).record(ms);
    }

    pub fn published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> TopicMetricsSnapshot {
        TopicMetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            subscriber_count: self.subscriber_count.load(Ordering::Relaxed),
            delivery_latency_ms: self.latency.snapshot(),
        }
    }
}

/// Fixed-bucket latency histogram. Atomics only so flushes never block.
#[derive(Debug)]
struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BOUNDS_MS.len()],
    overflow: AtomicU64,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            overflow: AtomicU64::new(0),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn record(&self, ms: f64) {
        match LATENCY_BOUNDS_MS.iter().position(|&bound| ms <= bound as f64) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((ms * 1000.0) as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0,
            buckets: LATENCY_BOUNDS_MS
                .iter()
                .zip(self.buckets.iter())
                .map(|(&le_ms, bucket)| BucketSnapshot {
                    le_ms,
                    count: bucket.load(Ordering::Relaxed),
                })
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
        }
    }
}

/// Directory of per-topic metrics plus bus-wide aggregates.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    topics: Mutex<HashMap<String, Arc<TopicMetrics>>>,
    global: Arc<GlobalCounters>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics handle for a topic, created on first use.
    pub fn topic(&self, name: &str) -> Arc<TopicMetrics> {
        let mut topics = self.topics.lock().expect("metrics lock");
        topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicMetrics::new(name.to_string(), self.global.clone())))
            .clone()
    }

    /// Forget a deleted topic. Global aggregates keep its history.
    pub fn remove_topic(&self, name: &str) {
        self.topics.lock().expect("metrics lock").remove(name);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let topics: Vec<(String, Arc<TopicMetrics>)> = {
            let guard = self.topics.lock().expect("metrics lock");
            guard
                .iter()
                .map(|(name, tm)| (name.clone(), tm.clone()))
                .collect()
        };
        MetricsSnapshot {
            totals: GlobalSnapshot {
                messages_published: self.global.published.load(Ordering::Relaxed),
                messages_delivered: self.global.delivered.load(Ordering::Relaxed),
                messages_dropped: self.global.dropped.load(Ordering::Relaxed),
            },
            topics: topics
                .into_iter()
                .map(|(name, tm)| (name, tm.snapshot()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub totals: GlobalSnapshot,
    pub topics: BTreeMap<String, TopicMetricsSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalSnapshot {
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicMetricsSnapshot {
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub queue_depth: u64,
    pub subscriber_count: u64,
    pub delivery_latency_ms: HistogramSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: f64,
    pub buckets: Vec<BucketSnapshot>,
    /// Samples above the largest bucket bound.
    pub overflow: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub le_ms: u64,
    pub count: u64,
}
