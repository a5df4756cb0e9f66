// Directory of live topics and the global shutdown coordinator.
use crate::metrics::MetricsRegistry;
use crate::subscriber::Subscriber;
use crate::topic::{Topic, TopicStats};
use crate::{BusConfig, BusError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::JoinSet;

/// Exactly one `Topic` exists per live name. The manager lock is never
/// held across a call into a topic that could block.
#[derive(Debug)]
pub struct TopicManager {
    topics: StdMutex<HashMap<String, Arc<Topic>>>,
    config: BusConfig,
    metrics: Arc<MetricsRegistry>,
    shutting_down: AtomicBool,
}

impl TopicManager {
    pub fn new(config: BusConfig) -> Arc<Self> {
        Arc::new(Self {
            topics: StdMutex::new(HashMap::new()),
            config,
            metrics: Arc::new(MetricsRegistry::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Readable shutdown flag for the control-plane collaborator.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Create a topic and start its delivery worker. Idempotent: an
    /// existing topic is returned with `created = false`.
    pub fn create(&self, name: &str) -> Result<(Arc<Topic>, bool)> {
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        let mut topics = self.topics.lock().expect("manager lock");
        if let Some(existing) = topics.get(name) {
            return Ok((existing.clone(), false));
        }
        let topic = Topic::spawn(name, self.config.clone(), self.metrics.topic(name));
        topics.insert(name.to_string(), topic.clone());
        tracing::info!(topic = %name, "created topic");
        Ok((topic, true))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.lock().expect("manager lock").get(name).cloned()
    }

    /// Like [`get`](Self::get), but unknown names are an error.
    pub fn require(&self, name: &str) -> Result<Arc<Topic>> {
        self.get(name)
            .ok_or_else(|| BusError::TopicNotFound(name.to_string()))
    }

    /// Drain a topic and remove it. The topic stays visible (Draining)
    /// until its worker has exited, then leaves the directory; a
    /// subsequent create starts fresh with an empty ring.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let Some(topic) = self.get(name) else {
            return Ok(false);
        };
        topic.shutdown().await;
        self.topics.lock().expect("manager lock").remove(name);
        self.metrics.remove_topic(name);
        tracing::info!(topic = %name, "deleted topic");
        Ok(true)
    }

    /// Topic names, freshly allocated, order unspecified.
    pub fn list(&self) -> Vec<String> {
        self.topics
            .lock()
            .expect("manager lock")
            .keys()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> BTreeMap<String, TopicStats> {
        let topics: Vec<(String, Arc<Topic>)> = {
            let guard = self.topics.lock().expect("manager lock");
            guard
                .iter()
                .map(|(name, topic)| (name.clone(), topic.clone()))
                .collect()
        };
        topics
            .into_iter()
            .map(|(name, topic)| (name, topic.stats()))
            .collect()
    }

    pub fn total_subscribers(&self) -> usize {
        let topics: Vec<Arc<Topic>> = {
            let guard = self.topics.lock().expect("manager lock");
            guard.values().cloned().collect()
        };
        topics.iter().map(|t| t.stats().subscriber_count).sum()
    }

    /// Remove a disconnecting subscriber from every topic it joined.
    pub fn cleanup_subscriber(&self, sub: &Subscriber) {
        for name in sub.topic_names() {
            if let Some(topic) = self.get(&name) {
                topic.unsubscribe(sub.id());
            }
        }
    }

    /// Drain every topic concurrently, bounded by the shutdown deadline;
    /// workers still running at the deadline are cancelled.
    pub async fn shutdown_all(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let topics: Vec<Arc<Topic>> = {
            let guard = self.topics.lock().expect("manager lock");
            guard.values().cloned().collect()
        };
        tracing::info!(topics = topics.len(), "draining all topics");

        let mut drains = JoinSet::new();
        for topic in topics.iter().cloned() {
            drains.spawn(async move { topic.shutdown().await });
        }
        let drain_all = async {
            while drains.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_deadline, drain_all)
            .await
            .is_err()
        {
            tracing::warn!("shutdown deadline exceeded, cancelling remaining workers");
            for topic in &topics {
                topic.abort_worker();
            }
        }
        tracing::info!("all topic workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::EventSink;
    use crate::Message;
    use async_trait::async_trait;
    use murmur_wire::ServerFrame;
    use serde_json::json;
    use std::io;

    #[derive(Debug, Default)]
    struct NullSink;

    #[async_trait]
    impl EventSink for NullSink {
        async fn send(&self, _frames: Vec<ServerFrame>) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let manager = TopicManager::new(BusConfig::default());
        let (first, created) = manager.create("orders").expect("create");
        assert!(created);
        let (second, created_again) = manager.create("orders").expect("create again");
        assert!(!created_again);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.list(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn delete_then_delete_reports_missing() {
        let manager = TopicManager::new(BusConfig::default());
        manager.create("orders").expect("create");
        assert!(manager.delete("orders").await.expect("delete"));
        assert!(!manager.delete("orders").await.expect("second delete"));
        assert!(manager.get("orders").is_none());
    }

    #[tokio::test]
    async fn recreated_topic_starts_empty() {
        let manager = TopicManager::new(BusConfig::default());
        let (topic, _) = manager.create("orders").expect("create");
        topic.publish(Message::new("orders", json!(1))).expect("publish");
        manager.delete("orders").await.expect("delete");

        let (fresh, created) = manager.create("orders").expect("recreate");
        assert!(created);
        assert_eq!(fresh.stats().message_count, 0);
        assert_eq!(fresh.stats().subscriber_count, 0);
    }

    #[tokio::test]
    async fn cleanup_removes_subscriber_everywhere() {
        let manager = TopicManager::new(BusConfig::default());
        let (a, _) = manager.create("a").expect("create a");
        let (b, _) = manager.create("b").expect("create b");
        let sub = Subscriber::new(Arc::new(NullSink), manager.config());
        a.subscribe(sub.clone(), 0).await.expect("subscribe a");
        b.subscribe(sub.clone(), 0).await.expect("subscribe b");
        assert_eq!(manager.total_subscribers(), 2);

        manager.cleanup_subscriber(&sub);
        assert_eq!(manager.total_subscribers(), 0);
        assert!(sub.topic_names().is_empty());
    }

    #[tokio::test]
    async fn shutdown_refuses_new_topics() {
        let manager = TopicManager::new(BusConfig::default());
        manager.create("orders").expect("create");
        manager.shutdown_all().await;

        assert!(manager.is_shutting_down());
        let err = manager.create("more").expect_err("shutting down");
        assert!(matches!(err, BusError::ShuttingDown));
        // Existing topics are drained and reject publishes.
        let topic = manager.get("orders").expect("still listed");
        assert!(topic.publish(Message::new("orders", json!(1))).is_err());
    }

    #[tokio::test]
    async fn stats_cover_all_topics() {
        let manager = TopicManager::new(BusConfig::default());
        let (orders, _) = manager.create("orders").expect("create");
        manager.create("audit").expect("create");
        orders.publish(Message::new("orders", json!(1))).expect("publish");
        orders.publish(Message::new("orders", json!(2))).expect("publish");

        let stats = manager.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["orders"].message_count, 2);
        assert_eq!(stats["audit"].message_count, 0);
    }
}
