// Per-connection protocol handling: decode incoming frames and route
// them to the manager, topics, and the publishing subscriber. The
// transport owns framing and the receive loop; this module owns the
// decode error ladder and connection lifecycle.
use crate::manager::TopicManager;
use crate::subscriber::{EventSink, Subscriber};
use crate::{BusError, Message};
use murmur_wire::{ClientFrame, DecodeError, ErrorCode, ServerFrame};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Dispatcher {
    manager: Arc<TopicManager>,
}

impl Dispatcher {
    pub fn new(manager: Arc<TopicManager>) -> Self {
        Self { manager }
    }

    /// Accept a connection: allocate the subscriber and greet it with
    /// its assigned client id.
    pub async fn connect(&self, sink: Arc<dyn EventSink>) -> Arc<Subscriber> {
        let sub = Subscriber::new(sink, self.manager.config());
        tracing::info!(client = %sub.id(), "client connected");
        let welcome = ServerFrame::Info {
            message: format!("connected with client_id: {}", sub.id()),
        };
        if let Err(err) = sub.send_frames(vec![welcome]).await {
            // The receive loop will notice the dead connection shortly.
            tracing::debug!(client = %sub.id(), error = %err, "welcome not delivered");
        }
        sub
    }

    /// Tear a connection down: close the subscriber and remove it from
    /// every topic it joined.
    pub fn disconnect(&self, sub: &Subscriber) {
        sub.close();
        self.manager.cleanup_subscriber(sub);
        tracing::info!(client = %sub.id(), "client disconnected");
    }

    /// Process one raw text frame from the connection.
    pub async fn dispatch(&self, sub: &Arc<Subscriber>, raw: &str) {
        let frame = match murmur_wire::decode_client_frame(raw) {
            Ok(frame) => frame,
            Err(err) => {
                let (code, message) = decode_error_reply(&err);
                self.send_error(sub, code, message, None).await;
                return;
            }
        };
        match frame {
            ClientFrame::Subscribe { topic, last_n } => {
                self.handle_subscribe(sub, &topic, last_n).await;
            }
            ClientFrame::Unsubscribe { topic } => {
                self.handle_unsubscribe(sub, &topic).await;
            }
            ClientFrame::Publish { topic, data } => {
                self.handle_publish(sub, &topic, data).await;
            }
            ClientFrame::Ping => {
                self.send(sub, ServerFrame::Pong).await;
            }
        }
    }

    async fn handle_subscribe(&self, sub: &Arc<Subscriber>, topic: &str, last_n: u32) {
        if let Err(err) = murmur_wire::validate_topic_name(topic) {
            self.send_error(sub, ErrorCode::ValidationError, err.to_string(), None)
                .await;
            return;
        }
        if let Err(err) = murmur_wire::validate_replay_depth(last_n) {
            self.send_error(sub, ErrorCode::ValidationError, err.to_string(), None)
                .await;
            return;
        }
        if self.manager.is_shutting_down() {
            self.send_error(
                sub,
                ErrorCode::ShuttingDown,
                "server is shutting down".to_string(),
                None,
            )
            .await;
            return;
        }
        let target = match self.manager.require(topic) {
            Ok(target) => target,
            Err(err) => {
                self.send_error(sub, ErrorCode::TopicNotFound, err.to_string(), None)
                    .await;
                return;
            }
        };
        // The ack and any replay are sent by the topic under the
        // subscriber's send gate, ahead of all live delivery.
        match target.subscribe(sub.clone(), last_n as usize).await {
            Ok(()) => {}
            Err(BusError::TopicClosed(name)) => {
                self.send_error(
                    sub,
                    ErrorCode::ShuttingDown,
                    format!("topic '{name}' is shutting down"),
                    None,
                )
                .await;
            }
            Err(err) => {
                tracing::debug!(client = %sub.id(), error = %err, "subscribe reply not delivered");
            }
        }
    }

    async fn handle_unsubscribe(&self, sub: &Arc<Subscriber>, topic: &str) {
        if let Err(err) = murmur_wire::validate_topic_name(topic) {
            self.send_error(sub, ErrorCode::ValidationError, err.to_string(), None)
                .await;
            return;
        }
        if let Some(target) = self.manager.get(topic) {
            target.unsubscribe(sub.id());
        }
        // A dangling name (topic already deleted) still gets dropped.
        sub.untrack_topic(topic);
        self.send_ack(
            sub,
            "unsubscribe",
            Some(topic),
            format!("unsubscribed from topic '{topic}'"),
        )
        .await;
    }

    async fn handle_publish(&self, sub: &Arc<Subscriber>, topic: &str, data: Value) {
        if let Err(err) = murmur_wire::validate_topic_name(topic) {
            self.send_error(sub, ErrorCode::ValidationError, err.to_string(), None)
                .await;
            return;
        }
        if let Err(err) = murmur_wire::validate_payload(&data) {
            let details = json!({ "limit_bytes": murmur_wire::MAX_PAYLOAD_BYTES });
            self.send_error(sub, ErrorCode::ValidationError, err.to_string(), Some(details))
                .await;
            return;
        }
        if self.manager.is_shutting_down() {
            self.send_error(
                sub,
                ErrorCode::ShuttingDown,
                "server is shutting down".to_string(),
                None,
            )
            .await;
            return;
        }
        let target = match self.manager.require(topic) {
            Ok(target) => target,
            Err(err) => {
                self.send_error(sub, ErrorCode::TopicNotFound, err.to_string(), None)
                    .await;
                return;
            }
        };
        if let Err(denied) = sub.check_rate() {
            let details = json!({ "retry_after_seconds": denied.retry_after_seconds });
            self.send_error(
                sub,
                ErrorCode::RateLimited,
                "publish rate limit exceeded".to_string(),
                Some(details),
            )
            .await;
            return;
        }
        match target.publish(Message::new(topic, data)) {
            Ok(subscriber_count) => {
                self.send_ack(
                    sub,
                    "publish",
                    Some(topic),
                    format!("published to {subscriber_count} subscriber(s)"),
                )
                .await;
            }
            Err(BusError::TopicClosed(name)) => {
                self.send_error(
                    sub,
                    ErrorCode::ShuttingDown,
                    format!("topic '{name}' is shutting down"),
                    None,
                )
                .await;
            }
            Err(err) => {
                tracing::error!(client = %sub.id(), error = %err, "publish failed");
                self.send_error(sub, ErrorCode::Internal, "internal error".to_string(), None)
                    .await;
            }
        }
    }

    async fn send_ack(
        &self,
        sub: &Arc<Subscriber>,
        request_type: &str,
        topic: Option<&str>,
        message: String,
    ) {
        self.send(
            sub,
            ServerFrame::Ack {
                request_type: request_type.to_string(),
                topic: topic.map(str::to_string),
                message,
            },
        )
        .await;
    }

    async fn send_error(
        &self,
        sub: &Arc<Subscriber>,
        code: ErrorCode,
        message: String,
        details: Option<Value>,
    ) {
        self.send(
            sub,
            ServerFrame::Error {
                code,
                message,
                details,
            },
        )
        .await;
    }

    async fn send(&self, sub: &Arc<Subscriber>, frame: ServerFrame) {
        if let Err(err) = sub.send_frames(vec![frame]).await {
            tracing::debug!(client = %sub.id(), error = %err, "reply not delivered");
        }
    }
}

fn decode_error_reply(err: &DecodeError) -> (ErrorCode, String) {
    let code = match err {
        DecodeError::InvalidJson => ErrorCode::InvalidJson,
        DecodeError::MissingType | DecodeError::Malformed { .. } => ErrorCode::InvalidMessage,
        DecodeError::UnknownType(_) => ErrorCode::UnknownMessageType,
    };
    (code, err.to_string())
}
