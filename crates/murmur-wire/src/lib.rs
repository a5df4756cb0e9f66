// JSON message schema for the bus streaming protocol.
// Every frame on the wire is a JSON object with a required `type` field;
// this crate owns the frame shapes, the stable error codes, and the
// protocol limits so that the engine and the transport agree on both.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum serialised payload size accepted for a publish.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;
/// Maximum length of a topic name.
pub const MAX_TOPIC_NAME_LEN: usize = 256;
/// Maximum replay depth a subscriber may request.
pub const MAX_REPLAY_DEPTH: u32 = 1000;

pub type Result<T> = std::result::Result<T, ValidationError>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("topic name must match [A-Za-z0-9_-]{{1,{MAX_TOPIC_NAME_LEN}}}")]
    InvalidTopicName,
    #[error("payload is {size} bytes, limit is {MAX_PAYLOAD_BYTES}")]
    PayloadTooLarge { size: usize },
    #[error("last_n {0} exceeds the replay limit of {MAX_REPLAY_DEPTH}")]
    ReplayTooDeep(u32),
}

/// Why an incoming frame could not be turned into a [`ClientFrame`].
///
/// The variants deliberately mirror the protocol's decode error codes:
/// unparseable text, a parseable value that is not a typed object, a
/// `type` nobody recognises, and a recognised type with a broken shape.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("frame is not valid JSON")]
    InvalidJson,
    #[error("frame must be a JSON object with a string `type` field")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("malformed {kind} frame: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// Frames a client may send to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        topic: String,
        #[serde(default)]
        last_n: u32,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        data: Value,
    },
    Ping,
}

/// Frames the bus sends back to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Info {
        message: String,
    },
    Ack {
        request_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        message: String,
    },
    Event {
        topic: String,
        data: Value,
        message_id: String,
        ts: String,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Pong,
}

/// Stable error codes surfaced to clients in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidJson,
    InvalidMessage,
    UnknownMessageType,
    ValidationError,
    TopicNotFound,
    NotSubscribed,
    RateLimited,
    QueueFull,
    ShuttingDown,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidJson => "INVALID_JSON",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::TopicNotFound => "TOPIC_NOT_FOUND",
            ErrorCode::NotSubscribed => "NOT_SUBSCRIBED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode one client frame, classifying failures for the error ladder.
pub fn decode_client_frame(raw: &str) -> std::result::Result<ClientFrame, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| DecodeError::InvalidJson)?;
    let Some(object) = value.as_object() else {
        return Err(DecodeError::MissingType);
    };
    let Some(kind) = object.get("type").and_then(Value::as_str) else {
        return Err(DecodeError::MissingType);
    };
    let kind: &'static str = match kind {
        "subscribe" => "subscribe",
        "unsubscribe" => "unsubscribe",
        "publish" => "publish",
        "ping" => "ping",
        other => return Err(DecodeError::UnknownType(other.to_string())),
    };
    serde_json::from_value(value).map_err(|err| DecodeError::Malformed {
        kind,
        reason: err.to_string(),
    })
}

pub fn validate_topic_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_TOPIC_NAME_LEN {
        return Err(ValidationError::InvalidTopicName);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidTopicName);
    }
    Ok(())
}

/// Validate a publish payload against the size limit.
/// Returns the serialised size on success so callers can reuse it.
pub fn validate_payload(data: &Value) -> Result<usize> {
    // Measure the canonical serialisation; whitespace in the incoming
    // text does not count against the limit.
    let size = serde_json::to_vec(data).map(|bytes| bytes.len()).unwrap_or(0);
    if size > MAX_PAYLOAD_BYTES {
        return Err(ValidationError::PayloadTooLarge { size });
    }
    Ok(size)
}

pub fn validate_replay_depth(last_n: u32) -> Result<()> {
    if last_n > MAX_REPLAY_DEPTH {
        return Err(ValidationError::ReplayTooDeep(last_n));
    }
    Ok(())
}
