//! Request and response bodies for the control-plane API.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct TopicCreateRequest {
    pub name: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TopicResponse {
    pub name: String,
    pub created: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TopicStatsBody {
    pub message_count: u64,
    pub subscriber_count: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatsResponse {
    pub topics: BTreeMap<String, TopicStatsBody>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: f64,
    pub topic_count: usize,
    pub active_subscriber_count: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}
