//! Health, stats, and metrics read-outs.
use crate::api::types::{HealthResponse, StatsResponse, TopicStatsBody};
use crate::app::AppState;
use axum::extract::State;
use axum::Json;
use murmur_core::MetricsSnapshot;

#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses((status = 200, description = "Liveness and basic counts", body = HealthResponse))
)]
pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.manager.is_shutting_down() {
        "draining"
    } else {
        "healthy"
    };
    Json(HealthResponse {
        status: status.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs_f64(),
        topic_count: state.manager.list().len(),
        active_subscriber_count: state.manager.total_subscribers(),
    })
}

#[utoipa::path(
    get,
    path = "/stats",
    tag = "system",
    responses((status = 200, description = "Per-topic counts", body = StatsResponse))
)]
pub(crate) async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let topics = state
        .manager
        .stats()
        .into_iter()
        .map(|(name, stats)| {
            (
                name,
                TopicStatsBody {
                    message_count: stats.message_count,
                    subscriber_count: stats.subscriber_count as u64,
                },
            )
        })
        .collect();
    Json(StatsResponse { topics })
}

#[utoipa::path(
    get,
    path = "/metrics",
    tag = "system",
    responses((status = 200, description = "Delivery metrics snapshot"))
)]
pub(crate) async fn metrics_snapshot(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    // Snapshot reads atomics only; it never blocks the delivery path.
    Json(state.manager.metrics().snapshot())
}
