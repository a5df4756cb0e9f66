//! HTTP application wiring.
//!
//! # Purpose
//! Builds the axum router and defines the shared application state, so
//! `main` stays small and the router is testable in isolation.
use crate::api;
use crate::ws;
use axum::routing::{delete, get};
use axum::Router;
use murmur_core::TopicManager;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TopicManager>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(manager: Arc<TopicManager>) -> Self {
        Self {
            manager,
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/topics",
            get(api::topics::list_topics).post(api::topics::create_topic),
        )
        .route("/topics/:name", delete(api::topics::delete_topic))
        .route("/health", get(api::system::health))
        .route("/stats", get(api::system::stats))
        .route("/metrics", get(api::system::metrics_snapshot))
        .route("/v1/openapi.json", get(api::openapi::openapi_json))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
