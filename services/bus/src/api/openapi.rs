//! Generated OpenAPI document for the control-plane API.
use axum::Json;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::topics::create_topic,
        crate::api::topics::delete_topic,
        crate::api::topics::list_topics,
        crate::api::system::health,
        crate::api::system::stats,
        crate::api::system::metrics_snapshot,
    ),
    components(schemas(
        crate::api::types::TopicCreateRequest,
        crate::api::types::TopicResponse,
        crate::api::types::TopicStatsBody,
        crate::api::types::StatsResponse,
        crate::api::types::HealthResponse,
        crate::api::types::ErrorResponse,
    )),
    tags(
        (name = "topics", description = "Topic lifecycle"),
        (name = "system", description = "Health and metrics")
    )
)]
pub struct ApiDoc;

pub(crate) async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
