//! Topic CRUD handlers.
use crate::api::error::{api_not_found, api_unavailable, api_validation_error, ApiError};
use crate::api::types::{TopicCreateRequest, TopicResponse};
use crate::app::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

#[utoipa::path(
    post,
    path = "/topics",
    tag = "topics",
    request_body = TopicCreateRequest,
    responses(
        (status = 201, description = "Topic created", body = TopicResponse),
        (status = 200, description = "Topic already present", body = TopicResponse),
        (status = 400, description = "Invalid topic name", body = crate::api::types::ErrorResponse),
        (status = 503, description = "Server is shutting down", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn create_topic(
    State(state): State<AppState>,
    Json(body): Json<TopicCreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if state.manager.is_shutting_down() {
        return Err(api_unavailable("server is shutting down"));
    }
    murmur_wire::validate_topic_name(&body.name)
        .map_err(|err| api_validation_error(&err.to_string()))?;
    match state.manager.create(&body.name) {
        Ok((_, created)) => {
            let status = if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            Ok((
                status,
                Json(TopicResponse {
                    name: body.name,
                    created,
                }),
            ))
        }
        Err(_) => Err(api_unavailable("server is shutting down")),
    }
}

#[utoipa::path(
    delete,
    path = "/topics/{name}",
    tag = "topics",
    params(("name" = String, Path, description = "Topic name")),
    responses(
        (status = 204, description = "Topic deleted"),
        (status = 404, description = "Topic not found", body = crate::api::types::ErrorResponse),
        (status = 503, description = "Server is shutting down", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn delete_topic(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    if state.manager.is_shutting_down() {
        return Err(api_unavailable("server is shutting down"));
    }
    match state.manager.delete(&name).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(api_not_found(&format!("topic '{name}' not found"))),
        Err(_) => Err(api_unavailable("server is shutting down")),
    }
}

#[utoipa::path(
    get,
    path = "/topics",
    tag = "topics",
    responses((status = 200, description = "Topic names", body = [String]))
)]
pub(crate) async fn list_topics(State(state): State<AppState>) -> Json<Vec<String>> {
    let mut names = state.manager.list();
    names.sort();
    Json(names)
}
