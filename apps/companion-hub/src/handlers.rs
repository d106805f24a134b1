use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::protocol::CommandError;
use crate::registry::SharedRegistry;
use crate::target::{TargetInfo, TargetStatus};

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn list_targets(State(registry): State<SharedRegistry>) -> Json<Vec<TargetInfo>> {
    Json(registry.list())
}

pub async fn get_target(
    Path(identity): Path<String>,
    State(registry): State<SharedRegistry>,
) -> Response {
    match registry.get(&identity) {
        Some(info) => Json(info).into_response(),
        None => command_error_response(&identity, CommandError::NotFound),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub app_path: String,
}

pub async fn run_target(
    Path(identity): Path<String>,
    State(registry): State<SharedRegistry>,
    Json(request): Json<RunRequest>,
) -> Response {
    match registry.run(&identity, request.app_path) {
        Ok(()) => success_response(),
        Err(err) => command_error_response(&identity, err),
    }
}

pub async fn stop_target(
    Path(identity): Path<String>,
    State(registry): State<SharedRegistry>,
) -> Response {
    match registry.stop(&identity) {
        Ok(()) => success_response(),
        Err(err) => command_error_response(&identity, err),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: TargetStatus,
}

/// Occupied/available toggling for the build orchestration. `unavailable` is
/// owned by the disconnect path and cannot be requested.
pub async fn set_target_status(
    Path(identity): Path<String>,
    State(registry): State<SharedRegistry>,
    Json(request): Json<StatusRequest>,
) -> Response {
    if request.status == TargetStatus::Unavailable {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "invalid_status",
                "message": "unavailable is set by disconnect, not by request",
            })),
        )
            .into_response();
    }
    match registry.set_status(&identity, request.status) {
        Ok(info) => Json(info).into_response(),
        Err(err) => command_error_response(&identity, err),
    }
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    /// Keep the persisted record, drop only the in-memory entry
    #[serde(default)]
    pub memory_only: bool,
}

pub async fn remove_target(
    Path(identity): Path<String>,
    Query(query): Query<RemoveQuery>,
    State(registry): State<SharedRegistry>,
) -> Response {
    match registry.remove(&identity, query.memory_only) {
        Ok(()) => success_response(),
        Err(err) => command_error_response(&identity, err),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn success_response() -> Response {
    Json(CommandResponse {
        success: true,
        error: None,
        message: None,
    })
    .into_response()
}

fn command_error_response(identity: &str, err: CommandError) -> Response {
    warn!(identity, "command rejected: {err}");
    let status = match err {
        CommandError::NotFound => StatusCode::NOT_FOUND,
        CommandError::NotAvailable => StatusCode::CONFLICT,
    };
    (
        status,
        Json(CommandResponse {
            success: false,
            error: Some(err.code().to_string()),
            message: Some(err.to_string()),
        }),
    )
        .into_response()
}
