//! HTTP request handlers.

use super::AppState;
use crate::admin::{Actor, AdminError, ControllerInput, DefinitionInput, HistoryQuery, TagInput};
use crate::db::DefinitionFilter;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};

// ============================================================================
// Envelope
// ============================================================================

/// Body of every API response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        success: true,
        message: None,
        data: Some(data),
        error: None,
    })
    .into_response()
}

fn done(message: &str) -> Response {
    Json(ApiResponse::<()> {
        success: true,
        message: Some(message.to_string()),
        data: None,
        error: None,
    })
    .into_response()
}

fn respond<T: Serialize>(result: Result<T, AdminError>) -> Response {
    match result {
        Ok(data) => ok(data),
        Err(e) => e.into_response(),
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AdminError::NotFound(_) => (StatusCode::NOT_FOUND, "Not found"),
            AdminError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
            AdminError::Invalid(_) => (StatusCode::BAD_REQUEST, "Invalid request"),
            AdminError::NotConnected(_) => (StatusCode::SERVICE_UNAVAILABLE, "Controller offline"),
            AdminError::Protocol(_) => (StatusCode::BAD_GATEWAY, "Controller error"),
            AdminError::Db(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error"),
        };
        if status.is_server_error() {
            tracing::error!("{}: {}", message, self);
        }

        let body = ApiResponse::<()> {
            success: false,
            message: Some(message.to_string()),
            data: None,
            error: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

/// The acting user, from the `X-User-Id` / `X-User-Name` headers set by the
/// authenticating proxy.
pub fn actor_from_headers(headers: &HeaderMap) -> Actor {
    let id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok());
    let name = headers
        .get("x-user-name")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    match (id, name) {
        (None, None) => Actor::system(),
        (id, name) => {
            let id = id.unwrap_or(0);
            Actor {
                id,
                name: name.unwrap_or_else(|| format!("user-{}", id)),
            }
        }
    }
}

// ============================================================================
// API: Controllers
// ============================================================================

pub async fn handle_list_controllers(State(state): State<AppState>) -> impl IntoResponse {
    respond(state.admin.list_controllers().await)
}

pub async fn handle_get_controller(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(state.admin.get_controller(id).await)
}

pub async fn handle_create_controller(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ControllerInput>,
) -> impl IntoResponse {
    let actor = actor_from_headers(&headers);
    match state.admin.create_controller(&actor, req).await {
        Ok(c) => (StatusCode::CREATED, ok(c)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_update_controller(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<ControllerInput>,
) -> impl IntoResponse {
    let actor = actor_from_headers(&headers);
    respond(state.admin.update_controller(&actor, id, req).await)
}

pub async fn handle_delete_controller(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let actor = actor_from_headers(&headers);
    match state.admin.delete_controller(&actor, id).await {
        Ok(()) => done("Controller deleted"),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_list_tags(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(state.admin.list_tags(id))
}

// ============================================================================
// API: Tags
// ============================================================================

pub async fn handle_get_tag(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(state.admin.get_tag(id))
}

pub async fn handle_create_tag(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TagInput>,
) -> impl IntoResponse {
    let actor = actor_from_headers(&headers);
    match state.admin.create_tag(&actor, req).await {
        Ok(t) => (StatusCode::CREATED, ok(t)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_update_tag(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<TagInput>,
) -> impl IntoResponse {
    let actor = actor_from_headers(&headers);
    respond(state.admin.update_tag(&actor, id, req).await)
}

pub async fn handle_delete_tag(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let actor = actor_from_headers(&headers);
    match state.admin.delete_tag(&actor, id).await {
        Ok(()) => done("Tag deleted"),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_read_tag_value(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(state.admin.read_tag_value(id).await)
}

#[derive(Debug, Deserialize)]
pub struct WriteValueRequest {
    pub value: serde_json::Value,
}

pub async fn handle_write_tag_value(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<WriteValueRequest>,
) -> impl IntoResponse {
    let actor = actor_from_headers(&headers);
    respond(state.admin.write_tag_value(&actor, id, &req.value).await)
}

// ============================================================================
// API: Faults
// ============================================================================

pub async fn handle_active_faults(State(state): State<AppState>) -> impl IntoResponse {
    respond(state.admin.active_faults())
}

pub async fn handle_fault_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    respond(state.admin.fault_history(query))
}

pub async fn handle_acknowledge_fault(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let actor = actor_from_headers(&headers);
    match state.admin.acknowledge_fault(&actor, id) {
        Ok(()) => done("Fault acknowledged"),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DefinitionQuery {
    pub site: Option<String>,
    pub subsystem: Option<String>,
    pub controller_id: Option<i64>,
    pub enabled: Option<bool>,
}

pub async fn handle_list_definitions(
    State(state): State<AppState>,
    Query(query): Query<DefinitionQuery>,
) -> impl IntoResponse {
    let filter = DefinitionFilter {
        site: query.site.filter(|s| !s.is_empty()),
        subsystem: query.subsystem.filter(|s| !s.is_empty()),
        controller_id: query.controller_id,
        enabled: query.enabled,
    };
    respond(state.admin.list_definitions(&filter))
}

pub async fn handle_get_definition(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(state.admin.get_definition(id))
}

pub async fn handle_create_definition(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DefinitionInput>,
) -> impl IntoResponse {
    let actor = actor_from_headers(&headers);
    match state.admin.create_definition(&actor, req).await {
        Ok(d) => (StatusCode::CREATED, ok(d)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_update_definition(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<DefinitionInput>,
) -> impl IntoResponse {
    let actor = actor_from_headers(&headers);
    respond(state.admin.update_definition(&actor, id, req).await)
}

pub async fn handle_delete_definition(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let actor = actor_from_headers(&headers);
    match state.admin.delete_definition(&actor, id).await {
        Ok(()) => done("Fault definition deleted"),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_import_definitions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<Vec<DefinitionInput>>,
) -> impl IntoResponse {
    let actor = actor_from_headers(&headers);
    respond(state.admin.import_definitions(&actor, req).await)
}

pub async fn handle_sites(State(state): State<AppState>) -> impl IntoResponse {
    respond(state.admin.sites())
}

pub async fn handle_subsystems(State(state): State<AppState>) -> impl IntoResponse {
    respond(state.admin.subsystems())
}

// ============================================================================
// API: Runtime
// ============================================================================

pub async fn handle_fleet_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.admin.fleet().snapshot().await)
}

pub async fn handle_stats(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.admin.stats().await)
}
