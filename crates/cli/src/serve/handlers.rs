//! HTTP route handlers: participant lifecycle, admin reads, and utilities.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use cohort_core::{
    ExperimentStorage, LifecycleError, NewParticipant, ParticipantDataIn, ParticipantIn,
    ParticipantUpdate, StorageError,
};

use super::state::AppState;
use super::{json_error, ROUTES};

/// Map a lifecycle failure to its HTTP status.
fn lifecycle_error(err: LifecycleError) -> Response {
    let status = match &err {
        LifecycleError::ParticipantNotFound { .. } => StatusCode::NOT_FOUND,
        LifecycleError::Storage(StorageError::ParticipantNotFound { .. })
        | LifecycleError::Storage(StorageError::DataNotFound { .. }) => StatusCode::NOT_FOUND,
        LifecycleError::Storage(StorageError::AlreadyRegistered { .. }) => StatusCode::CONFLICT,
        LifecycleError::Storage(StorageError::Backend(_)) => {
            tracing::error!("storage failure: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    json_error(status, &err.to_string()).into_response()
}

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": cohort_core::COHORT_VERSION,
    });
    (StatusCode::OK, Json(response))
}

/// GET / -- send participants to the experiment, keeping the platform's
/// query parameters.
pub(crate) async fn handle_root(uri: Uri) -> impl IntoResponse {
    match uri.query() {
        Some(query) if !query.is_empty() => Redirect::to(&format!("/exp?{query}")),
        _ => Redirect::to("/exp"),
    }
}

/// GET /ip
pub(crate) async fn handle_ip(request: Request<axum::body::Body>) -> impl IntoResponse {
    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => Json(addr.ip().to_string()).into_response(),
        None => json_error(StatusCode::INTERNAL_SERVER_ERROR, "client address unavailable")
            .into_response(),
    }
}

/// POST /init
pub(crate) async fn handle_init<S: ExperimentStorage>(
    State(state): State<Arc<AppState<S>>>,
    Json(participant): Json<ParticipantIn>,
) -> Response {
    match state.engine.initiate(participant).await {
        Ok(config) => Json(config).into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// POST /participants
pub(crate) async fn handle_create_participant<S: ExperimentStorage>(
    State(state): State<Arc<AppState<S>>>,
    Json(participant): Json<NewParticipant>,
) -> Response {
    match state.engine.register(participant).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// PATCH /participants
pub(crate) async fn handle_update_participant<S: ExperimentStorage>(
    State(state): State<Arc<AppState<S>>>,
    Json(update): Json<ParticipantUpdate>,
) -> Response {
    match state.engine.update_status(update).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// POST /data
pub(crate) async fn handle_submit_data<S: ExperimentStorage>(
    State(state): State<Arc<AppState<S>>>,
    Json(submission): Json<ParticipantDataIn>,
) -> Response {
    match state.engine.submit_data(submission).await {
        Ok(()) => Json(serde_json::Value::Null).into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// GET /refresh -- run one sweep now.
pub(crate) async fn handle_refresh<S: ExperimentStorage>(
    State(state): State<Arc<AppState<S>>>,
) -> Response {
    match state.engine.reclaim().await {
        Ok(expired) => Json(expired).into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// GET /participants (admin)
pub(crate) async fn handle_list_participants<S: ExperimentStorage>(
    State(state): State<Arc<AppState<S>>>,
) -> Response {
    match state.engine.list_participants().await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// GET /status (admin)
pub(crate) async fn handle_status<S: ExperimentStorage>(
    State(state): State<Arc<AppState<S>>>,
) -> Response {
    match state.engine.status_summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// GET /info (admin)
pub(crate) async fn handle_info<S: ExperimentStorage>(
    State(state): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    let settings = state.engine.settings();
    Json(serde_json::json!({
        "app_name": settings.app_name,
        "allotted_time": settings.allotted_time,
    }))
}

/// GET /docs (admin, not mounted in production)
pub(crate) async fn handle_docs() -> impl IntoResponse {
    let routes: Vec<serde_json::Value> = ROUTES
        .iter()
        .map(|r| {
            serde_json::json!({
                "method": r.method,
                "path": r.path,
                "admin": r.admin,
                "description": r.description,
            })
        })
        .collect();
    Json(serde_json::json!({
        "name": "cohort",
        "version": cohort_core::COHORT_VERSION,
        "routes": routes,
    }))
}
