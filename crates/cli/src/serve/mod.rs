//! `cohort serve` -- HTTP JSON API for the participant lifecycle.
//!
//! Runs the axum router and the reclamation sweeper side by side. The sweeper
//! is stopped after the server drains on Ctrl+C.
//!
//! Endpoints (admin routes need HTTP Basic credentials):
//! - POST  /init          - Enter the experiment, returns the configuration
//! - POST  /participants  - Register a participant record directly
//! - PATCH /participants  - Update a participant's status
//! - POST  /data          - Submit trial data and complete the participant
//! - GET   /refresh       - Run one reclamation sweep now
//! - GET   /participants  - All participants (admin)
//! - GET   /status        - Participant counts per status (admin)
//! - GET   /info          - App name and allotted time (admin)
//! - GET   /docs          - This route table (admin, not in production)
//! - GET   /health        - Server status
//! - GET   /ip            - Caller's address
//! - GET   /              - Redirect to /exp, keeping the query string
//! - GET   /exp/*         - Static experiment bundle, when configured

mod handlers;
mod middleware;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use cohort_core::{spawn_sweeper, ExperimentStorage, LifecycleEngine};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use self::handlers::{
    handle_create_participant, handle_docs, handle_health, handle_info, handle_init, handle_ip,
    handle_list_participants, handle_not_found, handle_refresh, handle_root, handle_status,
    handle_submit_data, handle_update_participant,
};
use self::middleware::basic_auth_middleware;
use self::state::AppState;

/// Maximum request body size: 10 MB. Trial payloads can be large.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

pub(crate) struct RouteInfo {
    pub(crate) method: &'static str,
    pub(crate) path: &'static str,
    pub(crate) admin: bool,
    pub(crate) description: &'static str,
}

const fn route(
    method: &'static str,
    path: &'static str,
    admin: bool,
    description: &'static str,
) -> RouteInfo {
    RouteInfo {
        method,
        path,
        admin,
        description,
    }
}

/// Every API route. The auth middleware consults `admin` here.
pub(crate) const ROUTES: &[RouteInfo] = &[
    route("POST", "/init", false, "enter the experiment"),
    route("POST", "/participants", false, "register a participant"),
    route("PATCH", "/participants", false, "update a participant's status"),
    route("POST", "/data", false, "submit trial data"),
    route("GET", "/refresh", false, "run one reclamation sweep"),
    route("GET", "/participants", true, "list participants"),
    route("GET", "/status", true, "participant counts per status"),
    route("GET", "/info", true, "app name and allotted time"),
    route("GET", "/docs", true, "this route table"),
    route("GET", "/health", false, "server status"),
    route("GET", "/ip", false, "caller address"),
    route("GET", "/", false, "redirect to the experiment"),
];

pub(crate) fn requires_admin(method: &Method, path: &str) -> bool {
    ROUTES
        .iter()
        .any(|r| r.admin && r.path == path && r.method == method.as_str())
}

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

pub(crate) fn build_router<S: ExperimentStorage>(
    state: Arc<AppState<S>>,
    frontend_dir: Option<PathBuf>,
) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH])
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/ip", get(handle_ip))
        .route("/init", post(handle_init::<S>))
        .route(
            "/participants",
            get(handle_list_participants::<S>)
                .post(handle_create_participant::<S>)
                .patch(handle_update_participant::<S>),
        )
        .route("/data", post(handle_submit_data::<S>))
        .route("/refresh", get(handle_refresh::<S>))
        .route("/status", get(handle_status::<S>))
        .route("/info", get(handle_info::<S>));

    if !state.engine.settings().is_production() {
        app = app.route("/docs", get(handle_docs));
    }
    if let Some(dir) = frontend_dir {
        app = app.nest_service("/exp", ServeDir::new(dir).append_index_html_on_directories(true));
    }

    app.fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            basic_auth_middleware::<S>,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Serve until Ctrl+C, with the sweeper running alongside.
pub async fn start_server<S: ExperimentStorage>(
    engine: LifecycleEngine<S>,
    host: &str,
    port: u16,
    frontend_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(dir) = &frontend_dir {
        if !dir.is_dir() {
            return Err(format!("frontend directory {} does not exist", dir.display()).into());
        }
    }

    let refresh = engine.settings().refresh_interval();
    let sweeper = spawn_sweeper(Arc::new(engine.clone()), refresh);

    let state = Arc::new(AppState::new(engine));
    let app = build_router(state, frontend_dir);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("cohort listening on http://{}", addr);
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    sweeper.shutdown().await;
    served?;
    tracing::info!("server shut down");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}
