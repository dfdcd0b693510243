//! HTTP Basic authentication for the admin routes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cohort_core::ExperimentStorage;

use super::state::AppState;

/// Admin routes are rejected with a Basic challenge unless the
/// `Authorization` header carries the configured admin credentials. Other
/// routes pass through.
pub(crate) async fn basic_auth_middleware<S: ExperimentStorage>(
    State(state): State<Arc<AppState<S>>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if !super::requires_admin(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    let authorized = basic_credentials(request.headers())
        .is_some_and(|(user, pass)| state.admin.verify(&user, &pass));

    if authorized {
        return next.run(request).await;
    }
    tracing::warn!(path = %request.uri().path(), "rejected admin request");
    (
        [(header::WWW_AUTHENTICATE, "Basic")],
        super::json_error(StatusCode::UNAUTHORIZED, "Incorrect email or password"),
    )
        .into_response()
}

/// Decode `Authorization: Basic <base64(user:pass)>`.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
