//! services/api/src/web/middleware.rs
//!
//! Authentication middleware for protecting routes.

use crate::web::{auth::session_cookie, state::AppState};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use plantgo_core::ports::PortError;
use std::sync::Arc;
use tracing::{debug, error};

/// Resolves the `session` cookie to a user id and stores it in the request
/// extensions as `Extension<Uuid>`. Missing or stale sessions get a 401.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_session_id = session_cookie(req.headers())
        .map(str::to_string)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let user_id = match state.db.validate_auth_session(&auth_session_id).await {
        Ok(user_id) => user_id,
        Err(PortError::Unauthorized) | Err(PortError::NotFound(_)) => {
            debug!("Rejected an unknown or expired session.");
            return Err(StatusCode::UNAUTHORIZED);
        }
        Err(e) => {
            error!("Failed to validate auth session: {:?}", e);
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
    };

    req.extensions_mut().insert(user_id);
    Ok(next.run(req).await)
}
