pub mod auth;
pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod ws_handler;

pub use middleware::require_auth;
pub use ws_handler::ws_handler;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use state::AppState;
use std::sync::Arc;

/// Builds the API routes: public auth endpoints plus everything behind `require_auth`.
pub fn router(app_state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/auth/signup", post(auth::signup_handler))
        .route("/auth/login", post(auth::login_handler))
        .route("/auth/logout", post(auth::logout_handler));

    let protected_routes = Router::new()
        .route("/me", get(rest::me_handler))
        .route("/observations", post(rest::submit_observation_handler))
        .route("/discoveries", get(rest::list_discoveries_handler))
        .route("/missions", post(rest::missions_handler))
        .route("/challenges", post(rest::create_challenge_handler))
        .route("/challenges/join", post(rest::join_challenge_handler))
        .route(
            "/challenges/active",
            get(rest::active_challenge_handler).delete(rest::leave_challenge_handler),
        )
        .route(
            "/challenges/{challenge_id}/leaderboard",
            get(rest::leaderboard_handler),
        )
        .route("/ws", get(ws_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(app_state)
}
