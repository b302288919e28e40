//! API routes.

pub mod health;
pub mod runner;

use axum::Router;

use crate::AppState;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/actions/runner", runner::router())
        .merge(health::router())
        .with_state(state)
}
