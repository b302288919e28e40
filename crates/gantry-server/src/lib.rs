//! Runner protocol server for Gantry.
//!
//! Exposes the endpoints runners long-poll for tasks and report task state
//! to, plus health checks.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
