//! Application state.

use std::sync::Arc;

use gantry_db::Database;
use gantry_scheduler::{Scheduler, SchedulerConfig};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub scheduler: Scheduler,
}

impl AppState {
    pub fn new(db: Arc<dyn Database>, config: SchedulerConfig) -> Self {
        let scheduler = Scheduler::new(db.clone(), config);
        Self { db, scheduler }
    }
}
