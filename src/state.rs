//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::config::Settings;
use crate::migrator::{MigrationStep, Migrator};
use crate::plan::registrar_plan;
use deadpool_postgres::Pool;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Application state shared across all handlers
pub struct AppState {
    /// Database connection pool
    pub db_pool: Pool,

    pub settings: Settings,

    pub migrator: Migrator,

    /// The registrar plan, in order
    pub plan: Vec<MigrationStep>,

    /// Held for the whole of any schema-changing request
    pub run_lock: Mutex<()>,
}

impl AppState {
    pub fn new(pool: Pool, settings: Settings) -> Self {
        Self {
            db_pool: pool,
            settings,
            migrator: Migrator::new(),
            plan: registrar_plan(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn schema(&self) -> &str {
        &self.settings.database.schema
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
