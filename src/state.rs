//! Application state management
//!
//! Built once at startup after the pool is open and shared by reference
//! with every consumer.

use crate::config::Settings;
use crate::connection::ConnectionManager;
use crate::db::ConnectionError;
use crate::migration::{
    DirectorySource, MigrationRunner, MigrationSource, PostgresDriver, StaticSource,
};
use crate::todo::TodoService;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Arc<Settings>,

    /// Owner of the process-wide pool
    pub connections: Arc<ConnectionManager>,

    /// Serialized schema migrations against the same pool
    pub migrations: MigrationRunner,

    pub todos: TodoService,
}

impl AppState {
    /// Requires an opened connection manager
    pub fn new(
        settings: Arc<Settings>,
        connections: Arc<ConnectionManager>,
    ) -> Result<Self, ConnectionError> {
        let handle = connections.db()?;
        let migrations = MigrationRunner::new(
            Arc::new(PostgresDriver::new(handle)),
            migration_source(&settings.migrations_dir),
        );

        let todos = TodoService::new(Arc::clone(&connections));

        Ok(Self {
            settings,
            connections,
            migrations,
            todos,
        })
    }
}

/// Files under `dir` when it exists, otherwise the migrations built into the binary
fn migration_source(dir: &str) -> Arc<dyn MigrationSource> {
    if Path::new(dir).is_dir() {
        Arc::new(DirectorySource::new(dir))
    } else {
        warn!(dir, "Migrations directory not found, using bundled migrations");
        Arc::new(StaticSource::bundled())
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
