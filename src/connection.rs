//! Database Connection Manager
//!
//! Owns the one pooled handle of the process. The DSN form is chosen once
//! at construction from the resolved environment; the pool is opened on the
//! first [`ConnectionManager::open`] and every later caller gets the same
//! handle.

use crate::config::Settings;
use crate::db::{ConnectionError, ConnectionHandle, Dsn, PoolLimits};
use tokio::sync::OnceCell;
use tracing::{debug, error};

pub struct ConnectionManager {
    dsn: Dsn,
    limits: PoolLimits,
    handle: OnceCell<ConnectionHandle>,
}

impl ConnectionManager {
    /// Pick the DSN for `settings`: the Cloud SQL socket form in production
    /// and development, local TCP otherwise.
    pub fn new(settings: &Settings) -> Self {
        let db = &settings.database;
        let dsn = if settings.is_production() || settings.is_development() {
            Self::generate_dsn_for_cloud_db(&db.name, &db.username, &db.password, &db.cloudsql_instance)
        } else {
            Self::generate_dsn_local(&db.name, &db.username, &db.password, &db.ip, db.port)
        };

        debug!(dsn = %dsn.redacted(), environment = %settings.environment, "Selected database target");

        Self {
            dsn,
            limits: PoolLimits::from(db),
            handle: OnceCell::new(),
        }
    }

    pub fn generate_dsn_local(name: &str, username: &str, password: &str, ip: &str, port: u16) -> Dsn {
        Dsn::local(name, username, password, ip, port)
    }

    pub fn generate_dsn_for_cloud_db(
        name: &str,
        username: &str,
        password: &str,
        cloudsql_instance: &str,
    ) -> Dsn {
        Dsn::cloud(name, username, password, cloudsql_instance)
    }

    pub fn dsn(&self) -> &Dsn {
        &self.dsn
    }

    /// Open the pool for `dsn` unless one already exists.
    ///
    /// Concurrent first callers wait on a single construction. Once a handle
    /// exists it is returned as-is, whatever `dsn` is passed.
    pub async fn open(&self, dsn: &Dsn) -> Result<ConnectionHandle, ConnectionError> {
        self.handle
            .get_or_try_init(|| async {
                ConnectionHandle::connect(dsn, self.limits).await.inspect_err(|e| {
                    error!(severity = "critical", error = %e, "Failed to open database connection");
                })
            })
            .await
            .cloned()
    }

    /// Open the pool for the DSN chosen at construction
    pub async fn connect(&self) -> Result<ConnectionHandle, ConnectionError> {
        self.open(&self.dsn).await
    }

    /// The live handle, once opened
    pub fn db(&self) -> Result<ConnectionHandle, ConnectionError> {
        self.handle.get().cloned().ok_or(ConnectionError::NotOpen)
    }
}
