//! Migration drivers
//!
//! The PostgreSQL driver keeps a single-row `schema_migrations` table and
//! runs each step together with its version update in one transaction.

use super::{AppliedVersion, DriverError, Step};
use crate::db::ConnectionHandle;
use async_trait::async_trait;
use tracing::debug;

const DEFAULT_MIGRATIONS_TABLE: &str = "schema_migrations";

/// Database side of the migration runner
#[async_trait]
pub trait MigrationDriver: Send + Sync {
    async fn ping(&self) -> Result<(), DriverError>;

    /// Create the bookkeeping table if needed
    async fn prepare(&self) -> Result<(), DriverError>;

    async fn version(&self) -> Result<Option<AppliedVersion>, DriverError>;

    /// Run `step.sql` and record `step.target` as the current version
    async fn apply(&self, step: &Step) -> Result<(), DriverError>;
}

pub struct PostgresDriver {
    handle: ConnectionHandle,
    table: String,
}

impl PostgresDriver {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            table: DEFAULT_MIGRATIONS_TABLE.to_string(),
        }
    }
}

#[async_trait]
impl MigrationDriver for PostgresDriver {
    async fn ping(&self) -> Result<(), DriverError> {
        let client = self.handle.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn prepare(&self) -> Result<(), DriverError> {
        let client = self.handle.get().await?;
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (version BIGINT NOT NULL PRIMARY KEY, dirty BOOLEAN NOT NULL)",
                self.table
            ))
            .await?;
        Ok(())
    }

    async fn version(&self) -> Result<Option<AppliedVersion>, DriverError> {
        let client = self.handle.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT version, dirty FROM \"{}\" LIMIT 1", self.table),
                &[],
            )
            .await?;

        Ok(row.map(|r| AppliedVersion {
            version: r.get(0),
            dirty: r.get(1),
        }))
    }

    async fn apply(&self, step: &Step) -> Result<(), DriverError> {
        let mut object = self.handle.get().await?;
        let client: &mut tokio_postgres::Client = &mut object;
        let tx = client.transaction().await?;

        tx.batch_execute(&step.sql).await?;
        tx.execute(&format!("DELETE FROM \"{}\"", self.table), &[])
            .await?;
        if let Some(version) = step.target {
            tx.execute(
                &format!(
                    "INSERT INTO \"{}\" (version, dirty) VALUES ($1, false)",
                    self.table
                ),
                &[&version],
            )
            .await?;
        }
        tx.commit().await?;

        debug!(version = step.version, target = ?step.target, "Migration SQL committed");
        Ok(())
    }
}
