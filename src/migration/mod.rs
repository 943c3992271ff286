//! Schema migrations
//!
//! [`MigrationRunner`] moves the schema exactly one version forward or
//! back per call. Calls within a process are serialized; running migrators
//! in several processes against one database at once is not guarded here.

mod driver;
mod source;

pub use driver::{MigrationDriver, PostgresDriver};
pub use source::{DirectorySource, Migration, MigrationSource, StaticSource};

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Boxed error from a [`MigrationDriver`]
pub type DriverError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("could not ping DB: {0}")]
    Ping(#[source] DriverError),

    #[error("failed to prepare migration bookkeeping: {0}")]
    Setup(#[source] DriverError),

    #[error("failed to read current migration version: {0}")]
    ReadVersion(#[source] DriverError),

    #[error("migration source error: {0}")]
    Source(String),

    #[error("database is dirty at version {0}; fix it manually before migrating")]
    Dirty(i64),

    #[error("no pending migration to apply")]
    NoPendingMigration,

    #[error("no applied migration to roll back")]
    NothingToRollback,

    #[error("applied version {0} is not present in the migration source")]
    UnknownVersion(i64),

    #[error("migration {0} has no down step")]
    Irreversible(i64),

    #[error("failed to {direction} migration {version}: {source}")]
    Step {
        version: i64,
        direction: Direction,
        #[source]
        source: DriverError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("apply"),
            Direction::Down => f.write_str("roll back"),
        }
    }
}

/// Bookkeeping row as stored by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedVersion {
    pub version: i64,
    pub dirty: bool,
}

/// A single planned migration step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub direction: Direction,
    /// Migration whose SQL is run
    pub version: i64,
    pub sql: String,
    /// Version recorded after success; `None` means nothing applied
    pub target: Option<i64>,
}

/// What a call to the runner changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub direction: Direction,
    pub from: Option<i64>,
    pub to: Option<i64>,
}

/// Work out the single step to take from `current` in `direction`.
///
/// `migrations` must be ascending by version.
pub fn plan_step(
    migrations: &[Migration],
    current: Option<AppliedVersion>,
    direction: Direction,
) -> Result<Step, MigrationError> {
    if let Some(AppliedVersion { version, dirty: true }) = current {
        return Err(MigrationError::Dirty(version));
    }
    let current = current.map(|c| c.version);

    match direction {
        Direction::Up => {
            let next = migrations
                .iter()
                .find(|m| current.map_or(true, |v| m.version > v))
                .ok_or(MigrationError::NoPendingMigration)?;
            Ok(Step {
                direction,
                version: next.version,
                sql: next.up.clone(),
                target: Some(next.version),
            })
        }
        Direction::Down => {
            let version = current.ok_or(MigrationError::NothingToRollback)?;
            let index = migrations
                .iter()
                .position(|m| m.version == version)
                .ok_or(MigrationError::UnknownVersion(version))?;
            let migration = &migrations[index];
            let sql = migration
                .down
                .clone()
                .ok_or(MigrationError::Irreversible(version))?;
            Ok(Step {
                direction,
                version,
                sql,
                target: index.checked_sub(1).map(|i| migrations[i].version),
            })
        }
    }
}

/// Applies or reverts one migration step at a time
pub struct MigrationRunner {
    driver: Arc<dyn MigrationDriver>,
    source: Arc<dyn MigrationSource>,
    lock: Mutex<()>,
}

impl MigrationRunner {
    pub fn new(driver: Arc<dyn MigrationDriver>, source: Arc<dyn MigrationSource>) -> Self {
        Self {
            driver,
            source,
            lock: Mutex::new(()),
        }
    }

    /// Apply the next pending migration
    pub async fn start_migrations(&self) -> Result<MigrationOutcome, MigrationError> {
        self.step(Direction::Up).await
    }

    /// Revert the most recently applied migration
    pub async fn rollback_last_migrations(&self) -> Result<MigrationOutcome, MigrationError> {
        self.step(Direction::Down).await
    }

    async fn step(&self, direction: Direction) -> Result<MigrationOutcome, MigrationError> {
        let _guard = self.lock.lock().await;

        let result = self.step_locked(direction).await;
        match &result {
            Ok(outcome) => info!(
                direction = %outcome.direction,
                from = ?outcome.from,
                to = ?outcome.to,
                "Migration step complete"
            ),
            Err(e) => error!(direction = %direction, error = %e, "Migration step failed"),
        }
        result
    }

    async fn step_locked(&self, direction: Direction) -> Result<MigrationOutcome, MigrationError> {
        self.driver.ping().await.map_err(MigrationError::Ping)?;
        self.driver.prepare().await.map_err(MigrationError::Setup)?;

        let migrations = self.source.load()?;
        let current = self
            .driver
            .version()
            .await
            .map_err(MigrationError::ReadVersion)?;
        let step = plan_step(&migrations, current, direction)?;

        self.driver
            .apply(&step)
            .await
            .map_err(|source| MigrationError::Step {
                version: step.version,
                direction,
                source,
            })?;

        Ok(MigrationOutcome {
            direction,
            from: current.map(|c| c.version),
            to: step.target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn migration(version: i64, reversible: bool) -> Migration {
        Migration {
            version,
            name: format!("m{version}"),
            up: format!("-- up {version}"),
            down: reversible.then(|| format!("-- down {version}")),
        }
    }

    fn applied(version: i64) -> Option<AppliedVersion> {
        Some(AppliedVersion {
            version,
            dirty: false,
        })
    }

    /// In-memory bookkeeping that flags overlapping steps
    #[derive(Default)]
    struct MemoryDriver {
        version: StdMutex<Option<AppliedVersion>>,
        history: StdMutex<Vec<Option<i64>>>,
        in_flight: AtomicUsize,
        overlapped: AtomicBool,
        ping_fails: bool,
        apply_fails: bool,
    }

    #[async_trait]
    impl MigrationDriver for MemoryDriver {
        async fn ping(&self) -> Result<(), DriverError> {
            if self.ping_fails {
                return Err("connection refused".into());
            }
            Ok(())
        }

        async fn prepare(&self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn version(&self) -> Result<Option<AppliedVersion>, DriverError> {
            Ok(*self.version.lock().unwrap())
        }

        async fn apply(&self, step: &Step) -> Result<(), DriverError> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.apply_fails {
                return Err("syntax error".into());
            }
            *self.version.lock().unwrap() = step.target.map(|version| AppliedVersion {
                version,
                dirty: false,
            });
            self.history.lock().unwrap().push(step.target);
            Ok(())
        }
    }

    fn runner(driver: Arc<MemoryDriver>, migrations: Vec<Migration>) -> MigrationRunner {
        MigrationRunner::new(driver, Arc::new(StaticSource::new(migrations)))
    }

    #[test]
    fn test_plan_up_from_empty() {
        let migrations = vec![migration(1, true), migration(2, true)];
        let step = plan_step(&migrations, None, Direction::Up).unwrap();
        assert_eq!(step.version, 1);
        assert_eq!(step.target, Some(1));
        assert_eq!(step.sql, "-- up 1");
    }

    #[test]
    fn test_plan_up_advances_one() {
        let migrations = vec![migration(1, true), migration(5, true), migration(9, true)];
        let step = plan_step(&migrations, applied(5), Direction::Up).unwrap();
        assert_eq!(step.target, Some(9));
    }

    #[test]
    fn test_plan_up_with_nothing_pending() {
        let migrations = vec![migration(1, true)];
        let err = plan_step(&migrations, applied(1), Direction::Up).unwrap_err();
        assert!(matches!(err, MigrationError::NoPendingMigration));
    }

    #[test]
    fn test_plan_down_targets_previous() {
        let migrations = vec![migration(1, true), migration(5, true)];
        let step = plan_step(&migrations, applied(5), Direction::Down).unwrap();
        assert_eq!(step.version, 5);
        assert_eq!(step.sql, "-- down 5");
        assert_eq!(step.target, Some(1));

        let step = plan_step(&migrations, applied(1), Direction::Down).unwrap();
        assert_eq!(step.target, None);
    }

    #[test]
    fn test_plan_down_errors() {
        let migrations = vec![migration(1, false), migration(2, true)];

        assert!(matches!(
            plan_step(&migrations, None, Direction::Down),
            Err(MigrationError::NothingToRollback)
        ));
        assert!(matches!(
            plan_step(&migrations, applied(1), Direction::Down),
            Err(MigrationError::Irreversible(1))
        ));
        assert!(matches!(
            plan_step(&migrations, applied(7), Direction::Down),
            Err(MigrationError::UnknownVersion(7))
        ));
    }

    #[test]
    fn test_plan_refuses_dirty_state() {
        let migrations = vec![migration(1, true), migration(2, true)];
        let dirty = Some(AppliedVersion {
            version: 1,
            dirty: true,
        });
        for direction in [Direction::Up, Direction::Down] {
            assert!(matches!(
                plan_step(&migrations, dirty, direction),
                Err(MigrationError::Dirty(1))
            ));
        }
    }

    #[tokio::test]
    async fn test_start_then_rollback_round_trip() {
        let driver = Arc::new(MemoryDriver::default());
        *driver.version.lock().unwrap() = applied(1);
        let runner = runner(driver.clone(), vec![migration(1, true), migration(2, true)]);

        let up = runner.start_migrations().await.unwrap();
        assert_eq!(
            up,
            MigrationOutcome {
                direction: Direction::Up,
                from: Some(1),
                to: Some(2),
            }
        );

        let down = runner.rollback_last_migrations().await.unwrap();
        assert_eq!(down.to, Some(1));
        assert_eq!(*driver.version.lock().unwrap(), applied(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_never_overlap() {
        let driver = Arc::new(MemoryDriver::default());
        let migrations = (1..=4).map(|v| migration(v, true)).collect();
        let runner = Arc::new(runner(driver.clone(), migrations));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let runner = runner.clone();
                tokio::spawn(async move { runner.start_migrations().await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(!driver.overlapped.load(Ordering::SeqCst));
        assert_eq!(
            *driver.history.lock().unwrap(),
            vec![Some(1), Some(2), Some(3), Some(4)]
        );
    }

    #[tokio::test]
    async fn test_ping_failure_stops_step() {
        let driver = Arc::new(MemoryDriver {
            ping_fails: true,
            ..Default::default()
        });
        let runner = runner(driver.clone(), vec![migration(1, true)]);

        let err = runner.start_migrations().await.unwrap_err();

        assert!(matches!(err, MigrationError::Ping(_)));
        assert!(driver.history.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_step_keeps_version_and_releases_lock() {
        let driver = Arc::new(MemoryDriver {
            apply_fails: true,
            ..Default::default()
        });
        let runner = runner(driver.clone(), vec![migration(1, true)]);

        for _ in 0..2 {
            let err = runner.start_migrations().await.unwrap_err();
            assert!(matches!(err, MigrationError::Step { version: 1, direction: Direction::Up, .. }));
        }
        assert_eq!(*driver.version.lock().unwrap(), None);
    }

    #[tokio::test]
    async fn test_rollback_with_nothing_applied() {
        let driver = Arc::new(MemoryDriver::default());
        let runner = runner(driver, vec![migration(1, true)]);

        let err = runner.rollback_last_migrations().await.unwrap_err();
        assert!(matches!(err, MigrationError::NothingToRollback));
    }
}
