//! Migration sources
//!
//! Files follow the `{version}_{name}.up.sql` / `{version}_{name}.down.sql`
//! naming convention.

use super::MigrationError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

/// One versioned schema change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub up: String,
    /// `None` when the change cannot be rolled back
    pub down: Option<String>,
}

/// Ordered list of migrations, ascending by version
pub trait MigrationSource: Send + Sync {
    fn load(&self) -> Result<Vec<Migration>, MigrationError>;
}

/// Migrations held in memory
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    migrations: Vec<Migration>,
}

impl StaticSource {
    pub fn new(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self { migrations }
    }

    /// The repository's `migrations/` directory, compiled into the binary
    pub fn bundled() -> Self {
        Self::new(vec![
            Migration {
                version: 1,
                name: "create_todos".to_string(),
                up: include_str!("../../migrations/1_create_todos.up.sql").to_string(),
                down: Some(include_str!("../../migrations/1_create_todos.down.sql").to_string()),
            },
            Migration {
                version: 2,
                name: "index_todos_status".to_string(),
                up: include_str!("../../migrations/2_index_todos_status.up.sql").to_string(),
                down: Some(
                    include_str!("../../migrations/2_index_todos_status.down.sql").to_string(),
                ),
            },
        ])
    }
}

impl MigrationSource for StaticSource {
    fn load(&self) -> Result<Vec<Migration>, MigrationError> {
        if let Some(pair) = self.migrations.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(MigrationError::Source(format!(
                "duplicate migration version {}",
                pair[0].version
            )));
        }
        Ok(self.migrations.clone())
    }
}

/// Migrations read from a directory on every load
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[derive(Default)]
struct PendingMigration {
    name: String,
    up: Option<String>,
    down: Option<String>,
}

impl MigrationSource for DirectorySource {
    fn load(&self) -> Result<Vec<Migration>, MigrationError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            MigrationError::Source(format!("cannot read {}: {}", self.dir.display(), e))
        })?;

        let mut found: BTreeMap<i64, PendingMigration> = BTreeMap::new();

        for entry in entries {
            let entry = entry.map_err(|e| MigrationError::Source(e.to_string()))?;
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((version, name, is_up)) = parse_file_name(file_name) else {
                debug!(file = %file_name, "Skipping non-migration file");
                continue;
            };

            let sql = std::fs::read_to_string(&path).map_err(|e| {
                MigrationError::Source(format!("cannot read {}: {}", path.display(), e))
            })?;

            let pending = found.entry(version).or_default();
            if !pending.name.is_empty() && pending.name != name {
                return Err(MigrationError::Source(format!(
                    "duplicate migration version {}: {} and {}",
                    version, pending.name, name
                )));
            }
            pending.name = name.to_string();

            let slot = if is_up { &mut pending.up } else { &mut pending.down };
            if slot.replace(sql).is_some() {
                return Err(MigrationError::Source(format!(
                    "duplicate {} file for version {}",
                    if is_up { "up" } else { "down" },
                    version
                )));
            }
        }

        found
            .into_iter()
            .map(|(version, pending)| {
                let up = pending.up.ok_or_else(|| {
                    MigrationError::Source(format!("version {} has no up file", version))
                })?;
                Ok(Migration {
                    version,
                    name: pending.name,
                    up,
                    down: pending.down,
                })
            })
            .collect()
    }
}

/// `12_create_todos.up.sql` -> `(12, "create_todos", true)`
fn parse_file_name(file_name: &str) -> Option<(i64, &str, bool)> {
    let stem = file_name.strip_suffix(".sql")?;
    let (stem, is_up) = match stem.strip_suffix(".up") {
        Some(stem) => (stem, true),
        None => (stem.strip_suffix(".down")?, false),
    };
    let (version, name) = stem.split_once('_')?;
    let version = version.parse().ok()?;
    Some((version, name, is_up))
}
