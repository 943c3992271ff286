//! Database connection strings and pool construction
//!
//! A [`Dsn`] renders to the connection-string forms used across the
//! deployment (`user:pass@tcp(host:port)/db` locally, the `/cloudsql` unix
//! socket form on Cloud Run) and is turned into a pooled
//! [`ConnectionHandle`] with its limits applied before anyone can use it.

use crate::config::DatabaseConfig;
use deadpool_postgres::{
    Config, CreatePoolError, ManagerConfig, Object, Pool, PoolConfig, PoolError, RecyclingMethod,
    Runtime, Timeouts,
};
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// Directory Cloud Run mounts Cloud SQL sockets under
pub const CLOUD_SQL_SOCKET_DIR: &str = "/cloudsql";

const CLOUD_DSN_PARAMS: &str = "charset=utf8mb4&parseTime=True&loc=Local";

/// Maximum time a connection may be reused
pub const MAX_CONN_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// TCP/socket connect deadline for a new physical connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for creating a pooled connection, including authentication
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(15);
/// Deadline for a checkout when every connection is in use
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to create pool for {dsn}: {source}")]
    Build {
        dsn: String,
        #[source]
        source: CreatePoolError,
    },

    #[error("Failed to open database connection to {dsn}: {source}")]
    Open {
        dsn: String,
        #[source]
        source: PoolError,
    },

    #[error("Failed to verify database connection to {dsn}: {source}")]
    Verify {
        dsn: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("Failed to check out a pooled connection: {0}")]
    Checkout(#[source] PoolError),

    #[error("Database connection has not been opened")]
    NotOpen,

    #[error("Invalid pool limits: {0}")]
    InvalidLimits(&'static str),
}

/// Where the database listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbAddress {
    Tcp { host: String, port: u16 },
    /// Cloud SQL instance connection name, `project:region:instance`
    CloudSocket { instance: String },
}

/// Database connection target
#[derive(Clone, PartialEq, Eq)]
pub struct Dsn {
    pub user: String,
    pub password: String,
    pub address: DbAddress,
    pub database: String,
    pub params: Option<String>,
}

impl Dsn {
    /// `user:pass@tcp(host:port)/db`
    pub fn local(name: &str, username: &str, password: &str, ip: &str, port: u16) -> Self {
        Self {
            user: username.to_string(),
            password: password.to_string(),
            address: DbAddress::Tcp {
                host: ip.to_string(),
                port,
            },
            database: name.to_string(),
            params: None,
        }
    }

    /// `user:pass@unix(/cloudsql/{instance})/db?charset=utf8mb4&parseTime=True&loc=Local`
    pub fn cloud(name: &str, username: &str, password: &str, cloudsql_instance: &str) -> Self {
        Self {
            user: username.to_string(),
            password: password.to_string(),
            address: DbAddress::CloudSocket {
                instance: cloudsql_instance.to_string(),
            },
            database: name.to_string(),
            params: Some(CLOUD_DSN_PARAMS.to_string()),
        }
    }

    /// Same form with the password masked, for logs
    pub fn redacted(&self) -> String {
        self.render("****")
    }

    fn render(&self, password: &str) -> String {
        let target = match &self.address {
            DbAddress::Tcp { host, port } => format!("tcp({}:{})", host, port),
            DbAddress::CloudSocket { instance } => {
                format!("unix({}/{})", CLOUD_SQL_SOCKET_DIR, instance)
            }
        };
        let mut dsn = format!("{}:{}@{}/{}", self.user, password, target, self.database);
        if let Some(params) = &self.params {
            dsn.push('?');
            dsn.push_str(params);
        }
        dsn
    }

    /// Driver configuration; query parameters are not forwarded
    fn pool_config(&self, limits: &PoolLimits) -> Config {
        let mut cfg = Config::new();
        match &self.address {
            DbAddress::Tcp { host, port } => {
                cfg.host = Some(host.clone());
                cfg.port = Some(*port);
            }
            DbAddress::CloudSocket { instance } => {
                cfg.host = Some(format!("{}/{}", CLOUD_SQL_SOCKET_DIR, instance));
            }
        }
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.dbname = Some(self.database.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.connect_timeout = Some(CONNECT_TIMEOUT);

        let mut timeouts = Timeouts::default();
        timeouts.wait = Some(WAIT_TIMEOUT);
        timeouts.create = Some(CREATE_TIMEOUT);
        timeouts.recycle = Some(CREATE_TIMEOUT);

        let mut pool = PoolConfig::new(limits.max_open);
        pool.timeouts = timeouts;
        cfg.pool = Some(pool);
        cfg
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(&self.password))
    }
}

impl fmt::Debug for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Dsn").field(&self.redacted()).finish()
    }
}

/// Pool sizing, fixed once the pool exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_idle: usize,
    pub max_open: usize,
    pub max_lifetime: Duration,
}

impl From<&DatabaseConfig> for PoolLimits {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            max_idle: config.max_idle_conns,
            max_open: config.max_open_conns,
            max_lifetime: MAX_CONN_LIFETIME,
        }
    }
}

struct HandleInner {
    pool: Pool,
    limits: PoolLimits,
    dsn: Dsn,
}

/// Shared pooled database handle; clones refer to the same pool
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Build the pool with `limits` applied, then prove one connection works.
    pub async fn connect(dsn: &Dsn, limits: PoolLimits) -> Result<Self, ConnectionError> {
        let handle = Self::build(dsn, limits)?;

        let client = handle
            .inner
            .pool
            .get()
            .await
            .map_err(|source| ConnectionError::Open {
                dsn: dsn.redacted(),
                source,
            })?;
        client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|source| ConnectionError::Verify {
                dsn: dsn.redacted(),
                source,
            })?;
        drop(client);

        info!(
            dsn = %dsn.redacted(),
            max_open = limits.max_open,
            max_idle = limits.max_idle,
            "Database connection pool established"
        );
        Ok(handle)
    }

    /// Pool without any connection attempt
    fn build(dsn: &Dsn, limits: PoolLimits) -> Result<Self, ConnectionError> {
        // A zero-sized pool never hands out a connection
        if limits.max_open == 0 {
            return Err(ConnectionError::InvalidLimits("max_open must be at least 1"));
        }

        let pool = dsn
            .pool_config(&limits)
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|source| ConnectionError::Build {
                dsn: dsn.redacted(),
                source,
            })?;

        Ok(Self {
            inner: Arc::new(HandleInner {
                pool,
                limits,
                dsn: dsn.clone(),
            }),
        })
    }

    /// Check out a connection
    pub async fn get(&self) -> Result<Object, ConnectionError> {
        self.trim_idle();
        self.inner.pool.get().await.map_err(ConnectionError::Checkout)
    }

    pub fn limits(&self) -> PoolLimits {
        self.inner.limits
    }

    pub fn dsn(&self) -> &Dsn {
        &self.inner.dsn
    }

    /// True when both handles share one pool
    #[cfg(test)]
    pub fn same_pool(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Drop idle connections past their lifetime or beyond `max_idle`.
    fn trim_idle(&self) {
        let limits = self.inner.limits;
        let kept = Cell::new(0usize);
        let dropped = Cell::new(0usize);

        let _ = self.inner.pool.retain(|_, metrics| {
            let keep = metrics.age() < limits.max_lifetime && kept.get() < limits.max_idle;
            if keep {
                kept.set(kept.get() + 1);
            } else {
                dropped.set(dropped.get() + 1);
            }
            keep
        });

        if dropped.get() > 0 {
            debug!(dropped = dropped.get(), kept = kept.get(), "Released idle connections");
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("dsn", &self.inner.dsn)
            .field("limits", &self.inner.limits)
            .finish()
    }
}
