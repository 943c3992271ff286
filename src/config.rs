//! Application configuration module
//!
//! Resolves the process-wide [`Settings`] from environment variables exactly
//! once. In production the Cloud SQL instance and credentials are replaced by
//! values fetched from Secret Manager; lookup failures do not abort resolution
//! and are reported back as [`SecretWarning`]s instead.

use crate::secret::{SecretError, SecretManagerClient, SecretStore};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

pub const ENV_TEST: &str = "test";
pub const ENV_DEVELOPMENT: &str = "development";
pub const ENV_PRODUCTION: &str = "production";

const DEFAULT_APP_ENV: &str = ENV_TEST;
const DEFAULT_IMAGE_NAME: &str = "go-cloudrun-boilerplate";
const DEFAULT_PORT: u16 = 1323;
const DEFAULT_DB_IP: &str = "127.0.0.1";
const DEFAULT_DB_PORT: u16 = 3306;
const DEFAULT_MAX_IDLE_CONNS: usize = 10;
const DEFAULT_MAX_OPEN_CONNS: usize = 100;
const DEFAULT_BUCKET_NAME: &str = "go-cloudrun-boilerplate-us-central1-data";
const DEFAULT_OBJECT_NAME: &str = "test.json";
const DEFAULT_TIMEOUT_SECS: u64 = 1200;
const DEFAULT_DB_USERNAME: &str = "root";
const DEFAULT_DB_PASSWORD: &str = "admin";
const DEFAULT_DB_NAME: &str = "test";
const DEFAULT_MIGRATIONS_DIR: &str = "migrations";
const DEFAULT_SECRET_MANAGER_ENDPOINT: &str = "https://secretmanager.googleapis.com";
const ENV_ACCESS_TOKEN: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Secret name suffixes looked up in production, in lookup order.
pub const SECRET_CLOUDSQL_INSTANCES: &str = "CLOUDSQL_INSTANCES";
pub const SECRET_DB_NAME: &str = "DB_NAME";
pub const SECRET_DB_USERNAME: &str = "DB_USERNAME";
pub const SECRET_DB_PASSWORD: &str = "DB_PASSWORD";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Source of raw configuration values
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Deployment classification taken from `APP_ENV`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Test,
    Development,
    Production,
    /// Any value other than the three recognized ones
    Unclassified(String),
}

impl Environment {
    pub fn parse(value: &str) -> Self {
        match value {
            ENV_TEST => Environment::Test,
            ENV_DEVELOPMENT => Environment::Development,
            ENV_PRODUCTION => Environment::Production,
            other => Environment::Unclassified(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Environment::Test => ENV_TEST,
            Environment::Development => ENV_DEVELOPMENT,
            Environment::Production => ENV_PRODUCTION,
            Environment::Unclassified(other) => other,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub ip: String,
    pub port: u16,
    pub max_idle_conns: usize,
    pub max_open_conns: usize,
    pub username: String,
    pub password: String,
    pub cloudsql_instance: String,
    pub name: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("max_open_conns", &self.max_open_conns)
            .field("username", &self.username)
            .field("password", &"****")
            .field("cloudsql_instance", &self.cloudsql_instance)
            .field("name", &self.name)
            .finish()
    }
}

/// Bearer token kept out of `Debug` output
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(****)")
    }
}

/// Cloud Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket_name: String,
    pub object_name: String,
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,
    pub project_uuid: String,
    pub project_id: String,
    pub image_name: String,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub migrations_dir: String,
    pub secret_manager_endpoint: String,
    /// Pre-issued OAuth token for Secret Manager; the metadata server is used when unset
    pub access_token: Option<AccessToken>,
    /// Abort startup when a production secret lookup fails
    pub strict_secrets: bool,
}

impl Settings {
    /// Read settings from `source`, applying defaults and required-field checks.
    ///
    /// No secret lookups happen here; see [`ConfigResolver`].
    pub fn from_source(source: &dyn EnvSource) -> Result<Self, ConfigError> {
        let env = EnvReader { source };

        let environment = Environment::parse(&env.required("APP_ENV", Some(DEFAULT_APP_ENV))?);

        let server = ServerConfig {
            port: env.parsed("PORT", DEFAULT_PORT)?,
            timeout_secs: nonzero("TIMEOUT", env.parsed("TIMEOUT", DEFAULT_TIMEOUT_SECS)?)?,
        };

        let database = DatabaseConfig {
            ip: env.optional("DB_IP", DEFAULT_DB_IP),
            port: env.required_parsed("DB_PORT", DEFAULT_DB_PORT)?,
            max_idle_conns: env.parsed("DB_MAX_IDLE_CONNS", DEFAULT_MAX_IDLE_CONNS)?,
            max_open_conns: nonzero(
                "DB_MAX_OPEN_CONNS",
                env.parsed("DB_MAX_OPEN_CONNS", DEFAULT_MAX_OPEN_CONNS)?,
            )?,
            username: env.required("DB_USERNAME", Some(DEFAULT_DB_USERNAME))?,
            password: env.required("DB_PASSWORD", Some(DEFAULT_DB_PASSWORD))?,
            cloudsql_instance: env.optional("CLOUDSQL_INSTANCES", ""),
            name: env.required("DB_NAME", Some(DEFAULT_DB_NAME))?,
        };

        let storage = StorageConfig {
            bucket_name: env.optional("BUCKET_NAME", DEFAULT_BUCKET_NAME),
            object_name: env.optional("OBJECT_NAME", DEFAULT_OBJECT_NAME),
        };

        Ok(Self {
            environment,
            project_uuid: env.required("PROJECT_UUID", None)?,
            project_id: env.required("PROJECT_ID", None)?,
            image_name: env.required("IMAGE_NAME", Some(DEFAULT_IMAGE_NAME))?,
            server,
            database,
            storage,
            migrations_dir: env.optional("MIGRATIONS_DIR", DEFAULT_MIGRATIONS_DIR),
            secret_manager_endpoint: env
                .optional("SECRET_MANAGER_ENDPOINT", DEFAULT_SECRET_MANAGER_ENDPOINT),
            access_token: env
                .source
                .var(ENV_ACCESS_TOKEN)
                .filter(|t| !t.trim().is_empty())
                .map(AccessToken),
            strict_secrets: env.parsed("STRICT_SECRETS", false)?,
        })
    }

    pub fn is_test(&self) -> bool {
        self.environment == Environment::Test
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Secret name for a production override, e.g. `my-image-DB_NAME`
    pub fn secret_name(&self, field: &str) -> String {
        format!("{}-{}", self.image_name, field)
    }
}

struct EnvReader<'a> {
    source: &'a dyn EnvSource,
}

impl EnvReader<'_> {
    fn required(&self, key: &'static str, default: Option<&str>) -> Result<String, ConfigError> {
        let value = self
            .source
            .var(key)
            .or_else(|| default.map(str::to_string))
            .ok_or(ConfigError::MissingVar(key))?;

        if value.trim().is_empty() {
            return Err(ConfigError::MissingVar(key));
        }
        Ok(value)
    }

    fn optional(&self, key: &str, default: &str) -> String {
        self.source.var(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.source.var(key) {
            Some(raw) if !raw.trim().is_empty() => parse_value(key, &raw),
            _ => Ok(default),
        }
    }

    fn required_parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.source.var(key) {
            Some(raw) if raw.trim().is_empty() => Err(ConfigError::MissingVar(key)),
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }
}

/// Reject `0` for settings where it would disable the feature outright
fn nonzero<T>(key: &'static str, value: T) -> Result<T, ConfigError>
where
    T: Default + PartialEq + fmt::Display,
{
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// A production secret lookup that failed; the field kept its env/default value
#[derive(Debug)]
pub struct SecretWarning {
    pub field: &'static str,
    pub secret_name: String,
    pub error: SecretError,
}

impl fmt::Display for SecretWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.field, self.secret_name, self.error)
    }
}

/// Outcome of the one-time resolution
#[derive(Debug)]
pub struct Resolution {
    pub settings: Arc<Settings>,
    pub warnings: Vec<SecretWarning>,
}

/// Builds the secret store used for production overrides from the env-derived settings
pub type SecretStoreFactory = Box<dyn Fn(&Settings) -> Arc<dyn SecretStore> + Send + Sync>;

/// Resolves [`Settings`] once per process and hands out the shared result
pub struct ConfigResolver {
    source: Arc<dyn EnvSource>,
    secrets: SecretStoreFactory,
    resolved: OnceCell<Resolution>,
}

impl ConfigResolver {
    pub fn new(source: Arc<dyn EnvSource>, secrets: SecretStoreFactory) -> Self {
        Self {
            source,
            secrets,
            resolved: OnceCell::new(),
        }
    }

    /// Resolver over the process environment backed by Secret Manager
    pub fn from_process_env() -> Self {
        Self::new(
            Arc::new(ProcessEnv),
            Box::new(|settings: &Settings| -> Arc<dyn SecretStore> {
                Arc::new(SecretManagerClient::from_settings(settings))
            }),
        )
    }

    /// Resolve on first call; later and concurrent callers observe the same value.
    pub async fn resolve(&self) -> Result<&Resolution, ConfigError> {
        self.resolved.get_or_try_init(|| self.run_resolution()).await
    }

    pub async fn get_configuration(&self) -> Result<Arc<Settings>, ConfigError> {
        Ok(Arc::clone(&self.resolve().await?.settings))
    }

    async fn run_resolution(&self) -> Result<Resolution, ConfigError> {
        let mut settings = Settings::from_source(self.source.as_ref()).inspect_err(|e| {
            error!(
                severity = "critical",
                error = %e,
                "Required environment values are not defined properly"
            );
        })?;

        if let Environment::Unclassified(name) = &settings.environment {
            warn!(app_env = %name, "Unrecognized APP_ENV, using the local database target");
        } else if settings.is_test() {
            debug!("Test environment, secret overrides disabled");
        }

        let mut warnings = Vec::new();
        if settings.is_production() {
            let store = (self.secrets)(&settings);
            warnings = apply_secret_overrides(&mut settings, store.as_ref()).await;
        }

        info!(
            environment = %settings.environment,
            image = %settings.image_name,
            bucket = %settings.storage.bucket_name,
            object = %settings.storage.object_name,
            secret_warnings = warnings.len(),
            "Configuration resolved"
        );
        debug!(settings = ?settings, "Resolved settings");

        Ok(Resolution {
            settings: Arc::new(settings),
            warnings,
        })
    }
}

/// Overwrite the Cloud SQL fields with their secrets, keeping the old value on
/// failure or when the secret is blank.
async fn apply_secret_overrides(
    settings: &mut Settings,
    store: &dyn SecretStore,
) -> Vec<SecretWarning> {
    let mut warnings = Vec::new();

    for field in [
        SECRET_CLOUDSQL_INSTANCES,
        SECRET_DB_NAME,
        SECRET_DB_USERNAME,
        SECRET_DB_PASSWORD,
    ] {
        let secret_name = settings.secret_name(field);
        let lookup = store.get_secret(&secret_name).await.and_then(|value| {
            if value.trim().is_empty() {
                Err(SecretError::Empty {
                    secret_id: secret_name.clone(),
                })
            } else {
                Ok(value)
            }
        });
        match lookup {
            Ok(value) => {
                let db = &mut settings.database;
                match field {
                    SECRET_CLOUDSQL_INSTANCES => db.cloudsql_instance = value,
                    SECRET_DB_NAME => db.name = value,
                    SECRET_DB_USERNAME => db.username = value,
                    _ => db.password = value,
                }
            }
            Err(error) => {
                error!(
                    severity = "critical",
                    field,
                    secret = %secret_name,
                    error = %error,
                    "Failed to read secret, keeping environment value"
                );
                warnings.push(SecretWarning {
                    field,
                    secret_name,
                    error,
                });
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::SecretRef;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn base_env() -> HashMap<String, String> {
        HashMap::from([
            ("PROJECT_UUID".to_string(), "123456789".to_string()),
            ("PROJECT_ID".to_string(), "demo-project".to_string()),
        ])
    }

    fn env_with(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        let mut env = base_env();
        for (k, v) in pairs {
            env.insert(k.to_string(), v.to_string());
        }
        env
    }

    /// Records every lookup; secrets listed in `missing` fail with NotFound and
    /// those in `blank` hold only whitespace
    #[derive(Default)]
    struct RecordingStore {
        lookups: Mutex<Vec<String>>,
        missing: Vec<String>,
        blank: Vec<String>,
    }

    #[async_trait]
    impl SecretStore for RecordingStore {
        async fn get_secret(&self, secret_id: &str) -> Result<String, SecretError> {
            self.lookups.lock().unwrap().push(secret_id.to_string());
            if self.missing.iter().any(|m| m == secret_id) {
                return Err(SecretError::NotFound {
                    secret_id: secret_id.to_string(),
                });
            }
            if self.blank.iter().any(|b| b == secret_id) {
                return Ok("  ".to_string());
            }
            Ok(format!("secret:{secret_id}"))
        }

        async fn create_secret(
            &self,
            secret_id: &str,
            _plaintext: &str,
        ) -> Result<SecretRef, SecretError> {
            Ok(SecretRef {
                name: secret_id.to_string(),
            })
        }

        async fn delete_secret(&self, _secret_id: &str) -> Result<(), SecretError> {
            Ok(())
        }
    }

    fn resolver_with(
        env: HashMap<String, String>,
        store: Arc<RecordingStore>,
    ) -> ConfigResolver {
        ConfigResolver::new(
            Arc::new(env),
            Box::new(move |_: &Settings| -> Arc<dyn SecretStore> { store.clone() }),
        )
    }

    #[test]
    fn test_defaults_applied() {
        let settings = Settings::from_source(&base_env()).unwrap();

        assert_eq!(settings.environment, Environment::Test);
        assert_eq!(settings.image_name, "go-cloudrun-boilerplate");
        assert_eq!(settings.server.port, 1323);
        assert_eq!(settings.server.timeout_secs, 1200);
        assert_eq!(settings.database.ip, "127.0.0.1");
        assert_eq!(settings.database.port, 3306);
        assert_eq!(settings.database.max_idle_conns, 10);
        assert_eq!(settings.database.max_open_conns, 100);
        assert_eq!(settings.database.username, "root");
        assert_eq!(settings.database.password, "admin");
        assert_eq!(settings.database.name, "test");
        assert_eq!(settings.database.cloudsql_instance, "");
        assert_eq!(settings.storage.object_name, "test.json");
        assert!(!settings.strict_secrets);
    }

    #[test]
    fn test_missing_required_without_default() {
        for key in ["PROJECT_UUID", "PROJECT_ID"] {
            let mut env = base_env();
            env.remove(key);
            let err = Settings::from_source(&env).unwrap_err();
            assert!(matches!(err, ConfigError::MissingVar(k) if k == key));
        }
    }

    #[test]
    fn test_required_field_set_empty() {
        for key in ["DB_NAME", "DB_USERNAME", "DB_PASSWORD", "IMAGE_NAME", "APP_ENV", "DB_PORT"] {
            let env = env_with(&[(key, "")]);
            let err = Settings::from_source(&env).unwrap_err();
            assert!(matches!(err, ConfigError::MissingVar(k) if k == key), "{key}");
        }
    }

    #[test]
    fn test_invalid_numeric_value() {
        let env = env_with(&[("DB_MAX_OPEN_CONNS", "lots")]);
        let err = Settings::from_source(&env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "DB_MAX_OPEN_CONNS", .. }));
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let env = env_with(&[("DB_MAX_OPEN_CONNS", "0")]);
        let err = Settings::from_source(&env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "DB_MAX_OPEN_CONNS", .. }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let env = env_with(&[("TIMEOUT", "0")]);
        let err = Settings::from_source(&env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "TIMEOUT", .. }));
    }

    #[test]
    fn test_access_token_read_from_source() {
        let settings = Settings::from_source(&base_env()).unwrap();
        assert!(settings.access_token.is_none());

        let env = env_with(&[("GOOGLE_OAUTH_ACCESS_TOKEN", "ya29.token")]);
        let settings = Settings::from_source(&env).unwrap();

        assert_eq!(settings.access_token.as_ref().map(AccessToken::expose), Some("ya29.token"));
        assert!(!format!("{:?}", settings).contains("ya29.token"));
    }

    #[test]
    fn test_environment_classification() {
        let cases = [
            ("test", (true, false, false)),
            ("development", (false, true, false)),
            ("production", (false, false, true)),
            ("staging", (false, false, false)),
        ];
        for (value, expected) in cases {
            let settings = Settings::from_source(&env_with(&[("APP_ENV", value)])).unwrap();
            let got = (
                settings.is_test(),
                settings.is_development(),
                settings.is_production(),
            );
            assert_eq!(got, expected, "APP_ENV={value}");
        }
    }

    #[test]
    fn test_database_password_redacted_in_debug() {
        let settings = Settings::from_source(&env_with(&[("DB_PASSWORD", "hunter2")])).unwrap();
        let rendered = format!("{:?}", settings);
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_production_reads_four_secrets() {
        let store = Arc::new(RecordingStore::default());
        let env = env_with(&[("APP_ENV", "production"), ("IMAGE_NAME", "todo")]);
        let resolver = resolver_with(env, store.clone());

        let resolution = resolver.resolve().await.unwrap();

        assert_eq!(
            *store.lookups.lock().unwrap(),
            vec![
                "todo-CLOUDSQL_INSTANCES",
                "todo-DB_NAME",
                "todo-DB_USERNAME",
                "todo-DB_PASSWORD",
            ]
        );
        let db = &resolution.settings.database;
        assert_eq!(db.cloudsql_instance, "secret:todo-CLOUDSQL_INSTANCES");
        assert_eq!(db.name, "secret:todo-DB_NAME");
        assert_eq!(db.username, "secret:todo-DB_USERNAME");
        assert_eq!(db.password, "secret:todo-DB_PASSWORD");
        assert!(resolution.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_non_production_reads_no_secrets() {
        for app_env in ["test", "development", "staging"] {
            let store = Arc::new(RecordingStore::default());
            let resolver = resolver_with(env_with(&[("APP_ENV", app_env)]), store.clone());

            resolver.resolve().await.unwrap();

            assert!(store.lookups.lock().unwrap().is_empty(), "APP_ENV={app_env}");
        }
    }

    #[tokio::test]
    async fn test_secret_failure_keeps_env_value() {
        let store = Arc::new(RecordingStore {
            missing: vec!["go-cloudrun-boilerplate-DB_PASSWORD".to_string()],
            ..Default::default()
        });
        let env = env_with(&[("APP_ENV", "production"), ("DB_PASSWORD", "from-env")]);
        let resolver = resolver_with(env, store.clone());

        let resolution = resolver.resolve().await.unwrap();

        assert_eq!(store.lookups.lock().unwrap().len(), 4);
        assert_eq!(resolution.settings.database.password, "from-env");
        assert_eq!(
            resolution.settings.database.name,
            "secret:go-cloudrun-boilerplate-DB_NAME"
        );
        assert_eq!(resolution.warnings.len(), 1);
        assert_eq!(resolution.warnings[0].field, SECRET_DB_PASSWORD);
        assert!(matches!(
            resolution.warnings[0].error,
            SecretError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_blank_secret_keeps_env_value() {
        let store = Arc::new(RecordingStore {
            blank: vec!["go-cloudrun-boilerplate-DB_NAME".to_string()],
            ..Default::default()
        });
        let env = env_with(&[("APP_ENV", "production"), ("DB_NAME", "todos")]);
        let resolver = resolver_with(env, store);

        let resolution = resolver.resolve().await.unwrap();

        assert_eq!(resolution.settings.database.name, "todos");
        assert_eq!(resolution.warnings.len(), 1);
        assert_eq!(resolution.warnings[0].field, SECRET_DB_NAME);
        assert!(matches!(resolution.warnings[0].error, SecretError::Empty { .. }));
    }

    /// Counts how many times resolution reads `APP_ENV`
    struct CountingEnv {
        inner: HashMap<String, String>,
        app_env_reads: AtomicUsize,
    }

    impl EnvSource for CountingEnv {
        fn var(&self, key: &str) -> Option<String> {
            if key == "APP_ENV" {
                self.app_env_reads.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.var(key)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_resolution() {
        let env = Arc::new(CountingEnv {
            inner: env_with(&[("APP_ENV", "production")]),
            app_env_reads: AtomicUsize::new(0),
        });
        let store = Arc::new(RecordingStore::default());
        let factory_store = store.clone();
        let resolver = Arc::new(ConfigResolver::new(
            env.clone(),
            Box::new(move |_: &Settings| -> Arc<dyn SecretStore> { factory_store.clone() }),
        ));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.get_configuration().await.unwrap() })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(env.app_env_reads.load(Ordering::SeqCst), 1);
        assert_eq!(store.lookups.lock().unwrap().len(), 4);
        for settings in &results {
            assert!(Arc::ptr_eq(settings, &results[0]));
        }
    }

    #[tokio::test]
    async fn test_failed_resolution_is_reported() {
        let mut env = base_env();
        env.remove("PROJECT_ID");
        let resolver = resolver_with(env, Arc::new(RecordingStore::default()));

        let err = resolver.get_configuration().await.unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("PROJECT_ID")));
    }
}
