//! Cloud Run Todo API
//!
//! Startup order is fixed: configuration is resolved once (with Secret
//! Manager overrides in production), the database pool is opened, and only
//! then is the HTTP server started or a migration step run.

mod config;
mod connection;
mod db;
mod error;
mod migration;
mod routes;
mod secret;
mod state;
mod todo;

use crate::config::{ConfigResolver, Settings};
use crate::connection::ConnectionManager;
use crate::routes::create_router;
use crate::secret::{SecretManagerClient, SecretStore};
use crate::state::{AppState, SharedState};
use crate::todo::{ListQuery, SortOrder, TodoInput};
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "cloudrun-todo-api", version, about = "Todo API service for Cloud Run")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve HTTP (default)
    Serve,
    /// Apply or roll back exactly one migration step
    Migrate {
        #[arg(value_enum)]
        direction: MigrateDirection,
    },
    /// Manage Secret Manager entries of the configured project
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },
    /// Read and write todos directly through the database pool
    Todo {
        #[command(subcommand)]
        action: TodoAction,
    },
}

#[derive(Subcommand)]
enum TodoAction {
    /// List todos with the given status, most recently updated first
    List {
        #[arg(long)]
        done: bool,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        page_size: i64,
        #[arg(long, default_value = "desc")]
        order: SortOrder,
    },
    Get {
        id: i64,
    },
    Create {
        #[arg(long)]
        slug: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        done: bool,
    },
    /// Replace slug, task and status of an existing todo
    Update {
        id: i64,
        #[arg(long)]
        slug: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        done: bool,
    },
    Delete {
        id: i64,
    },
}

#[derive(Subcommand)]
enum SecretAction {
    /// Print the latest version of a secret
    Get { secret_id: String },
    /// Create a secret with its first version
    Create { secret_id: String, value: String },
    /// Delete a secret and all its versions
    Delete { secret_id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum MigrateDirection {
    Up,
    Down,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();

    let resolver = ConfigResolver::from_process_env();
    let settings = resolve_settings(&resolver).await?;

    match cli.command.unwrap_or(Command::Serve) {
        // Secret management needs no database
        Command::Secret { action } => manage_secret(&settings, action).await,
        Command::Serve => serve(open_state(settings).await?).await,
        Command::Migrate { direction } => migrate(&*open_state(settings).await?, direction).await,
        Command::Todo { action } => manage_todo(&*open_state(settings).await?, action).await,
    }
}

/// Open the pool (fail fast) and build the shared state around it
async fn open_state(settings: Arc<Settings>) -> anyhow::Result<SharedState> {
    let connections = Arc::new(ConnectionManager::new(&settings));
    connections.connect().await.with_context(|| {
        format!(
            "Cannot start without a database connection to {}",
            connections.dsn().redacted()
        )
    })?;

    Ok(Arc::new(AppState::new(settings, connections)?))
}

/// Resolve configuration and decide what to do about failed secret lookups
async fn resolve_settings(resolver: &ConfigResolver) -> anyhow::Result<Arc<Settings>> {
    let resolution = resolver
        .resolve()
        .await
        .context("Required environment values are not defined properly")?;
    let settings = resolver.get_configuration().await?;

    if !resolution.warnings.is_empty() {
        for warning in &resolution.warnings {
            error!(severity = "critical", %warning, "Secret override failed");
        }
        if settings.strict_secrets {
            anyhow::bail!(
                "{} secret lookup(s) failed and STRICT_SECRETS is set",
                resolution.warnings.len()
            );
        }
        warn!("Continuing with environment values for the failed secrets");
    }

    info!(environment = %settings.environment, "📋 Configuration loaded successfully");
    Ok(settings)
}

async fn serve(state: SharedState) -> anyhow::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, state.settings.server.port));
    let app = create_router(state);

    info!("🌐 Server listening on http://{}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Server shutdown complete");
    Ok(())
}

async fn migrate(state: &AppState, direction: MigrateDirection) -> anyhow::Result<()> {
    let outcome = match direction {
        MigrateDirection::Up => state.migrations.start_migrations().await?,
        MigrateDirection::Down => state.migrations.rollback_last_migrations().await?,
    };

    info!(
        from = ?outcome.from,
        to = ?outcome.to,
        "✅ Migration {} complete",
        outcome.direction
    );
    Ok(())
}

async fn manage_secret(settings: &Settings, action: SecretAction) -> anyhow::Result<()> {
    let store = SecretManagerClient::from_settings(settings);

    match action {
        SecretAction::Get { secret_id } => {
            let value = store.get_secret(&secret_id).await?;
            println!("{}", value);
        }
        SecretAction::Create { secret_id, value } => {
            let secret = store.create_secret(&secret_id, &value).await?;
            println!("{}", secret.name);
        }
        SecretAction::Delete { secret_id } => {
            store.delete_secret(&secret_id).await?;
        }
    }
    Ok(())
}

async fn manage_todo(state: &AppState, action: TodoAction) -> anyhow::Result<()> {
    let todos = &state.todos;

    let output = match action {
        TodoAction::List {
            done,
            page,
            page_size,
            order,
        } => {
            let query = ListQuery::new(done, page, page_size, order)?;
            serde_json::to_string_pretty(&todos.list(&query).await?)?
        }
        TodoAction::Get { id } => serde_json::to_string_pretty(&todos.get(id).await?)?,
        TodoAction::Create { slug, task, done } => {
            let input = TodoInput {
                slug,
                task,
                status: done,
            };
            serde_json::to_string_pretty(&todos.create(&input).await?)?
        }
        TodoAction::Update {
            id,
            slug,
            task,
            done,
        } => {
            let input = TodoInput {
                slug,
                task,
                status: done,
            };
            serde_json::to_string_pretty(&todos.update(id, &input).await?)?
        }
        TodoAction::Delete { id } => {
            serde_json::json!({ "rows_affected": todos.delete(id).await? }).to_string()
        }
    };

    println!("{}", output);
    Ok(())
}

/// Initialize tracing; `LOG_FORMAT=json` switches to JSON lines
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cloudrun_todo_api=debug,tower_http=debug"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(false)
                    .json(),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
