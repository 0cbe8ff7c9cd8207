//! Relaygram Server - real-time core of a Telegram-style messaging backend
//!
//! Subcommands:
//! - `run` serves HTTP and WebSocket traffic (the default)
//! - `create-admin`, `add-universal-code` and `allow-api` seed the database

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaygram_server::{
    build_router,
    config::Config,
    crypto,
    models::{unix_now, NotificationCategory},
    notify::AdminEvent,
    storage::Storage,
    AppState,
};

/// Relaygram Server CLI
#[derive(Parser)]
#[command(name = "relaygram-server")]
#[command(about = "Update log, notification hub, broadcast and call signaling server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an admin console account
    CreateAdmin {
        #[arg(long)]
        username: String,

        #[arg(long)]
        password: String,

        #[arg(long, default_value = "admin")]
        role: String,
    },

    /// Add (or re-activate) a universal verification code
    AddUniversalCode {
        #[arg(long)]
        code: String,
    },

    /// Allow a client application's api_id/api_hash pair
    AllowApi {
        #[arg(long)]
        api_id: i64,

        #[arg(long)]
        api_hash: String,
    },

    /// Run the server
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relaygram_server=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load config
    let config = Config::load(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CreateAdmin { username, password, role } => {
            create_admin(&config, &username, &password, &role).await?;
        }
        Commands::AddUniversalCode { code } => {
            add_universal_code(&config, &code).await?;
        }
        Commands::AllowApi { api_id, api_hash } => {
            allow_api(&config, api_id, &api_hash).await?;
        }
        Commands::Run => {
            run_server(config).await?;
        }
    }

    Ok(())
}

async fn create_admin(config: &Config, username: &str, password: &str, role: &str) -> anyhow::Result<()> {
    if password.len() < 8 {
        anyhow::bail!("Admin password must be at least 8 characters");
    }

    let storage = Storage::new(&config.storage.database_path).await?;
    if storage.get_admin_by_username(username).await?.is_some() {
        anyhow::bail!("Admin {} already exists", username);
    }

    let admin = storage
        .create_admin(username, &crypto::hash_password(password), role, unix_now())
        .await?;

    println!("=== Admin Created ===");
    println!("ID: {}", admin.id);
    println!("Username: {}", admin.username);
    println!("Role: {}", admin.role);

    Ok(())
}

async fn add_universal_code(config: &Config, code: &str) -> anyhow::Result<()> {
    let storage = Storage::new(&config.storage.database_path).await?;

    if storage.get_universal_code(code).await?.is_some() {
        storage.set_universal_code_active(code, true).await?;
        println!("Universal code {} re-activated", code);
    } else {
        storage.add_universal_code(code, unix_now()).await?;
        println!("Universal code {} added", code);
    }

    Ok(())
}

async fn allow_api(config: &Config, api_id: i64, api_hash: &str) -> anyhow::Result<()> {
    let storage = Storage::new(&config.storage.database_path).await?;
    storage.allow_api(api_id, api_hash, unix_now()).await?;

    println!("api_id {} is now allowed", api_id);

    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    tracing::info!("Starting Relaygram Server v{}", env!("CARGO_PKG_VERSION"));

    // Initialize storage
    let storage = Storage::new(&config.storage.database_path).await?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config, storage);
    let app = build_router(state.clone());

    tracing::info!("Listening on {}", addr);
    let listener = TcpListener::bind(&addr).await?;

    // Start cleanup task
    spawn_maintenance(state.clone());

    state.notifier.publish(AdminEvent::new(
        NotificationCategory::ServiceUp,
        "Service started",
        format!("Relaygram Server v{} listening on {}", env!("CARGO_PKG_VERSION"), addr),
    ));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Retention sweep, expired ephemeral entries and due scheduled broadcasts.
fn spawn_maintenance(state: AppState) {
    let cleanup_every = Duration::from_secs(state.config.storage.cleanup_interval_minutes.max(1) * 60);
    let retention = Duration::from_secs(state.config.storage.update_retention_hours * 3600);
    let updates = state.updates.clone();
    let ephemeral = Arc::clone(&state.ephemeral);
    let notifier = state.notifier.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_every);
        loop {
            interval.tick().await;
            if let Err(e) = updates.sweep(retention).await {
                tracing::error!("Update retention sweep failed: {}", e);
                notifier.publish(AdminEvent::system_error("update retention sweep", &e));
            }
            let purged = ephemeral.purge_expired();
            if purged > 0 {
                tracing::debug!(purged = purged, "Expired ephemeral entries removed");
            }
        }
    });

    // scheduled broadcasts are checked far more often than the retention sweep
    let broadcasts = state.broadcasts.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            if let Err(e) = broadcasts.dispatch_due().await {
                tracing::error!("Scheduled broadcast dispatch failed: {}", e);
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
