//! Tokenshare Server
//!
//! Self-hosted file sharing with chunked uploads, expiring download links
//! and recipient notification.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokenshare_server::clock::SystemClock;
use tokenshare_server::config::Config;
use tokenshare_server::db::{self, ShareRepository};
use tokenshare_server::notify::{LogNotifier, MailjetNotifier, Notifier};
use tokenshare_server::routes;
use tokenshare_server::share::ShareRegistry;
use tokenshare_server::state::AppState;
use tokenshare_server::storage::LocalStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "tokenshare_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Tokenshare Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Upload folder: {}", config.storage.upload_folder);
    tracing::info!("Public URL: {}", config.server.public_base_url);

    // Initialize storage
    tokio::fs::create_dir_all(&config.storage.upload_folder)
        .await
        .with_context(|| format!("Failed to create upload folder {}", config.storage.upload_folder))?;
    let storage = Arc::new(LocalStorage::new(&config.storage.upload_folder));

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    let notifier: Arc<dyn Notifier> = match &config.mail {
        Some(mail) => {
            tracing::info!("Mailjet notifications enabled, sender {}", mail.from_email);
            Arc::new(
                MailjetNotifier::new(
                    &mail.api_key,
                    &mail.api_secret,
                    &mail.from_email,
                    &mail.from_name,
                )
                .and_then(|n| n.with_timeout(Duration::from_secs(mail.timeout_secs)))
                .context("Failed to build Mailjet client")?,
            )
        }
        None => {
            tracing::warn!("MAILJET_API_KEY not set, notifications will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let registry = ShareRegistry::restore(
        config.lifecycle(),
        storage,
        Arc::new(SystemClock),
        notifier,
        ShareRepository::new(db_pool),
    )
    .await
    .context("Failed to load shares")?;
    tracing::info!(
        shares = registry.share_count(),
        bytes = registry.usage_bytes(),
        "Share registry ready"
    );

    // Create application state
    let app_state = AppState::new(config.clone(), registry);

    // Start the expiry reaper
    let reaper_task = if config.cleanup.auto_cleanup {
        tracing::info!(
            "Cleanup scheduled every {} minutes",
            config.cleanup.interval_minutes
        );
        Some(app_state.reaper().clone().start(config.cleanup_interval()))
    } else {
        tracing::info!("Automatic cleanup disabled");
        None
    };

    let app = routes::app(app_state);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;
    tracing::info!("Tokenshare Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(task) = reaper_task {
        task.abort();
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
