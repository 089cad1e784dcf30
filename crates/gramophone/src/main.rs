use anyhow::{Context, Result};
use clap::Parser;
use gramophone::auth::TrustedProxies;
use gramophone::capture::{CapturePipelineFactory, DisplayAllocator};
use gramophone::metrics::Metrics;
use gramophone::server::{self, AppState};
use gramophone::sessions::SessionManager;
use gramophone::upload::BackendNotifier;
use gramoconf::{RecordingConfig, Registry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// X display numbers handed to recording sessions.
const DISPLAY_BASE: u32 = 100;
const DISPLAY_CAPACITY: u32 = 1024;

/// The gramophone recording server
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match gramoconf::discover_config_file(cli.config.as_deref()) {
        Some(path) => {
            let config = gramoconf::load_from_file(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            (config, Some(path))
        }
        None => (RecordingConfig::default(), None),
    };
    let (config, config_path) = config;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logs.level.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &config_path {
        Some(path) => tracing::info!("loaded configuration from {}", path.display()),
        None => tracing::warn!("no configuration file found, using defaults"),
    }

    let registry = Arc::new(Registry::build(&config).context("invalid configuration")?);
    for section in &registry.skipped_sections {
        tracing::warn!(section = %section, "section is missing url or secret, skipping");
    }
    tracing::info!(backends = registry.backend_count(), "credential registry loaded");
    if registry.allow_all() {
        tracing::warn!("allowall is enabled; every origin is accepted - do not run this in production");
    }

    let (proxies, rejected) = TrustedProxies::from_config(&config.http.trustedproxies);
    for entry in rejected {
        tracing::warn!(entry = %entry, "ignoring unparseable trusted proxy");
    }

    let metrics = Arc::new(Metrics::new());
    let allocator = Arc::new(DisplayAllocator::new(DISPLAY_BASE, DISPLAY_CAPACITY));
    let factory = Arc::new(CapturePipelineFactory::new(
        allocator,
        config.browser.clone(),
        config.recorder.clone(),
        config.timeouts.stop_timeout(),
    ));
    let notifier = Arc::new(BackendNotifier::new(config.timeouts.upload_timeout()));
    let manager = Arc::new(SessionManager::new(
        registry.clone(),
        metrics.clone(),
        factory,
        notifier,
        config.timeouts.clone(),
    ));

    let state = AppState {
        registry,
        manager: manager.clone(),
        metrics: metrics.clone(),
        proxies: Arc::new(proxies),
        started_at: Instant::now(),
    };
    let app = server::router(state);

    let listen = cli.listen.unwrap_or_else(|| config.http.listen.clone());
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address {listen}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on http://{addr}");

    let shutdown_token = CancellationToken::new();

    let server_token = shutdown_token.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        server_token.cancelled().await;
        tracing::info!("server shutdown signal received");
    });

    tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("server shutdown with error: {e:?}");
        }
    });

    // Periodic statistics logging.
    let stats_manager = manager.clone();
    let stats_metrics = metrics.clone();
    let stats_token = shutdown_token.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let sessions = stats_manager.stats();
                    let totals = stats_metrics.snapshot().totals();
                    tracing::info!(
                        sessions.active = sessions.active,
                        recordings.current = totals.current_recordings,
                        recordings.total = totals.recordings_total,
                        recordings.failed = totals.recordings_failed,
                        uploads.failed = totals.uploads_failed,
                        recorded.duration_secs = totals.recorded_duration_seconds,
                        "Server statistics"
                    );
                }
                _ = stats_token.cancelled() => {
                    break;
                }
            }
        }
    });

    // Handle SIGINT (Ctrl+C), SIGTERM (systemd) and internal fatal faults.
    let fatal = manager.fatal_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down gracefully");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => { sigterm.recv().await; }
                    Err(e) => {
                        tracing::error!("failed to set up SIGTERM handler: {e}");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            tracing::info!("received SIGTERM, shutting down gracefully");
        }
        _ = fatal.cancelled() => {
            tracing::error!("unrecoverable fault, shutting down");
        }
    }

    shutdown_token.cancel();

    // Give in-flight sessions time to stop their pipelines and upload.
    let drain = config.timeouts.stop_timeout() + config.timeouts.upload_timeout();
    manager.shutdown(drain).await;

    tracing::info!("shutdown complete");

    Ok(())
}
