use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;
use vigil_core::alert::DEFAULT_QUEUE_DEPTH;
use vigil_core::{Alert, AlertDispatcher, AlertThrottle, FrameEncoder, LabelDirectory, Notifier};

mod config;
mod dbus_interface;
mod engine;
mod http;
mod notify;
mod store;

use config::Config;
use dbus_interface::{VigilService, BUS_NAME, OBJECT_PATH};
use engine::{EngineHandle, EngineParts};
use http::{HttpState, Ingest};
use notify::{EmailNotifier, EventBusNotifier, WebhookNotifier};
use store::Store;

/// How long open HTTP connections get to drain after shutdown.
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// The runtime is built by hand: the blocking webhook client and the pipeline
// thread must be created outside of it.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "vigild starting");

    let config = Config::load().context("failed to load configuration")?;

    let store = Arc::new(
        Store::open(&config.db_path)
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?,
    );

    let labels = Arc::new(LabelDirectory::new(config.label_source()));
    if let Err(e) = labels.reload() {
        tracing::warn!(error = %e, "label directory unavailable; every face will show as Unknown until reloaded");
    }

    let (events_tx, _) = broadcast::channel(notify::EVENT_CAPACITY);
    let notifiers = build_notifiers(&config, &events_tx)?;
    let transports: Vec<&str> = notifiers.iter().map(|n| n.name()).collect();
    tracing::info!(?transports, "alert transports configured");

    // Reported alerts get their own dispatcher and transport instances.
    let ingest = Ingest {
        sink: store.clone(),
        blacklist: store.clone(),
        alerts: AlertDispatcher::spawn(
            AlertThrottle::new(config.alert_cooldown()),
            build_notifiers(&config, &events_tx)?,
            DEFAULT_QUEUE_DEPTH,
        )
        .context("failed to start report dispatcher")?,
    };

    let encoder = FrameEncoder::new(config.jpeg_quality);
    let feed = encoder.feed();

    let engine = engine::spawn_engine(
        &config,
        EngineParts {
            labels: Arc::clone(&labels),
            blacklist: store.clone(),
            sink: store.clone(),
            notifiers,
            encoder,
        },
    )
    .context("failed to start pipeline")?;

    let (closing_tx, closing_rx) = watch::channel(false);
    let http_state = HttpState::new(feed, &events_tx, engine.counters(), ingest, closing_rx);
    drop(events_tx);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("vigild-rt")
        .build()
        .context("failed to build tokio runtime")?;

    let service = VigilService::new(
        store,
        labels,
        engine.counters(),
        runtime.handle().clone(),
        config.camera_device.clone(),
        config.confidence_threshold,
    );

    runtime.block_on(run(config, service, http_state, closing_tx, engine))
}

/// One fresh set of alert transports: the event feed, plus webhook and mail
/// when configured.
fn build_notifiers(
    config: &Config,
    events: &broadcast::Sender<Arc<Alert>>,
) -> Result<Vec<Box<dyn Notifier>>> {
    let mut notifiers: Vec<Box<dyn Notifier>> = vec![Box::new(EventBusNotifier::new(events.clone()))];
    if let Some(url) = &config.webhook_url {
        let webhook = WebhookNotifier::new(url.clone(), config.alert_timeout())
            .context("failed to build webhook client")?;
        notifiers.push(Box::new(webhook));
    }
    if let Some(settings) = config.email() {
        let email = EmailNotifier::new(settings, config.alert_timeout())
            .context("failed to build mail transport")?;
        notifiers.push(Box::new(email));
    }
    Ok(notifiers)
}

async fn run(
    config: Config,
    service: VigilService,
    http_state: HttpState,
    closing: watch::Sender<bool>,
    engine: EngineHandle,
) -> Result<()> {
    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register D-Bus service")?;
    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    let server = tokio::spawn(http::serve(listener, http_state));

    tracing::info!("vigild ready");
    shutdown_signal().await;
    tracing::info!("vigild shutting down");

    // Ends every open stream and event feed and stops accepting connections.
    let _ = closing.send(true);

    match tokio::task::spawn_blocking(move || engine.shutdown()).await {
        Ok(Some(totals)) => tracing::info!(
            frames = totals.frames,
            faces = totals.faces,
            alerts = totals.alerts,
            log_failures = totals.log_failures,
            "pipeline stopped"
        ),
        Ok(None) => {}
        Err(e) => tracing::error!(error = %e, "pipeline shutdown task failed"),
    }

    match tokio::time::timeout(HTTP_DRAIN_TIMEOUT, server).await {
        Ok(Ok(result)) => result.context("http server failed")?,
        Ok(Err(e)) => tracing::error!(error = %e, "http server task failed"),
        Err(_) => tracing::warn!("http connections did not drain in time"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
