use std::sync::Arc;

use anyhow::{Context, Result};
use facewatch_core::{EmbeddingExtractor, JsonLinesExtractor};
use facewatch_store::SqliteStore;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod dispatch;
mod engine;
mod registry;

use config::Config;
use dispatch::EventDispatcher;
use engine::EngineError;
use registry::SessionRegistry;

const BUS_NAME: &str = "org.facewatch.Engine1";
const OBJECT_PATH: &str = "/org/facewatch/Engine1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facewatchd starting");

    let config = Config::load().context("loading configuration")?;
    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );

    let dispatcher = EventDispatcher::new(
        store.clone(),
        tokio::runtime::Handle::current(),
        config.retry_policy(),
    );
    let registry = Arc::new(SessionRegistry::new(
        store,
        dispatcher,
        config.grid(),
        config.frame_queue,
    ));

    let _connection = if config.dbus_enabled {
        let service = dbus_interface::FacewatchService::new(Arc::clone(&registry));
        let connection = zbus::connection::Builder::session()?
            .name(BUS_NAME)?
            .serve_at(OBJECT_PATH, service)?
            .build()
            .await
            .context("registering D-Bus service")?;
        tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");
        Some(connection)
    } else {
        tracing::info!("D-Bus interface disabled via FACEWATCH_DBUS_ENABLED=0");
        None
    };

    let (eof_tx, eof_rx) = oneshot::channel::<()>();
    let reader_registry = Arc::clone(&registry);
    std::thread::Builder::new()
        .name("facewatch-reader".into())
        .spawn(move || {
            read_frames(&reader_registry);
            let _ = eof_tx.send(());
        })
        .context("spawning frame reader thread")?;

    tracing::info!(db = %config.db_path.display(), "facewatchd ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("interrupt received");
        }
        _ = eof_rx => {
            tracing::info!("extractor stream closed");
        }
    }

    tracing::info!("facewatchd shutting down");
    let flushed = registry.stop_all().await;
    let dispatcher = registry.dispatcher();
    if !dispatcher.wait_idle(config.shutdown_grace()).await {
        tracing::warn!(
            pending = dispatcher.stats().in_flight,
            "shutdown grace period elapsed with events undelivered"
        );
    }
    let stats = dispatcher.stats();
    tracing::info!(
        flushed,
        delivered = stats.delivered,
        failed = stats.failed,
        "facewatchd stopped"
    );

    Ok(())
}

/// Feed extractor output from stdin to the per-camera sessions.
fn read_frames(registry: &SessionRegistry) {
    let mut extractor = JsonLinesExtractor::new(std::io::stdin().lock());

    loop {
        let frame = match extractor.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "extractor stream failed");
                break;
            }
        };

        let camera = frame.camera.clone();
        let handle = match registry.get_or_spawn(&camera) {
            Ok(handle) => handle,
            Err(EngineError::Closed) => {
                tracing::info!("shutting down; frame reader stopped");
                break;
            }
            Err(e) => {
                tracing::error!(camera = %camera, error = %e, "cannot start session; frame dropped");
                continue;
            }
        };
        if let Err(e) = handle.blocking_submit(frame) {
            tracing::warn!(camera = %camera, error = %e, "session closed; frame dropped");
        }
    }

    tracing::info!(
        skipped_lines = extractor.skipped(),
        skipped_faces = extractor.skipped_faces(),
        "frame reader finished"
    );
}
