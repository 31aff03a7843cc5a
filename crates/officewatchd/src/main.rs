use anyhow::{Context, Result};
use officewatch_core::{
    load_gallery_or_empty, DetectorConfig, FaceDetector, FaceRecognizer, Pipeline, ARCFACE_PROFILE,
};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod events;
mod monitor;
mod publisher;
mod store;

use config::Config;
use dbus_interface::{MonitorService, BUS_NAME, OBJECT_PATH};
use events::PresenceEvent;
use monitor::{Monitor, MonitorSettings, V4l2Opener};
use store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "officewatchd starting");

    let config = Config::load().context("failed to load configuration")?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open {}", config.db_path.display()))?,
    );

    // Models are required; fail fast rather than serve a monitor that can never recognize.
    let scrfd_path = config.scrfd_model_path();
    let detector = FaceDetector::load(&scrfd_path, DetectorConfig::default())
        .with_context(|| format!("failed to load detector from {scrfd_path}"))?;
    tracing::debug!(config = ?detector.config(), "face detector ready");
    let arcface_path = config.arcface_model_path();
    let recognizer = FaceRecognizer::load(&arcface_path)
        .with_context(|| format!("failed to load recognizer from {arcface_path}"))?;

    let gallery = load_gallery_or_empty(&config.gallery_path, &ARCFACE_PROFILE);

    let monitor = Arc::new(Monitor::new(
        Arc::new(V4l2Opener::new(config.capture())),
        Pipeline::new(Box::new(detector), Box::new(recognizer)),
        Arc::clone(&store),
        Arc::clone(&store),
        gallery,
        MonitorSettings {
            tolerance: config.tolerance,
            cooldown: config.cooldown,
            tick_interval: config.tick_interval,
            gallery_path: config.gallery_path.clone(),
            encoder: ARCFACE_PROFILE,
        },
    ));
    let events = monitor.subscribe();

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, MonitorService::new(Arc::clone(&monitor), Arc::clone(&store)))?
        .build()
        .await
        .context("failed to register on D-Bus")?;
    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, system = config.system_bus, "D-Bus service ready");

    let forwarder = tokio::spawn(forward_events(connection.clone(), events));

    if config.autostart {
        let m = Arc::clone(&monitor);
        match tokio::task::spawn_blocking(move || m.start()).await? {
            Ok(outcome) => tracing::info!(?outcome, "autostart"),
            Err(e) => tracing::warn!(error = %e, "autostart failed; waiting for Start()"),
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("officewatchd shutting down");

    let m = Arc::clone(&monitor);
    tokio::task::spawn_blocking(move || m.stop()).await?;
    forwarder.abort();

    Ok(())
}

/// Log every presence event and re-emit it on the bus.
async fn forward_events(connection: zbus::Connection, mut events: broadcast::Receiver<PresenceEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(e) = dbus_interface::emit_presence(&connection, &event).await {
                    tracing::warn!(error = %e, "failed to emit PresenceChanged");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "presence signal forwarder fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
