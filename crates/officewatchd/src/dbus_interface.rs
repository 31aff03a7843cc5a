use crate::events::PresenceEvent;
use crate::monitor::{Monitor, MonitorError, StartOutcome};
use crate::store::SqliteStore;
use officewatch_core::AttendanceStore;
use std::sync::Arc;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.officewatch.Monitor1";
pub const OBJECT_PATH: &str = "/org/officewatch/Monitor1";

/// D-Bus control surface for the presence monitor.
///
/// Bus name: org.officewatch.Monitor1
/// Object path: /org/officewatch/Monitor1
pub struct MonitorService {
    monitor: Arc<Monitor>,
    store: Arc<SqliteStore>,
}

impl MonitorService {
    pub fn new(monitor: Arc<Monitor>, store: Arc<SqliteStore>) -> Self {
        Self { monitor, store }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

/// Run a blocking monitor or database call off the async executor.
async fn blocking<T, F>(f: F) -> zbus::fdo::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(failed)
}

#[interface(name = "org.officewatch.Monitor1")]
impl MonitorService {
    /// Start monitoring. Succeeds if already running; fails if the camera cannot be opened.
    async fn start(&self) -> zbus::fdo::Result<bool> {
        let monitor = Arc::clone(&self.monitor);
        match blocking(move || monitor.start()).await? {
            Ok(StartOutcome::Started) => Ok(true),
            Ok(StartOutcome::AlreadyRunning) => {
                tracing::debug!("start requested while already running");
                Ok(true)
            }
            Err(MonitorError::Device(e)) => Err(zbus::fdo::Error::IOError(e.to_string())),
            Err(e) => Err(failed(e)),
        }
    }

    /// Stop monitoring. Returns once the camera has been released.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        let monitor = Arc::clone(&self.monitor);
        blocking(move || monitor.stop()).await
    }

    async fn is_running(&self) -> bool {
        self.monitor.is_running()
    }

    /// Latest annotated frame as JPEG; empty when nothing has been captured yet.
    async fn snapshot(&self) -> zbus::fdo::Result<Vec<u8>> {
        let monitor = Arc::clone(&self.monitor);
        blocking(move || match monitor.snapshot_frame() {
            Some(frame) => frame.encode_jpeg().map_err(failed),
            None => Ok(Vec::new()),
        })
        .await?
    }

    /// Labels, match distances and boxes of the latest frame as JSON; `null` before the
    /// first frame. The `sequence` field pairs it with a `Snapshot` of the same frame.
    async fn snapshot_annotations(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.monitor.frame_summary()).map_err(failed)
    }

    /// Re-read the gallery artifact; returns the number of entries loaded.
    async fn reload_gallery(&self) -> zbus::fdo::Result<u32> {
        let monitor = Arc::clone(&self.monitor);
        let entries = blocking(move || monitor.reload_gallery())
            .await?
            .map_err(failed)?;
        Ok(u32::try_from(entries).unwrap_or(u32::MAX))
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.monitor.status();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "running": status.running,
            "gallery_entries": status.gallery_entries,
            "gallery_identities": status.gallery_identities,
            "tolerance": status.tolerance,
            "cooldown_secs": status.cooldown_secs,
            "last_frame_sequence": status.last_frame_sequence,
            "last_frame_at": status.last_frame_at,
            "last_frame_labels": status.last_frame_labels,
        })
        .to_string())
    }

    /// Today's attendance sessions as a JSON array.
    async fn current_attendance(&self) -> zbus::fdo::Result<String> {
        let store = Arc::clone(&self.store);
        let records = blocking(move || store.current_attendance())
            .await?
            .map_err(failed)?;
        serde_json::to_string(&records).map_err(failed)
    }

    async fn is_inside(&self, identity_id: i64) -> zbus::fdo::Result<bool> {
        let store = Arc::clone(&self.store);
        blocking(move || store.is_inside(identity_id))
            .await?
            .map_err(failed)
    }

    /// Emitted for every committed entry or exit.
    #[zbus(signal)]
    async fn presence_changed(
        emitter: &SignalEmitter<'_>,
        kind: &str,
        identity_id: i64,
        name: &str,
        at: &str,
    ) -> zbus::Result<()>;
}

/// Re-emit a presence event as the `PresenceChanged` signal.
pub async fn emit_presence(connection: &zbus::Connection, event: &PresenceEvent) -> zbus::Result<()> {
    let emitter = SignalEmitter::new(connection, OBJECT_PATH)?;
    MonitorService::presence_changed(
        &emitter,
        event.kind.as_str(),
        event.identity_id,
        &event.label(),
        &event.at.to_rfc3339(),
    )
    .await
}
