//! Monitoring loop worker and its control surface.
//!
//! One dedicated OS thread owns the capture device and the recognition pipeline for the
//! duration of a run. The worker opens the device itself and acknowledges the result to
//! `start()`; `stop()` joins the worker, which drops the device before handing the
//! pipeline back for the next run.

use crate::events::PresenceEvent;
use crate::publisher::{FaceAnnotation, FramePublisher, FrameSummary, PublishedFrame};
use chrono::{DateTime, Utc};
use officewatch_core::{
    load_gallery, AttendanceStore, BoundingBox, EncoderProfile, EuclideanMatcher, Gallery,
    GalleryError, IdentityDirectory, IdentityId, Matcher, Pipeline, PresenceTracker, Transition,
};
use officewatch_hw::{Camera, CameraError, CaptureConfig, Frame, FrameSource};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("capture device unavailable: {0}")]
    Device(#[from] CameraError),
    #[error("failed to spawn monitor thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("monitor thread exited before acknowledging start")]
    WorkerExited,
    #[error("recognition pipeline was lost when a previous run panicked")]
    PipelineLost,
}

/// Opens a fresh frame source for each monitoring run.
///
/// Called on the worker thread; the returned source never leaves it.
pub trait SourceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// Opens the V4L2 camera.
pub struct V4l2Opener {
    config: CaptureConfig,
}

impl V4l2Opener {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }
}

impl SourceOpener for V4l2Opener {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        let camera = Camera::open(&self.config)?;
        tracing::info!(
            device = %camera.device_path,
            width = camera.width,
            height = camera.height,
            format = ?camera.pixel_format,
            "capture device acquired"
        );
        Ok(Box::new(camera))
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub tolerance: f32,
    pub cooldown: Duration,
    pub tick_interval: Duration,
    /// Artifact re-read by [`Monitor::reload_gallery`].
    pub gallery_path: PathBuf,
    /// Embeddings the pipeline's encoder produces; reloaded galleries must match it.
    pub encoder: EncoderProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub gallery_entries: usize,
    pub gallery_identities: usize,
    pub tolerance: f32,
    pub cooldown_secs: u64,
    pub last_frame_sequence: Option<u32>,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_frame_labels: Vec<String>,
}

enum WorkerState {
    /// Not running. `None` only after a worker panicked and took the pipeline with it.
    Idle(Option<Pipeline>),
    Running(JoinHandle<Pipeline>),
}

/// State shared between the control surface and the worker.
struct Shared {
    running: AtomicBool,
    gallery: RwLock<Arc<Gallery>>,
    publisher: FramePublisher,
    events: broadcast::Sender<PresenceEvent>,
    store: Arc<dyn AttendanceStore>,
    directory: Arc<dyn IdentityDirectory>,
    settings: MonitorSettings,
}

pub struct Monitor {
    shared: Arc<Shared>,
    opener: Arc<dyn SourceOpener>,
    worker: Mutex<WorkerState>,
}

impl Monitor {
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        pipeline: Pipeline,
        store: Arc<dyn AttendanceStore>,
        directory: Arc<dyn IdentityDirectory>,
        gallery: Gallery,
        settings: MonitorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                gallery: RwLock::new(Arc::new(gallery)),
                publisher: FramePublisher::new(),
                events,
                store,
                directory,
                settings,
            }),
            opener,
            worker: Mutex::new(WorkerState::Idle(Some(pipeline))),
        }
    }

    fn lock_worker(&self) -> MutexGuard<'_, WorkerState> {
        self.worker.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start monitoring. Returns once the worker has acquired the capture device.
    ///
    /// A second call while running is a no-op and opens no second device handle.
    pub fn start(&self) -> Result<StartOutcome, MonitorError> {
        let mut worker = self.lock_worker();

        let pipeline = match std::mem::replace(&mut *worker, WorkerState::Idle(None)) {
            WorkerState::Running(handle) if !handle.is_finished() => {
                *worker = WorkerState::Running(handle);
                return Ok(StartOutcome::AlreadyRunning);
            }
            WorkerState::Running(handle) => join_worker(handle),
            WorkerState::Idle(pipeline) => pipeline,
        };
        let pipeline = pipeline.ok_or(MonitorError::PipelineLost)?;

        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        let shared = Arc::clone(&self.shared);
        let opener = Arc::clone(&self.opener);
        let handle = std::thread::Builder::new()
            .name("officewatch-monitor".into())
            .spawn(move || run_worker(shared, opener, pipeline, ack_tx))
            .map_err(MonitorError::Spawn)?;

        match ack_rx.recv() {
            Ok(Ok(())) => {
                *worker = WorkerState::Running(handle);
                tracing::info!("monitoring started");
                Ok(StartOutcome::Started)
            }
            Ok(Err(e)) => {
                *worker = WorkerState::Idle(join_worker(handle));
                tracing::warn!(error = %e, "monitoring not started");
                Err(MonitorError::Device(e))
            }
            Err(_) => {
                *worker = WorkerState::Idle(join_worker(handle));
                Err(MonitorError::WorkerExited)
            }
        }
    }

    /// Stop monitoring and wait until the worker has released the capture device.
    ///
    /// Returns `false` if the monitor was not running.
    pub fn stop(&self) -> bool {
        let mut worker = self.lock_worker();
        self.shared.running.store(false, Ordering::SeqCst);
        match std::mem::replace(&mut *worker, WorkerState::Idle(None)) {
            WorkerState::Running(handle) => {
                *worker = WorkerState::Idle(join_worker(handle));
                tracing::info!("monitoring stopped");
                true
            }
            idle => {
                *worker = idle;
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Independent copy of the most recent annotated frame.
    pub fn snapshot_frame(&self) -> Option<PublishedFrame> {
        self.shared.publisher.snapshot()
    }

    /// Labels and boxes of the most recent frame, without copying its pixels.
    pub fn frame_summary(&self) -> Option<FrameSummary> {
        self.shared.publisher.latest().map(|frame| frame.summary())
    }

    /// Receiver for entry/exit events committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.shared.events.subscribe()
    }

    pub fn gallery(&self) -> Arc<Gallery> {
        self.shared.gallery()
    }

    /// Replace the gallery wholesale. Takes effect from the next tick.
    pub fn set_gallery(&self, gallery: Gallery) {
        let mut current = self.shared.gallery.write().unwrap_or_else(|p| p.into_inner());
        *current = Arc::new(gallery);
    }

    /// Re-read the gallery artifact. On failure, including an artifact built for another
    /// encoder, the current gallery stays in place.
    pub fn reload_gallery(&self) -> Result<usize, GalleryError> {
        let settings = &self.shared.settings;
        let path = &settings.gallery_path;
        match load_gallery(path, &settings.encoder) {
            Ok(gallery) => {
                let entries = gallery.len();
                self.set_gallery(gallery);
                tracing::info!(path = %path.display(), entries, "gallery reloaded");
                Ok(entries)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "gallery reload failed; keeping current gallery");
                Err(e)
            }
        }
    }

    pub fn status(&self) -> MonitorStatus {
        let gallery = self.gallery();
        let frame = self.shared.publisher.latest();
        MonitorStatus {
            running: self.is_running(),
            gallery_entries: gallery.len(),
            gallery_identities: gallery.identity_count(),
            tolerance: self.shared.settings.tolerance,
            cooldown_secs: self.shared.settings.cooldown.as_secs(),
            last_frame_sequence: frame.as_ref().map(|f| f.sequence),
            last_frame_at: frame.as_ref().map(|f| f.captured_at),
            last_frame_labels: frame
                .map(|f| f.annotations.iter().map(|a| a.label.clone()).collect())
                .unwrap_or_default(),
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join a worker thread, recovering its pipeline. A panicked worker yields `None`.
fn join_worker(handle: JoinHandle<Pipeline>) -> Option<Pipeline> {
    match handle.join() {
        Ok(pipeline) => Some(pipeline),
        Err(_) => {
            tracing::error!("monitor thread panicked");
            None
        }
    }
}

/// Clears the run flag however the worker exits.
struct RunFlag<'a>(&'a AtomicBool);

impl Drop for RunFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn run_worker(
    shared: Arc<Shared>,
    opener: Arc<dyn SourceOpener>,
    mut pipeline: Pipeline,
    ack: mpsc::SyncSender<Result<(), CameraError>>,
) -> Pipeline {
    let _flag = RunFlag(&shared.running);

    let mut source = match opener.open() {
        Ok(source) => source,
        Err(e) => {
            let _ = ack.send(Err(e));
            return pipeline;
        }
    };
    // Raised only once the device is held, so a failed start never reads as running.
    shared.running.store(true, Ordering::SeqCst);
    if ack.send(Ok(())).is_err() {
        return pipeline;
    }

    // Presence state lives for exactly one run.
    let mut tracker = PresenceTracker::new(shared.settings.cooldown);
    tracing::debug!(
        cooldown = ?tracker.cooldown(),
        tick = ?shared.settings.tick_interval,
        "monitor loop running"
    );
    let matcher = EuclideanMatcher;
    while shared.running.load(Ordering::SeqCst) {
        shared.tick(source.as_mut(), &mut pipeline, &mut tracker, &matcher);
        std::thread::sleep(shared.settings.tick_interval);
    }

    drop(source);
    tracing::info!(tracked = tracker.tracked(), "capture device released");
    pipeline
}

impl Shared {
    fn gallery(&self) -> Arc<Gallery> {
        Arc::clone(&self.gallery.read().unwrap_or_else(|p| p.into_inner()))
    }

    /// One capture, recognize, update, sweep, publish cycle. Nothing in here ends the run.
    fn tick(
        &self,
        source: &mut dyn FrameSource,
        pipeline: &mut Pipeline,
        tracker: &mut PresenceTracker,
        matcher: &dyn Matcher,
    ) {
        let frame = match source.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "frame read failed; skipping tick");
                return;
            }
        };
        let now = Utc::now();

        let mut annotations = Vec::new();
        if frame.is_dark {
            tracing::trace!(
                sequence = frame.sequence,
                brightness = frame.avg_brightness(),
                "dark frame; skipping localization"
            );
        } else {
            let faces = match pipeline
                .localizer
                .localize(&frame.data, frame.width, frame.height)
            {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(sequence = frame.sequence, error = %e, "face localization failed");
                    Vec::new()
                }
            };
            let gallery = self.gallery();
            for face in faces {
                if let Some(annotation) =
                    self.identify(&frame, face, pipeline, &gallery, matcher, tracker, now)
                {
                    annotations.push(annotation);
                }
            }
        }

        for result in tracker.sweep(now, self.store.as_ref()) {
            match result {
                Ok(transition) => {
                    let name = self.display_name(transition.identity_id);
                    self.emit(&transition, name);
                }
                Err(e) => {
                    tracing::warn!(identity_id = e.identity_id(), error = %e, "exit not persisted; will retry")
                }
            }
        }

        self.publisher.publish(PublishedFrame::annotate(
            &frame.data,
            frame.width,
            frame.height,
            annotations,
            now,
            frame.sequence,
        ));
    }

    /// Encode, match and resolve one face, feeding resolved identities to the tracker.
    /// A face that cannot be encoded is dropped from the frame.
    #[allow(clippy::too_many_arguments)]
    fn identify(
        &self,
        frame: &Frame,
        face: BoundingBox,
        pipeline: &mut Pipeline,
        gallery: &Gallery,
        matcher: &dyn Matcher,
        tracker: &mut PresenceTracker,
        now: DateTime<Utc>,
    ) -> Option<FaceAnnotation> {
        let embedding = match pipeline
            .encoder
            .encode(&frame.data, frame.width, frame.height, &face)
        {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::debug!(error = %e, "face encoding failed; ignoring region");
                return None;
            }
        };

        let result = matcher.compare(&embedding, gallery, self.settings.tolerance);
        let Some(identity_id) = result.identity_id else {
            tracing::trace!(distance = ?result.distance, "no gallery match");
            return Some(FaceAnnotation::unknown(face, result.distance));
        };

        let identity = match self.directory.resolve(identity_id) {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                tracing::debug!(identity_id, "matched identity missing from directory");
                return Some(FaceAnnotation::unknown(face, result.distance));
            }
            Err(e) => {
                tracing::warn!(identity_id, error = %e, "identity lookup failed");
                return Some(FaceAnnotation::unknown(face, result.distance));
            }
        };
        tracing::trace!(identity_id, distance = ?result.distance, "matched");

        match tracker.observe(identity_id, now, self.store.as_ref()) {
            Ok(Some(transition)) => self.emit(&transition, Some(identity.display_name.clone())),
            Ok(None) => {}
            Err(e) => tracing::warn!(identity_id, error = %e, "entry not persisted; will retry"),
        }

        Some(FaceAnnotation {
            label: identity.display_name,
            identity_id: Some(identity_id),
            distance: result.distance,
            bbox: face,
        })
    }

    fn display_name(&self, identity_id: IdentityId) -> Option<String> {
        self.directory
            .resolve(identity_id)
            .ok()
            .flatten()
            .map(|identity| identity.display_name)
    }

    fn emit(&self, transition: &Transition, display_name: Option<String>) {
        let event = PresenceEvent::from_transition(transition, display_name);
        tracing::info!(
            identity_id = event.identity_id,
            session = ?event.session_id,
            stayed_secs = ?event.stayed_secs,
            "{event}"
        );
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
