use crate::config::Config;
use rollcall_core::detector::DetectorError;
use rollcall_core::pipeline::{self, FrameSource, PipelineError, StopReason, StreamError};
use rollcall_core::recognizer::{RecognizerError, ARCFACE_EMBEDDING_DIM};
use rollcall_core::store::StoreError;
use rollcall_core::{FaceDetector, FaceRecognizer, IdentityStore, KnownIdentity, MatchPolicy, Scheduler, SchedulerConfig};
use rollcall_io::{MjpegSource, PreviewSink, QueuedAttendanceSink, ReplaySource, SinkError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("identity store: {0}")]
    Store(#[from] StoreError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("frame source: {0}")]
    Source(#[from] StreamError),
    #[error("attendance sender: {0}")]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Everything the engine thread needs to open its I/O.
struct Wiring {
    stream_url: String,
    replay_dir: Option<PathBuf>,
    attendance_url: String,
    attendance_timeout: Duration,
    queue_capacity: usize,
    scheduler: SchedulerConfig,
    policy: MatchPolicy,
}

/// Handle to the running recognition loop.
pub struct EngineHandle {
    quit: Arc<AtomicBool>,
    done: oneshot::Receiver<Result<StopReason, EngineError>>,
}

impl EngineHandle {
    /// Ask the loop to stop before its next frame.
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Relaxed);
    }

    /// Wait for the loop to finish.
    pub async fn wait(&mut self) -> Result<StopReason, EngineError> {
        (&mut self.done).await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the recognition loop on a dedicated OS thread.
///
/// Loads the identity store and both ONNX models synchronously so a missing
/// file fails startup. The frame source and attendance sender are opened on
/// the engine thread; their blocking HTTP clients must stay off the async
/// runtime.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let known = load_gallery(&config.data_dir, ARCFACE_EMBEDDING_DIM)?;

    let scrfd_path = config.scrfd_model_path();
    let detector = FaceDetector::load(&scrfd_path)?;
    tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

    let arcface_path = config.arcface_model_path();
    let recognizer = FaceRecognizer::load(&arcface_path)?;
    tracing::info!(path = %arcface_path, "ArcFace recognizer loaded");

    let preview = PreviewSink::new(config.preview_path.clone(), config.preview_every);
    let quit = preview.quit_handle();

    let wiring = Wiring {
        stream_url: config.stream_url.clone(),
        replay_dir: config.replay_dir.clone(),
        attendance_url: config.attendance_url.clone(),
        attendance_timeout: config.attendance_timeout,
        queue_capacity: config.queue_capacity,
        scheduler: config.scheduler_config(),
        policy: config.match_policy(),
    };

    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let result = run_engine(wiring, detector, recognizer, known, preview);
            let _ = done_tx.send(result);
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        quit,
        done: done_rx,
    })
}

/// Load the identity store and check it against the encoder's output size.
fn load_gallery(dir: &Path, embedding_dim: usize) -> Result<Vec<KnownIdentity>, EngineError> {
    let store = IdentityStore::load(dir)?;
    store.ensure_dimension(embedding_dim)?;
    if store.is_empty() {
        tracing::warn!(dir = %dir.display(), "identity store is empty; every face will be Unknown");
    }
    Ok(store.into_known())
}

fn run_engine(
    wiring: Wiring,
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    known: Vec<KnownIdentity>,
    mut preview: PreviewSink,
) -> Result<StopReason, EngineError> {
    let mut source = open_source(&wiring)?;
    let mut attendance = QueuedAttendanceSink::http(
        &wiring.attendance_url,
        wiring.attendance_timeout,
        wiring.queue_capacity,
    )?;

    tracing::info!(
        frame_skip = wiring.scheduler.frame_skip,
        encoding_every = wiring.scheduler.encoding_every,
        downscale = wiring.scheduler.downscale_factor,
        persistence_frames = wiring.scheduler.persistence_frames,
        cooldown_secs = wiring.scheduler.cooldown.as_secs_f64(),
        identities = known.len(),
        "recognition loop starting"
    );
    let mut scheduler = Scheduler::new(wiring.scheduler, detector, recognizer, wiring.policy, known);

    let (reason, _) = pipeline::run(&mut source, &mut scheduler, &mut attendance, &mut preview)?;
    Ok(reason)
}

fn open_source(wiring: &Wiring) -> Result<Box<dyn FrameSource>, StreamError> {
    match &wiring.replay_dir {
        Some(dir) => Ok(Box::new(ReplaySource::open(dir)?)),
        None => Ok(Box::new(MjpegSource::connect(&wiring.stream_url)?)),
    }
}
