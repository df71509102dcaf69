//! Run lifecycle orchestration.
//!
//! One run at a time: `start` resolves the source and engine synchronously
//! (so acquisition failures surface to the caller), spawns the three stage
//! workers plus a supervisor, and flips the state machine to `Running`. The
//! supervisor owns teardown for both exit paths, cooperative stop and
//! natural end of input, and always lands the machine back on `Idle`.

use std::collections::HashSet;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use detect_core::{InferenceEngine, StubEngine, coco_class_id};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use video_ingest::{
    CaptureError, Frame, probe_source_fps, spawn_camera_reader, spawn_file_reader,
    spawn_synthetic_source,
};

use crate::detect::{
    config::{DEFAULT_FPS, PipelineConfig, StartRequest},
    data::{OUTPUT_QUEUE_CAPACITY, OutputQueue, SharedFrame},
    health::PipelineHealth,
    loiter::LoiteringDetector,
    queue::StreamQueue,
    speed::SpeedEstimator,
    stages::{
        self, CaptureBatch, FpsCell, INTER_STAGE_DEPTH, PostItem, PostprocessState, STAGE_POLL,
    },
    store::ConfigStore,
};

/// Capture resolution requested from every source.
const CAPTURE_SIZE: (i32, i32) = (640, 480);

/// How long the supervisor waits for the stages to drain after a stop
/// request before detaching them.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl RunState {
    pub fn label(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("detection is already running")]
    AlreadyRunning,
    #[error("detection is not running")]
    NotRunning,
    #[error("failed to open video source: {0}")]
    SourceUnavailable(String),
    #[error("failed to initialize inference engine: {0}")]
    EngineUnavailable(String),
}

/// Builds the engine for a run. Injectable so tests drive the pipeline with
/// scripted detections instead of a real runtime.
pub type EngineFactory =
    Box<dyn Fn(&PipelineConfig) -> anyhow::Result<Box<dyn InferenceEngine>> + Send + Sync>;

#[derive(Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub state: &'static str,
    pub fps: f32,
    /// Labels of stages that have missed their heartbeat window.
    pub health: Vec<&'static str>,
    pub config: PipelineConfig,
}

/// Channel ends the orchestrator keeps for an active run.
struct RunHandle {
    post_tx: Sender<PostItem>,
    supervisor: thread::JoinHandle<()>,
    health: Arc<PipelineHealth>,
}

pub struct Orchestrator {
    store: Arc<ConfigStore>,
    state: Arc<Mutex<RunState>>,
    cancel: Arc<AtomicBool>,
    run: Mutex<Option<RunHandle>>,
    output: OutputQueue,
    latest: SharedFrame,
    fps: Arc<FpsCell>,
    engine_factory: EngineFactory,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_engine_factory(
            config,
            Box::new(|_| Ok(Box::new(StubEngine::new()) as Box<dyn InferenceEngine>)),
        )
    }

    pub fn with_engine_factory(config: PipelineConfig, engine_factory: EngineFactory) -> Self {
        Self {
            store: Arc::new(ConfigStore::new(config)),
            state: Arc::new(Mutex::new(RunState::Idle)),
            cancel: Arc::new(AtomicBool::new(false)),
            run: Mutex::new(None),
            output: Arc::new(StreamQueue::new(OUTPUT_QUEUE_CAPACITY)),
            latest: Arc::new(Mutex::new(None)),
            fps: Arc::new(FpsCell::new()),
            engine_factory,
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn output_queue(&self) -> OutputQueue {
        Arc::clone(&self.output)
    }

    pub fn latest_frame(&self) -> SharedFrame {
        Arc::clone(&self.latest)
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().expect("run state poisoned")
    }

    /// Launch a run with the stored config plus the caller's overrides.
    /// Returns the effective config.
    pub fn start(&self, request: Option<&StartRequest>) -> Result<PipelineConfig, PipelineError> {
        {
            let mut state = self.state.lock().expect("run state poisoned");
            if *state != RunState::Idle {
                return Err(PipelineError::AlreadyRunning);
            }
            *state = RunState::Starting;
        }

        let config = match request {
            Some(request) => request.merged(&self.store.snapshot()),
            None => self.store.snapshot(),
        };
        self.store.replace(config.clone());

        match self.launch(&config) {
            Ok(handle) => {
                *self.run.lock().expect("run handle poisoned") = Some(handle);
                {
                    // A very short run may already have drained and landed
                    // back on Idle; don't resurrect it.
                    let mut state = self.state.lock().expect("run state poisoned");
                    if *state == RunState::Starting {
                        *state = RunState::Running;
                    }
                }
                info!(
                    "detection started (source: {}, tracking: {}, speed: {})",
                    config.video_source, config.enable_tracking, config.enable_speed_estimation
                );
                Ok(config)
            }
            Err(err) => {
                *self.state.lock().expect("run state poisoned") = RunState::Idle;
                error!("start failed: {err}");
                Err(err)
            }
        }
    }

    /// Request a cooperative stop. Returns as soon as the signal is raised;
    /// the supervisor finishes teardown in the background and resets the
    /// state machine to `Idle`.
    pub fn stop(&self) -> Result<(), PipelineError> {
        {
            let mut state = self.state.lock().expect("run state poisoned");
            if *state != RunState::Running {
                return Err(PipelineError::NotRunning);
            }
            *state = RunState::Stopping;
        }

        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.run.lock().expect("run handle poisoned").as_ref() {
            // Sentinel unblocks the terminal stage even if it is parked on
            // an empty channel.
            let _ = handle.post_tx.send_timeout(PostItem::End, STAGE_POLL);
        }
        self.output.clear();
        info!("detection stop requested");
        Ok(())
    }

    /// Block until the state machine is back on `Idle`.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let supervisor = self
                .run
                .lock()
                .expect("run handle poisoned")
                .take()
                .map(|handle| handle.supervisor);
            if let Some(supervisor) = supervisor {
                let _ = supervisor.join();
            }
            if self.state() == RunState::Idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn status(&self) -> StatusReport {
        let state = self.state();
        let running = state == RunState::Running;
        let health = if running {
            self.run
                .lock()
                .expect("run handle poisoned")
                .as_ref()
                .map(|handle| handle.health.stalled())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        StatusReport {
            running,
            state: state.label(),
            fps: if running { self.fps.get() } else { 0.0 },
            health,
            config: self.store.snapshot(),
        }
    }

    fn launch(&self, config: &PipelineConfig) -> Result<RunHandle, PipelineError> {
        let (capture_rx, source_fps) = resolve_source(&config.video_source)?;
        let engine = (self.engine_factory)(config)
            .map_err(|err| PipelineError::EngineUnavailable(err.to_string()))?;
        debug!("engine ready: {}", engine.name());

        self.cancel.store(false, Ordering::Relaxed);
        self.output.clear();
        self.fps.set(source_fps as f32);

        let (batch_tx, batch_rx) = bounded::<CaptureBatch>(INTER_STAGE_DEPTH);
        let (post_tx, post_rx) = bounded::<PostItem>(INTER_STAGE_DEPTH);
        let (done_tx, done_rx) = bounded::<&'static str>(3);
        let health = Arc::new(PipelineHealth::new());

        let target_classes = resolve_target_classes(&config.target_labels);
        let postprocess = PostprocessState {
            tracker: config
                .enable_tracking
                .then(|| Box::new(detect_core::GreedyTracker::default()) as Box<dyn detect_core::Tracker>),
            speed: config.enable_speed_estimation.then(SpeedEstimator::new),
            loiter: LoiteringDetector::new(source_fps),
            target_classes,
        };

        let mut workers = Vec::with_capacity(3);
        workers.push(spawn_stage("detect-preprocess", done_tx.clone(), {
            let cancel = Arc::clone(&self.cancel);
            let health = Arc::clone(&health);
            let fps_cell = Arc::clone(&self.fps);
            move || stages::run_preprocess_stage(capture_rx, batch_tx, cancel, health, fps_cell)
        })?);
        workers.push(spawn_stage("detect-inference", done_tx.clone(), {
            let cancel = Arc::clone(&self.cancel);
            let health = Arc::clone(&health);
            let post_tx = post_tx.clone();
            move || stages::run_inference_stage(engine, batch_rx, post_tx, cancel, health)
        })?);
        workers.push(spawn_stage("detect-postprocess", done_tx, {
            let cancel = Arc::clone(&self.cancel);
            let health = Arc::clone(&health);
            let store = Arc::clone(&self.store);
            let output = Arc::clone(&self.output);
            let latest = Arc::clone(&self.latest);
            move || {
                stages::run_postprocess_stage(
                    post_rx, store, postprocess, output, latest, cancel, health,
                )
            }
        })?);

        let supervisor = {
            let state = Arc::clone(&self.state);
            let cancel = Arc::clone(&self.cancel);
            let fps_cell = Arc::clone(&self.fps);
            let output = Arc::clone(&self.output);
            thread::Builder::new()
                .name("detect-supervisor".into())
                .spawn(move || {
                    supervise(workers, done_rx, &cancel);
                    if cancel.load(Ordering::Relaxed) {
                        // A frame in flight can land after `stop` cleared the
                        // queue; clear again once the stages are down. A
                        // naturally drained run keeps its final frames.
                        output.clear();
                    }
                    fps_cell.set(0.0);
                    *state.lock().expect("run state poisoned") = RunState::Idle;
                    // Cleared only once the machine is back on Idle; a new
                    // start re-arms it anyway.
                    cancel.store(false, Ordering::Relaxed);
                    info!("detection run finished");
                })
                .map_err(|err| PipelineError::EngineUnavailable(err.to_string()))?
        };

        Ok(RunHandle {
            post_tx,
            supervisor,
            health,
        })
    }
}

struct StageWorker {
    name: &'static str,
    handle: thread::JoinHandle<()>,
}

fn spawn_stage(
    name: &'static str,
    done_tx: Sender<&'static str>,
    body: impl FnOnce() + Send + 'static,
) -> Result<StageWorker, PipelineError> {
    let handle = thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            // Failure boundary: a stage failure ends the stage, never the
            // run supervisor's accounting.
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)).is_err() {
                error!("{name} stage failed");
            }
            let _ = done_tx.send(name);
            debug!("{name} stage exited");
        })
        .map_err(|err| PipelineError::EngineUnavailable(err.to_string()))?;
    Ok(StageWorker { name, handle })
}

/// Wait for every stage to report done. Stages normally cascade to exit on
/// end of input; after a cancellation the wait is bounded, and stragglers
/// are detached with a warning rather than blocking teardown forever.
fn supervise(workers: Vec<StageWorker>, done_rx: Receiver<&'static str>, cancel: &AtomicBool) {
    let mut remaining: HashSet<&'static str> = workers.iter().map(|w| w.name).collect();
    let mut cancel_deadline: Option<Instant> = None;

    while !remaining.is_empty() {
        match done_rx.recv_timeout(STAGE_POLL) {
            Ok(name) => {
                remaining.remove(name);
            }
            Err(RecvTimeoutError::Timeout) => {
                if cancel.load(Ordering::Relaxed) {
                    let deadline = *cancel_deadline.get_or_insert_with(|| Instant::now() + JOIN_TIMEOUT);
                    if Instant::now() >= deadline {
                        for name in &remaining {
                            warn!("{name} stage did not stop within {JOIN_TIMEOUT:?}; detaching");
                        }
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for worker in workers {
        if remaining.contains(worker.name) {
            // Detached; the thread exits on its own once its blocking call
            // times out.
            continue;
        }
        let _ = worker.handle.join();
    }
}

/// Open the configured source and report the frame rate the run will assume.
fn resolve_source(
    source: &str,
) -> Result<(Receiver<Result<Frame, CaptureError>>, f64), PipelineError> {
    if source == "camera" || source.starts_with("/dev/video") {
        let uri = if source == "camera" { "0" } else { source };
        let rx = spawn_camera_reader(uri, CAPTURE_SIZE)
            .map_err(|err| PipelineError::SourceUnavailable(err.to_string()))?;
        return Ok((rx, DEFAULT_FPS));
    }

    if let Some(rest) = source.strip_prefix("synthetic") {
        let frame_limit = rest
            .strip_prefix(':')
            .and_then(|count| count.parse::<u64>().ok());
        let rx = spawn_synthetic_source(CAPTURE_SIZE, DEFAULT_FPS, frame_limit);
        return Ok((rx, DEFAULT_FPS));
    }

    let fps = probe_source_fps(source).unwrap_or(DEFAULT_FPS);
    let rx = spawn_file_reader(source, CAPTURE_SIZE)
        .map_err(|err| PipelineError::SourceUnavailable(err.to_string()))?;
    Ok((rx, fps))
}

/// Map configured label names to class ids, warning on unknown labels. An
/// empty result disables label filtering rather than filtering everything
/// out.
fn resolve_target_classes(labels: &[String]) -> Vec<u32> {
    let mut classes = Vec::with_capacity(labels.len());
    for label in labels {
        match coco_class_id(label) {
            Some(id) => classes.push(id),
            None => warn!("unknown target label {label:?} ignored"),
        }
    }
    classes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_labels() {
        assert_eq!(RunState::Idle.label(), "idle");
        assert_eq!(RunState::Stopping.label(), "stopping");
    }

    #[test]
    fn unknown_labels_are_dropped() {
        let classes = resolve_target_classes(&[
            "person".to_string(),
            "unicorn".to_string(),
            "car".to_string(),
        ]);
        assert_eq!(classes, vec![0, 2]);
    }

    #[test]
    fn synthetic_source_parses_frame_limit() {
        let (rx, fps) = resolve_source("synthetic:3").unwrap();
        assert!((fps - DEFAULT_FPS).abs() < f64::EPSILON);
        let mut frames = 0;
        while let Ok(frame) = rx.recv_timeout(Duration::from_secs(2)) {
            frame.unwrap();
            frames += 1;
        }
        assert_eq!(frames, 3);
    }

    #[test]
    fn missing_file_is_reported_synchronously() {
        let orchestrator = Orchestrator::new(PipelineConfig {
            video_source: "/nonexistent/clip.mp4".to_string(),
            ..PipelineConfig::default()
        });
        let err = orchestrator.start(None).unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable(_)));
        assert_eq!(orchestrator.state(), RunState::Idle);
    }

    #[test]
    fn stop_without_run_is_rejected() {
        let orchestrator = Orchestrator::new(PipelineConfig::default());
        assert!(matches!(
            orchestrator.stop(),
            Err(PipelineError::NotRunning)
        ));
    }
}
