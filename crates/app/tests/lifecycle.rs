//! End-to-end lifecycle tests: the full pipeline running against the
//! synthetic capture source with a scripted inference engine.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use detect_core::{Detection, DetectionBatch, InferenceEngine, ScriptedEngine};
use vigil::detect::{
    config::{LiveUpdate, PipelineConfig},
    pipeline::{Orchestrator, PipelineError, RunState},
};

// The synthetic source keeps a process-global open-handle counter, so tests
// that assert on it must not overlap.
static SOURCE_LOCK: Mutex<()> = Mutex::new(());

fn serialize() -> MutexGuard<'static, ()> {
    SOURCE_LOCK.lock().unwrap_or_else(|err| err.into_inner())
}

fn synthetic_config(source: &str) -> PipelineConfig {
    PipelineConfig {
        video_source: source.to_string(),
        ..PipelineConfig::default()
    }
}

fn scripted_orchestrator(config: PipelineConfig) -> Orchestrator {
    Orchestrator::with_engine_factory(
        config,
        Box::new(|_| {
            let engine = ScriptedEngine::new(vec![DetectionBatch {
                detections: vec![Detection {
                    bbox: [100.0, 100.0, 164.0, 164.0],
                    score: 0.9,
                    class_id: 0, // person
                }],
            }]);
            Ok(Box::new(engine) as Box<dyn InferenceEngine>)
        }),
    )
}

fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    predicate()
}

#[test]
fn start_stop_cycle_produces_annotated_frames() {
    let _guard = serialize();
    let orchestrator = scripted_orchestrator(synthetic_config("synthetic"));

    orchestrator.start(None).unwrap();
    assert!(matches!(
        orchestrator.start(None),
        Err(PipelineError::AlreadyRunning)
    ));

    // Frames must reach the output with tracked, labelled detections.
    let latest = orchestrator.latest_frame();
    assert!(wait_for(Duration::from_secs(10), || {
        latest
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|packet| !packet.jpeg.is_empty() && !packet.detections.is_empty())
    }));
    let packet = latest.lock().unwrap().clone().unwrap();
    assert_eq!(packet.detections[0].label, "person");
    assert!(packet.detections[0].track_id.is_some());

    orchestrator.stop().unwrap();
    assert!(orchestrator.wait_until_idle(Duration::from_secs(5)));
    assert!(matches!(
        orchestrator.stop(),
        Err(PipelineError::NotRunning)
    ));

    // Cooperative stop must release the capture handle.
    assert!(wait_for(Duration::from_secs(5), || {
        video_ingest::open_source_count() == 0
    }));
}

#[test]
fn run_drains_to_idle_on_end_of_input() {
    let _guard = serialize();
    let orchestrator = scripted_orchestrator(synthetic_config("synthetic:10"));

    orchestrator.start(None).unwrap();
    assert!(orchestrator.wait_until_idle(Duration::from_secs(10)));
    assert_eq!(orchestrator.state(), RunState::Idle);
    assert!(wait_for(Duration::from_secs(5), || {
        video_ingest::open_source_count() == 0
    }));
}

#[test]
fn restart_after_stop_is_clean() {
    let _guard = serialize();
    let orchestrator = scripted_orchestrator(synthetic_config("synthetic"));

    for _ in 0..2 {
        orchestrator.start(None).unwrap();
        assert!(wait_for(Duration::from_secs(10), || {
            !orchestrator.output_queue().is_empty()
        }));
        orchestrator.stop().unwrap();
        assert!(orchestrator.wait_until_idle(Duration::from_secs(5)));
    }
    assert!(wait_for(Duration::from_secs(5), || {
        video_ingest::open_source_count() == 0
    }));
}

#[test]
fn stop_leaves_no_frames_in_the_output_queue() {
    let _guard = serialize();
    let orchestrator = scripted_orchestrator(synthetic_config("synthetic"));

    orchestrator.start(None).unwrap();
    assert!(wait_for(Duration::from_secs(10), || {
        !orchestrator.output_queue().is_empty()
    }));

    // A frame in flight when `stop` clears the queue may still land there;
    // once the run is back on Idle the queue must be empty anyway.
    orchestrator.stop().unwrap();
    assert!(orchestrator.wait_until_idle(Duration::from_secs(5)));
    assert!(orchestrator.output_queue().is_empty());
}

#[test]
fn per_batch_engine_failures_do_not_kill_the_run() {
    let _guard = serialize();
    let orchestrator = Orchestrator::with_engine_factory(
        synthetic_config("synthetic"),
        Box::new(|_| {
            Ok(Box::new(ScriptedEngine::failing("model exploded")) as Box<dyn InferenceEngine>)
        }),
    );

    orchestrator.start(None).unwrap();
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(orchestrator.state(), RunState::Running);

    orchestrator.stop().unwrap();
    assert!(orchestrator.wait_until_idle(Duration::from_secs(5)));
    assert!(wait_for(Duration::from_secs(5), || {
        video_ingest::open_source_count() == 0
    }));
}

#[test]
fn live_update_applies_mid_run_and_keeps_invariant() {
    let _guard = serialize();
    let orchestrator = scripted_orchestrator(synthetic_config("synthetic"));
    orchestrator.start(None).unwrap();

    let updated = orchestrator.store().apply_live(&LiveUpdate {
        confidence_threshold: Some(0.95),
        enable_loitering_detection: Some(true),
        ..LiveUpdate::default()
    });
    assert!((updated.live.confidence_threshold - 0.95).abs() < f32::EPSILON);
    assert!(updated.live.enable_loitering_detection);
    // Speed estimation is on, so tracking cannot be observed off.
    assert!(updated.enable_tracking);

    // Scripted detections score 0.9, below the raised threshold: output
    // frames keep flowing but stop carrying detections.
    let latest = orchestrator.latest_frame();
    assert!(wait_for(Duration::from_secs(10), || {
        latest
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|packet| packet.detections.is_empty())
    }));

    orchestrator.stop().unwrap();
    assert!(orchestrator.wait_until_idle(Duration::from_secs(5)));
}
