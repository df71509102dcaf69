//! Stage worker loops for the detection pipeline.
//!
//! Three workers run as independent threads: preprocess (drains capture,
//! builds tensor batches), inference (feeds the engine, receives completions
//! asynchronously), and postprocess (tracking, analytics, annotation,
//! output). Every blocking wait carries a timeout so a cancellation signal
//! is observed within one poll interval, and every stage body is wrapped so
//! a failure logs and exits the stage instead of unwinding past the
//! orchestrator.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use detect_core::{DetectionBatch, InferenceEngine, Tensor, Tracker};
use tracing::{debug, error, warn};
use video_ingest::{CaptureError, Frame};

use crate::detect::{
    annotation::annotate_and_encode,
    config::PipelineConfig,
    data::{DetectionSummary, FramePacket, OutputQueue, SharedFrame},
    health::{PipelineHealth, StageId},
    loiter::LoiteringDetector,
    speed::{DEFAULT_SMOOTHING_WINDOW, SpeedEstimator},
    store::ConfigStore,
};

/// Poll interval for every blocking queue wait; bounds cancellation latency.
pub(crate) const STAGE_POLL: Duration = Duration::from_millis(200);

/// Inter-stage channel depth.
pub(crate) const INTER_STAGE_DEPTH: usize = 8;

/// JPEG quality for streamed frames.
const STREAM_JPEG_QUALITY: u8 = 70;

/// Frames per submitted inference batch.
const BATCH_SIZE: usize = 1;

/// Tensor batch paired with its source frames, produced by preprocess.
pub(crate) struct CaptureBatch {
    pub(crate) frames: Vec<Frame>,
    pub(crate) tensors: Vec<Tensor>,
    pub(crate) first_frame_number: u64,
    pub(crate) fps: f32,
}

/// Item flowing into the postprocess stage. `End` is the end-of-stream
/// sentinel that unblocks the terminal stage even if no cancellation check
/// fires.
pub(crate) enum PostItem {
    Batch(InferredBatch),
    End,
}

pub(crate) struct InferredBatch {
    pub(crate) frames: Vec<Frame>,
    pub(crate) detections: Vec<DetectionBatch>,
    pub(crate) first_frame_number: u64,
    pub(crate) fps: f32,
}

/// Lock-free cell holding the smoothed capture fps for the status API.
pub(crate) struct FpsCell(AtomicU32);

impl FpsCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU32::new(0.0f32.to_bits()))
    }

    pub(crate) fn set(&self, fps: f32) {
        self.0.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Preprocess loop: drain the capture receiver, batch tensors, hand off to
/// inference. Applies drop-current-batch on a full downstream queue so a
/// slow detector never stalls capture.
pub(crate) fn run_preprocess_stage(
    capture_rx: Receiver<Result<Frame, CaptureError>>,
    batch_tx: Sender<CaptureBatch>,
    cancel: Arc<AtomicBool>,
    health: Arc<PipelineHealth>,
    fps_cell: Arc<FpsCell>,
) {
    let mut frame_number: u64 = 0;
    let mut smoothed_fps: f32 = 0.0;
    let mut last_instant = Instant::now();
    let mut dropped_batches: u64 = 0;
    let mut pending_frames: Vec<Frame> = Vec::with_capacity(BATCH_SIZE);
    let mut pending_tensors: Vec<Tensor> = Vec::with_capacity(BATCH_SIZE);

    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }

        let frame = match capture_rx.recv_timeout(STAGE_POLL) {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                error!("capture failed: {err}");
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("capture source exhausted");
                break;
            }
        };

        health.beat(StageId::Capture);
        frame_number = frame_number.wrapping_add(1);

        let now = Instant::now();
        let elapsed = now.duration_since(last_instant).as_secs_f32();
        last_instant = now;
        if elapsed > 0.0 {
            let instant = 1.0 / elapsed;
            smoothed_fps = if smoothed_fps == 0.0 {
                instant
            } else {
                0.9 * smoothed_fps + 0.1 * instant
            };
            fps_cell.set(smoothed_fps);
            metrics::gauge!("vigil_pipeline_fps").set(f64::from(smoothed_fps));
        }

        if frame_number % 30 == 0 {
            debug!("capture heartbeat: frame #{frame_number}, {smoothed_fps:.1} fps");
        }

        pending_tensors.push(frame_to_tensor(&frame));
        pending_frames.push(frame);
        if pending_frames.len() < BATCH_SIZE {
            continue;
        }

        let batch = CaptureBatch {
            frames: std::mem::take(&mut pending_frames),
            tensors: std::mem::take(&mut pending_tensors),
            first_frame_number: frame_number - (BATCH_SIZE as u64 - 1),
            fps: smoothed_fps,
        };

        match batch_tx.send_timeout(batch, STAGE_POLL) {
            Ok(()) => {
                metrics::gauge!("vigil_queue_depth", "queue" => "inference")
                    .set(batch_tx.len() as f64);
            }
            Err(err) if err.is_timeout() => {
                // Inference backlog: discard this batch and keep capturing.
                dropped_batches = dropped_batches.wrapping_add(1);
                metrics::counter!("vigil_dropped_frames_total", "stage" => "preprocess")
                    .increment(BATCH_SIZE as u64);
                if dropped_batches % 30 == 1 {
                    warn!("dropping frames (inference backlog, dropped batches: {dropped_batches})");
                }
            }
            Err(_) => {
                error!("inference stage terminated unexpectedly");
                break;
            }
        }
    }
}

/// Inference loop: submit tensor batches to the engine; completions arrive
/// on an engine-owned thread and are forwarded through the postprocess
/// channel, never touching shared state directly.
pub(crate) fn run_inference_stage(
    mut engine: Box<dyn InferenceEngine>,
    batch_rx: Receiver<CaptureBatch>,
    post_tx: Sender<PostItem>,
    cancel: Arc<AtomicBool>,
    health: Arc<PipelineHealth>,
) {
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }

        let batch = match batch_rx.recv_timeout(STAGE_POLL) {
            Ok(batch) => batch,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        health.beat(StageId::Inference);

        let CaptureBatch {
            frames,
            tensors,
            first_frame_number,
            fps,
        } = batch;
        let completion_tx = post_tx.clone();
        let submitted = engine.submit(
            tensors,
            Box::new(move |result| match result {
                Ok(detections) => {
                    let item = PostItem::Batch(InferredBatch {
                        frames,
                        detections,
                        first_frame_number,
                        fps,
                    });
                    if completion_tx.send_timeout(item, STAGE_POLL).is_err() {
                        metrics::counter!("vigil_dropped_frames_total", "stage" => "inference")
                            .increment(1);
                    }
                }
                Err(err) => {
                    // Per-batch failure: the frames are dropped, the run
                    // continues.
                    error!("inference error: {err}");
                    metrics::counter!("vigil_inference_errors_total").increment(1);
                }
            }),
        );
        if let Err(err) = submitted {
            error!("failed to submit batch: {err}");
            break;
        }
    }

    // Pending completions fire before close returns, so the sentinel below
    // is the last item the postprocess stage can see.
    engine.close();
    if post_tx.send_timeout(PostItem::End, STAGE_POLL).is_err() {
        debug!("postprocess stage already gone at end of stream");
    }
}

/// State owned exclusively by the postprocess stage. Single writer, no
/// locking on the per-frame path.
pub(crate) struct PostprocessState {
    pub(crate) tracker: Option<Box<dyn Tracker>>,
    pub(crate) speed: Option<SpeedEstimator>,
    pub(crate) loiter: LoiteringDetector,
    pub(crate) target_classes: Vec<u32>,
}

/// Postprocess loop: per frame, take one config snapshot, filter, track,
/// run analytics, annotate, encode, and publish to the output queue.
pub(crate) fn run_postprocess_stage(
    post_rx: Receiver<PostItem>,
    store: Arc<ConfigStore>,
    mut state: PostprocessState,
    output: OutputQueue,
    latest: SharedFrame,
    cancel: Arc<AtomicBool>,
    health: Arc<PipelineHealth>,
) {
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }

        let batch = match post_rx.recv_timeout(STAGE_POLL) {
            Ok(PostItem::Batch(batch)) => batch,
            Ok(PostItem::End) => {
                debug!("postprocess received end-of-stream");
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        health.beat(StageId::Postprocess);
        let snapshot = store.snapshot();
        let stage_start = Instant::now();

        let InferredBatch {
            frames,
            detections,
            first_frame_number,
            fps,
        } = batch;
        if frames.len() != detections.len() {
            error!(
                "engine returned {} batch(es) for {} frame(s); dropping",
                detections.len(),
                frames.len()
            );
            continue;
        }

        for (offset, (frame, frame_detections)) in
            frames.into_iter().zip(detections.into_iter()).enumerate()
        {
            let frame_number = first_frame_number + offset as u64;
            match process_frame(&frame, frame_detections, &snapshot, &mut state) {
                Ok(summaries) => {
                    match annotate_and_encode(&frame, &summaries, STREAM_JPEG_QUALITY) {
                        Ok(jpeg) => {
                            let packet = FramePacket {
                                jpeg,
                                detections: summaries,
                                timestamp_ms: frame.timestamp_ms,
                                frame_number,
                                fps,
                            };
                            output.push_latest(packet.clone());
                            metrics::gauge!("vigil_queue_depth", "queue" => "output")
                                .set(output.len() as f64);
                            *latest.lock().expect("latest frame slot poisoned") = Some(packet);
                        }
                        Err(err) => error!("annotation failed: {err}"),
                    }
                }
                Err(err) => error!("postprocess failed on frame #{frame_number}: {err}"),
            }
        }

        metrics::histogram!("vigil_stage_latency_seconds", "stage" => "postprocess")
            .record(stage_start.elapsed().as_secs_f64());
    }

    // Run over: all per-track state dies with it.
    if let Some(speed) = state.speed.as_mut() {
        speed.clear_all();
    }
    state.loiter.clear();
    if let Some(tracker) = state.tracker.as_mut() {
        tracker.reset();
    }
}

/// Apply confidence/label filtering, tracking, and the analytics engines to
/// one frame's detections.
fn process_frame(
    frame: &Frame,
    detections: DetectionBatch,
    snapshot: &PipelineConfig,
    state: &mut PostprocessState,
) -> anyhow::Result<Vec<DetectionSummary>> {
    let filtered: Vec<_> = detections
        .detections
        .into_iter()
        .filter(|det| det.score >= snapshot.live.confidence_threshold)
        .filter(|det| {
            state.target_classes.is_empty() || state.target_classes.contains(&det.class_id)
        })
        .collect();

    let Some(tracker) = state.tracker.as_mut() else {
        return Ok(filtered
            .into_iter()
            .map(|det| DetectionSummary {
                label: det.label().to_string(),
                score: det.score,
                bbox: det.bbox,
                track_id: None,
                speed_kmh: None,
                loitering: false,
            })
            .collect());
    };

    let update = tracker.update(filtered);
    for retired in &update.retired {
        if let Some(speed) = state.speed.as_mut() {
            speed.clear_track(*retired);
        }
        state.loiter.remove_track(*retired);
    }

    let timestamp_secs = frame.timestamp_ms as f64 / 1000.0;
    let meters_per_pixel = snapshot.live.meters_per_pixel();
    let mut summaries = Vec::with_capacity(update.tracks.len());
    for tracked in update.tracks {
        let speed_kmh = state.speed.as_mut().and_then(|speed| {
            speed.estimate(
                tracked.track_id,
                tracked.detection.bbox,
                timestamp_secs,
                meters_per_pixel,
            )?;
            speed.smoothed_speed(tracked.track_id, DEFAULT_SMOOTHING_WINDOW)
        });

        // Dwell accumulates with presence; the flag is only raised while
        // loitering detection is switched on.
        let over_threshold = state
            .loiter
            .observe(tracked.track_id, snapshot.live.loitering_threshold_secs);
        let loitering = snapshot.live.enable_loitering_detection && over_threshold;

        summaries.push(DetectionSummary {
            label: tracked.detection.label().to_string(),
            score: tracked.detection.score,
            bbox: tracked.detection.bbox,
            track_id: Some(tracked.track_id),
            speed_kmh,
            loitering,
        });
    }
    Ok(summaries)
}

/// Convert a BGR8 frame into the normalized CHW RGB tensor the engine
/// contract expects.
pub(crate) fn frame_to_tensor(frame: &Frame) -> Tensor {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let plane = width * height;
    let mut data = vec![0.0f32; plane * 3];
    for (index, pixel) in frame.data.chunks_exact(3).enumerate() {
        data[index] = f32::from(pixel[2]) / 255.0;
        data[plane + index] = f32::from(pixel[1]) / 255.0;
        data[2 * plane + index] = f32::from(pixel[0]) / 255.0;
    }
    Tensor {
        data,
        width: frame.width as u32,
        height: frame.height as u32,
    }
}

#[cfg(test)]
mod tests {
    use detect_core::{Detection, GreedyTracker};
    use video_ingest::FrameFormat;

    use super::*;

    fn frame(timestamp_ms: i64) -> Frame {
        Frame {
            data: vec![0u8; 64 * 48 * 3],
            width: 64,
            height: 48,
            timestamp_ms,
            format: FrameFormat::Bgr8,
        }
    }

    fn person(x: f32, score: f32) -> Detection {
        Detection {
            bbox: [x, 10.0, x + 20.0, 40.0],
            score,
            class_id: 0,
        }
    }

    fn state_with_tracking() -> PostprocessState {
        PostprocessState {
            tracker: Some(Box::new(GreedyTracker::default())),
            speed: Some(SpeedEstimator::new()),
            loiter: LoiteringDetector::new(30.0),
            target_classes: vec![0],
        }
    }

    #[test]
    fn confidence_filter_uses_snapshot() {
        let mut config = PipelineConfig::default();
        config.live.confidence_threshold = 0.5;
        let mut state = state_with_tracking();
        let batch = DetectionBatch {
            detections: vec![person(10.0, 0.4), person(40.0, 0.9)],
        };
        let summaries = process_frame(&frame(0), batch, &config, &mut state).unwrap();
        assert_eq!(summaries.len(), 1);
        assert!((summaries[0].score - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn target_label_filter_applies() {
        let config = PipelineConfig::default();
        let mut state = state_with_tracking();
        let batch = DetectionBatch {
            detections: vec![Detection {
                bbox: [5.0, 5.0, 25.0, 25.0],
                score: 0.9,
                class_id: 41, // "cup", not in target set
            }],
        };
        let summaries = process_frame(&frame(0), batch, &config, &mut state).unwrap();
        assert!(summaries.is_empty());
    }

    #[test]
    fn speed_appears_after_second_observation() {
        let config = PipelineConfig::default();
        let mut state = state_with_tracking();

        let first = process_frame(
            &frame(0),
            DetectionBatch {
                detections: vec![person(10.0, 0.9)],
            },
            &config,
            &mut state,
        )
        .unwrap();
        assert_eq!(first[0].speed_kmh, None);

        let second = process_frame(
            &frame(100),
            DetectionBatch {
                detections: vec![person(14.0, 0.9)],
            },
            &config,
            &mut state,
        )
        .unwrap();
        assert_eq!(second[0].track_id, first[0].track_id);
        assert!(second[0].speed_kmh.unwrap() > 0.0);
    }

    #[test]
    fn retired_tracks_evict_analytics_state() {
        let config = PipelineConfig::default();
        let mut state = PostprocessState {
            tracker: Some(Box::new(GreedyTracker::new(0.2, 1))),
            speed: Some(SpeedEstimator::new()),
            loiter: LoiteringDetector::new(30.0),
            target_classes: vec![0],
        };

        for step in 0..2 {
            process_frame(
                &frame(step * 100),
                DetectionBatch {
                    detections: vec![person(10.0 + step as f32, 0.9)],
                },
                &config,
                &mut state,
            )
            .unwrap();
        }
        assert_eq!(state.speed.as_ref().unwrap().tracked_count(), 1);
        assert_eq!(state.loiter.tracked_count(), 1);

        // Object disappears; after the coast window the track retires and
        // both engines must be purged.
        for step in 2..6 {
            process_frame(
                &frame(step * 100),
                DetectionBatch::default(),
                &config,
                &mut state,
            )
            .unwrap();
        }
        assert_eq!(state.speed.as_ref().unwrap().tracked_count(), 0);
        assert_eq!(state.loiter.tracked_count(), 0);
    }

    #[test]
    fn loitering_flag_needs_enable_and_threshold() {
        let mut config = PipelineConfig::default();
        config.live.enable_loitering_detection = true;
        config.live.loitering_threshold_secs = 0.1; // 3 frames at 30 fps
        let mut state = state_with_tracking();

        let mut last = Vec::new();
        for step in 0..4 {
            last = process_frame(
                &frame(step * 33),
                DetectionBatch {
                    detections: vec![person(10.0, 0.9)],
                },
                &config,
                &mut state,
            )
            .unwrap();
        }
        assert!(last[0].loitering);

        // Disabling the flag hides loitering without touching the counter.
        config.live.enable_loitering_detection = false;
        let hidden = process_frame(
            &frame(200),
            DetectionBatch {
                detections: vec![person(10.0, 0.9)],
            },
            &config,
            &mut state,
        )
        .unwrap();
        assert!(!hidden[0].loitering);
        assert!(state.loiter.dwell_frames(hidden[0].track_id.unwrap()) >= 4);
    }

    #[test]
    fn tensor_layout_is_chw_rgb() {
        let mut f = frame(0);
        f.data = vec![0u8; 2 * 2 * 3];
        // First pixel BGR = (255, 0, 0) i.e. pure blue.
        f.data[0] = 255;
        f.width = 2;
        f.height = 2;
        let tensor = frame_to_tensor(&f);
        assert_eq!(tensor.data.len(), 12);
        assert_eq!(tensor.data[0], 0.0); // R plane
        assert_eq!(tensor.data[8], 1.0); // B plane, first pixel
    }
}
