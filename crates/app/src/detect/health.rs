//! Per-stage heartbeat tracking surfaced in the status API.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

const STALE_THRESHOLD_MS: u64 = 1_500;
const STARTUP_GRACE_MS: u64 = 5_000;

#[derive(Copy, Clone, Debug)]
pub(crate) enum StageId {
    Capture,
    Inference,
    Postprocess,
}

impl StageId {
    pub(crate) fn label(self) -> &'static str {
        match self {
            StageId::Capture => "capture",
            StageId::Inference => "inference",
            StageId::Postprocess => "postprocess",
        }
    }
}

/// Last-heartbeat timestamps for each stage. Stages beat once per loop
/// iteration; a stage that has not beaten within the stale threshold is
/// reported in `/api/status`.
pub(crate) struct PipelineHealth {
    capture: AtomicU64,
    inference: AtomicU64,
    postprocess: AtomicU64,
}

impl PipelineHealth {
    pub(crate) fn new() -> Self {
        let grace_deadline = current_millis().saturating_add(STARTUP_GRACE_MS);
        Self {
            capture: AtomicU64::new(grace_deadline),
            inference: AtomicU64::new(grace_deadline),
            postprocess: AtomicU64::new(grace_deadline),
        }
    }

    pub(crate) fn beat(&self, stage: StageId) {
        let now = current_millis();
        match stage {
            StageId::Capture => self.capture.store(now, Ordering::Relaxed),
            StageId::Inference => self.inference.store(now, Ordering::Relaxed),
            StageId::Postprocess => self.postprocess.store(now, Ordering::Relaxed),
        }
    }

    /// Labels of stages that have missed their heartbeat window.
    pub(crate) fn stalled(&self) -> Vec<&'static str> {
        let now = current_millis();
        let mut stalled = Vec::new();
        for (stamp, stage) in [
            (&self.capture, StageId::Capture),
            (&self.inference, StageId::Inference),
            (&self.postprocess, StageId::Postprocess),
        ] {
            if now.saturating_sub(stamp.load(Ordering::Relaxed)) > STALE_THRESHOLD_MS {
                stalled.push(stage.label());
            }
        }
        stalled
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
