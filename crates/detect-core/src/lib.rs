//! Detector and tracker contracts shared by the pipeline.
//!
//! The accelerator binding and the association algorithm are black boxes to
//! the rest of the system; this crate pins down their interfaces plus the
//! built-in implementations used when no real runtime is attached.

mod engine;
mod tracker;
mod types;

pub use engine::{Completion, InferenceEngine, InferenceError, ScriptedEngine, StubEngine};
pub use tracker::{GreedyTracker, TrackedDetection, Tracker, TrackerOutput};
pub use types::{COCO_CLASSES, Detection, DetectionBatch, Tensor, coco_class_id, coco_label};
