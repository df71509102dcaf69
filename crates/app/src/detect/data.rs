use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::detect::queue::StreamQueue;

/// Output queue capacity; overflow evicts the oldest frame.
pub const OUTPUT_QUEUE_CAPACITY: usize = 30;

/// Annotated, encoded frame ready for streaming.
#[derive(Clone)]
pub struct FramePacket {
    pub jpeg: Vec<u8>,
    pub detections: Vec<DetectionSummary>,
    pub timestamp_ms: i64,
    pub frame_number: u64,
    pub fps: f32,
}

/// Per-detection record carried alongside the encoded frame and exposed on
/// the status/detections APIs.
#[derive(Clone, Serialize)]
pub struct DetectionSummary {
    pub label: String,
    pub score: f32,
    pub bbox: [f32; 4],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    pub loitering: bool,
}

pub type SharedFrame = Arc<Mutex<Option<FramePacket>>>;
pub type OutputQueue = Arc<StreamQueue<FramePacket>>;
