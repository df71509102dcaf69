//! Thin capture layer: raw frame types plus background readers that feed
//! frames over bounded channels.
//!
//! Decoding runs in an `ffmpeg` child process (or the synthetic generator);
//! the channel buffer is intentionally small so downstream backpressure
//! reaches capture instead of growing memory.

mod ffmpeg;
mod synthetic;
mod types;

pub use ffmpeg::{probe_source_fps, spawn_camera_reader, spawn_file_reader};
pub use synthetic::{open_source_count, spawn_synthetic_source};
pub use types::{CaptureError, Frame, FrameFormat};
