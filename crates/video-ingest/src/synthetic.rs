//! Deterministic test-pattern source.
//!
//! Produces a gray field with a bright box orbiting the frame, paced at a
//! fixed rate. Used by the demo path (`synthetic` source URI) and by tests
//! that need a capture source without a camera or FFmpeg.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::{Receiver, bounded};

use crate::types::{CaptureError, Frame, FrameFormat};

static OPEN_SOURCES: AtomicUsize = AtomicUsize::new(0);

/// Number of synthetic sources currently live. Used by lifecycle tests to
/// assert capture handles are released across start/stop cycles.
pub fn open_source_count() -> usize {
    OPEN_SOURCES.load(Ordering::SeqCst)
}

/// Spawn a synthetic source emitting `frame_limit` frames (`None` = endless)
/// at `fps`. The generator thread exits when the limit is reached or the
/// receiver is dropped.
pub fn spawn_synthetic_source(
    target_size: (i32, i32),
    fps: f64,
    frame_limit: Option<u64>,
) -> Receiver<Result<Frame, CaptureError>> {
    let (tx, rx) = bounded(2);
    let (width, height) = target_size;
    let interval = Duration::from_secs_f64(1.0 / fps.max(1.0));

    OPEN_SOURCES.fetch_add(1, Ordering::SeqCst);
    thread::spawn(move || {
        let mut index: u64 = 0;
        loop {
            if let Some(limit) = frame_limit {
                if index >= limit {
                    break;
                }
            }
            let frame = Frame {
                data: render_pattern(width, height, index),
                width,
                height,
                timestamp_ms: Utc::now().timestamp_millis(),
                format: FrameFormat::Bgr8,
            };
            if tx.send(Ok(frame)).is_err() {
                break;
            }
            index += 1;
            thread::sleep(interval);
        }
        OPEN_SOURCES.fetch_sub(1, Ordering::SeqCst);
    });

    rx
}

/// Render one BGR8 pattern frame: mid-gray background, white 32x32 box
/// sweeping left to right, wrapping every `width` frames.
fn render_pattern(width: i32, height: i32, index: u64) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let mut data = vec![96u8; w * h * 3];

    let box_size = 32usize.min(w).min(h);
    let x0 = (index as usize * 4) % w.saturating_sub(box_size).max(1);
    let y0 = (h.saturating_sub(box_size)) / 2;

    for y in y0..(y0 + box_size).min(h) {
        for x in x0..(x0 + box_size).min(w) {
            let offset = (y * w + x) * 3;
            data[offset] = 255;
            data[offset + 1] = 255;
            data[offset + 2] = 255;
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_requested_number_of_frames() {
        let rx = spawn_synthetic_source((64, 48), 240.0, Some(3));
        let mut frames = 0;
        while let Ok(result) = rx.recv() {
            let frame = result.unwrap();
            assert_eq!(frame.data.len(), 64 * 48 * 3);
            frames += 1;
        }
        assert_eq!(frames, 3);
    }

    #[test]
    fn source_count_returns_to_zero_after_drop() {
        let rx = spawn_synthetic_source((32, 32), 240.0, Some(2));
        assert!(open_source_count() >= 1);
        drop(rx);
        for _ in 0..50 {
            if open_source_count() == 0 {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("synthetic source thread did not release its handle");
    }
}
