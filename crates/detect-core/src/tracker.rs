//! Multi-object tracking contract and a default greedy matcher.
//!
//! The pipeline treats the tracker as a stateful black box: feed it the
//! current frame's detections, get back the same detections annotated with
//! stable track ids plus the ids retired this frame. Retirement drives
//! analytics eviction, so every implementation must report it.

use std::collections::VecDeque;

use crate::types::Detection;

/// Detection annotated with a stable track identity.
#[derive(Debug, Clone)]
pub struct TrackedDetection {
    pub detection: Detection,
    pub track_id: u64,
}

/// Result of one tracker update.
#[derive(Debug, Default)]
pub struct TrackerOutput {
    pub tracks: Vec<TrackedDetection>,
    /// Track ids lost this frame; their per-track state must be discarded.
    pub retired: Vec<u64>,
}

pub trait Tracker: Send {
    fn update(&mut self, detections: Vec<Detection>) -> TrackerOutput;

    /// Drop all track state. Every live id is reported retired on the next
    /// update cycle's behalf by the caller.
    fn reset(&mut self);
}

/// Greedy IoU tracker with centroid rescue and bounded coasting.
///
/// Sufficient for the handful of objects a single camera sees; detections
/// are matched to the best-overlapping live track, unmatched tracks coast
/// for `max_coast_frames` before retirement.
pub struct GreedyTracker {
    min_iou: f32,
    max_coast_frames: u32,
    max_centroid_distance: f32,
    next_id: u64,
    tracks: Vec<InternalTrack>,
}

struct InternalTrack {
    id: u64,
    bbox: [f32; 4],
    coast: u32,
}

impl Default for GreedyTracker {
    fn default() -> Self {
        Self {
            min_iou: 0.2,
            max_coast_frames: 15,
            max_centroid_distance: 96.0,
            next_id: 1,
            tracks: Vec::new(),
        }
    }
}

impl GreedyTracker {
    pub fn new(min_iou: f32, max_coast_frames: u32) -> Self {
        Self {
            min_iou,
            max_coast_frames,
            ..Self::default()
        }
    }
}

impl Tracker for GreedyTracker {
    fn update(&mut self, detections: Vec<Detection>) -> TrackerOutput {
        let mut output = TrackerOutput::default();
        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut pending: VecDeque<Detection> = detections.into();

        while let Some(det) = pending.pop_front() {
            let mut best: Option<(usize, f32)> = None;
            for (index, track) in self.tracks.iter().enumerate() {
                if matched_tracks[index] {
                    continue;
                }
                let overlap = iou(&det.bbox, &track.bbox);
                let score = if overlap >= self.min_iou {
                    overlap
                } else if centroid_distance(&det.bbox, &track.bbox) <= self.max_centroid_distance {
                    // Rescue fast movers that cleared their old box entirely.
                    f32::EPSILON
                } else {
                    continue;
                };
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((index, score));
                }
            }

            let id = match best {
                Some((index, _)) => {
                    matched_tracks[index] = true;
                    self.tracks[index].bbox = det.bbox;
                    self.tracks[index].coast = 0;
                    self.tracks[index].id
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(InternalTrack {
                        id,
                        bbox: det.bbox,
                        coast: 0,
                    });
                    matched_tracks.push(true);
                    id
                }
            };
            output.tracks.push(TrackedDetection {
                detection: det,
                track_id: id,
            });
        }

        let max_coast = self.max_coast_frames;
        self.tracks.retain_mut(|track| {
            if track.coast == 0 && output.tracks.iter().any(|t| t.track_id == track.id) {
                return true;
            }
            track.coast += 1;
            if track.coast > max_coast {
                output.retired.push(track.id);
                false
            } else {
                true
            }
        });

        output
    }

    fn reset(&mut self) {
        self.tracks.clear();
    }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);
    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if intersection <= 0.0 {
        return 0.0;
    }
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    intersection / (area_a + area_b - intersection)
}

fn centroid_distance(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let acx = (a[0] + a[2]) / 2.0;
    let acy = (a[1] + a[3]) / 2.0;
    let bcx = (b[0] + b[2]) / 2.0;
    let bcy = (b[1] + b[3]) / 2.0;
    ((acx - bcx).powi(2) + (acy - bcy).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            bbox: [x1, y1, x2, y2],
            score: 0.8,
            class_id: 0,
        }
    }

    #[test]
    fn iou_overlap() {
        let score = iou(&[0.0, 0.0, 100.0, 100.0], &[50.0, 50.0, 150.0, 150.0]);
        assert!((score - 2500.0 / 17500.0).abs() < 0.01);
    }

    #[test]
    fn stable_id_across_frames() {
        let mut tracker = GreedyTracker::default();
        let first = tracker.update(vec![det(100.0, 100.0, 150.0, 150.0)]);
        let id = first.tracks[0].track_id;

        let second = tracker.update(vec![det(104.0, 102.0, 154.0, 152.0)]);
        assert_eq!(second.tracks[0].track_id, id);
        assert!(second.retired.is_empty());
    }

    #[test]
    fn distinct_objects_get_distinct_ids() {
        let mut tracker = GreedyTracker::default();
        let out = tracker.update(vec![
            det(0.0, 0.0, 50.0, 50.0),
            det(400.0, 400.0, 460.0, 460.0),
        ]);
        assert_ne!(out.tracks[0].track_id, out.tracks[1].track_id);
    }

    #[test]
    fn lost_track_is_retired_after_coast_window() {
        let mut tracker = GreedyTracker::new(0.2, 2);
        let first = tracker.update(vec![det(10.0, 10.0, 40.0, 40.0)]);
        let id = first.tracks[0].track_id;

        let mut retired = Vec::new();
        for _ in 0..4 {
            retired.extend(tracker.update(Vec::new()).retired);
        }
        assert_eq!(retired, vec![id]);
    }
}
