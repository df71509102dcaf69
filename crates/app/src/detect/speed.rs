//! Per-track speed estimation from bounded position history.
//!
//! Each track carries two bounded histories: observed centers with
//! timestamps, and computed km/h samples used for smoothing. Bounding by
//! count keeps memory and per-frame compute flat regardless of frame rate.

use std::collections::{HashMap, VecDeque};

/// Samples kept per track for both position and speed history.
pub const HISTORY_CAPACITY: usize = 10;

/// Smoothing window for [`SpeedEstimator::smoothed_speed`].
pub const DEFAULT_SMOOTHING_WINDOW: usize = 3;

/// Displacement below this (meters) is treated as a stationary object.
const NOISE_FLOOR_M: f64 = 0.001;

const MPS_TO_KMH: f64 = 3.6;

pub struct SpeedEstimator {
    capacity: usize,
    positions: HashMap<u64, VecDeque<(f64, f64, f64)>>,
    speeds: HashMap<u64, VecDeque<f64>>,
}

impl SpeedEstimator {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            positions: HashMap::new(),
            speeds: HashMap::new(),
        }
    }

    /// Record an observed center and return the instantaneous speed in km/h.
    ///
    /// Returns `None` until two samples exist or when the elapsed time is
    /// not positive (clock skew / duplicate timestamps); in that case
    /// nothing is appended to the speed history. A displacement under the
    /// noise floor with positive elapsed time records an exact `0.0` so the
    /// smoothing window sees a stationary sample instead of a gap.
    pub fn update_position(
        &mut self,
        track_id: u64,
        center_x: f64,
        center_y: f64,
        timestamp_secs: f64,
        meters_per_pixel: f64,
    ) -> Option<f64> {
        let history = self.positions.entry(track_id).or_default();
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back((center_x, center_y, timestamp_secs));

        if history.len() < 2 {
            return None;
        }

        let prev = history[history.len() - 2];
        let curr = history[history.len() - 1];
        let elapsed = curr.2 - prev.2;
        if elapsed <= 0.0 {
            return None;
        }

        let pixel_displacement = ((curr.0 - prev.0).powi(2) + (curr.1 - prev.1).powi(2)).sqrt();
        let meters = pixel_displacement * meters_per_pixel;
        let speed_kmh = if meters > NOISE_FLOOR_M {
            (meters / elapsed) * MPS_TO_KMH
        } else {
            0.0
        };

        let speeds = self.speeds.entry(track_id).or_default();
        if speeds.len() >= self.capacity {
            speeds.pop_front();
        }
        speeds.push_back(speed_kmh);
        Some(speed_kmh)
    }

    /// Record a bounding-box observation using its center point.
    pub fn estimate(
        &mut self,
        track_id: u64,
        bbox: [f32; 4],
        timestamp_secs: f64,
        meters_per_pixel: f64,
    ) -> Option<f64> {
        let center_x = f64::from(bbox[0] + bbox[2]) / 2.0;
        let center_y = f64::from(bbox[1] + bbox[3]) / 2.0;
        self.update_position(track_id, center_x, center_y, timestamp_secs, meters_per_pixel)
    }

    /// Mean of the last `window` speed samples (fewer if the history is
    /// shorter); `None` when no speed has been recorded.
    pub fn smoothed_speed(&self, track_id: u64, window: usize) -> Option<f64> {
        let speeds = self.speeds.get(&track_id)?;
        if speeds.is_empty() || window == 0 {
            return None;
        }
        let taken = window.min(speeds.len());
        let sum: f64 = speeds.iter().rev().take(taken).sum();
        Some(sum / taken as f64)
    }

    pub fn clear_track(&mut self, track_id: u64) {
        self.positions.remove(&track_id);
        self.speeds.remove(&track_id);
    }

    pub fn clear_all(&mut self) {
        self.positions.clear();
        self.speeds.clear();
    }

    pub fn tracked_count(&self) -> usize {
        self.positions.len()
    }

    #[cfg(test)]
    fn history_lens(&self, track_id: u64) -> (usize, usize) {
        (
            self.positions.get(&track_id).map_or(0, VecDeque::len),
            self.speeds.get(&track_id).map_or(0, VecDeque::len),
        )
    }
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPP: f64 = 0.01; // 10 mm per pixel

    #[test]
    fn needs_two_samples() {
        let mut estimator = SpeedEstimator::new();
        assert_eq!(estimator.update_position(1, 0.0, 0.0, 0.0, MPP), None);
        assert!(estimator.update_position(1, 10.0, 0.0, 1.0, MPP).is_some());
    }

    #[test]
    fn computes_kmh_from_displacement() {
        let mut estimator = SpeedEstimator::new();
        estimator.update_position(1, 0.0, 0.0, 0.0, MPP);
        // 100 px over 1 s at 0.01 m/px = 1 m/s = 3.6 km/h.
        let speed = estimator.update_position(1, 100.0, 0.0, 1.0, MPP).unwrap();
        assert!((speed - 3.6).abs() < 1e-9);
    }

    #[test]
    fn stationary_object_records_zero() {
        let mut estimator = SpeedEstimator::new();
        estimator.update_position(7, 50.0, 50.0, 0.0, MPP);
        let speed = estimator.update_position(7, 50.0, 50.0, 0.5, MPP);
        assert_eq!(speed, Some(0.0));
        assert_eq!(estimator.smoothed_speed(7, 3), Some(0.0));
    }

    #[test]
    fn non_positive_elapsed_emits_nothing() {
        let mut estimator = SpeedEstimator::new();
        estimator.update_position(2, 0.0, 0.0, 1.0, MPP);
        assert_eq!(estimator.update_position(2, 30.0, 0.0, 1.0, MPP), None);
        assert_eq!(estimator.update_position(2, 30.0, 0.0, 0.5, MPP), None);
        assert_eq!(estimator.history_lens(2).1, 0);
    }

    #[test]
    fn smoothing_window_math() {
        let mut estimator = SpeedEstimator::new();
        // Produce speeds of exactly 10, 20, 30 km/h.
        let mut x = 0.0;
        for (step, kmh) in [10.0f64, 20.0, 30.0].iter().enumerate() {
            let meters_per_sec = kmh / MPS_TO_KMH;
            if step == 0 {
                estimator.update_position(3, x, 0.0, 0.0, MPP);
            }
            x += meters_per_sec / MPP;
            estimator.update_position(3, x, 0.0, (step + 1) as f64, MPP);
        }
        assert!((estimator.smoothed_speed(3, 3).unwrap() - 20.0).abs() < 1e-9);
        assert!((estimator.smoothed_speed(3, 2).unwrap() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn histories_stay_bounded() {
        let mut estimator = SpeedEstimator::new();
        for step in 0..200 {
            estimator.update_position(9, step as f64 * 5.0, 0.0, step as f64 * 0.033, MPP);
        }
        let (positions, speeds) = estimator.history_lens(9);
        assert!(positions <= HISTORY_CAPACITY);
        assert!(speeds <= HISTORY_CAPACITY);
    }

    #[test]
    fn eviction_removes_all_state() {
        let mut estimator = SpeedEstimator::new();
        estimator.update_position(4, 0.0, 0.0, 0.0, MPP);
        estimator.update_position(4, 10.0, 0.0, 1.0, MPP);
        estimator.clear_track(4);
        assert_eq!(estimator.tracked_count(), 0);
        assert_eq!(estimator.smoothed_speed(4, 3), None);
    }
}
