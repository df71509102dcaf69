//! Loitering detection: per-track dwell counters against a time threshold.
//!
//! The threshold is live-updatable and converted to frames with the run's
//! fixed fps on every observation, so a threshold change re-evaluates the
//! already-accumulated counter on the next frame without resetting it.

use std::collections::HashMap;

pub struct LoiteringDetector {
    fps: f64,
    dwell: HashMap<u64, u64>,
}

impl LoiteringDetector {
    pub fn new(fps: f64) -> Self {
        Self {
            fps: if fps > 0.0 { fps } else { 30.0 },
            dwell: HashMap::new(),
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Count one observed frame for the track and report whether it has
    /// dwelled past `threshold_secs`.
    pub fn observe(&mut self, track_id: u64, threshold_secs: f64) -> bool {
        let dwell = self.dwell.entry(track_id).or_insert(0);
        *dwell += 1;
        *dwell as f64 >= threshold_secs * self.fps
    }

    pub fn dwell_frames(&self, track_id: u64) -> u64 {
        self.dwell.get(&track_id).copied().unwrap_or(0)
    }

    /// Track lost: the identity is gone, so the counter goes with it.
    pub fn remove_track(&mut self, track_id: u64) {
        self.dwell.remove(&track_id);
    }

    pub fn clear(&mut self) {
        self.dwell.clear();
    }

    pub fn tracked_count(&self) -> usize {
        self.dwell.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flips_exactly_at_threshold() {
        let mut detector = LoiteringDetector::new(10.0);
        // fps=10, threshold=2s => 20 frames.
        for _ in 0..19 {
            assert!(!detector.observe(1, 2.0));
        }
        assert!(detector.observe(1, 2.0));
    }

    #[test]
    fn threshold_change_reuses_accumulated_counter() {
        let mut detector = LoiteringDetector::new(10.0);
        for _ in 0..15 {
            detector.observe(5, 2.0);
        }
        assert_eq!(detector.dwell_frames(5), 15);
        // Lowering the threshold flips the flag immediately on the next
        // observation; the counter is not reset.
        assert!(detector.observe(5, 1.0));
        assert_eq!(detector.dwell_frames(5), 16);
    }

    #[test]
    fn removal_resets_dwell() {
        let mut detector = LoiteringDetector::new(30.0);
        detector.observe(2, 10.0);
        detector.observe(2, 10.0);
        detector.remove_track(2);
        assert_eq!(detector.dwell_frames(2), 0);
        assert!(!detector.observe(2, 10.0));
        assert_eq!(detector.dwell_frames(2), 1);
    }

    #[test]
    fn non_positive_fps_falls_back_to_default() {
        let detector = LoiteringDetector::new(0.0);
        assert!((detector.fps() - 30.0).abs() < f64::EPSILON);
    }
}
