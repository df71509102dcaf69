//! Pipeline configuration: restart-required fields plus the live-updatable
//! sub-record, with the tracking/speed-estimation invariant enforced at
//! every mutation point.

use serde::{Deserialize, Serialize};

/// Default frames-per-second assumed for camera sources and unprobeable
/// files.
pub const DEFAULT_FPS: f64 = 30.0;

/// Full per-run configuration. The top-level fields require a restart; the
/// flattened [`LiveConfig`] may change mid-run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub video_source: String,
    pub enable_tracking: bool,
    pub enable_speed_estimation: bool,
    pub target_labels: Vec<String>,
    #[serde(flatten)]
    pub live: LiveConfig,
}

/// Fields that may be updated while a run is active. Every postprocess
/// cycle reads one consistent snapshot of these.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LiveConfig {
    pub confidence_threshold: f32,
    /// Real-world millimeters covered by one pixel.
    pub pixel_distance_mm: f64,
    pub enable_loitering_detection: bool,
    pub loitering_threshold_secs: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            video_source: "camera".to_string(),
            enable_tracking: true,
            enable_speed_estimation: true,
            target_labels: vec!["person".to_string(), "car".to_string()],
            live: LiveConfig::default(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            pixel_distance_mm: 10.0,
            enable_loitering_detection: false,
            loitering_threshold_secs: 10.0,
        }
    }
}

impl PipelineConfig {
    /// Re-apply the config invariant: speed estimation requires tracking.
    /// Violations are corrected, not rejected.
    pub fn normalize(&mut self) {
        if self.enable_speed_estimation {
            self.enable_tracking = true;
        }
    }

    /// Calibration factor in meters per pixel.
    pub fn meters_per_pixel(&self) -> f64 {
        self.live.pixel_distance_mm / 1000.0
    }
}

impl LiveConfig {
    pub fn meters_per_pixel(&self) -> f64 {
        self.pixel_distance_mm / 1000.0
    }
}

/// Partial update accepted by the live-config endpoint. Unknown fields from
/// stale clients are ignored rather than errored so hot updates stay
/// idempotent; restart-required fields are simply not representable here.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LiveUpdate {
    pub confidence_threshold: Option<f32>,
    pub pixel_distance_mm: Option<f64>,
    pub enable_loitering_detection: Option<bool>,
    pub loitering_threshold_secs: Option<f64>,
}

impl LiveUpdate {
    pub fn apply(&self, live: &mut LiveConfig) {
        if let Some(value) = self.confidence_threshold {
            live.confidence_threshold = value.clamp(0.0, 1.0);
        }
        if let Some(value) = self.pixel_distance_mm {
            if value > 0.0 {
                live.pixel_distance_mm = value;
            }
        }
        if let Some(value) = self.enable_loitering_detection {
            live.enable_loitering_detection = value;
        }
        if let Some(value) = self.loitering_threshold_secs {
            if value > 0.0 {
                live.loitering_threshold_secs = value;
            }
        }
    }
}

/// Overrides accepted by the start endpoint, merged over the stored config
/// before the run launches.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StartRequest {
    pub video_source: Option<String>,
    pub enable_tracking: Option<bool>,
    pub enable_speed_estimation: Option<bool>,
    pub target_labels: Option<Vec<String>>,
    #[serde(flatten)]
    pub live: LiveUpdate,
}

impl StartRequest {
    pub fn merged(&self, base: &PipelineConfig) -> PipelineConfig {
        let mut config = base.clone();
        if let Some(source) = &self.video_source {
            config.video_source = source.clone();
        }
        if let Some(value) = self.enable_tracking {
            config.enable_tracking = value;
        }
        if let Some(value) = self.enable_speed_estimation {
            config.enable_speed_estimation = value;
        }
        if let Some(labels) = &self.target_labels {
            config.target_labels = labels.clone();
        }
        self.live.apply(&mut config.live);
        config.normalize();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_forces_tracking_on_for_speed_estimation() {
        let mut config = PipelineConfig {
            enable_tracking: false,
            enable_speed_estimation: true,
            ..PipelineConfig::default()
        };
        config.normalize();
        assert!(config.enable_tracking);
    }

    #[test]
    fn start_overrides_are_normalized() {
        let base = PipelineConfig::default();
        let request: StartRequest =
            serde_json::from_str(r#"{"enable_tracking": false, "confidence_threshold": 0.5}"#)
                .unwrap();
        let merged = request.merged(&base);
        // Speed estimation is still on in the base config, so tracking
        // cannot be turned off.
        assert!(merged.enable_tracking);
        assert!((merged.live.confidence_threshold - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn live_update_ignores_invalid_values() {
        let mut live = LiveConfig::default();
        LiveUpdate {
            pixel_distance_mm: Some(-4.0),
            loitering_threshold_secs: Some(0.0),
            ..LiveUpdate::default()
        }
        .apply(&mut live);
        assert!((live.pixel_distance_mm - 10.0).abs() < f64::EPSILON);
        assert!((live.loitering_threshold_secs - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn config_serializes_flat() {
        let json = serde_json::to_value(PipelineConfig::default()).unwrap();
        assert!(json.get("confidence_threshold").is_some());
        assert!(json.get("live").is_none());
    }
}
