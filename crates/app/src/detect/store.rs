//! Live configuration store shared between the control surface and the
//! postprocess stage.
//!
//! All access is snapshot/apply under a single mutex held only for the copy
//! or write; no caller ever holds a reference into the store across a
//! blocking operation.

use std::sync::Mutex;

use crate::detect::config::{LiveUpdate, PipelineConfig};

pub struct ConfigStore {
    inner: Mutex<PipelineConfig>,
}

impl ConfigStore {
    pub fn new(mut config: PipelineConfig) -> Self {
        config.normalize();
        Self {
            inner: Mutex::new(config),
        }
    }

    /// Lock-scoped copy; callers never see a partial update.
    pub fn snapshot(&self) -> PipelineConfig {
        self.inner.lock().expect("config store poisoned").clone()
    }

    /// Apply a live update and return the resulting config. Only
    /// live-updatable fields are touched; the invariant is re-applied.
    pub fn apply_live(&self, update: &LiveUpdate) -> PipelineConfig {
        let mut guard = self.inner.lock().expect("config store poisoned");
        update.apply(&mut guard.live);
        guard.normalize();
        guard.clone()
    }

    /// Replace the whole config (used by `start`, which owns the
    /// restart-required fields).
    pub fn replace(&self, mut config: PipelineConfig) {
        config.normalize();
        *self.inner.lock().expect("config store poisoned") = config;
    }
}
