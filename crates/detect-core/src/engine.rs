//! Asynchronous inference contract.
//!
//! Engines accept a preprocessed tensor batch together with a completion
//! callback. The callback fires exactly once per submitted batch, from an
//! engine-owned thread, in no guaranteed order relative to other in-flight
//! batches. Callers pair inputs with outputs themselves (the pipeline keeps
//! the source frames alongside the submission).

use std::{collections::VecDeque, thread};

use crossbeam_channel::{Sender, unbounded};
use thiserror::Error;
use tracing::debug;

use crate::types::{DetectionBatch, Tensor};

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference engine is closed")]
    Closed,
    #[error("inference failed: {0}")]
    Failed(String),
}

/// Completion callback; receives per-frame detection batches or the error
/// for the whole submitted batch.
pub type Completion = Box<dyn FnOnce(Result<Vec<DetectionBatch>, InferenceError>) + Send>;

pub trait InferenceEngine: Send {
    /// Queue a batch for asynchronous execution.
    fn submit(&mut self, batch: Vec<Tensor>, on_complete: Completion)
    -> Result<(), InferenceError>;

    /// Release the engine's resources. Pending completions still fire.
    fn close(&mut self);

    fn name(&self) -> &'static str;
}

enum Job {
    Run(Vec<Tensor>, Completion),
}

/// Worker thread shared by the built-in engines: drains submissions and
/// invokes completions off the caller's thread.
struct EngineWorker {
    tx: Option<Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EngineWorker {
    fn spawn<F>(name: &str, mut run: F) -> Self
    where
        F: FnMut(Vec<Tensor>) -> Result<Vec<DetectionBatch>, InferenceError> + Send + 'static,
    {
        let (tx, rx) = unbounded::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for Job::Run(batch, on_complete) in rx {
                    on_complete(run(batch));
                }
            })
            .expect("failed to spawn inference worker");
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn submit(&self, batch: Vec<Tensor>, on_complete: Completion) -> Result<(), InferenceError> {
        let tx = self.tx.as_ref().ok_or(InferenceError::Closed)?;
        tx.send(Job::Run(batch, on_complete))
            .map_err(|_| InferenceError::Closed)
    }

    fn close(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Placeholder engine binding: accepts every batch and reports no
/// detections. Stands in where no accelerator runtime is available.
pub struct StubEngine {
    worker: EngineWorker,
}

impl StubEngine {
    pub fn new() -> Self {
        debug!("stub inference engine active; no detections will be produced");
        Self {
            worker: EngineWorker::spawn("inference-stub", |batch| {
                Ok(batch.iter().map(|_| DetectionBatch::default()).collect())
            }),
        }
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for StubEngine {
    fn submit(
        &mut self,
        batch: Vec<Tensor>,
        on_complete: Completion,
    ) -> Result<(), InferenceError> {
        self.worker.submit(batch, on_complete)
    }

    fn close(&mut self) {
        self.worker.close();
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

/// Engine that replays a canned script of outputs, one entry per submitted
/// frame, cycling when exhausted. Used by the demo source and by tests.
pub struct ScriptedEngine {
    worker: EngineWorker,
}

impl ScriptedEngine {
    pub fn new(script: Vec<DetectionBatch>) -> Self {
        let mut queue: VecDeque<DetectionBatch> = script.into();
        Self {
            worker: EngineWorker::spawn("inference-scripted", move |batch| {
                let mut out = Vec::with_capacity(batch.len());
                for _ in &batch {
                    let next = queue.pop_front().unwrap_or_default();
                    queue.push_back(next.clone());
                    out.push(next);
                }
                Ok(out)
            }),
        }
    }

    /// Engine whose every submission fails, for error-path tests.
    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self {
            worker: EngineWorker::spawn("inference-failing", move |_| {
                Err(InferenceError::Failed(message.clone()))
            }),
        }
    }
}

impl InferenceEngine for ScriptedEngine {
    fn submit(
        &mut self,
        batch: Vec<Tensor>,
        on_complete: Completion,
    ) -> Result<(), InferenceError> {
        self.worker.submit(batch, on_complete)
    }

    fn close(&mut self) {
        self.worker.close();
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
