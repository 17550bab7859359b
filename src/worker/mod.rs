//! Job queue, processing pipeline and worker loops

pub mod control;
pub mod pipeline;
pub mod queue;
pub mod runner;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

pub use control::{WorkerCommand, WorkerControl, WorkerHeartbeat, WorkerState};
pub use pipeline::{JobHandler, JobPipeline, ProcessOutcome};
pub use queue::{JobQueue, QueueEntry};
pub use runner::{Worker, WorkerExit, WorkerPool};

/// Process-wide switches flipped by recovery actions and read by workers
#[derive(Debug, Clone, Default)]
pub struct RuntimeFlags {
    inner: Arc<FlagState>,
}

#[derive(Debug, Default)]
struct FlagState {
    fallback_mode: AtomicBool,
    processing_halted: AtomicBool,
}

impl RuntimeFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs are read from the job store instead of the queue backend
    pub fn fallback_mode(&self) -> bool {
        self.inner.fallback_mode.load(Ordering::SeqCst)
    }

    pub fn set_fallback_mode(&self, enabled: bool) {
        let previous = self.inner.fallback_mode.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            warn!("Fallback mode {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn processing_halted(&self) -> bool {
        self.inner.processing_halted.load(Ordering::SeqCst)
    }

    pub fn set_processing_halted(&self, halted: bool) {
        let previous = self.inner.processing_halted.swap(halted, Ordering::SeqCst);
        if previous != halted {
            warn!("Processing {}", if halted { "halted" } else { "resumed" });
        }
    }
}
