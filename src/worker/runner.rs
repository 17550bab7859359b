//! Worker loops and the pool that supervises them

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::control::{WorkerCommand, WorkerControl, WorkerHeartbeat, WorkerState};
use super::pipeline::{JobHandler, JobPipeline, ProcessOutcome};
use crate::config::WorkerConfig;
use crate::error::Result;

/// Why a worker loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Shutdown,
    Stopped,
    Restart,
}

pub struct Worker {
    name: String,
    queues: Vec<String>,
    pipeline: JobPipeline,
    control: WorkerControl,
    handler: Arc<dyn JobHandler>,
    poll_interval: Duration,
    jobs_processed: u64,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        queues: Vec<String>,
        pipeline: JobPipeline,
        control: WorkerControl,
        handler: Arc<dyn JobHandler>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            queues,
            pipeline,
            control,
            handler,
            poll_interval,
            jobs_processed: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed
    }

    /// Process at most one job
    pub async fn run_once(&mut self) -> Result<Option<ProcessOutcome>> {
        let outcome = self
            .pipeline
            .process_next(&self.name, &self.queues, self.handler.as_ref())
            .await?;
        if outcome.is_some() {
            self.jobs_processed += 1;
        }
        Ok(outcome)
    }

    /// Poll until shutdown or a Stop/Restart command
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerExit {
        info!("Worker {} started on {:?}", self.name, self.queues);
        let exit = loop {
            if *shutdown.borrow() {
                break WorkerExit::Shutdown;
            }

            match self.control.next_command(&self.name).await {
                Ok(Some(WorkerCommand::Stop)) => break WorkerExit::Stopped,
                Ok(Some(WorkerCommand::Restart)) => break WorkerExit::Restart,
                Ok(Some(WorkerCommand::Scale { .. })) => {
                    debug!("Worker {} ignoring scale command", self.name);
                }
                Ok(None) => {}
                Err(e) => debug!("Worker {} could not read control list: {}", self.name, e),
            }

            let halted = self.pipeline.flags().processing_halted();
            let state = if halted {
                WorkerState::Halted
            } else {
                WorkerState::Busy
            };
            self.heartbeat(state).await;

            let worked = if halted {
                false
            } else {
                match self.run_once().await {
                    Ok(outcome) => outcome.is_some(),
                    Err(e) => {
                        warn!("Worker {} poll failed: {}", self.name, e);
                        false
                    }
                }
            };

            if !worked {
                self.heartbeat(if halted { WorkerState::Halted } else { WorkerState::Idle })
                    .await;
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break WorkerExit::Shutdown;
                        }
                    }
                }
            }
        };

        self.heartbeat(WorkerState::Stopping).await;
        self.control.remove_heartbeat(&self.name).await;
        info!(
            "Worker {} exiting ({:?}) after {} jobs",
            self.name, exit, self.jobs_processed
        );
        exit
    }

    async fn heartbeat(&self, state: WorkerState) {
        self.control
            .publish_heartbeat(&WorkerHeartbeat {
                name: self.name.clone(),
                queues: self.queues.clone(),
                last_seen: chrono::Utc::now(),
                jobs_processed: self.jobs_processed,
                state,
            })
            .await;
    }
}

struct RunningWorker {
    name: String,
    stop: watch::Sender<bool>,
    handle: JoinHandle<WorkerExit>,
}

/// Spawns workers, restarts them on request and applies scale commands
pub struct WorkerPool {
    config: WorkerConfig,
    pipeline: JobPipeline,
    control: WorkerControl,
    handler: Arc<dyn JobHandler>,
    prefix: String,
    next_id: u32,
    workers: Vec<RunningWorker>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        pipeline: JobPipeline,
        control: WorkerControl,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        let prefix = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "worker".to_string());
        Self {
            config,
            pipeline,
            control,
            handler,
            prefix,
            next_id: 0,
            workers: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.name.clone()).collect()
    }

    /// Grow or shrink to `target`, capped at the configured maximum
    pub fn scale_to(&mut self, target: u32) -> u32 {
        let target = target.min(self.config.max_workers) as usize;
        while self.workers.len() < target {
            self.next_id += 1;
            let name = format!("{}-{}", self.prefix, self.next_id);
            self.spawn(name);
        }
        while self.workers.len() > target {
            if let Some(worker) = self.workers.pop() {
                debug!("Stopping worker {} to scale down", worker.name);
                let _ = worker.stop.send(true);
            }
        }
        info!("Worker pool scaled to {}", target);
        target as u32
    }

    fn spawn(&mut self, name: String) {
        let (stop, rx) = watch::channel(false);
        let worker = Worker::new(
            name.clone(),
            self.config.queues.clone(),
            self.pipeline.clone(),
            self.control.clone(),
            Arc::clone(&self.handler),
            self.config.poll_interval,
        );
        let handle = tokio::spawn(worker.run(rx));
        self.workers.push(RunningWorker { name, stop, handle });
    }

    /// Reap finished workers, restarting those that asked for it, then apply
    /// any pending scale command
    pub async fn supervise_once(&mut self) {
        let mut index = 0;
        while index < self.workers.len() {
            if !self.workers[index].handle.is_finished() {
                index += 1;
                continue;
            }
            let finished = self.workers.swap_remove(index);
            match finished.handle.await {
                Ok(WorkerExit::Restart) => {
                    info!("Restarting worker {}", finished.name);
                    self.spawn(finished.name);
                }
                Ok(exit) => debug!("Worker {} finished ({:?})", finished.name, exit),
                Err(e) => warn!("Worker {} panicked: {}", finished.name, e),
            }
        }

        match self.control.next_supervisor_command().await {
            Ok(Some(WorkerCommand::Scale { target })) => {
                self.scale_to(target);
            }
            Ok(Some(other)) => debug!("Supervisor ignoring {:?}", other),
            Ok(None) => {}
            Err(e) => debug!("Supervisor could not read control list: {}", e),
        }
    }

    /// Supervise until shutdown, then stop every worker and wait for it
    pub async fn run(mut self, initial: u32, mut shutdown: watch::Receiver<bool>) {
        self.scale_to(initial);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.supervise_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    pub async fn shutdown(&mut self) {
        for worker in &self.workers {
            let _ = worker.stop.send(true);
        }
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.handle.await {
                warn!("Worker {} panicked during shutdown: {}", worker.name, e);
            }
        }
        info!("Worker pool stopped");
    }
}
