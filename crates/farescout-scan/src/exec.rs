//! Execution environment capability and the worker unit it runs.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use farescout_adapters::{FlightScraper, ScrapeError};
use farescout_core::{FailurePhase, WorkerSpec, WorkerState};
use farescout_storage::OutputStore;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::status::{StatusError, StatusWriter};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("unit {unit_id} rejected: at most {limit} units may run at once")]
    Capacity { unit_id: String, limit: usize },
    #[error("unit {unit_id} could not start: {reason}")]
    Failed { unit_id: String, reason: String },
}

/// A launched unit, as seen by whoever launched it.
pub trait UnitHandle: Send + Sync {
    fn unit_id(&self) -> &str;

    /// Ask the unit to stop. Returns immediately.
    fn terminate(&self);

    fn is_alive(&self) -> bool;
}

/// Where worker units run: tasks, processes or containers.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    /// `cancel` fires when the run is stopped; the unit must wind down when
    /// it does.
    async fn spawn(
        &self,
        spec: WorkerSpec,
        writer: StatusWriter,
        cancel: CancellationToken,
    ) -> Result<Box<dyn UnitHandle>, LaunchError>;
}

struct UnitFailure {
    phase: FailurePhase,
    message: String,
}

impl UnitFailure {
    fn new(phase: FailurePhase, message: impl ToString) -> Self {
        Self {
            phase,
            message: message.to_string(),
        }
    }
}

fn note(result: Result<(), StatusError>, unit_id: &str) {
    if let Err(err) = result {
        warn!(unit_id, error = %err, "status write rejected");
    }
}

/// Drive `fut` to completion, republishing the writer's status every `every`.
async fn with_heartbeat<F: Future>(writer: &mut StatusWriter, every: Duration, fut: F) -> F::Output {
    tokio::pin!(fut);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            out = &mut fut => return out,
            _ = ticker.tick() => {
                let unit_id = writer.current().unit_id.clone();
                note(writer.heartbeat().await, &unit_id);
            }
        }
    }
}

/// One scrape through one location, publishing its own status.
pub struct WorkerUnit {
    spec: WorkerSpec,
    scraper: Arc<dyn FlightScraper>,
    outputs: OutputStore,
    heartbeat: Duration,
}

impl WorkerUnit {
    pub fn new(
        spec: WorkerSpec,
        scraper: Arc<dyn FlightScraper>,
        outputs: OutputStore,
        heartbeat: Duration,
    ) -> Self {
        Self {
            spec,
            scraper,
            outputs,
            heartbeat,
        }
    }

    /// Runs until the unit reaches a terminal state or `cancel` fires.
    pub async fn run(self, mut writer: StatusWriter, cancel: CancellationToken) {
        let span = info_span!(
            "worker_unit",
            run_id = %self.spec.run_id,
            unit_id = %self.spec.unit_id,
            location_id = %self.spec.location.id,
        );
        async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(UnitFailure::new(FailurePhase::Cancelled, "unit terminated")),
                result = self.execute(&mut writer) => result,
            };
            let unit_id = self.spec.unit_id.clone();
            match outcome {
                Ok(items) => {
                    info!(items, "unit complete");
                    note(writer.complete(items).await, &unit_id);
                }
                Err(failure) => {
                    warn!(phase = %failure.phase, error = %failure.message, "unit failed");
                    note(writer.fail(failure.phase, failure.message).await, &unit_id);
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, writer: &mut StatusWriter) -> Result<u64, UnitFailure> {
        let unit_id = self.spec.unit_id.as_str();
        let location = &self.spec.location;

        note(writer.advance(WorkerState::Starting).await, unit_id);
        if !location.is_baseline() {
            note(writer.advance(WorkerState::Connecting).await, unit_id);
            with_heartbeat(writer, self.heartbeat, self.scraper.connect(location))
                .await
                .map_err(|e| UnitFailure::new(FailurePhase::Connect, e))?;
        }
        note(writer.advance(WorkerState::Ready).await, unit_id);

        note(writer.advance(WorkerState::Scraping).await, unit_id);
        let observations = with_heartbeat(
            writer,
            self.heartbeat,
            self.scraper.scrape(&self.spec.request, location),
        )
        .await
        .map_err(|e| match e {
            ScrapeError::Connect { .. } => UnitFailure::new(FailurePhase::Connect, e),
            _ => UnitFailure::new(FailurePhase::Scrape, e),
        })?;
        let items = observations.len() as u64;
        debug!(items, "scrape finished");
        note(writer.found(items).await, unit_id);

        let bytes = serde_json::to_vec_pretty(&observations)
            .map_err(|e| UnitFailure::new(FailurePhase::Output, e))?;
        let stored = self
            .outputs
            .write_output(&self.spec.output_target, &bytes)
            .await
            .map_err(|e| UnitFailure::new(FailurePhase::Output, format!("{e:#}")))?;
        debug!(sha256 = %stored.content_hash, bytes = stored.byte_size, "output stored");
        Ok(items)
    }
}

struct TaskHandle {
    unit_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl UnitHandle for TaskHandle {
    fn unit_id(&self) -> &str {
        &self.unit_id
    }

    fn terminate(&self) {
        self.cancel.cancel();
    }

    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Runs each unit as a tokio task in this process.
pub struct TokioTaskEnvironment {
    scraper: Arc<dyn FlightScraper>,
    outputs: OutputStore,
    heartbeat: Duration,
    max_units: Option<usize>,
    running: Arc<AtomicUsize>,
}

impl TokioTaskEnvironment {
    pub fn new(scraper: Arc<dyn FlightScraper>, outputs: OutputStore, heartbeat: Duration) -> Self {
        Self {
            scraper,
            outputs,
            heartbeat,
            max_units: None,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Refuse launches beyond `limit` concurrently running units.
    pub fn with_max_units(mut self, limit: usize) -> Self {
        self.max_units = Some(limit);
        self
    }

    pub fn running_units(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionEnvironment for TokioTaskEnvironment {
    async fn spawn(
        &self,
        spec: WorkerSpec,
        writer: StatusWriter,
        cancel: CancellationToken,
    ) -> Result<Box<dyn UnitHandle>, LaunchError> {
        let previous = self.running.fetch_add(1, Ordering::SeqCst);
        let guard = RunningGuard(self.running.clone());
        if let Some(limit) = self.max_units {
            if previous >= limit {
                return Err(LaunchError::Capacity {
                    unit_id: spec.unit_id,
                    limit,
                });
            }
        }

        let unit_id = spec.unit_id.clone();
        let unit = WorkerUnit::new(spec, self.scraper.clone(), self.outputs.clone(), self.heartbeat);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            unit.run(writer, token).await;
        });
        Ok(Box::new(TaskHandle {
            unit_id,
            cancel,
            task,
        }))
    }
}
