//! The control loop: provision -> plan -> launch -> poll -> aggregate.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use farescout_adapters::{best_per_egress, LocationProvisioner};
use farescout_core::{
    DateMatrix, FailurePhase, Location, RequestError, RunPhase, RunSummary, SearchRequest,
    WorkerSpec, WorkerState, WorkerStatus,
};
use farescout_storage::{FlightStore, OutputStore};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::ResultAggregator;
use crate::config::{ScanConfig, StatusBackend, MIN_INTERVAL};
use crate::exec::{ExecutionEnvironment, LaunchError, UnitHandle};
use crate::plan::plan_matrix;
use crate::report::write_reports;
use crate::status::{FileStatusBoard, MemoryStatusBoard, StatusChannel, StatusTracker, StatusWriter};

pub const EVENT_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub scan_timeout: Duration,
    pub provision_timeout: Duration,
    pub stale_after: Duration,
    /// How long stopped units get to exit. Runs alongside aggregation.
    pub termination_grace: Duration,
    pub aggregate_timeout: Duration,
    pub status_backend: StatusBackend,
    /// `None` disables per-run reports.
    pub reports_dir: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            scan_timeout: Duration::from_secs(600),
            provision_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(10),
            termination_grace: Duration::from_secs(2),
            aggregate_timeout: Duration::from_secs(120),
            status_backend: StatusBackend::Memory,
            reports_dir: None,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            scan_timeout: config.scan_timeout,
            provision_timeout: config.provision_timeout,
            stale_after: config.stale_after,
            termination_grace: config.termination_grace,
            aggregate_timeout: config.aggregate_timeout,
            status_backend: config.status_backend,
            reports_dir: config.reports_enabled.then(|| config.reports_dir()),
        }
    }
}

/// Collaborators the control loop drives.
#[derive(Clone)]
pub struct ScanServices {
    pub provisioner: Arc<dyn LocationProvisioner>,
    pub environment: Arc<dyn ExecutionEnvironment>,
    pub store: Arc<dyn FlightStore>,
    pub outputs: OutputStore,
    pub aggregator: ResultAggregator,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartRejection {
    #[error("Scan already running")]
    AlreadyRunning,
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
}

/// Bounded buffer of control-loop log lines, drained by readers.
#[derive(Debug)]
pub struct EventLog {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    fn guard(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, message: impl AsRef<str>) {
        let line = format!("[{}] {}", Utc::now().format("%H:%M:%S"), message.as_ref());
        let mut lines = self.guard();
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn drain(&self) -> Vec<String> {
        self.guard().drain(..).collect()
    }
}

struct Control {
    run_id: Option<Uuid>,
    phase: RunPhase,
    summary: Option<RunSummary>,
    cancel: Option<CancellationToken>,
}

struct Inner {
    services: ScanServices,
    settings: OrchestratorSettings,
    control: Mutex<Control>,
    events: EventLog,
    finished: watch::Sender<Option<RunSummary>>,
}

enum PollEnd {
    Complete,
    TimedOut,
    Cancelled,
}

/// Owns at most one active run. Cheap to clone; clones share the run.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(services: ScanServices, settings: OrchestratorSettings) -> Self {
        let (finished, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                services,
                settings,
                control: Mutex::new(Control {
                    run_id: None,
                    phase: RunPhase::Idle,
                    summary: None,
                    cancel: None,
                }),
                events: EventLog::new(EVENT_LOG_CAPACITY),
                finished,
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn FlightStore> {
        self.inner.services.store.clone()
    }

    /// Accept a run of `matrix` unless one is already active. An explicit
    /// location list replaces provisioning.
    pub fn start(
        &self,
        matrix: DateMatrix,
        locations: Option<Vec<Location>>,
    ) -> Result<Uuid, StartRejection> {
        let mut control = self.inner.control();
        if control.phase.is_active() {
            return Err(StartRejection::AlreadyRunning);
        }
        let requests = matrix.requests()?;

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let mut summary = RunSummary::new(run_id, requests.clone(), Utc::now());
        summary.phase = RunPhase::Provisioning;
        control.run_id = Some(run_id);
        control.phase = RunPhase::Provisioning;
        control.summary = Some(summary.clone());
        control.cancel = Some(cancel.clone());
        drop(control);

        let inner = self.inner.clone();
        tokio::spawn(
            inner
                .drive(summary, requests, locations, cancel)
                .instrument(info_span!("scan_run", %run_id)),
        );
        Ok(run_id)
    }

    /// Flag the active run to stop and signal its units. Committed records
    /// stay. Returns whether a run was active.
    pub fn stop(&self) -> bool {
        let cancel = {
            let control = self.inner.control();
            if !control.phase.is_active() {
                return false;
            }
            control.cancel.clone()
        };
        let Some(cancel) = cancel else {
            return false;
        };
        cancel.cancel();
        self.inner.log("Stop requested; terminating scanners");
        true
    }

    /// Snapshot of the current or most recent run.
    pub fn status(&self) -> Option<RunSummary> {
        self.inner.control().summary.clone()
    }

    pub fn phase(&self) -> RunPhase {
        self.inner.control().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase().is_active()
    }

    pub fn drain_events(&self) -> Vec<String> {
        self.inner.events.drain()
    }

    /// Resolves once `run_id` has reached `Done` or `Failed`.
    pub async fn wait_for(&self, run_id: Uuid) -> Option<RunSummary> {
        let mut finished = self.inner.finished.subscribe();
        let result = finished
            .wait_for(|last| last.as_ref().is_some_and(|s| s.run_id == run_id))
            .await;
        result.ok().and_then(|last| last.clone())
    }

    /// `start` followed by `wait_for`.
    pub async fn run(
        &self,
        matrix: DateMatrix,
        locations: Option<Vec<Location>>,
    ) -> anyhow::Result<RunSummary> {
        let run_id = self.start(matrix, locations)?;
        self.wait_for(run_id)
            .await
            .with_context(|| format!("run {run_id} ended without a summary"))
    }
}

impl Inner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn log(&self, message: impl AsRef<str>) {
        info!("{}", message.as_ref());
        self.events.push(message);
    }

    fn publish(&self, summary: &RunSummary) {
        let mut control = self.control();
        if control.run_id == Some(summary.run_id) {
            control.phase = summary.phase;
            control.summary = Some(summary.clone());
        }
    }

    fn enter(&self, summary: &mut RunSummary, phase: RunPhase) {
        summary.phase = phase;
        self.publish(summary);
    }

    async fn drive(
        self: Arc<Self>,
        mut summary: RunSummary,
        requests: Vec<SearchRequest>,
        explicit: Option<Vec<Location>>,
        cancel: CancellationToken,
    ) -> RunSummary {
        if let Err(err) = self.execute(&mut summary, &requests, explicit, &cancel).await {
            warn!(error = %format!("{err:#}"), "scan failed");
            self.log(format!("Scan failed: {err:#}"));
            summary.phase = RunPhase::Failed;
            summary.failure = Some(format!("{err:#}"));
        }
        summary.end_time = Some(Utc::now());
        self.persist(&summary).await;

        self.publish(&summary);
        self.finished.send_replace(Some(summary.clone()));
        summary
    }

    /// Errors are hard infrastructure failures; everything else is recorded
    /// on the summary.
    async fn execute(
        &self,
        summary: &mut RunSummary,
        requests: &[SearchRequest],
        explicit: Option<Vec<Location>>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let run_id = summary.run_id;
        self.enter(summary, RunPhase::Provisioning);
        self.log(format!(
            "Starting scan {run_id}: {} date pair(s), {}",
            requests.len(),
            requests.first().map(ToString::to_string).unwrap_or_default()
        ));

        let outputs = &self.services.outputs;
        outputs
            .prepare_run(run_id)
            .await
            .context("preparing run output directory")?;
        let channel: Arc<dyn StatusChannel> = match self.settings.status_backend {
            StatusBackend::Memory => Arc::new(MemoryStatusBoard::new()),
            StatusBackend::Files => Arc::new(
                FileStatusBoard::create(outputs.run_dir(run_id).join("status"))
                    .await
                    .context("preparing status directory")?,
            ),
        };

        let locations = match explicit {
            Some(list) => {
                let list = best_per_egress(list);
                self.log(format!("Using {} requested location(s)", list.len()));
                list
            }
            None => self.provision(cancel).await,
        };

        self.enter(summary, RunPhase::Planning);
        let specs = plan_matrix(run_id, requests, &locations);
        let mut seen = HashSet::new();
        summary.locations_used = specs
            .iter()
            .filter(|s| seen.insert(s.location_id().to_string()))
            .map(|s| s.location_id().to_string())
            .collect();
        summary.units = specs
            .iter()
            .map(|s| (s.unit_id.clone(), WorkerStatus::pending(&s.unit_id, s.location_id())))
            .collect();
        self.log(format!(
            "Will scan from {} location(s) with {} unit(s): {}",
            summary.locations_used.len(),
            specs.len(),
            summary.locations_used.join(", ")
        ));

        self.enter(summary, RunPhase::Launching);
        // The scan ceiling covers launching as well as polling.
        let started = Instant::now();
        let deadline = started + self.settings.scan_timeout;
        let (handles, forced) = self.launch(&specs, &channel, deadline, cancel).await;
        if handles.is_empty() && !cancel.is_cancelled() {
            summary.units.extend(forced);
            record_unit_faults(summary);
            summary.phase = RunPhase::Failed;
            summary.failure = Some("no scanner could be launched".to_string());
            self.log("Scan failed: no scanner could be launched");
            return Ok(());
        }

        self.enter(summary, RunPhase::Polling);
        let tracker = StatusTracker::new(channel, &specs);
        let ended = self
            .poll_until_done(summary, &tracker, &forced, started, deadline, cancel)
            .await;

        let reaper = match ended {
            PollEnd::Complete => None,
            PollEnd::TimedOut => {
                summary.timed_out = true;
                self.log("Global timeout reached; terminating remaining scanners");
                Some(self.terminate_remaining(summary, handles, FailurePhase::Timeout))
            }
            PollEnd::Cancelled => {
                summary.cancelled = true;
                Some(self.terminate_remaining(summary, handles, FailurePhase::Cancelled))
            }
        };
        record_unit_faults(summary);

        if summary.timed_out && summary.counts().completed == 0 {
            summary.phase = RunPhase::Failed;
            summary.failure = Some("global timeout reached with no completed units".to_string());
            self.publish(summary);
            self.log("Scan failed: no scanner finished before the timeout");
            wait_for_exit(reaper).await;
            return Ok(());
        }

        self.enter(summary, RunPhase::Aggregating);
        self.aggregate(summary, &specs).await;
        wait_for_exit(reaper).await;

        summary.phase = RunPhase::Done;
        let counts = summary.counts();
        self.log(format!(
            "Scan complete: {} flight(s) committed, {} of {} unit(s) complete, {} error(s)",
            summary.total_records, counts.completed, counts.total_units, counts.errors
        ));
        Ok(())
    }

    async fn provision(&self, cancel: &CancellationToken) -> Vec<Location> {
        let provisioner = &self.services.provisioner;
        let discovered = tokio::select! {
            result = tokio::time::timeout(self.settings.provision_timeout, provisioner.discover()) => result,
            _ = cancel.cancelled() => return Vec::new(),
        };
        match discovered {
            Ok(Ok(locations)) => {
                self.log(format!(
                    "Found {} location(s) via {}: {}",
                    locations.len(),
                    provisioner.name(),
                    locations.iter().map(|l| l.id.as_str()).collect::<Vec<_>>().join(", ")
                ));
                locations
            }
            Ok(Err(err)) => {
                warn!(provisioner = provisioner.name(), error = %err, "provisioning failed");
                self.log(format!("Provisioning failed ({err}); scanning baseline only"));
                Vec::new()
            }
            Err(_) => {
                warn!(provisioner = provisioner.name(), "provisioning timed out");
                self.log("Provisioning timed out; scanning baseline only");
                Vec::new()
            }
        }
    }

    /// Launch every spec in order. Each launch must finish before `deadline`;
    /// a stop abandons the launches still to come.
    async fn launch(
        &self,
        specs: &[WorkerSpec],
        channel: &Arc<dyn StatusChannel>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> (Vec<Box<dyn UnitHandle>>, BTreeMap<String, WorkerStatus>) {
        let mut handles = Vec::with_capacity(specs.len());
        let mut forced = BTreeMap::new();
        for spec in specs {
            if cancel.is_cancelled() {
                break;
            }
            let writer = StatusWriter::new(channel.clone(), spec);
            let spawn = self
                .services
                .environment
                .spawn(spec.clone(), writer, cancel.child_token());
            let launched = tokio::select! {
                result = tokio::time::timeout_at(deadline, spawn) => result,
                _ = cancel.cancelled() => break,
            };
            let result = launched.unwrap_or_else(|_| {
                Err(LaunchError::Failed {
                    unit_id: spec.unit_id.clone(),
                    reason: "launch did not finish before the scan timeout".to_string(),
                })
            });
            match result {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    warn!(unit_id = %spec.unit_id, error = %err, "launch failed");
                    self.log(format!("Could not launch {}: {err}", spec.unit_id));
                    let status = WorkerStatus::pending(&spec.unit_id, spec.location_id())
                        .forced_error(FailurePhase::Launch, err.to_string());
                    forced.insert(spec.unit_id.clone(), status);
                }
            }
        }
        (handles, forced)
    }

    /// Refresh `summary.units` from the tracker; launch failures override.
    async fn refresh(
        &self,
        summary: &mut RunSummary,
        tracker: &StatusTracker,
        forced: &BTreeMap<String, WorkerStatus>,
    ) {
        match tracker.poll().await {
            Ok(mut polled) => {
                for (unit_id, status) in forced {
                    polled.insert(unit_id.clone(), status.clone());
                }
                for (unit_id, status) in polled {
                    // Orchestrator-side overrides are final.
                    if summary.units.get(&unit_id).is_some_and(|s| s.is_terminal() && !status.is_terminal()) {
                        continue;
                    }
                    summary.units.insert(unit_id, status);
                }
            }
            Err(err) => warn!(error = %err, "status poll failed"),
        }
        self.publish(summary);
    }

    async fn poll_until_done(
        &self,
        summary: &mut RunSummary,
        tracker: &StatusTracker,
        forced: &BTreeMap<String, WorkerStatus>,
        started: Instant,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> PollEnd {
        let mut reported_stale = HashSet::new();
        let mut last_progress = None;

        loop {
            self.refresh(summary, tracker, forced).await;
            let counts = summary.counts();
            if last_progress != Some((counts.completed + counts.errors, counts.total_items_found)) {
                last_progress = Some((counts.completed + counts.errors, counts.total_items_found));
                self.log(format!(
                    "Progress: {}/{} scanners finished, {} flights found",
                    counts.completed + counts.errors,
                    counts.total_units,
                    counts.total_items_found
                ));
            }
            if counts.is_run_complete() {
                return PollEnd::Complete;
            }
            if cancel.is_cancelled() {
                return PollEnd::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return PollEnd::TimedOut;
            }

            if now.duration_since(started) >= self.settings.stale_after {
                for unit_id in StatusTracker::stale_units(&summary.units, Utc::now(), self.settings.stale_after) {
                    if reported_stale.insert(unit_id.clone()) {
                        warn!(unit_id = %unit_id, "unit has stopped reporting; suspected hang");
                        self.log(format!("{unit_id} has not reported recently; suspected hang"));
                    }
                }
            }

            let nap = self.settings.poll_interval.max(MIN_INTERVAL).min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Record every unit not yet terminal as failed with `phase` and signal
    /// it to stop. The returned task waits out the termination grace.
    fn terminate_remaining(
        &self,
        summary: &mut RunSummary,
        handles: Vec<Box<dyn UnitHandle>>,
        phase: FailurePhase,
    ) -> JoinHandle<()> {
        let message = match phase {
            FailurePhase::Timeout => "terminated after the global scan timeout",
            _ => "terminated because the scan was stopped",
        };
        let mut remaining = HashSet::new();
        for status in summary.units.values_mut().filter(|s| !s.is_terminal()) {
            remaining.insert(status.unit_id.clone());
            *status = status.forced_error(phase, message);
        }
        self.publish(summary);

        for handle in handles.iter().filter(|h| remaining.contains(h.unit_id())) {
            handle.terminate();
        }
        let grace = self.settings.termination_grace;
        tokio::spawn(
            async move {
                let grace_deadline = Instant::now() + grace;
                while handles.iter().any(|h| h.is_alive()) && Instant::now() < grace_deadline {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                for handle in handles.iter().filter(|h| h.is_alive()) {
                    warn!(unit_id = handle.unit_id(), "unit still running after termination grace");
                }
            }
            .in_current_span(),
        )
    }

    async fn aggregate(&self, summary: &mut RunSummary, specs: &[WorkerSpec]) {
        let deadline = Instant::now() + self.settings.aggregate_timeout;
        let mut pending = BTreeMap::new();
        let mut joins = JoinSet::new();
        for spec in specs {
            let complete = summary
                .units
                .get(&spec.unit_id)
                .is_some_and(|s| s.state == WorkerState::Complete);
            if !complete {
                continue;
            }
            pending.insert(spec.unit_id.clone(), spec.clone());
            let aggregator = self.services.aggregator.clone();
            let spec = spec.clone();
            joins.spawn(async move {
                let result = aggregator.aggregate(&spec).await;
                (spec, result)
            });
        }

        let mut timed_out = false;
        loop {
            let joined = match tokio::time::timeout_at(deadline, joins.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    joins.abort_all();
                    timed_out = true;
                    break;
                }
            };
            match joined {
                Ok((spec, Ok(commit))) => {
                    pending.remove(&spec.unit_id);
                    summary.total_records += commit.committed;
                    if commit.skipped > 0 {
                        self.log(format!(
                            "{}: committed {}, skipped {} malformed record(s)",
                            spec.unit_id, commit.committed, commit.skipped
                        ));
                    }
                    summary.commits.insert(spec.unit_id.clone(), commit);
                }
                Ok((spec, Err(err))) => {
                    pending.remove(&spec.unit_id);
                    warn!(unit_id = %spec.unit_id, error = %err, "aggregation failed");
                    self.log(format!("Could not aggregate {}: {err}", spec.unit_id));
                    summary.record_fault(
                        &spec.unit_id,
                        spec.location_id(),
                        FailurePhase::Aggregate,
                        err.to_string(),
                    );
                }
                Err(err) => warn!(error = %err, "aggregation task panicked"),
            }
        }

        let message = if timed_out {
            "aggregation did not finish in time"
        } else {
            "aggregation task panicked"
        };
        for spec in pending.values() {
            warn!(unit_id = %spec.unit_id, "{message}");
            self.log(format!("Could not aggregate {}: {message}", spec.unit_id));
            summary.record_fault(&spec.unit_id, spec.location_id(), FailurePhase::Aggregate, message);
        }
        self.publish(summary);
    }

    async fn persist(&self, summary: &RunSummary) {
        if let Err(err) = self.services.store.save_run(summary).await {
            warn!(error = %err, "could not record run summary");
        }
        if summary.phase != RunPhase::Done {
            return;
        }
        let Some(reports_dir) = &self.settings.reports_dir else {
            return;
        };
        let records = match self.services.store.run_records(summary.run_id).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "could not load run records for reports");
                return;
            }
        };
        match write_reports(reports_dir, summary, &records).await {
            Ok(dir) => self.log(format!("Reports written to {}", dir.display())),
            Err(err) => warn!(error = %format!("{err:#}"), "could not write run reports"),
        }
    }
}

/// Copy every errored unit into the summary's fault list.
fn record_unit_faults(summary: &mut RunSummary) {
    let failed = summary
        .units
        .values()
        .filter(|s| s.state == WorkerState::Error)
        .cloned()
        .collect::<Vec<_>>();
    for status in failed {
        summary.record_fault(
            &status.unit_id,
            &status.location_id,
            status.error_phase.unwrap_or(FailurePhase::Scrape),
            status.error_message.unwrap_or_default(),
        );
    }
}

async fn wait_for_exit(reaper: Option<JoinHandle<()>>) {
    if let Some(reaper) = reaper {
        if let Err(err) = reaper.await {
            warn!(error = %err, "termination watcher failed");
        }
    }
}
