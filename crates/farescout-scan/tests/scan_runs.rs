use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use farescout_adapters::{
    observation, FailingProvisioner, LocationProvisioner, ScriptedBehavior, ScriptedScraper,
    StaticProvisioner,
};
use farescout_core::{
    DateMatrix, FailurePhase, Location, RequestError, RunPhase, WorkerSpec, WorkerState,
    BASELINE_LOCATION_ID,
};
use farescout_scan::{
    ExecutionEnvironment, LaunchError, Orchestrator, OrchestratorSettings, ResultAggregator,
    ScanServices, StartRejection, StatusBackend, StatusWriter, TokioTaskEnvironment, UnitHandle,
    WorkerUnit,
};
use farescout_storage::{
    output_target, FlightFilter, FlightStore, MemoryFlightStore, OutputStore, PageRequest,
};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Harness {
    dir: TempDir,
    store: Arc<MemoryFlightStore>,
    outputs: OutputStore,
    orchestrator: Orchestrator,
}

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn matrix() -> DateMatrix {
    DateMatrix {
        origin: "LHR".into(),
        destination: "BOM".into(),
        departure_dates: vec![d("2026-02-16")],
        return_dates: vec![d("2026-02-23")],
    }
}

fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        poll_interval: Duration::from_millis(20),
        scan_timeout: Duration::from_secs(5),
        provision_timeout: Duration::from_secs(1),
        stale_after: Duration::from_secs(5),
        termination_grace: Duration::from_millis(500),
        aggregate_timeout: Duration::from_secs(5),
        status_backend: StatusBackend::Memory,
        reports_dir: None,
    }
}

fn two_fares() -> ScriptedBehavior {
    ScriptedBehavior::Records(vec![
        observation("Air India", 498.0, "GBP", 0),
        observation("Emirates", 455.0, "GBP", 1),
    ])
}

fn locations(ids: &[&str]) -> Vec<Location> {
    ids.iter().map(|id| Location::new(*id, *id)).collect()
}

/// Units that ignore `terminate` and only stop once their scrape returns.
struct StubbornEnvironment {
    scraper: Arc<ScriptedScraper>,
    outputs: OutputStore,
}

struct StubbornHandle {
    unit_id: String,
    task: JoinHandle<()>,
}

impl UnitHandle for StubbornHandle {
    fn unit_id(&self) -> &str {
        &self.unit_id
    }

    fn terminate(&self) {}

    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

#[async_trait]
impl ExecutionEnvironment for StubbornEnvironment {
    async fn spawn(
        &self,
        spec: WorkerSpec,
        writer: StatusWriter,
        _cancel: CancellationToken,
    ) -> Result<Box<dyn UnitHandle>, LaunchError> {
        let unit_id = spec.unit_id.clone();
        let unit = WorkerUnit::new(spec, self.scraper.clone(), self.outputs.clone(), Duration::from_millis(20));
        let task = tokio::spawn(unit.run(writer, CancellationToken::new()));
        Ok(Box::new(StubbornHandle { unit_id, task }))
    }
}

/// Launches that never return.
struct StuckLauncher;

#[async_trait]
impl ExecutionEnvironment for StuckLauncher {
    async fn spawn(
        &self,
        _spec: WorkerSpec,
        _writer: StatusWriter,
        _cancel: CancellationToken,
    ) -> Result<Box<dyn UnitHandle>, LaunchError> {
        std::future::pending().await
    }
}

fn harness_on(
    provisioner: Arc<dyn LocationProvisioner>,
    environment: impl FnOnce(&OutputStore) -> Arc<dyn ExecutionEnvironment>,
    tune: impl FnOnce(&mut OrchestratorSettings, &TempDir),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryFlightStore::new());
    let outputs = OutputStore::new(dir.path().join("output"));
    let environment = environment(&outputs);
    let mut settings = fast_settings();
    tune(&mut settings, &dir);

    let services = ScanServices {
        provisioner,
        environment,
        store: store.clone(),
        outputs: outputs.clone(),
        aggregator: ResultAggregator::new(store.clone(), outputs.clone()),
    };
    Harness {
        dir,
        store,
        outputs,
        orchestrator: Orchestrator::new(services, settings),
    }
}

fn harness_with(
    provisioner: Arc<dyn LocationProvisioner>,
    scraper: ScriptedScraper,
    max_units: Option<usize>,
    tune: impl FnOnce(&mut OrchestratorSettings, &TempDir),
) -> Harness {
    harness_on(
        provisioner,
        |outputs| {
            let mut environment =
                TokioTaskEnvironment::new(Arc::new(scraper), outputs.clone(), Duration::from_millis(20));
            if let Some(limit) = max_units {
                environment = environment.with_max_units(limit);
            }
            Arc::new(environment)
        },
        tune,
    )
}

fn stubborn_harness(
    scraper: ScriptedScraper,
    tune: impl FnOnce(&mut OrchestratorSettings, &TempDir),
) -> Harness {
    harness_on(
        static_locations(&["US"]),
        |outputs| {
            Arc::new(StubbornEnvironment {
                scraper: Arc::new(scraper),
                outputs: outputs.clone(),
            })
        },
        tune,
    )
}

fn harness(provisioner: Arc<dyn LocationProvisioner>, scraper: ScriptedScraper) -> Harness {
    harness_with(provisioner, scraper, None, |_, _| {})
}

fn static_locations(ids: &[&str]) -> Arc<dyn LocationProvisioner> {
    Arc::new(StaticProvisioner::new(locations(ids)))
}

#[tokio::test]
async fn three_locations_commit_every_unit_and_page_cheapest_first() {
    let h = harness(
        static_locations(&["US", "JP", "IN"]),
        ScriptedScraper::new().with_fallback(two_fares()),
    );

    let summary = h.orchestrator.run(matrix(), None).await.unwrap();
    assert_eq!(summary.phase, RunPhase::Done);
    assert_eq!(summary.locations_used, vec![BASELINE_LOCATION_ID, "US", "JP", "IN"]);
    assert_eq!(summary.total_records, 8);
    let counts = summary.counts();
    assert_eq!(counts.completed, 4);
    assert_eq!(counts.errors, 0);
    assert!(summary.end_time.is_some());
    assert!(summary.faults.is_empty());

    let page = h
        .store
        .query(&FlightFilter::default(), PageRequest::new(1, 5))
        .await
        .unwrap();
    assert_eq!(page.records.len(), 5);
    assert_eq!(page.total, 8);
    assert_eq!(page.total_pages, 2);
    assert_eq!(page.best_price, Some(455.0));
    let prices = page
        .records
        .iter()
        .map(|r| r.reference_price.unwrap())
        .collect::<Vec<_>>();
    assert!(prices.windows(2).all(|w| w[0] <= w[1]));

    assert_eq!(h.orchestrator.phase(), RunPhase::Done);
    assert!(!h.orchestrator.is_running());
    let events = h.orchestrator.drain_events();
    assert!(events.iter().any(|line| line.contains("Scan complete")));
}

#[tokio::test]
async fn empty_provisioner_scans_baseline_only() {
    let h = harness(
        Arc::new(StaticProvisioner::empty()),
        ScriptedScraper::new().with_fallback(two_fares()),
    );
    let summary = h.orchestrator.run(matrix(), None).await.unwrap();
    assert_eq!(summary.phase, RunPhase::Done);
    assert_eq!(summary.locations_used, vec![BASELINE_LOCATION_ID]);
    assert_eq!(summary.counts().total_units, 1);
    assert_eq!(summary.total_records, 2);
}

#[tokio::test]
async fn provisioner_failure_degrades_to_baseline() {
    let h = harness(
        Arc::new(FailingProvisioner {
            reason: "directory unreachable".into(),
        }),
        ScriptedScraper::new().with_fallback(two_fares()),
    );
    let summary = h.orchestrator.run(matrix(), None).await.unwrap();
    assert_eq!(summary.phase, RunPhase::Done);
    assert_eq!(summary.locations_used, vec![BASELINE_LOCATION_ID]);
    assert_eq!(summary.total_records, 2);
    let events = h.orchestrator.drain_events();
    assert!(events.iter().any(|line| line.contains("Provisioning failed")));
}

#[tokio::test]
async fn explicit_locations_bypass_the_provisioner() {
    let h = harness(
        Arc::new(FailingProvisioner {
            reason: "should not be asked".into(),
        }),
        ScriptedScraper::new().with_fallback(two_fares()),
    );
    let summary = h
        .orchestrator
        .run(matrix(), Some(locations(&["JP", "JP"])))
        .await
        .unwrap();
    assert_eq!(summary.locations_used, vec![BASELINE_LOCATION_ID, "JP"]);
    assert_eq!(summary.total_records, 4);
}

#[tokio::test]
async fn unit_failures_are_isolated() {
    let h = harness(
        static_locations(&["US", "JP", "IN"]),
        ScriptedScraper::new()
            .with_fallback(two_fares())
            .on("JP", ScriptedBehavior::FailScrape("captcha wall".into()))
            .on("IN", ScriptedBehavior::FailConnect("tunnel refused".into())),
    );

    let summary = h.orchestrator.run(matrix(), None).await.unwrap();
    assert_eq!(summary.phase, RunPhase::Done);
    let counts = summary.counts();
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.errors, 2);
    assert_eq!(summary.total_records, 4);

    assert_eq!(summary.units["JP"].error_phase, Some(FailurePhase::Scrape));
    assert_eq!(summary.units["IN"].error_phase, Some(FailurePhase::Connect));
    let mut faulted = summary
        .faults
        .iter()
        .map(|f| f.unit_id.as_str())
        .collect::<Vec<_>>();
    faulted.sort();
    assert_eq!(faulted, vec!["IN", "JP"]);
    assert!(!summary.commits.contains_key("JP"));
}

#[tokio::test]
async fn timeout_with_nothing_finished_fails_the_run() {
    let h = harness_with(
        static_locations(&["US", "JP"]),
        ScriptedScraper::new().with_fallback(ScriptedBehavior::Hang),
        None,
        |settings, _| settings.scan_timeout = Duration::from_millis(300),
    );

    let summary = h.orchestrator.run(matrix(), None).await.unwrap();
    assert_eq!(summary.phase, RunPhase::Failed);
    assert!(summary.timed_out);
    assert!(summary.failure.is_some());
    assert_eq!(summary.units.len(), 3);
    for unit in summary.units.values() {
        assert_eq!(unit.state, WorkerState::Error);
        assert_eq!(unit.error_phase, Some(FailurePhase::Timeout));
    }
    assert!(h.store.is_empty().await);
    assert!(!h.orchestrator.is_running());
}

#[tokio::test]
async fn timeout_keeps_units_that_finished() {
    let h = harness_with(
        static_locations(&["US"]),
        ScriptedScraper::new()
            .with_fallback(ScriptedBehavior::Hang)
            .on(BASELINE_LOCATION_ID, two_fares()),
        None,
        |settings, _| settings.scan_timeout = Duration::from_millis(300),
    );

    let summary = h.orchestrator.run(matrix(), None).await.unwrap();
    assert_eq!(summary.phase, RunPhase::Done);
    assert!(summary.timed_out);
    assert_eq!(summary.total_records, 2);
    assert_eq!(summary.units[BASELINE_LOCATION_ID].state, WorkerState::Complete);
    assert_eq!(summary.units["US"].error_phase, Some(FailurePhase::Timeout));
}

#[tokio::test]
async fn stop_terminates_units_and_keeps_committed_work() {
    let h = harness(
        static_locations(&["US", "JP"]),
        ScriptedScraper::new()
            .with_fallback(ScriptedBehavior::Hang)
            .on(BASELINE_LOCATION_ID, two_fares()),
    );

    let run_id = h.orchestrator.start(matrix(), None).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.orchestrator.is_running());
    assert!(h.orchestrator.stop());

    let summary = h.orchestrator.wait_for(run_id).await.unwrap();
    assert_eq!(summary.phase, RunPhase::Done);
    assert!(summary.cancelled);
    assert_eq!(summary.total_records, 2);
    assert_eq!(summary.units["US"].error_phase, Some(FailurePhase::Cancelled));
    assert_eq!(summary.units["JP"].error_phase, Some(FailurePhase::Cancelled));
    assert!(!h.orchestrator.stop());
}

#[tokio::test]
async fn second_start_is_rejected_until_the_run_ends() {
    let h = harness(
        static_locations(&["US"]),
        ScriptedScraper::new().with_fallback(ScriptedBehavior::Hang),
    );

    let first = h.orchestrator.start(matrix(), None).unwrap();
    assert_eq!(
        h.orchestrator.start(matrix(), None),
        Err(StartRejection::AlreadyRunning)
    );
    let status = h.orchestrator.status().unwrap();
    assert_eq!(status.run_id, first);
    assert!(status.phase.is_active());

    h.orchestrator.stop();
    h.orchestrator.wait_for(first).await.unwrap();

    let second = h.orchestrator.start(matrix(), None).unwrap();
    assert_ne!(first, second);
    h.orchestrator.stop();
    let summary = h.orchestrator.wait_for(second).await.unwrap();
    assert!(summary.cancelled);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_anything_runs() {
    let h = harness(
        static_locations(&["US"]),
        ScriptedScraper::new().with_fallback(two_fares()),
    );
    let mut same = matrix();
    same.destination = "lhr".into();
    assert_eq!(
        h.orchestrator.start(same, None),
        Err(StartRejection::InvalidRequest(RequestError::SameAirport(
            "LHR".into()
        )))
    );
    assert_eq!(h.orchestrator.phase(), RunPhase::Idle);
    assert!(h.orchestrator.status().is_none());
}

#[tokio::test]
async fn date_matrix_runs_a_unit_per_location_and_pair() {
    let h = harness(
        static_locations(&["US"]),
        ScriptedScraper::new().with_fallback(two_fares()),
    );
    let mut dates = matrix();
    dates.departure_dates.push(d("2026-02-17"));

    let summary = h.orchestrator.run(dates, None).await.unwrap();
    assert_eq!(summary.requests.len(), 2);
    assert_eq!(summary.units.len(), 4);
    assert!(summary.units.contains_key("US@2026-02-17_2026-02-23"));
    assert_eq!(summary.total_records, 8);
    assert_eq!(summary.locations_used, vec![BASELINE_LOCATION_ID, "US"]);

    let records = h.store.run_records(summary.run_id).await.unwrap();
    assert_eq!(
        records
            .iter()
            .filter(|r| r.departure_date == d("2026-02-17"))
            .count(),
        4
    );
}

#[tokio::test]
async fn launch_rejections_become_unit_faults() {
    let h = harness_with(
        static_locations(&["US", "JP"]),
        ScriptedScraper::new().with_fallback(ScriptedBehavior::Delayed(
            Duration::from_millis(200),
            vec![observation("Vistara", 470.0, "GBP", 0)],
        )),
        Some(2),
        |_, _| {},
    );

    let summary = h.orchestrator.run(matrix(), None).await.unwrap();
    assert_eq!(summary.phase, RunPhase::Done);
    assert_eq!(summary.units["JP"].error_phase, Some(FailurePhase::Launch));
    assert_eq!(summary.total_records, 2);
    assert!(summary
        .faults
        .iter()
        .any(|f| f.unit_id == "JP" && f.phase == FailurePhase::Launch));
}

#[tokio::test]
async fn file_status_backend_drives_a_full_run() {
    let h = harness_with(
        static_locations(&["US"]),
        ScriptedScraper::new().with_fallback(two_fares()),
        None,
        |settings, _| settings.status_backend = StatusBackend::Files,
    );

    let summary = h.orchestrator.run(matrix(), None).await.unwrap();
    assert_eq!(summary.phase, RunPhase::Done);
    assert_eq!(summary.total_records, 4);
    let status_dir = h.outputs.run_dir(summary.run_id).join("status");
    let files = std::fs::read_dir(status_dir).unwrap().count();
    assert_eq!(files, 2);
}

#[tokio::test]
async fn finished_runs_are_recorded_with_reports() {
    let h = harness_with(
        static_locations(&["US"]),
        ScriptedScraper::new().with_fallback(two_fares()),
        None,
        |settings, dir| settings.reports_dir = Some(dir.path().join("reports")),
    );

    let summary = h.orchestrator.run(matrix(), None).await.unwrap();
    let runs = h.store.recent_runs(5).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, summary.run_id);
    assert_eq!(runs[0].phase, RunPhase::Done);

    let report_dir = h.dir.path().join("reports").join(summary.run_id.to_string());
    assert!(report_dir.join("run_summary.json").exists());
    assert!(report_dir.join("scan_brief.md").exists());
    assert!(report_dir.join("snapshots").join("manifest.json").exists());
}

#[tokio::test]
async fn timeout_leaves_polling_within_one_poll_interval() {
    let h = stubborn_harness(ScriptedScraper::new().with_fallback(ScriptedBehavior::Hang), |settings, _| {
        settings.scan_timeout = Duration::from_millis(300);
        settings.termination_grace = Duration::from_secs(2);
    });

    let started = Instant::now();
    let run_id = h.orchestrator.start(matrix(), None).unwrap();
    while matches!(
        h.orchestrator.phase(),
        RunPhase::Provisioning | RunPhase::Planning | RunPhase::Launching | RunPhase::Polling
    ) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let left_polling = started.elapsed();
    assert!(
        left_polling < Duration::from_millis(300 + 20 + 200),
        "left polling after {left_polling:?}"
    );
    assert_eq!(h.orchestrator.phase(), RunPhase::Failed);
    let live = h.orchestrator.status().unwrap();
    assert!(live
        .units
        .values()
        .all(|u| u.error_phase == Some(FailurePhase::Timeout)));

    let summary = h.orchestrator.wait_for(run_id).await.unwrap();
    assert_eq!(summary.phase, RunPhase::Failed);
    assert!(summary.timed_out);
}

#[tokio::test]
async fn units_finishing_after_the_ceiling_stay_timed_out() {
    let h = stubborn_harness(
        ScriptedScraper::new()
            .on(BASELINE_LOCATION_ID, two_fares())
            .on(
                "US",
                ScriptedBehavior::Delayed(
                    Duration::from_millis(450),
                    vec![observation("United", 401.0, "GBP", 0)],
                ),
            ),
        |settings, _| {
            settings.scan_timeout = Duration::from_millis(300);
            settings.termination_grace = Duration::from_secs(1);
        },
    );

    let summary = h.orchestrator.run(matrix(), None).await.unwrap();
    assert_eq!(summary.phase, RunPhase::Done);
    assert!(summary.timed_out);
    assert_eq!(summary.units["US"].state, WorkerState::Error);
    assert_eq!(summary.units["US"].error_phase, Some(FailurePhase::Timeout));
    assert_eq!(summary.total_records, 2);
    assert!(!summary.commits.contains_key("US"));

    // The late unit did finish and write its output, but none of it counts.
    assert!(h
        .outputs
        .read_output(&output_target(summary.run_id, "US"))
        .await
        .is_ok());
    let records = h.store.run_records(summary.run_id).await.unwrap();
    assert!(records.iter().all(|r| r.location_id == BASELINE_LOCATION_ID));
}

#[tokio::test]
async fn hung_launches_are_bounded_by_the_scan_timeout() {
    let h = harness_on(
        static_locations(&["US", "JP"]),
        |_| Arc::new(StuckLauncher),
        |settings, _| settings.scan_timeout = Duration::from_millis(300),
    );

    let summary = tokio::time::timeout(Duration::from_secs(3), h.orchestrator.run(matrix(), None))
        .await
        .expect("run ends despite stuck launches")
        .unwrap();
    assert_eq!(summary.phase, RunPhase::Failed);
    assert_eq!(summary.failure.as_deref(), Some("no scanner could be launched"));
    assert_eq!(summary.units.len(), 3);
    for unit in summary.units.values() {
        assert_eq!(unit.state, WorkerState::Error);
        assert_eq!(unit.error_phase, Some(FailurePhase::Launch));
    }
    assert_eq!(summary.faults.len(), 3);
    assert!(!h.orchestrator.is_running());
}

#[tokio::test]
async fn look_alike_location_ids_keep_their_own_records() {
    let h = harness(
        static_locations(&[]),
        ScriptedScraper::new()
            .with_fallback(ScriptedBehavior::Records(Vec::new()))
            .on("a/b", ScriptedBehavior::Records(vec![observation("AAA", 300.0, "GBP", 0)]))
            .on(
                "a_b",
                ScriptedBehavior::Records(vec![
                    observation("BBB", 310.0, "GBP", 0),
                    observation("BBB", 320.0, "GBP", 1),
                ]),
            ),
    );

    let summary = h
        .orchestrator
        .run(matrix(), Some(locations(&["a/b", "a_b"])))
        .await
        .unwrap();
    assert_eq!(summary.phase, RunPhase::Done);
    assert_eq!(summary.total_records, 3);

    let records = h.store.run_records(summary.run_id).await.unwrap();
    let airlines_at = |location: &str| {
        let mut airlines = records
            .iter()
            .filter(|r| r.location_id == location)
            .map(|r| r.airline.clone())
            .collect::<Vec<_>>();
        airlines.sort();
        airlines
    };
    assert_eq!(airlines_at("a/b"), vec!["AAA"]);
    assert_eq!(airlines_at("a_b"), vec!["BBB", "BBB"]);
}
