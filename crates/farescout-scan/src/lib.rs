//! Scan orchestration: planning, unit execution, status tracking,
//! aggregation and the run control loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use farescout_adapters::{
    FixtureScraper, FlightScraper, LocationProvisioner, StaticProvisioner, VpnGateProvisioner,
};
use farescout_storage::{FlightStore, HttpClientConfig, HttpFetcher, OutputStore, SqliteFlightStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod aggregate;
pub mod config;
pub mod exec;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod status;

pub use aggregate::{
    normalize_batch, normalize_observation, AggregationError, CurrencyTable, NormalizedBatch,
    ResultAggregator,
};
pub use config::{default_matrix, default_request, parse_date, ProvisionerKind, ScanConfig, StatusBackend};
pub use exec::{ExecutionEnvironment, LaunchError, TokioTaskEnvironment, UnitHandle, WorkerUnit};
pub use orchestrator::{EventLog, Orchestrator, OrchestratorSettings, ScanServices, StartRejection};
pub use plan::{plan, plan_matrix};
pub use report::write_reports;
pub use status::{
    FileStatusBoard, MemoryStatusBoard, StatusChannel, StatusError, StatusTracker, StatusWriter,
};

pub const CRATE_NAME: &str = "farescout-scan";

/// Picks the location provisioner named by the config.
pub async fn build_provisioner(config: &ScanConfig) -> Result<Arc<dyn LocationProvisioner>> {
    let provisioner: Arc<dyn LocationProvisioner> = match config.provisioner {
        ProvisionerKind::VpnGate => {
            let fetcher = HttpFetcher::new(HttpClientConfig {
                timeout: std::time::Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..HttpClientConfig::default()
            })?;
            Arc::new(VpnGateProvisioner::new(Arc::new(fetcher), config.vpngate_url.clone()))
        }
        ProvisionerKind::Static => Arc::new(
            StaticProvisioner::from_registry(&config.workspace_root.join("locations.yaml")).await?,
        ),
        ProvisionerKind::None => Arc::new(StaticProvisioner::empty()),
    };
    Ok(provisioner)
}

/// Everything a process needs to run scans against the configured store.
#[derive(Clone)]
pub struct ScanRuntime {
    pub config: ScanConfig,
    pub store: Arc<dyn FlightStore>,
    pub orchestrator: Orchestrator,
}

impl ScanRuntime {
    pub async fn from_config(config: ScanConfig) -> Result<Self> {
        let store: Arc<dyn FlightStore> = Arc::new(
            SqliteFlightStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening flight store {}", config.database_url))?,
        );
        let scraper: Arc<dyn FlightScraper> =
            Arc::new(FixtureScraper::for_workspace(&config.workspace_root));
        let outputs = OutputStore::new(&config.output_dir);
        let provisioner = build_provisioner(&config).await?;

        let services = ScanServices {
            provisioner,
            environment: Arc::new(TokioTaskEnvironment::new(
                scraper.clone(),
                outputs.clone(),
                config.heartbeat_interval,
            )),
            store: store.clone(),
            aggregator: ResultAggregator::new(store.clone(), outputs.clone())
                .with_default_site(scraper.source_id()),
            outputs,
        };
        let orchestrator = Orchestrator::new(services, OrchestratorSettings::from_config(&config));
        Ok(Self { config, store, orchestrator })
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(ScanConfig::from_env()).await
    }

    /// Cron-driven scans of the default route. Triggers that land while a run
    /// is active are dropped.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let matrix = default_matrix()?;
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = &self.config.scan_cron;
        let orchestrator = self.orchestrator.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let orchestrator = orchestrator.clone();
            let matrix = matrix.clone();
            Box::pin(async move {
                match orchestrator.start(matrix, None) {
                    Ok(run_id) => info!(%run_id, "scheduled scan started"),
                    Err(err) => warn!(error = %err, "scheduled scan skipped"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
