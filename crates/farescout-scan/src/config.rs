use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use farescout_core::{DateMatrix, SearchRequest};

pub const DEFAULT_ORIGIN: &str = "LHR";
pub const DEFAULT_DESTINATION: &str = "BOM";
pub const DEFAULT_DEPARTURE_DATE: &str = "2026-02-16";
pub const DEFAULT_RETURN_DATE: &str = "2026-02-23";

/// Floor for the poll and heartbeat intervals; zero would spin.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionerKind {
    VpnGate,
    Static,
    None,
}

impl ProvisionerKind {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "static" => ProvisionerKind::Static,
            "none" | "off" => ProvisionerKind::None,
            _ => ProvisionerKind::VpnGate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBackend {
    Memory,
    Files,
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub database_url: String,
    pub output_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub provisioner: ProvisionerKind,
    pub vpngate_url: String,
    pub poll_interval: Duration,
    pub scan_timeout: Duration,
    pub provision_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    pub termination_grace: Duration,
    pub aggregate_timeout: Duration,
    pub status_backend: StatusBackend,
    pub reports_enabled: bool,
    pub scheduler_enabled: bool,
    pub scan_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str, default: &str) -> String {
        (self.lookup)(name).unwrap_or_else(|| default.to_string())
    }

    fn flag(&self, name: &str, default: bool) -> bool {
        (self.lookup)(name)
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
            .unwrap_or(default)
    }

    fn u64(&self, name: &str, default: u64) -> u64 {
        (self.lookup)(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn millis(&self, name: &str, default: u64) -> Duration {
        Duration::from_millis(self.u64(name, default))
    }

    fn secs(&self, name: &str, default: u64) -> Duration {
        Duration::from_secs(self.u64(name, default))
    }
}

impl ScanConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any `FARESCOUT_*` variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env { lookup };
        let workspace_root = PathBuf::from(env.string("FARESCOUT_WORKSPACE_ROOT", "."));
        Self {
            database_url: env.string("FARESCOUT_DATABASE_URL", "sqlite://flights.db?mode=rwc"),
            output_dir: (env.lookup)("FARESCOUT_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("output")),
            provisioner: (env.lookup)("FARESCOUT_PROVISIONER")
                .map(|v| ProvisionerKind::parse(&v))
                .unwrap_or(ProvisionerKind::VpnGate),
            vpngate_url: env.string("FARESCOUT_VPNGATE_URL", farescout_adapters::VPNGATE_DEFAULT_URL),
            poll_interval: env.millis("FARESCOUT_POLL_INTERVAL_MS", 2000).max(MIN_INTERVAL),
            scan_timeout: env.secs("FARESCOUT_SCAN_TIMEOUT_SECS", 600),
            provision_timeout: env.secs("FARESCOUT_PROVISION_TIMEOUT_SECS", 30),
            heartbeat_interval: env.millis("FARESCOUT_HEARTBEAT_MS", 1000).max(MIN_INTERVAL),
            stale_after: env.secs("FARESCOUT_STALE_AFTER_SECS", 10),
            termination_grace: env.millis("FARESCOUT_TERMINATION_GRACE_MS", 2000),
            aggregate_timeout: env.secs("FARESCOUT_AGGREGATE_TIMEOUT_SECS", 120),
            status_backend: match (env.lookup)("FARESCOUT_STATUS_BACKEND").as_deref() {
                Some("files") => StatusBackend::Files,
                _ => StatusBackend::Memory,
            },
            reports_enabled: env.flag("FARESCOUT_REPORTS", true),
            scheduler_enabled: env.flag("FARESCOUT_SCHEDULER_ENABLED", false),
            scan_cron: env.string("FARESCOUT_SCAN_CRON", "0 0 6 * * *"),
            user_agent: env.string("FARESCOUT_USER_AGENT", "farescout/0.1"),
            http_timeout_secs: env.u64("FARESCOUT_HTTP_TIMEOUT_SECS", 30),
            workspace_root,
        }
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

pub fn parse_date(value: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date {value:?}, expected YYYY-MM-DD"))
}

/// The route and dates scanned when nothing else is asked for.
pub fn default_request() -> anyhow::Result<SearchRequest> {
    let request = SearchRequest::new(
        DEFAULT_ORIGIN,
        DEFAULT_DESTINATION,
        parse_date(DEFAULT_DEPARTURE_DATE)?,
        parse_date(DEFAULT_RETURN_DATE)?,
    )?;
    Ok(request)
}

pub fn default_matrix() -> anyhow::Result<DateMatrix> {
    Ok(DateMatrix::single(&default_request()?))
}
