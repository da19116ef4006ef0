//! Collaborator boundaries: flight scrapers and location provisioners.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine as _;
use farescout_core::{Location, RawObservation, SearchRequest};
use farescout_storage::{FetchError, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "farescout-adapters";

pub const VPNGATE_DEFAULT_URL: &str = "https://www.vpngate.net/api/iphone/";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("could not bring up egress for {location}: {message}")]
    Connect { location: String, message: String },
    #[error("scrape failed: {0}")]
    Site(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Opaque flight search collaborator. Potentially slow, potentially failing.
#[async_trait]
pub trait FlightScraper: Send + Sync {
    fn source_id(&self) -> &str;

    /// Bring up the egress for `location`. Not called for the baseline.
    async fn connect(&self, _location: &Location) -> Result<(), ScrapeError> {
        Ok(())
    }

    async fn scrape(
        &self,
        request: &SearchRequest,
        location: &Location,
    ) -> Result<Vec<RawObservation>, ScrapeError>;
}

async fn read_json_file<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves canned observations from `{root}/{location_id}.json`, falling back
/// to `{root}/default.json`. A location with neither file yields no results.
#[derive(Debug, Clone)]
pub struct FixtureScraper {
    root: PathBuf,
    source_id: String,
}

impl FixtureScraper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            source_id: "fixture".to_string(),
        }
    }

    /// `{workspace_root}/fixtures/flights`.
    pub fn for_workspace(workspace_root: &Path) -> Self {
        Self::new(workspace_root.join("fixtures").join("flights"))
    }

    fn candidates(&self, location: &Location) -> [PathBuf; 2] {
        [
            self.root.join(format!("{}.json", location.id)),
            self.root.join("default.json"),
        ]
    }
}

#[async_trait]
impl FlightScraper for FixtureScraper {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn scrape(
        &self,
        request: &SearchRequest,
        location: &Location,
    ) -> Result<Vec<RawObservation>, ScrapeError> {
        for path in self.candidates(location) {
            let exists = fs::try_exists(&path)
                .await
                .with_context(|| format!("checking fixture {}", path.display()))?;
            if exists {
                let observations: Vec<RawObservation> = read_json_file(&path).await?;
                debug!(
                    location_id = %location.id,
                    request = %request,
                    fixture = %path.display(),
                    count = observations.len(),
                    "served fixture observations"
                );
                return Ok(observations);
            }
        }
        Ok(Vec::new())
    }
}

/// What a [`ScriptedScraper`] does for one location.
#[derive(Debug, Clone)]
pub enum ScriptedBehavior {
    Records(Vec<RawObservation>),
    /// Return the records after sleeping.
    Delayed(Duration, Vec<RawObservation>),
    FailConnect(String),
    FailScrape(String),
    /// Never returns.
    Hang,
}

/// Deterministic stand-in for a live scraper.
#[derive(Debug, Clone)]
pub struct ScriptedScraper {
    behaviors: HashMap<String, ScriptedBehavior>,
    fallback: ScriptedBehavior,
}

impl Default for ScriptedScraper {
    fn default() -> Self {
        Self {
            behaviors: HashMap::new(),
            fallback: ScriptedBehavior::Records(Vec::new()),
        }
    }
}

impl ScriptedScraper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, behavior: ScriptedBehavior) -> Self {
        self.fallback = behavior;
        self
    }

    pub fn on(mut self, location_id: impl Into<String>, behavior: ScriptedBehavior) -> Self {
        self.behaviors.insert(location_id.into(), behavior);
        self
    }

    fn behavior_for(&self, location: &Location) -> &ScriptedBehavior {
        self.behaviors.get(&location.id).unwrap_or(&self.fallback)
    }
}

/// A minimal well-formed observation, handy when scripting scrapers.
pub fn observation(airline: &str, price: f64, currency: &str, stops: i64) -> RawObservation {
    RawObservation {
        airline: Some(airline.to_string()),
        price: Some(price),
        currency: Some(currency.to_string()),
        stops: Some(stops),
        duration_minutes: Some(540 + stops * 120),
        site: Some("scripted".to_string()),
        booking_url: None,
        ..RawObservation::default()
    }
}

#[async_trait]
impl FlightScraper for ScriptedScraper {
    fn source_id(&self) -> &str {
        "scripted"
    }

    async fn connect(&self, location: &Location) -> Result<(), ScrapeError> {
        match self.behavior_for(location) {
            ScriptedBehavior::FailConnect(message) => Err(ScrapeError::Connect {
                location: location.id.clone(),
                message: message.clone(),
            }),
            _ => Ok(()),
        }
    }

    async fn scrape(
        &self,
        _request: &SearchRequest,
        location: &Location,
    ) -> Result<Vec<RawObservation>, ScrapeError> {
        match self.behavior_for(location) {
            ScriptedBehavior::Records(records) => Ok(records.clone()),
            ScriptedBehavior::Delayed(delay, records) => {
                tokio::time::sleep(*delay).await;
                Ok(records.clone())
            }
            ScriptedBehavior::FailScrape(message) => Err(ScrapeError::Site(message.clone())),
            ScriptedBehavior::FailConnect(_) => Ok(Vec::new()),
            ScriptedBehavior::Hang => std::future::pending().await,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("fetching endpoint list: {0}")]
    Fetch(#[from] FetchError),
    #[error("parsing endpoint list: {0}")]
    Parse(String),
    #[error(transparent)]
    Registry(#[from] anyhow::Error),
}

/// Discovers the egress identities a run can fan out to.
#[async_trait]
pub trait LocationProvisioner: Send + Sync {
    fn name(&self) -> &str;

    /// Deduplicated by egress identity; see [`best_per_egress`].
    async fn discover(&self) -> Result<Vec<Location>, ProvisionError>;
}

fn outranks(candidate: &Location, incumbent: &Location) -> bool {
    match (candidate.score, incumbent.score) {
        (Some(c), Some(i)) if c != i => c > i,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        _ => match (candidate.throughput_bps, incumbent.throughput_bps) {
            (Some(c), Some(i)) => c > i,
            _ => false,
        },
    }
}

/// Keep one candidate per egress identity, in order of first appearance.
///
/// A later candidate replaces the incumbent when its score is strictly
/// higher (a missing score ranks below any score). On equal scores the
/// higher throughput wins when both report one; otherwise the first seen
/// stays.
pub fn best_per_egress(candidates: impl IntoIterator<Item = Location>) -> Vec<Location> {
    let mut out: Vec<Location> = Vec::new();
    let mut slot_by_key: HashMap<String, usize> = HashMap::new();
    for candidate in candidates {
        let key = candidate.egress_identity().to_string();
        match slot_by_key.get(&key) {
            Some(&slot) => {
                if outranks(&candidate, &out[slot]) {
                    out[slot] = candidate;
                }
            }
            None => {
                slot_by_key.insert(key, out.len());
                out.push(candidate);
            }
        }
    }
    out
}

const VPNGATE_MIN_COLUMNS: usize = 15;

/// Parse the VPNGate server list.
///
/// Lines starting with `*` (banner and terminator) or `#` (header) are not
/// data. Rows that are short, lack a country or carry an undecodable profile
/// are skipped.
pub fn parse_vpngate_csv(text: &str) -> Vec<Location> {
    let engine = base64::engine::general_purpose::STANDARD;
    let mut out = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('*') || line.starts_with('#') {
            continue;
        }
        let cols = line.split(',').collect::<Vec<_>>();
        if cols.len() < VPNGATE_MIN_COLUMNS {
            debug!(line_no, columns = cols.len(), "skipping short vpngate row");
            continue;
        }
        let country_code = cols[6].trim();
        let country_name = cols[5].trim();
        let payload = cols[14].trim();
        if country_code.is_empty() || payload.is_empty() {
            continue;
        }
        let config_payload = match engine
            .decode(payload)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
        {
            Some(config) => config,
            None => {
                debug!(line_no, country_code, "skipping vpngate row with bad profile");
                continue;
            }
        };

        let mut location = Location::new(
            country_code.to_ascii_uppercase(),
            if country_name.is_empty() { country_code } else { country_name },
        );
        location.score = cols[2].trim().parse().ok();
        location.throughput_bps = cols[4].trim().parse().ok();
        location.endpoint = Some(cols[0].trim().to_string()).filter(|h| !h.is_empty());
        location.config_payload = Some(config_payload);
        out.push(location);
    }
    out
}

/// Public VPNGate relay list, best server per country.
#[derive(Debug, Clone)]
pub struct VpnGateProvisioner {
    fetcher: Arc<HttpFetcher>,
    url: String,
}

impl VpnGateProvisioner {
    pub fn new(fetcher: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl LocationProvisioner for VpnGateProvisioner {
    fn name(&self) -> &str {
        "vpngate"
    }

    async fn discover(&self) -> Result<Vec<Location>, ProvisionError> {
        let response = self.fetcher.fetch_bytes("vpngate", &self.url).await?;
        let text = String::from_utf8(response.body)
            .map_err(|e| ProvisionError::Parse(format!("server list is not utf-8: {e}")))?;
        let candidates = parse_vpngate_csv(&text);
        if candidates.is_empty() {
            warn!(url = %self.url, "vpngate list held no usable servers");
        }
        Ok(best_per_egress(candidates))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationRegistry {
    #[serde(default)]
    pub locations: Vec<LocationEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationEntry {
    pub id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub egress_key: Option<String>,
    #[serde(default)]
    pub score: Option<i64>,
    #[serde(default)]
    pub throughput_bps: Option<u64>,
}

fn enabled_by_default() -> bool {
    true
}

impl LocationEntry {
    fn to_location(&self) -> Location {
        let mut location = Location::new(&self.id, &self.display_name);
        if let Some(key) = &self.egress_key {
            location.egress_key = Some(key.clone());
        }
        location.score = self.score;
        location.throughput_bps = self.throughput_bps;
        location
    }
}

pub async fn load_location_registry(path: &Path) -> anyhow::Result<LocationRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// A fixed location list.
#[derive(Debug, Clone, Default)]
pub struct StaticProvisioner {
    locations: Vec<Location>,
}

impl StaticProvisioner {
    pub fn new(locations: Vec<Location>) -> Self {
        Self { locations }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Enabled entries of a `locations.yaml` registry.
    pub async fn from_registry(path: &Path) -> anyhow::Result<Self> {
        let registry = load_location_registry(path).await?;
        Ok(Self::new(
            registry
                .locations
                .iter()
                .filter(|entry| entry.enabled)
                .map(LocationEntry::to_location)
                .collect(),
        ))
    }
}

#[async_trait]
impl LocationProvisioner for StaticProvisioner {
    fn name(&self) -> &str {
        "static"
    }

    async fn discover(&self) -> Result<Vec<Location>, ProvisionError> {
        Ok(best_per_egress(self.locations.iter().cloned()))
    }
}

/// Always fails; exercises the degrade-to-baseline path.
#[derive(Debug, Clone)]
pub struct FailingProvisioner {
    pub reason: String,
}

#[async_trait]
impl LocationProvisioner for FailingProvisioner {
    fn name(&self) -> &str {
        "failing"
    }

    async fn discover(&self) -> Result<Vec<Location>, ProvisionError> {
        Err(ProvisionError::Parse(self.reason.clone()))
    }
}
