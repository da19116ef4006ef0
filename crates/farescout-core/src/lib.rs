//! Core scan domain model for FareScout.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "farescout-core";

/// Id of the pseudo-location that scans over the host's own network identity.
pub const BASELINE_LOCATION_ID: &str = "baseline";

/// Currency every observed price is normalised into.
pub const REFERENCE_CURRENCY: &str = "GBP";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("invalid airport code {0:?}: expected three letters")]
    InvalidAirport(String),
    #[error("origin and destination are both {0}")]
    SameAirport(String),
    #[error("return date {return_date} precedes departure date {departure_date}")]
    ReturnBeforeDeparture {
        departure_date: NaiveDate,
        return_date: NaiveDate,
    },
    #[error("date matrix has no valid departure/return pair")]
    EmptyDateMatrix,
}

fn normalize_airport(code: &str) -> Result<String, RequestError> {
    let trimmed = code.trim();
    if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(trimmed.to_ascii_uppercase())
    } else {
        Err(RequestError::InvalidAirport(code.to_string()))
    }
}

fn normalize_route(origin: &str, destination: &str) -> Result<(String, String), RequestError> {
    let origin = normalize_airport(origin)?;
    let destination = normalize_airport(destination)?;
    if origin == destination {
        return Err(RequestError::SameAirport(origin));
    }
    Ok((origin, destination))
}

/// One route + date pair. Immutable once a run has started.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchRequest {
    pub origin: String,
    pub destination: String,
    pub departure_date: NaiveDate,
    pub return_date: NaiveDate,
}

impl SearchRequest {
    pub fn new(
        origin: &str,
        destination: &str,
        departure_date: NaiveDate,
        return_date: NaiveDate,
    ) -> Result<Self, RequestError> {
        let (origin, destination) = normalize_route(origin, destination)?;
        if return_date < departure_date {
            return Err(RequestError::ReturnBeforeDeparture {
                departure_date,
                return_date,
            });
        }
        Ok(Self {
            origin,
            destination,
            departure_date,
            return_date,
        })
    }

    pub fn date_label(&self) -> String {
        format!("{}_{}", self.departure_date, self.return_date)
    }
}

impl fmt::Display for SearchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{} {}/{}",
            self.origin, self.destination, self.departure_date, self.return_date
        )
    }
}

/// Cartesian product of departure and return dates over one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateMatrix {
    pub origin: String,
    pub destination: String,
    pub departure_dates: Vec<NaiveDate>,
    pub return_dates: Vec<NaiveDate>,
}

impl DateMatrix {
    pub fn single(request: &SearchRequest) -> Self {
        Self {
            origin: request.origin.clone(),
            destination: request.destination.clone(),
            departure_dates: vec![request.departure_date],
            return_dates: vec![request.return_date],
        }
    }

    /// Expands the matrix departure-major, dropping pairs that return before
    /// they depart and repeated pairs.
    pub fn requests(&self) -> Result<Vec<SearchRequest>, RequestError> {
        let (origin, destination) = normalize_route(&self.origin, &self.destination)?;
        let mut out: Vec<SearchRequest> = Vec::new();
        for departure_date in &self.departure_dates {
            for return_date in &self.return_dates {
                if return_date < departure_date {
                    continue;
                }
                let request = SearchRequest {
                    origin: origin.clone(),
                    destination: destination.clone(),
                    departure_date: *departure_date,
                    return_date: *return_date,
                };
                if !out.contains(&request) {
                    out.push(request);
                }
            }
        }
        if out.is_empty() {
            return Err(RequestError::EmptyDateMatrix);
        }
        Ok(out)
    }
}

/// A network egress identity a worker unit can scan through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub display_name: String,
    /// Underlying egress identity; several provisioned endpoints may share one.
    #[serde(default)]
    pub egress_key: Option<String>,
    #[serde(default)]
    pub score: Option<i64>,
    #[serde(default)]
    pub throughput_bps: Option<u64>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing)]
    pub config_payload: Option<String>,
}

impl Location {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            egress_key: Some(id.clone()),
            id,
            display_name: display_name.into(),
            score: None,
            throughput_bps: None,
            endpoint: None,
            config_payload: None,
        }
    }

    pub fn baseline() -> Self {
        Self {
            id: BASELINE_LOCATION_ID.to_string(),
            display_name: "Baseline (no egress override)".to_string(),
            egress_key: None,
            score: None,
            throughput_bps: None,
            endpoint: None,
            config_payload: None,
        }
    }

    pub fn with_score(mut self, score: i64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_throughput(mut self, throughput_bps: u64) -> Self {
        self.throughput_bps = Some(throughput_bps);
        self
    }

    pub fn is_baseline(&self) -> bool {
        self.id == BASELINE_LOCATION_ID
    }

    pub fn egress_identity(&self) -> &str {
        self.egress_key.as_deref().unwrap_or(&self.id)
    }
}

/// Immutable launch description for exactly one worker unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub run_id: Uuid,
    pub unit_id: String,
    pub location: Location,
    pub request: SearchRequest,
    /// Artifact path relative to the output store root.
    pub output_target: PathBuf,
}

impl WorkerSpec {
    pub fn location_id(&self) -> &str {
        &self.location.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Connecting,
    Ready,
    Scraping,
    Complete,
    Error,
}

impl WorkerState {
    pub const fn rank(self) -> u8 {
        match self {
            WorkerState::Starting => 0,
            WorkerState::Connecting => 1,
            WorkerState::Ready => 2,
            WorkerState::Scraping => 3,
            WorkerState::Complete => 4,
            WorkerState::Error => 5,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Complete | WorkerState::Error)
    }

    /// Forward moves (skips included) and same-state heartbeats are legal;
    /// `error` is reachable from any non-terminal state; terminal states absorb.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            WorkerState::Error => true,
            _ => next.rank() >= self.rank(),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Connecting => "connecting",
            WorkerState::Ready => "ready",
            WorkerState::Scraping => "scraping",
            WorkerState::Complete => "complete",
            WorkerState::Error => "error",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in a unit's life an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Launch,
    Connect,
    Scrape,
    Output,
    Timeout,
    Cancelled,
    Aggregate,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailurePhase::Launch => "launch",
            FailurePhase::Connect => "connect",
            FailurePhase::Scrape => "scrape",
            FailurePhase::Output => "output",
            FailurePhase::Timeout => "timeout",
            FailurePhase::Cancelled => "cancelled",
            FailurePhase::Aggregate => "aggregate",
        };
        f.write_str(s)
    }
}

/// Progress record a worker unit publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub unit_id: String,
    pub location_id: String,
    pub state: WorkerState,
    pub items_found: u64,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_phase: Option<FailurePhase>,
    /// Per-unit write counter; readers never accept a lower value.
    pub seq: u64,
    /// `None` until the unit has published at least once.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkerStatus {
    pub fn pending(unit_id: impl Into<String>, location_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            location_id: location_id.into(),
            state: WorkerState::Starting,
            items_found: 0,
            error_message: None,
            error_phase: None,
            seq: 0,
            updated_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn observed(&self) -> bool {
        self.updated_at.is_some()
    }

    /// Orchestrator-side view of a unit it gave up on. Never written back to
    /// the unit's status channel.
    pub fn forced_error(&self, phase: FailurePhase, message: impl Into<String>) -> Self {
        Self {
            state: WorkerState::Error,
            error_message: Some(message.into()),
            error_phase: Some(phase),
            ..self.clone()
        }
    }
}

/// Aggregate counts over a set of unit statuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total_units: usize,
    pub completed: usize,
    pub errors: usize,
    pub running: usize,
    pub total_items_found: u64,
}

impl StatusCounts {
    pub fn from_statuses<'a>(statuses: impl IntoIterator<Item = &'a WorkerStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts.total_units += 1;
            counts.total_items_found += status.items_found;
            match status.state {
                WorkerState::Complete => counts.completed += 1,
                WorkerState::Error => counts.errors += 1,
                _ => counts.running += 1,
            }
        }
        counts
    }

    pub fn is_run_complete(&self) -> bool {
        self.completed + self.errors == self.total_units
    }
}

/// One loosely typed observation as emitted by a scraper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub airline: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub stops: Option<i64>,
    pub duration_minutes: Option<i64>,
    pub site: Option<String>,
    pub booking_url: Option<String>,
    pub departure_date: Option<String>,
    pub return_date: Option<String>,
    #[serde(default)]
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: f64,
    pub currency: String,
}

/// Normalised, append-only flight observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightRecord {
    /// Assigned by the store on insertion.
    #[serde(default)]
    pub id: Option<i64>,
    pub run_id: Uuid,
    pub unit_id: String,
    pub location_id: String,
    pub departure_date: NaiveDate,
    pub return_date: NaiveDate,
    pub airline: String,
    pub price: Price,
    pub reference_price: Option<f64>,
    pub stop_count: Option<u32>,
    pub duration_minutes: Option<u32>,
    pub source_site: String,
    pub booking_reference: Option<String>,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub raw_metadata: JsonValue,
}

impl FlightRecord {
    pub fn is_direct(&self) -> bool {
        self.stop_count == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Provisioning,
    Planning,
    Launching,
    Polling,
    Aggregating,
    Done,
    Failed,
}

impl RunPhase {
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            RunPhase::Provisioning
                | RunPhase::Planning
                | RunPhase::Launching
                | RunPhase::Polling
                | RunPhase::Aggregating
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCommit {
    pub committed: u64,
    pub skipped: u64,
    pub already_committed: bool,
}

/// An error attributed to exactly one unit of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFault {
    pub unit_id: String,
    pub location_id: String,
    pub phase: FailurePhase,
    pub message: String,
}

/// The orchestrator's owned record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub phase: RunPhase,
    pub requests: Vec<SearchRequest>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub locations_used: Vec<String>,
    pub total_records: u64,
    pub units: BTreeMap<String, WorkerStatus>,
    pub commits: BTreeMap<String, UnitCommit>,
    pub faults: Vec<UnitFault>,
    pub cancelled: bool,
    pub timed_out: bool,
    pub failure: Option<String>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, requests: Vec<SearchRequest>, start_time: DateTime<Utc>) -> Self {
        Self {
            run_id,
            phase: RunPhase::Idle,
            requests,
            start_time,
            end_time: None,
            locations_used: Vec::new(),
            total_records: 0,
            units: BTreeMap::new(),
            commits: BTreeMap::new(),
            faults: Vec::new(),
            cancelled: false,
            timed_out: false,
            failure: None,
        }
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts::from_statuses(self.units.values())
    }

    pub fn record_fault(
        &mut self,
        unit_id: &str,
        location_id: &str,
        phase: FailurePhase,
        message: impl Into<String>,
    ) {
        self.faults.push(UnitFault {
            unit_id: unit_id.to_string(),
            location_id: location_id.to_string(),
            phase,
            message: message.into(),
        });
    }
}
