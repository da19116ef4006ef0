//! Status channel (unit write side, tracker read side) and the Status Tracker.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use farescout_core::{FailurePhase, StatusCounts, WorkerSpec, WorkerState, WorkerStatus};
use farescout_storage::{file_stem, write_atomic};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("unit {unit_id} cannot move from {from} to {to}")]
    Regression {
        unit_id: String,
        from: WorkerState,
        to: WorkerState,
    },
    #[error("unit {unit_id} already reached {state}")]
    AfterTerminal { unit_id: String, state: WorkerState },
    #[error("unit {unit_id} write seq {seq} is not newer than {current}")]
    StaleSeq {
        unit_id: String,
        seq: u64,
        current: u64,
    },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Reject writes that would make a unit's observed status go backwards.
pub fn check_update(current: Option<&WorkerStatus>, next: &WorkerStatus) -> Result<(), StatusError> {
    let Some(current) = current else {
        return Ok(());
    };
    if current.is_terminal() {
        return Err(StatusError::AfterTerminal {
            unit_id: next.unit_id.clone(),
            state: current.state,
        });
    }
    if next.seq <= current.seq {
        return Err(StatusError::StaleSeq {
            unit_id: next.unit_id.clone(),
            seq: next.seq,
            current: current.seq,
        });
    }
    if !current.state.can_transition_to(next.state) {
        return Err(StatusError::Regression {
            unit_id: next.unit_id.clone(),
            from: current.state,
            to: next.state,
        });
    }
    Ok(())
}

#[async_trait]
pub trait StatusChannel: Send + Sync {
    /// Write side. Only the unit named in `status` may call this.
    async fn publish(&self, status: &WorkerStatus) -> Result<(), StatusError>;

    /// Read side: the latest accepted status per unit that has published.
    async fn snapshot(&self) -> Result<HashMap<String, WorkerStatus>, StatusError>;
}

#[derive(Debug, Default)]
pub struct MemoryStatusBoard {
    statuses: RwLock<HashMap<String, WorkerStatus>>,
}

impl MemoryStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusChannel for MemoryStatusBoard {
    async fn publish(&self, status: &WorkerStatus) -> Result<(), StatusError> {
        let mut statuses = self.statuses.write().await;
        check_update(statuses.get(&status.unit_id), status)?;
        statuses.insert(status.unit_id.clone(), status.clone());
        Ok(())
    }

    async fn snapshot(&self) -> Result<HashMap<String, WorkerStatus>, StatusError> {
        Ok(self.statuses.read().await.clone())
    }
}

/// One `status_{unit_id}.json` per unit, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileStatusBoard {
    dir: PathBuf,
}

impl FileStatusBoard {
    pub async fn create(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating status directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, unit_id: &str) -> PathBuf {
        self.dir.join(format!("status_{}.json", file_stem(unit_id)))
    }

    async fn read_status(path: &Path) -> Option<WorkerStatus> {
        let bytes = fs::read(path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(status) => Some(status),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "ignoring unreadable status file");
                None
            }
        }
    }
}

#[async_trait]
impl StatusChannel for FileStatusBoard {
    async fn publish(&self, status: &WorkerStatus) -> Result<(), StatusError> {
        let path = self.path_for(&status.unit_id);
        let current = Self::read_status(&path).await;
        check_update(current.as_ref(), status)?;
        let bytes = serde_json::to_vec_pretty(status).context("serializing worker status")?;
        write_atomic(&path, &bytes).await?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<HashMap<String, WorkerStatus>, StatusError> {
        let mut out = HashMap::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("listing {}", self.dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !(name.starts_with("status_") && name.ends_with(".json")) {
                continue;
            }
            if let Some(status) = Self::read_status(&entry.path()).await {
                out.insert(status.unit_id.clone(), status);
            }
        }
        Ok(out)
    }
}

/// Write capability handed to exactly one unit.
pub struct StatusWriter {
    channel: Arc<dyn StatusChannel>,
    current: WorkerStatus,
}

impl StatusWriter {
    pub fn new(channel: Arc<dyn StatusChannel>, spec: &WorkerSpec) -> Self {
        Self {
            channel,
            current: WorkerStatus::pending(&spec.unit_id, spec.location_id()),
        }
    }

    pub fn current(&self) -> &WorkerStatus {
        &self.current
    }

    async fn write(&mut self, next: WorkerStatus) -> Result<(), StatusError> {
        let next = WorkerStatus {
            seq: self.current.seq + 1,
            updated_at: Some(Utc::now()),
            ..next
        };
        self.channel.publish(&next).await?;
        self.current = next;
        Ok(())
    }

    pub async fn advance(&mut self, state: WorkerState) -> Result<(), StatusError> {
        let next = WorkerStatus {
            state,
            ..self.current.clone()
        };
        self.write(next).await
    }

    /// Republish the current state so the tracker can tell slow from hung.
    pub async fn heartbeat(&mut self) -> Result<(), StatusError> {
        self.write(self.current.clone()).await
    }

    pub async fn found(&mut self, items_found: u64) -> Result<(), StatusError> {
        let next = WorkerStatus {
            items_found,
            ..self.current.clone()
        };
        self.write(next).await
    }

    pub async fn complete(&mut self, items_found: u64) -> Result<(), StatusError> {
        let next = WorkerStatus {
            state: WorkerState::Complete,
            items_found,
            ..self.current.clone()
        };
        self.write(next).await
    }

    pub async fn fail(&mut self, phase: FailurePhase, message: impl Into<String>) -> Result<(), StatusError> {
        let next = WorkerStatus {
            state: WorkerState::Error,
            error_message: Some(message.into()),
            error_phase: Some(phase),
            ..self.current.clone()
        };
        self.write(next).await
    }
}

/// Read-only view over the expected units of one run.
pub struct StatusTracker {
    channel: Arc<dyn StatusChannel>,
    expected: Vec<(String, String)>,
}

impl StatusTracker {
    pub fn new(channel: Arc<dyn StatusChannel>, specs: &[WorkerSpec]) -> Self {
        Self {
            channel,
            expected: specs
                .iter()
                .map(|s| (s.unit_id.clone(), s.location_id().to_string()))
                .collect(),
        }
    }

    /// Every expected unit, keyed by unit id. A single-pair run has one unit
    /// per location and uses the location id as the unit id; date-matrix
    /// runs suffix it with `@{pair}`, and each status still carries its
    /// `location_id`. Units that never published show as `starting` with no
    /// `updated_at`.
    pub async fn poll(&self) -> Result<BTreeMap<String, WorkerStatus>, StatusError> {
        let mut published = self.channel.snapshot().await?;
        Ok(self
            .expected
            .iter()
            .map(|(unit_id, location_id)| {
                let status = published
                    .remove(unit_id)
                    .unwrap_or_else(|| WorkerStatus::pending(unit_id, location_id));
                (unit_id.clone(), status)
            })
            .collect())
    }

    pub fn counts(statuses: &BTreeMap<String, WorkerStatus>) -> StatusCounts {
        StatusCounts::from_statuses(statuses.values())
    }

    pub fn is_run_complete(statuses: &BTreeMap<String, WorkerStatus>) -> bool {
        Self::counts(statuses).is_run_complete()
    }

    /// Non-terminal units whose last write is older than `window`, or who
    /// never wrote.
    pub fn stale_units(
        statuses: &BTreeMap<String, WorkerStatus>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Vec<String> {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(365));
        statuses
            .values()
            .filter(|s| !s.is_terminal())
            .filter(|s| match s.updated_at {
                Some(at) => now.signed_duration_since(at) > window,
                None => true,
            })
            .map(|s| s.unit_id.clone())
            .collect()
    }
}
