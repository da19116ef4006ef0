//! Result aggregation: unit artifact -> normalised records -> store, once.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use farescout_core::{FlightRecord, Price, RawObservation, UnitCommit, WorkerSpec, REFERENCE_CURRENCY};
use farescout_storage::{CommitOutcome, FlightStore, OutputStore, StoreError};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("reading output of unit {unit_id}: {error:#}")]
    Output { unit_id: String, error: anyhow::Error },
    #[error("malformed output of unit {unit_id}: {reason}")]
    Malformed { unit_id: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Rates into the reference currency (GBP per unit of currency).
#[derive(Debug, Clone)]
pub struct CurrencyTable {
    reference: String,
    rates: HashMap<String, f64>,
}

impl Default for CurrencyTable {
    fn default() -> Self {
        Self::new(
            REFERENCE_CURRENCY,
            [
                ("GBP", 1.0),
                ("EUR", 0.86),
                ("USD", 0.79),
                ("INR", 0.0095),
                ("JPY", 0.0053),
            ],
        )
    }
}

impl CurrencyTable {
    pub fn new<'a>(reference: &str, rates: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        Self {
            reference: reference.to_ascii_uppercase(),
            rates: rates
                .into_iter()
                .map(|(code, rate)| (code.to_ascii_uppercase(), rate))
                .collect(),
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// `None` for currencies without a rate.
    pub fn to_reference(&self, amount: f64, currency: &str) -> Option<f64> {
        let rate = if currency.eq_ignore_ascii_case(&self.reference) {
            1.0
        } else {
            *self.rates.get(&currency.to_ascii_uppercase())?
        };
        Some((amount * rate * 100.0).round() / 100.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<FlightRecord>,
    pub skipped: u64,
}

fn parse_date_override(value: Option<&str>, default: NaiveDate) -> Result<NaiveDate, String> {
    match value {
        None => Ok(default),
        Some(text) => NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
            .map_err(|e| format!("bad date {text:?}: {e}")),
    }
}

fn non_negative(value: Option<i64>, field: &str) -> Result<Option<u32>, String> {
    value
        .map(|v| u32::try_from(v).map_err(|_| format!("{field} out of range: {v}")))
        .transpose()
}

/// Turn one raw observation into a record, or explain why it is skipped.
pub fn normalize_observation(
    spec: &WorkerSpec,
    raw: RawObservation,
    currencies: &CurrencyTable,
    default_site: &str,
    discovered_at: DateTime<Utc>,
) -> Result<FlightRecord, String> {
    let amount = match raw.price {
        Some(p) if p.is_finite() && p > 0.0 => p,
        other => return Err(format!("unusable price {other:?}")),
    };
    let departure_date = parse_date_override(raw.departure_date.as_deref(), spec.request.departure_date)?;
    let return_date = parse_date_override(raw.return_date.as_deref(), spec.request.return_date)?;
    let stop_count = non_negative(raw.stops, "stops")?;
    let duration_minutes = non_negative(raw.duration_minutes, "duration")?;

    let currency = raw
        .currency
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| currencies.reference().to_string());
    let airline = raw
        .airline
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());

    Ok(FlightRecord {
        id: None,
        run_id: spec.run_id,
        unit_id: spec.unit_id.clone(),
        location_id: spec.location.id.clone(),
        departure_date,
        return_date,
        airline,
        reference_price: currencies.to_reference(amount, &currency),
        price: Price { amount, currency },
        stop_count,
        duration_minutes,
        source_site: raw.site.unwrap_or_else(|| default_site.to_string()),
        booking_reference: raw.booking_url,
        discovered_at,
        raw_metadata: raw.metadata,
    })
}

/// Parse a unit artifact. Anything but a JSON array is malformed; bad
/// elements inside an array are skipped.
pub fn normalize_batch(
    spec: &WorkerSpec,
    raw_output: &[u8],
    currencies: &CurrencyTable,
    default_site: &str,
) -> Result<NormalizedBatch, AggregationError> {
    let malformed = |reason: String| AggregationError::Malformed {
        unit_id: spec.unit_id.clone(),
        reason,
    };
    let value: JsonValue =
        serde_json::from_slice(raw_output).map_err(|e| malformed(e.to_string()))?;
    let JsonValue::Array(items) = value else {
        return Err(malformed("expected a JSON array of observations".to_string()));
    };

    let discovered_at = Utc::now();
    let mut batch = NormalizedBatch::default();
    for (index, item) in items.into_iter().enumerate() {
        let normalized = serde_json::from_value::<RawObservation>(item)
            .map_err(|e| e.to_string())
            .and_then(|raw| normalize_observation(spec, raw, currencies, default_site, discovered_at));
        match normalized {
            Ok(record) => batch.records.push(record),
            Err(reason) => {
                warn!(unit_id = %spec.unit_id, index, %reason, "skipping malformed observation");
                batch.skipped += 1;
            }
        }
    }
    Ok(batch)
}

/// Commits each unit's records exactly once per `(run_id, unit_id)`.
#[derive(Clone)]
pub struct ResultAggregator {
    store: Arc<dyn FlightStore>,
    outputs: OutputStore,
    currencies: CurrencyTable,
    default_site: String,
}

impl ResultAggregator {
    pub fn new(store: Arc<dyn FlightStore>, outputs: OutputStore) -> Self {
        Self {
            store,
            outputs,
            currencies: CurrencyTable::default(),
            default_site: "unknown".to_string(),
        }
    }

    /// Site recorded for observations that do not name one.
    pub fn with_default_site(mut self, site: impl Into<String>) -> Self {
        self.default_site = site.into();
        self
    }

    /// Read the unit's artifact from the output store and commit it.
    pub async fn aggregate(&self, spec: &WorkerSpec) -> Result<UnitCommit, AggregationError> {
        let raw = self
            .outputs
            .read_output(&spec.output_target)
            .await
            .map_err(|error| AggregationError::Output {
                unit_id: spec.unit_id.clone(),
                error,
            })?;
        self.aggregate_output(spec, &raw).await
    }

    pub async fn aggregate_output(
        &self,
        spec: &WorkerSpec,
        raw_output: &[u8],
    ) -> Result<UnitCommit, AggregationError> {
        let batch = normalize_batch(spec, raw_output, &self.currencies, &self.default_site)?;
        let outcome = self
            .store
            .commit_unit(spec.run_id, &spec.unit_id, &batch.records)
            .await?;
        let commit = match outcome {
            CommitOutcome::Committed(count) => UnitCommit {
                committed: count,
                skipped: batch.skipped,
                already_committed: false,
            },
            CommitOutcome::AlreadyCommitted(previous) => {
                debug!(unit_id = %spec.unit_id, previous, "unit already committed; nothing written");
                UnitCommit {
                    committed: 0,
                    skipped: batch.skipped,
                    already_committed: true,
                }
            }
        };
        Ok(commit)
    }
}
