//! Append-only flight store: the trait the scan pipeline and query layer
//! share, plus SQLite and in-memory backends.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use farescout_core::{FlightRecord, Price, RunSummary};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Result of committing one unit's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(u64),
    /// The (run, unit) pair was committed earlier with this many records;
    /// nothing was written.
    AlreadyCommitted(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightFilter {
    #[serde(default)]
    pub direct_only: bool,
    #[serde(default)]
    pub location_id: Option<String>,
}

impl FlightFilter {
    fn matches(&self, record: &FlightRecord) -> bool {
        record.reference_price.is_some()
            && (!self.direct_only || record.is_direct())
            && self
                .location_id
                .as_deref()
                .map_or(true, |loc| record.location_id == loc)
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 10,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.per_page)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightPage {
    pub records: Vec<FlightRecord>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u64,
    pub best_price: Option<f64>,
}

impl FlightPage {
    fn assemble(records: Vec<FlightRecord>, total: u64, page: PageRequest, best_price: Option<f64>) -> Self {
        Self {
            records,
            total,
            page: page.page,
            per_page: page.per_page,
            total_pages: total.div_ceil(u64::from(page.per_page)),
            best_price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationStats {
    pub location_id: String,
    pub record_count: u64,
    pub average_price: f64,
    pub min_price: f64,
}

#[async_trait]
pub trait FlightStore: Send + Sync {
    /// Append records without any commitment bookkeeping.
    async fn append(&self, records: &[FlightRecord]) -> Result<u64, StoreError>;

    /// Append one unit's records exactly once per `(run_id, unit_id)`.
    async fn commit_unit(
        &self,
        run_id: Uuid,
        unit_id: &str,
        records: &[FlightRecord],
    ) -> Result<CommitOutcome, StoreError>;

    /// Cheapest first, by reference price then id. Records without a
    /// reference price are never listed.
    async fn query(&self, filter: &FlightFilter, page: PageRequest) -> Result<FlightPage, StoreError>;

    async fn flight_by_id(&self, id: i64) -> Result<Option<FlightRecord>, StoreError>;

    async fn run_records(&self, run_id: Uuid) -> Result<Vec<FlightRecord>, StoreError>;

    /// Per-location price comparison, cheapest average first.
    async fn location_stats(&self) -> Result<Vec<LocationStats>, StoreError>;

    async fn save_run(&self, summary: &RunSummary) -> Result<(), StoreError>;

    async fn recent_runs(&self, limit: u32) -> Result<Vec<RunSummary>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<FlightRecord>,
    next_id: i64,
    commits: HashMap<(Uuid, String), u64>,
    runs: Vec<RunSummary>,
}

impl MemoryState {
    fn push(&mut self, record: &FlightRecord) {
        self.next_id += 1;
        let mut stored = record.clone();
        stored.id = Some(self.next_id);
        self.records.push(stored);
    }
}

/// Process-local store; one lock serialises every write.
#[derive(Debug, Default)]
pub struct MemoryFlightStore {
    state: Mutex<MemoryState>,
}

impl MemoryFlightStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn cheapest_first(a: &FlightRecord, b: &FlightRecord) -> std::cmp::Ordering {
    let pa = a.reference_price.unwrap_or(f64::INFINITY);
    let pb = b.reference_price.unwrap_or(f64::INFINITY);
    pa.total_cmp(&pb).then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl FlightStore for MemoryFlightStore {
    async fn append(&self, records: &[FlightRecord]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        for record in records {
            state.push(record);
        }
        Ok(records.len() as u64)
    }

    async fn commit_unit(
        &self,
        run_id: Uuid,
        unit_id: &str,
        records: &[FlightRecord],
    ) -> Result<CommitOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let key = (run_id, unit_id.to_string());
        if let Some(count) = state.commits.get(&key) {
            return Ok(CommitOutcome::AlreadyCommitted(*count));
        }
        for record in records {
            state.push(record);
        }
        state.commits.insert(key, records.len() as u64);
        Ok(CommitOutcome::Committed(records.len() as u64))
    }

    async fn query(&self, filter: &FlightFilter, page: PageRequest) -> Result<FlightPage, StoreError> {
        let state = self.state.lock().await;
        let mut matching = state
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(cheapest_first);
        let total = matching.len() as u64;
        let best_price = matching.first().and_then(|r| r.reference_price);
        let records = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.per_page as usize)
            .collect();
        Ok(FlightPage::assemble(records, total, page, best_price))
    }

    async fn flight_by_id(&self, id: i64) -> Result<Option<FlightRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.iter().find(|r| r.id == Some(id)).cloned())
    }

    async fn run_records(&self, run_id: Uuid) -> Result<Vec<FlightRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn location_stats(&self) -> Result<Vec<LocationStats>, StoreError> {
        let state = self.state.lock().await;
        let mut grouped: HashMap<&str, Vec<f64>> = HashMap::new();
        for record in &state.records {
            if let Some(price) = record.reference_price {
                grouped.entry(record.location_id.as_str()).or_default().push(price);
            }
        }
        let mut stats = grouped
            .into_iter()
            .map(|(location_id, prices)| LocationStats {
                location_id: location_id.to_string(),
                record_count: prices.len() as u64,
                average_price: prices.iter().sum::<f64>() / prices.len() as f64,
                min_price: prices.iter().copied().fold(f64::INFINITY, f64::min),
            })
            .collect::<Vec<_>>();
        stats.sort_by(|a, b| {
            a.average_price
                .total_cmp(&b.average_price)
                .then_with(|| a.location_id.cmp(&b.location_id))
        });
        Ok(stats)
    }

    async fn save_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.runs.retain(|r| r.run_id != summary.run_id);
        state.runs.push(summary.clone());
        Ok(())
    }

    async fn recent_runs(&self, limit: u32) -> Result<Vec<RunSummary>, StoreError> {
        let state = self.state.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        runs.truncate(limit as usize);
        Ok(runs)
    }
}

const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS flights (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        unit_id TEXT NOT NULL,
        location_id TEXT NOT NULL,
        departure_date TEXT NOT NULL,
        return_date TEXT NOT NULL,
        airline TEXT NOT NULL,
        price_amount REAL NOT NULL,
        price_currency TEXT NOT NULL,
        price_reference REAL,
        stops INTEGER,
        duration_minutes INTEGER,
        source_site TEXT NOT NULL,
        booking_reference TEXT,
        discovered_at TEXT NOT NULL,
        raw_metadata TEXT NOT NULL DEFAULT 'null'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_flights_price ON flights(price_reference)",
    "CREATE INDEX IF NOT EXISTS idx_flights_run ON flights(run_id)",
    r#"
    CREATE TABLE IF NOT EXISTS unit_commits (
        run_id TEXT NOT NULL,
        unit_id TEXT NOT NULL,
        record_count INTEGER NOT NULL,
        committed_at TEXT NOT NULL,
        PRIMARY KEY (run_id, unit_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scan_runs (
        run_id TEXT PRIMARY KEY,
        phase TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        total_records INTEGER NOT NULL,
        summary_json TEXT NOT NULL
    )
    "#,
];

const RECORD_COLUMNS: &str = "id, run_id, unit_id, location_id, departure_date, return_date, \
     airline, price_amount, price_currency, price_reference, stops, duration_minutes, \
     source_site, booking_reference, discovered_at, raw_metadata";

/// SQLite-backed store. Commits for one run are serialised by a per-run lock
/// around a transaction. A run's lock lives only while a commit holds it.
#[derive(Debug)]
pub struct SqliteFlightStore {
    pool: SqlitePool,
    run_locks: Mutex<HashMap<Uuid, Weak<Mutex<()>>>>,
}

impl SqliteFlightStore {
    /// Open (creating if missing) the database at `database_url`, e.g.
    /// `sqlite://flights.db`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// A private in-memory database. One connection only, so every query
    /// sees the same data.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            run_locks: Mutex::new(HashMap::new()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn run_lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        let mut map = self.run_locks.lock().await;
        map.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = map.get(&run_id).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(Mutex::new(()));
        map.insert(run_id, Arc::downgrade(&lock));
        lock
    }

    fn where_clause(filter: &FlightFilter) -> String {
        let mut clauses = vec!["price_reference IS NOT NULL"];
        if filter.direct_only {
            clauses.push("stops = 0");
        }
        if filter.location_id.is_some() {
            clauses.push("location_id = ?");
        }
        format!("WHERE {}", clauses.join(" AND "))
    }
}

async fn insert_record(conn: &mut SqliteConnection, record: &FlightRecord) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO flights (
            run_id, unit_id, location_id, departure_date, return_date, airline,
            price_amount, price_currency, price_reference, stops, duration_minutes,
            source_site, booking_reference, discovered_at, raw_metadata
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.run_id.to_string())
    .bind(&record.unit_id)
    .bind(&record.location_id)
    .bind(record.departure_date.to_string())
    .bind(record.return_date.to_string())
    .bind(&record.airline)
    .bind(record.price.amount)
    .bind(&record.price.currency)
    .bind(record.reference_price)
    .bind(record.stop_count.map(i64::from))
    .bind(record.duration_minutes.map(i64::from))
    .bind(&record.source_site)
    .bind(&record.booking_reference)
    .bind(record.discovered_at.to_rfc3339())
    .bind(serde_json::to_string(&record.raw_metadata)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn corrupt(id: i64, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        id,
        reason: reason.into(),
    }
}

fn record_from_row(row: &SqliteRow) -> Result<FlightRecord, StoreError> {
    let id: i64 = row.try_get("id")?;
    let parse_date = |column: &str| -> Result<NaiveDate, StoreError> {
        let text: String = row.try_get(column)?;
        NaiveDate::parse_from_str(&text, "%Y-%m-%d")
            .map_err(|e| corrupt(id, format!("{column}: {e}")))
    };
    let parse_count = |column: &str| -> Result<Option<u32>, StoreError> {
        let value: Option<i64> = row.try_get(column)?;
        value
            .map(|v| u32::try_from(v).map_err(|e| corrupt(id, format!("{column}: {e}"))))
            .transpose()
    };

    let run_id: String = row.try_get("run_id")?;
    let discovered_at: String = row.try_get("discovered_at")?;
    let raw_metadata: String = row.try_get("raw_metadata")?;

    Ok(FlightRecord {
        id: Some(id),
        run_id: Uuid::parse_str(&run_id).map_err(|e| corrupt(id, format!("run_id: {e}")))?,
        unit_id: row.try_get("unit_id")?,
        location_id: row.try_get("location_id")?,
        departure_date: parse_date("departure_date")?,
        return_date: parse_date("return_date")?,
        airline: row.try_get("airline")?,
        price: Price {
            amount: row.try_get("price_amount")?,
            currency: row.try_get("price_currency")?,
        },
        reference_price: row.try_get("price_reference")?,
        stop_count: parse_count("stops")?,
        duration_minutes: parse_count("duration_minutes")?,
        source_site: row.try_get("source_site")?,
        booking_reference: row.try_get("booking_reference")?,
        discovered_at: DateTime::parse_from_rfc3339(&discovered_at)
            .map_err(|e| corrupt(id, format!("discovered_at: {e}")))?
            .with_timezone(&Utc),
        raw_metadata: serde_json::from_str(&raw_metadata)?,
    })
}

#[async_trait]
impl FlightStore for SqliteFlightStore {
    async fn append(&self, records: &[FlightRecord]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            insert_record(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(records.len() as u64)
    }

    async fn commit_unit(
        &self,
        run_id: Uuid,
        unit_id: &str,
        records: &[FlightRecord],
    ) -> Result<CommitOutcome, StoreError> {
        let lock = self.run_lock(run_id).await;
        let _writer = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT record_count FROM unit_commits WHERE run_id = ? AND unit_id = ?",
        )
        .bind(run_id.to_string())
        .bind(unit_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(count) = existing {
            tx.rollback().await?;
            debug!(%run_id, unit_id, count, "unit already committed");
            return Ok(CommitOutcome::AlreadyCommitted(count.max(0) as u64));
        }

        for record in records {
            insert_record(&mut tx, record).await?;
        }
        sqlx::query(
            "INSERT INTO unit_commits (run_id, unit_id, record_count, committed_at) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id.to_string())
        .bind(unit_id)
        .bind(records.len() as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(CommitOutcome::Committed(records.len() as u64))
    }

    async fn query(&self, filter: &FlightFilter, page: PageRequest) -> Result<FlightPage, StoreError> {
        let where_clause = Self::where_clause(filter);

        let best_sql = format!("SELECT MIN(price_reference) FROM flights {where_clause}");
        let mut best = sqlx::query_scalar::<_, Option<f64>>(&best_sql);
        if let Some(location_id) = &filter.location_id {
            best = best.bind(location_id);
        }
        let best_price = best.fetch_one(&self.pool).await?;

        let count_sql = format!("SELECT COUNT(*) FROM flights {where_clause}");
        let mut count = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(location_id) = &filter.location_id {
            count = count.bind(location_id);
        }
        let total = count.fetch_one(&self.pool).await?.max(0) as u64;

        let rows_sql = format!(
            "SELECT {RECORD_COLUMNS} FROM flights {where_clause} \
             ORDER BY price_reference ASC, id ASC LIMIT ? OFFSET ?"
        );
        let mut rows = sqlx::query(&rows_sql);
        if let Some(location_id) = &filter.location_id {
            rows = rows.bind(location_id);
        }
        let rows = rows
            .bind(i64::from(page.per_page))
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FlightPage::assemble(records, total, page, best_price))
    }

    async fn flight_by_id(&self, id: i64) -> Result<Option<FlightRecord>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM flights WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn run_records(&self, run_id: Uuid) -> Result<Vec<FlightRecord>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM flights WHERE run_id = ? ORDER BY id ASC");
        let rows = sqlx::query(&sql)
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn location_stats(&self) -> Result<Vec<LocationStats>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT location_id,
                   COUNT(*) AS record_count,
                   AVG(price_reference) AS average_price,
                   MIN(price_reference) AS min_price
              FROM flights
             WHERE price_reference IS NOT NULL
             GROUP BY location_id
             ORDER BY average_price ASC, location_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let record_count: i64 = row.try_get("record_count")?;
            let average_price: Option<f64> = row.try_get("average_price")?;
            let min_price: Option<f64> = row.try_get("min_price")?;
            out.push(LocationStats {
                location_id: row.try_get("location_id")?,
                record_count: record_count.max(0) as u64,
                average_price: average_price.unwrap_or_default(),
                min_price: min_price.unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn save_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        let phase = serde_json::to_value(summary.phase)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO scan_runs (run_id, phase, start_time, end_time, total_records, summary_json)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(summary.run_id.to_string())
        .bind(phase)
        .bind(summary.start_time.to_rfc3339())
        .bind(summary.end_time.map(|t| t.to_rfc3339()))
        .bind(summary.total_records as i64)
        .bind(serde_json::to_string(summary)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_runs(&self, limit: u32) -> Result<Vec<RunSummary>, StoreError> {
        let rows = sqlx::query("SELECT summary_json FROM scan_runs ORDER BY start_time DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.try_get("summary_json")?;
            out.push(serde_json::from_str(&json)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farescout_core::{RunPhase, SearchRequest};

    fn record(run_id: Uuid, location: &str, price: f64, stops: u32) -> FlightRecord {
        FlightRecord {
            id: None,
            run_id,
            unit_id: location.to_string(),
            location_id: location.to_string(),
            departure_date: NaiveDate::from_ymd_opt(2026, 2, 16).unwrap(),
            return_date: NaiveDate::from_ymd_opt(2026, 2, 23).unwrap(),
            airline: "Air India".into(),
            price: Price {
                amount: price,
                currency: "GBP".into(),
            },
            reference_price: Some(price),
            stop_count: Some(stops),
            duration_minutes: Some(545),
            source_site: "fixture".into(),
            booking_reference: Some(format!("https://example.test/{location}/{price}")),
            discovered_at: Utc::now(),
            raw_metadata: serde_json::json!({"times": "10:05 - 00:20"}),
        }
    }

    async fn stores() -> Vec<Box<dyn FlightStore>> {
        vec![
            Box::new(MemoryFlightStore::new()),
            Box::new(SqliteFlightStore::in_memory().await.expect("sqlite memory")),
        ]
    }

    #[tokio::test]
    async fn commit_is_idempotent_per_run_and_unit() {
        for store in stores().await {
            let run_id = Uuid::new_v4();
            let batch = vec![record(run_id, "DE", 410.0, 1), record(run_id, "DE", 380.0, 0)];

            let first = store.commit_unit(run_id, "DE", &batch).await.unwrap();
            let second = store.commit_unit(run_id, "DE", &batch).await.unwrap();
            assert_eq!(first, CommitOutcome::Committed(2));
            assert_eq!(second, CommitOutcome::AlreadyCommitted(2));

            let other_run = Uuid::new_v4();
            let third = store.commit_unit(other_run, "DE", &batch).await.unwrap();
            assert_eq!(third, CommitOutcome::Committed(2));

            let page = store.query(&FlightFilter::default(), PageRequest::default()).await.unwrap();
            assert_eq!(page.total, 4);
        }
    }

    #[tokio::test]
    async fn run_locks_are_released_after_commits() {
        let store = SqliteFlightStore::in_memory().await.unwrap();
        for _ in 0..5 {
            let run_id = Uuid::new_v4();
            let batch = vec![record(run_id, "DE", 410.0, 1)];
            store.commit_unit(run_id, "DE", &batch).await.unwrap();
            store.commit_unit(run_id, "US", &batch).await.unwrap();
        }

        let held = store.run_lock(Uuid::nil()).await;
        let map = store.run_locks.lock().await;
        assert_eq!(map.len(), 1, "finished runs leave no lock behind");
        assert!(map.contains_key(&Uuid::nil()));
        drop(map);
        drop(held);
    }

    #[tokio::test]
    async fn query_sorts_cheapest_first_and_paginates() {
        for store in stores().await {
            let run_id = Uuid::new_v4();
            let prices = [520.0, 310.0, 450.0, 299.0, 610.0, 333.0, 401.0];
            let batch = prices
                .iter()
                .enumerate()
                .map(|(i, p)| record(run_id, if i % 2 == 0 { "US" } else { "JP" }, *p, (i % 2) as u32))
                .collect::<Vec<_>>();
            assert_eq!(store.append(&batch).await.unwrap(), 7);

            let first = store.query(&FlightFilter::default(), PageRequest::new(1, 5)).await.unwrap();
            assert_eq!(first.total, 7);
            assert_eq!(first.total_pages, 2);
            assert_eq!(first.best_price, Some(299.0));
            let got = first
                .records
                .iter()
                .map(|r| r.reference_price.unwrap())
                .collect::<Vec<_>>();
            assert_eq!(got, vec![299.0, 310.0, 333.0, 401.0, 450.0]);

            let second = store.query(&FlightFilter::default(), PageRequest::new(2, 5)).await.unwrap();
            assert_eq!(second.records.len(), 2);
            assert_eq!(second.records[1].reference_price, Some(610.0));

            let direct = store
                .query(
                    &FlightFilter {
                        direct_only: true,
                        location_id: None,
                    },
                    PageRequest::new(1, 10),
                )
                .await
                .unwrap();
            assert_eq!(direct.total, 4);
            assert!(direct.records.iter().all(|r| r.is_direct()));

            let japan = store
                .query(
                    &FlightFilter {
                        direct_only: false,
                        location_id: Some("JP".into()),
                    },
                    PageRequest::new(1, 10),
                )
                .await
                .unwrap();
            assert_eq!(japan.total, 3);
            assert_eq!(japan.best_price, Some(299.0));
        }
    }

    #[tokio::test]
    async fn records_without_reference_price_are_hidden_from_queries() {
        for store in stores().await {
            let run_id = Uuid::new_v4();
            let mut unknown = record(run_id, "BR", 1200.0, 1);
            unknown.price.currency = "BRL".into();
            unknown.reference_price = None;
            store.append(&[unknown, record(run_id, "BR", 700.0, 1)]).await.unwrap();

            let page = store.query(&FlightFilter::default(), PageRequest::default()).await.unwrap();
            assert_eq!(page.total, 1);
            assert_eq!(store.run_records(run_id).await.unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn sqlite_round_trips_records_and_runs() {
        let store = SqliteFlightStore::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let original = record(run_id, "KR", 389.5, 0);
        store.append(std::slice::from_ref(&original)).await.unwrap();

        let loaded = store.flight_by_id(1).await.unwrap().expect("record 1");
        assert_eq!(loaded.id, Some(1));
        assert_eq!(loaded.airline, original.airline);
        assert_eq!(loaded.departure_date, original.departure_date);
        assert_eq!(loaded.stop_count, Some(0));
        assert_eq!(loaded.raw_metadata, original.raw_metadata);
        assert!(store.flight_by_id(99).await.unwrap().is_none());

        let request = SearchRequest::new(
            "LHR",
            "BOM",
            original.departure_date,
            original.return_date,
        )
        .unwrap();
        let mut summary = RunSummary::new(run_id, vec![request], Utc::now());
        summary.phase = RunPhase::Done;
        summary.total_records = 1;
        store.save_run(&summary).await.unwrap();
        store.save_run(&summary).await.unwrap();
        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, run_id);
        assert_eq!(runs[0].phase, RunPhase::Done);
    }

    #[tokio::test]
    async fn location_stats_rank_by_average_price() {
        for store in stores().await {
            let run_id = Uuid::new_v4();
            store
                .append(&[
                    record(run_id, "US", 500.0, 1),
                    record(run_id, "US", 300.0, 1),
                    record(run_id, "IN", 350.0, 0),
                ])
                .await
                .unwrap();
            let stats = store.location_stats().await.unwrap();
            assert_eq!(stats.len(), 2);
            assert_eq!(stats[0].location_id, "IN");
            assert_eq!(stats[1].location_id, "US");
            assert_eq!(stats[1].record_count, 2);
            assert_eq!(stats[1].average_price, 400.0);
            assert_eq!(stats[1].min_price, 300.0);
        }
    }
}
