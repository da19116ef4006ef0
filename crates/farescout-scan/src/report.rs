//! Per-run reports: JSON summary, markdown brief, parquet snapshots.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field, Schema};
use farescout_core::{FlightRecord, RunSummary};
use farescout_storage::{sha256_hex, write_atomic};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tokio::fs;

const BRIEF_TOP_DEALS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `{reports_root}/{run_id}/` and returns that directory.
pub async fn write_reports(
    reports_root: &Path,
    summary: &RunSummary,
    records: &[FlightRecord],
) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    write_atomic(&run_dir.join("run_summary.json"), &summary_json).await?;
    write_atomic(&run_dir.join("scan_brief.md"), scan_brief(summary, records).as_bytes()).await?;
    export_snapshots(&run_dir, summary, records).await?;
    Ok(run_dir)
}

pub fn scan_brief(summary: &RunSummary, records: &[FlightRecord]) -> String {
    let counts = summary.counts();
    let route = summary
        .requests
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "no request".to_string());

    let mut priced = records
        .iter()
        .filter_map(|r| r.reference_price.map(|p| (p, r)))
        .collect::<Vec<_>>();
    priced.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut lines = vec![
        "# FareScout Scan Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Route: {route}"),
        format!("- Date pairs: {}", summary.requests.len()),
        format!("- Started: {}", summary.start_time),
        format!(
            "- Finished: {}",
            summary.end_time.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string())
        ),
        format!("- Locations: {}", summary.locations_used.join(", ")),
        format!(
            "- Units: {} complete, {} failed of {}",
            counts.completed, counts.errors, counts.total_units
        ),
        format!("- Flights committed: {}", summary.total_records),
    ];
    if summary.cancelled {
        lines.push("- Stopped before completion".to_string());
    }
    if summary.timed_out {
        lines.push("- Hit the global scan timeout".to_string());
    }

    lines.push(String::new());
    lines.push("## Cheapest Fares".to_string());
    if priced.is_empty() {
        lines.push("- none".to_string());
    }
    for (price, record) in priced.iter().take(BRIEF_TOP_DEALS) {
        lines.push(format!(
            "- {:.2} via {} ({}, {} {:.2}, {})",
            price,
            record.location_id,
            record.airline,
            record.price.currency,
            record.price.amount,
            if record.is_direct() { "direct" } else { "with stops" }
        ));
    }

    if !summary.faults.is_empty() {
        lines.push(String::new());
        lines.push("## Faults".to_string());
        for fault in &summary.faults {
            lines.push(format!("- {} [{}]: {}", fault.unit_id, fault.phase, fault.message));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

async fn export_snapshots(
    run_dir: &Path,
    summary: &RunSummary,
    records: &[FlightRecord],
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let flights_path = snapshot_dir.join("flights.parquet");
    let units_path = snapshot_dir.join("units.parquet");
    write_flights_parquet(&flights_path, records)?;
    write_units_parquet(&units_path, summary)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("flights", run_dir, &flights_path)?,
            manifest_entry("units", run_dir, &units_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    write_atomic(&manifest_path, &bytes).await?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_flights_parquet(path: &Path, records: &[FlightRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("unit_id", DataType::Utf8, false),
        Field::new("location_id", DataType::Utf8, false),
        Field::new("departure_date", DataType::Utf8, false),
        Field::new("return_date", DataType::Utf8, false),
        Field::new("airline", DataType::Utf8, false),
        Field::new("price", DataType::Float64, false),
        Field::new("currency", DataType::Utf8, false),
        Field::new("reference_price", DataType::Float64, true),
        Field::new("stop_count", DataType::UInt32, true),
        Field::new("source_site", DataType::Utf8, false),
    ]));

    let strings = |f: fn(&FlightRecord) -> String| {
        StringArray::from(records.iter().map(f).collect::<Vec<_>>())
    };
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(|r| r.unit_id.clone())),
            Arc::new(strings(|r| r.location_id.clone())),
            Arc::new(strings(|r| r.departure_date.to_string())),
            Arc::new(strings(|r| r.return_date.to_string())),
            Arc::new(strings(|r| r.airline.clone())),
            Arc::new(Float64Array::from(
                records.iter().map(|r| r.price.amount).collect::<Vec<_>>(),
            )),
            Arc::new(strings(|r| r.price.currency.clone())),
            Arc::new(Float64Array::from(
                records.iter().map(|r| r.reference_price).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                records.iter().map(|r| r.stop_count).collect::<Vec<_>>(),
            )),
            Arc::new(strings(|r| r.source_site.clone())),
        ],
    )
    .context("building flights record batch")?;
    write_parquet(path, batch)
}

fn write_units_parquet(path: &Path, summary: &RunSummary) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("unit_id", DataType::Utf8, false),
        Field::new("location_id", DataType::Utf8, false),
        Field::new("state", DataType::Utf8, false),
        Field::new("items_found", DataType::UInt64, false),
        Field::new("committed", DataType::UInt64, true),
        Field::new("error_phase", DataType::Utf8, true),
        Field::new("error_message", DataType::Utf8, true),
    ]));

    let units = summary.units.values().collect::<Vec<_>>();
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                units.iter().map(|u| u.unit_id.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                units.iter().map(|u| u.location_id.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                units.iter().map(|u| u.state.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                units.iter().map(|u| u.items_found).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                units
                    .iter()
                    .map(|u| summary.commits.get(&u.unit_id).map(|c| c.committed))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                units
                    .iter()
                    .map(|u| u.error_phase.map(|p| p.to_string()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                units
                    .iter()
                    .map(|u| u.error_message.as_deref())
                    .collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building units record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
