use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use farescout_adapters::{best_per_egress, LocationProvisioner};
use farescout_core::{DateMatrix, FlightRecord, Location, RunSummary};
use farescout_scan::{build_provisioner, config, ScanConfig, ScanRuntime};
use farescout_storage::{FlightFilter, FlightStore, PageRequest};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "farescout")]
#[command(about = "Scan one flight search from many network locations at once")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scan in the foreground.
    Scan(ScanArgs),
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value = farescout_web::DEFAULT_BIND)]
        bind: SocketAddr,
    },
    /// Print a page of the cheapest stored fares.
    Deals {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 10)]
        per_page: u32,
        #[arg(long)]
        direct: bool,
        #[arg(long)]
        location: Option<String>,
    },
    /// Print the locations the configured provisioner offers.
    Locations,
}

#[derive(Debug, Args, Default)]
struct ScanArgs {
    #[arg(long, default_value = config::DEFAULT_ORIGIN)]
    origin: String,
    #[arg(long, default_value = config::DEFAULT_DESTINATION)]
    destination: String,
    /// Departure date; repeat for a date matrix.
    #[arg(long = "depart", value_name = "YYYY-MM-DD")]
    departure_dates: Vec<String>,
    /// Return date; repeat for a date matrix.
    #[arg(long = "return", value_name = "YYYY-MM-DD")]
    return_dates: Vec<String>,
    /// Scan through these location ids instead of asking the provisioner.
    #[arg(long = "location", value_name = "ID")]
    locations: Vec<String>,
}

impl ScanArgs {
    fn matrix(&self) -> Result<DateMatrix> {
        let dates = |given: &[String], default: &str| -> Result<Vec<_>> {
            if given.is_empty() {
                return Ok(vec![config::parse_date(default)?]);
            }
            given.iter().map(|d| config::parse_date(d)).collect()
        };
        Ok(DateMatrix {
            origin: self.origin.clone(),
            destination: self.destination.clone(),
            departure_dates: dates(&self.departure_dates, config::DEFAULT_DEPARTURE_DATE)?,
            return_dates: dates(&self.return_dates, config::DEFAULT_RETURN_DATE)?,
        })
    }

    fn locations(&self) -> Option<Vec<Location>> {
        if self.locations.is_empty() {
            return None;
        }
        Some(self.locations.iter().map(|id| Location::new(id, id)).collect())
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,farescout=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_record(rank: usize, record: &FlightRecord) {
    println!(
        "{:>3}. {:>9} {:<4} {:<10} {:<18} {} stop(s)  ({} {:.2})",
        rank,
        record
            .reference_price
            .map(|p| format!("{p:.2}"))
            .unwrap_or_else(|| "-".to_string()),
        farescout_core::REFERENCE_CURRENCY,
        record.location_id,
        record.airline,
        record
            .stop_count
            .map(|s| s.to_string())
            .unwrap_or_else(|| "?".to_string()),
        record.price.currency,
        record.price.amount,
    );
}

fn print_summary(summary: &RunSummary) {
    let counts = summary.counts();
    println!(
        "scan {}: run_id={} locations={} units={}/{} errors={} records={}",
        if summary.cancelled { "stopped" } else { "finished" },
        summary.run_id,
        summary.locations_used.join(","),
        counts.completed,
        counts.total_units,
        counts.errors,
        summary.total_records,
    );
    if let Some(failure) = &summary.failure {
        println!("run failed: {failure}");
    }
    for fault in &summary.faults {
        println!("  {} [{}] {}", fault.unit_id, fault.phase, fault.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Scan(ScanArgs {
        origin: config::DEFAULT_ORIGIN.to_string(),
        destination: config::DEFAULT_DESTINATION.to_string(),
        ..ScanArgs::default()
    })) {
        Commands::Scan(args) => {
            let runtime = ScanRuntime::from_env().await?;
            let summary = runtime
                .orchestrator
                .run(args.matrix()?, args.locations())
                .await?;
            print_summary(&summary);

            let mut records = runtime
                .store
                .run_records(summary.run_id)
                .await
                .context("loading run records")?;
            records.retain(|r| r.reference_price.is_some());
            records.sort_by(|a, b| {
                a.reference_price
                    .unwrap_or(f64::INFINITY)
                    .total_cmp(&b.reference_price.unwrap_or(f64::INFINITY))
            });
            for (i, record) in records.iter().take(5).enumerate() {
                print_record(i + 1, record);
            }
        }
        Commands::Serve { bind } => {
            farescout_web::serve_runtime(ScanRuntime::from_env().await?, bind).await?;
        }
        Commands::Deals {
            page,
            per_page,
            direct,
            location,
        } => {
            let runtime = ScanRuntime::from_env().await?;
            let filter = FlightFilter {
                direct_only: direct,
                location_id: location,
            };
            let page = runtime
                .store
                .query(&filter, PageRequest::new(page, per_page))
                .await
                .context("querying flights")?;
            println!(
                "page {}/{} ({} fares, best {})",
                page.page,
                page.total_pages.max(1),
                page.total,
                page.best_price
                    .map(|p| format!("{p:.2}"))
                    .unwrap_or_else(|| "-".to_string()),
            );
            let offset = PageRequest::new(page.page, page.per_page).offset() as usize;
            for (i, record) in page.records.iter().enumerate() {
                print_record(offset + i + 1, record);
            }
        }
        Commands::Locations => {
            let scan_config = ScanConfig::from_env();
            let provisioner = build_provisioner(&scan_config).await?;
            let locations = best_per_egress(provisioner.discover().await?);
            println!("{} location(s) via {}", locations.len(), provisioner.name());
            for location in locations {
                println!(
                    "  {:<4} {:<24} score={} throughput={}",
                    location.id,
                    location.display_name,
                    location.score.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    location
                        .throughput_bps
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".into()),
                );
            }
        }
    }

    Ok(())
}
