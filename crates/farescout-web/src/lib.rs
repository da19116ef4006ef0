//! Axum JSON API over the scan orchestrator and the flight store.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use farescout_core::{DateMatrix, Location};
use farescout_scan::{config, Orchestrator, ScanRuntime};
use farescout_storage::{FlightFilter, FlightStore, PageRequest};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "farescout-web";
pub const DEFAULT_BIND: &str = "127.0.0.1:8000";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub store: Arc<dyn FlightStore>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            store: orchestrator.store(),
            orchestrator,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct DataQuery {
    page: Option<u32>,
    per_page: Option<u32>,
    direct: Option<String>,
    location: Option<String>,
}

impl DataQuery {
    fn filter(&self) -> FlightFilter {
        FlightFilter {
            direct_only: self
                .direct
                .as_deref()
                .is_some_and(|v| matches!(v, "1" | "true" | "yes" | "on")),
            location_id: self.location.clone().filter(|l| !l.is_empty()),
        }
    }

    fn page(&self) -> PageRequest {
        let defaults = PageRequest::default();
        PageRequest::new(
            self.page.unwrap_or(defaults.page),
            self.per_page.unwrap_or(defaults.per_page),
        )
    }
}

/// Body of `POST /api/start`. Every field is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct StartBody {
    origin: Option<String>,
    destination: Option<String>,
    departure_date: Option<String>,
    return_date: Option<String>,
    departure_dates: Vec<String>,
    return_dates: Vec<String>,
    #[serde(alias = "countries")]
    locations: Vec<String>,
}

impl StartBody {
    fn dates(list: &[String], single: Option<&str>, default: &str) -> anyhow::Result<Vec<chrono::NaiveDate>> {
        if list.is_empty() {
            return Ok(vec![config::parse_date(single.unwrap_or(default))?]);
        }
        list.iter().map(|d| config::parse_date(d)).collect()
    }

    fn matrix(&self) -> anyhow::Result<DateMatrix> {
        Ok(DateMatrix {
            origin: self
                .origin
                .clone()
                .unwrap_or_else(|| config::DEFAULT_ORIGIN.to_string()),
            destination: self
                .destination
                .clone()
                .unwrap_or_else(|| config::DEFAULT_DESTINATION.to_string()),
            departure_dates: Self::dates(
                &self.departure_dates,
                self.departure_date.as_deref(),
                config::DEFAULT_DEPARTURE_DATE,
            )?,
            return_dates: Self::dates(
                &self.return_dates,
                self.return_date.as_deref(),
                config::DEFAULT_RETURN_DATE,
            )?,
        })
    }

    /// An empty list leaves location discovery to the provisioner.
    fn locations(&self) -> Option<Vec<Location>> {
        let ids = self
            .locations
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(|id| Location::new(id, id))
            .collect::<Vec<_>>();
        (!ids.is_empty()).then_some(ids)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/data", get(data_handler))
        .route("/api/flights/{id}", get(flight_handler))
        .route("/api/locations/stats", get(location_stats_handler))
        .route("/api/scanner-status", get(scanner_status_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/start", post(start_handler))
        .route("/api/stop", post(stop_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, bind: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(%bind, "serving farescout api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Serve `runtime` with its cron scheduler, when enabled, running alongside.
pub async fn serve_runtime(runtime: ScanRuntime, bind: SocketAddr) -> anyhow::Result<()> {
    let scheduler = runtime.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }
    serve(AppState::new(runtime.orchestrator), bind).await
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn data_handler(State(state): State<Arc<AppState>>, Query(query): Query<DataQuery>) -> Response {
    match state.store.query(&query.filter(), query.page()).await {
        Ok(page) => Json(json!({
            "stats": {
                "best_price": page.best_price,
                "total_records": page.total,
            },
            "best_deals": page.records,
            "pagination": {
                "page": page.page,
                "per_page": page.per_page,
                "total": page.total,
                "total_pages": page.total_pages,
            },
        }))
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn flight_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<i64>) -> Response {
    match state.store.flight_by_id(id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("flight {id} not found")})),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn location_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.location_stats().await {
        Ok(stats) => Json(json!({ "locations": stats })).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn scanner_status_handler(State(state): State<Arc<AppState>>) -> Response {
    let summary = state.orchestrator.status();
    let counts = summary.as_ref().map(|s| s.counts()).unwrap_or_default();
    Json(json!({
        "running": state.orchestrator.is_running(),
        "summary": summary,
        "totals": {
            "total_units": counts.total_units,
            "complete": counts.completed,
            "errors": counts.errors,
            "total_items": counts.total_items_found,
        },
    }))
    .into_response()
}

async fn logs_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "logs": state.orchestrator.drain_events() })).into_response()
}

async fn start_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<StartBody>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return rejected(rejection.body_text()),
    };
    let matrix = match body.matrix() {
        Ok(matrix) => matrix,
        Err(err) => return rejected(format!("{err:#}")),
    };
    match state.orchestrator.start(matrix, body.locations()) {
        Ok(run_id) => Json(json!({ "ok": true, "run_id": run_id })).into_response(),
        Err(err) => rejected(err.to_string()),
    }
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> Response {
    let was_running = state.orchestrator.stop();
    Json(json!({ "ok": true, "was_running": was_running })).into_response()
}

fn rejected(error: String) -> Response {
    Json(json!({ "ok": false, "error": error })).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{NaiveDate, Utc};
    use farescout_adapters::{observation, ScriptedBehavior, ScriptedScraper, StaticProvisioner};
    use farescout_core::{FlightRecord, Price};
    use farescout_scan::{
        OrchestratorSettings, ResultAggregator, ScanServices, TokioTaskEnvironment,
    };
    use farescout_storage::{MemoryFlightStore, OutputStore};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryFlightStore>,
        router: Router,
    }

    fn fixture(behavior: ScriptedBehavior) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryFlightStore::new());
        let outputs = OutputStore::new(dir.path());
        let scraper = Arc::new(ScriptedScraper::new().with_fallback(behavior));
        let services = ScanServices {
            provisioner: Arc::new(StaticProvisioner::new(vec![Location::new("US", "US")])),
            environment: Arc::new(TokioTaskEnvironment::new(
                scraper,
                outputs.clone(),
                Duration::from_millis(20),
            )),
            store: store.clone(),
            outputs: outputs.clone(),
            aggregator: ResultAggregator::new(store.clone(), outputs),
        };
        let settings = OrchestratorSettings {
            poll_interval: Duration::from_millis(20),
            termination_grace: Duration::from_millis(200),
            ..OrchestratorSettings::default()
        };
        let orchestrator = Orchestrator::new(services, settings);
        Fixture {
            _dir: dir,
            store,
            router: app(AppState::new(orchestrator)),
        }
    }

    fn record(location: &str, price: f64, stops: u32) -> FlightRecord {
        FlightRecord {
            id: None,
            run_id: Uuid::nil(),
            unit_id: location.into(),
            location_id: location.into(),
            departure_date: NaiveDate::from_ymd_opt(2026, 2, 16).unwrap(),
            return_date: NaiveDate::from_ymd_opt(2026, 2, 23).unwrap(),
            airline: "Air India".into(),
            price: Price { amount: price, currency: "GBP".into() },
            reference_price: Some(price),
            stop_count: Some(stops),
            duration_minutes: Some(540),
            source_site: "scripted".into(),
            booking_reference: None,
            discovered_at: Utc::now(),
            raw_metadata: serde_json::Value::Null,
        }
    }

    async fn get_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router
            .clone()
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    async fn post_json(router: &Router, uri: &str, body: serde_json::Value) -> serde_json::Value {
        let resp = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let fx = fixture(ScriptedBehavior::Records(vec![]));
        let resp = fx
            .router
            .oneshot(axum::http::Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn data_paginates_and_filters_direct_flights() {
        let fx = fixture(ScriptedBehavior::Records(vec![]));
        fx.store
            .append(&[
                record("US", 420.0, 1),
                record("JP", 390.0, 0),
                record("IN", 510.0, 0),
                record("US", 455.0, 0),
            ])
            .await
            .unwrap();

        let (status, body) = get_json(&fx.router, "/api/data?per_page=3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stats"]["best_price"], 390.0);
        assert_eq!(body["stats"]["total_records"], 4);
        assert_eq!(body["pagination"]["total_pages"], 2);
        assert_eq!(body["best_deals"].as_array().unwrap().len(), 3);
        assert_eq!(body["best_deals"][1]["reference_price"], 420.0);

        let (_, direct) = get_json(&fx.router, "/api/data?direct=true&page=1").await;
        assert_eq!(direct["pagination"]["total"], 3);
        let prices = direct["best_deals"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["reference_price"].as_f64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(prices, vec![390.0, 455.0, 510.0]);

        let (_, us) = get_json(&fx.router, "/api/data?location=US").await;
        assert_eq!(us["pagination"]["total"], 2);
    }

    #[tokio::test]
    async fn flight_lookup_returns_404_for_unknown_ids() {
        let fx = fixture(ScriptedBehavior::Records(vec![]));
        fx.store.append(&[record("US", 420.0, 1)]).await.unwrap();
        let (_, page) = get_json(&fx.router, "/api/data").await;
        let id = page["best_deals"][0]["id"].as_i64().unwrap();

        let (status, body) = get_json(&fx.router, &format!("/api/flights/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["location_id"], "US");

        let (status, _) = get_json(&fx.router, "/api/flights/9999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn location_stats_rank_cheapest_average_first() {
        let fx = fixture(ScriptedBehavior::Records(vec![]));
        fx.store
            .append(&[record("US", 400.0, 1), record("US", 500.0, 0), record("JP", 420.0, 0)])
            .await
            .unwrap();
        let (status, body) = get_json(&fx.router, "/api/locations/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["locations"][0]["location_id"], "JP");
        assert_eq!(body["locations"][1]["record_count"], 2);
    }

    #[tokio::test]
    async fn status_is_empty_before_any_run() {
        let fx = fixture(ScriptedBehavior::Records(vec![]));
        let (_, body) = get_json(&fx.router, "/api/scanner-status").await;
        assert_eq!(body["running"], false);
        assert!(body["summary"].is_null());
        assert_eq!(body["totals"]["total_units"], 0);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let fx = fixture(ScriptedBehavior::Hang);
        let first = post_json(&fx.router, "/api/start", json!({"origin": "LHR", "destination": "BOM"})).await;
        assert_eq!(first["ok"], true);
        assert!(first["run_id"].is_string());

        let second = post_json(&fx.router, "/api/start", json!({})).await;
        assert_eq!(second["ok"], false);
        assert_eq!(second["error"], "Scan already running");

        let (_, status) = get_json(&fx.router, "/api/scanner-status").await;
        assert_eq!(status["running"], true);

        let stopped = post_json(&fx.router, "/api/stop", json!({})).await;
        assert_eq!(stopped["ok"], true);
    }

    #[tokio::test]
    async fn invalid_start_bodies_are_reported_not_raised() {
        let fx = fixture(ScriptedBehavior::Records(vec![]));
        let same = post_json(&fx.router, "/api/start", json!({"origin": "BOM", "destination": "bom"})).await;
        assert_eq!(same["ok"], false);

        let bad_date = post_json(&fx.router, "/api/start", json!({"departure_date": "16/02/2026"})).await;
        assert_eq!(bad_date["ok"], false);
        assert!(bad_date["error"].as_str().unwrap().contains("16/02/2026"));
    }

    #[tokio::test]
    async fn started_runs_land_in_the_store() {
        let fx = fixture(ScriptedBehavior::Records(vec![observation("Emirates", 455.0, "GBP", 1)]));
        let started = post_json(
            &fx.router,
            "/api/start",
            json!({"countries": ["JP"], "departure_date": "2026-02-16", "return_date": "2026-02-23"}),
        )
        .await;
        assert_eq!(started["ok"], true);

        for _ in 0..200 {
            let (_, status) = get_json(&fx.router, "/api/scanner-status").await;
            if status["running"] == false {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let (_, status) = get_json(&fx.router, "/api/scanner-status").await;
        assert_eq!(status["summary"]["phase"], "done");
        assert_eq!(status["summary"]["locations_used"], json!(["baseline", "JP"]));

        let (_, data) = get_json(&fx.router, "/api/data").await;
        assert_eq!(data["stats"]["total_records"], 2);

        let (_, logs) = get_json(&fx.router, "/api/logs").await;
        assert!(!logs["logs"].as_array().unwrap().is_empty());
        let (_, drained) = get_json(&fx.router, "/api/logs").await;
        assert!(drained["logs"].as_array().unwrap().is_empty());
    }
}
