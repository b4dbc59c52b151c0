use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::ingest::{IngestError, IngestOutcome, Ingestor};
use crate::measurement::StorableMeasurement;
use crate::store::{DeviceSeries, MeasurementStore, SaveOutcome, StoreError};
use crate::Bytes;

/// Initialize tracing subscriber for native builds.
/// Uses RUST_LOG env var for filtering (defaults to info).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(true))
        .with(filter)
        .init();
}

type HandlerError = (StatusCode, String);

#[derive(Clone)]
struct AppState {
    ingestor: Arc<Ingestor>,
    store: Arc<MeasurementStore>,
}

/// Receiver router: accepts published measurements and answers latest-value and range queries.
pub fn build_router(store: Arc<MeasurementStore>) -> Router {
    let state = AppState {
        ingestor: Arc::new(Ingestor::new(store.clone())),
        store,
    };

    Router::new()
        .route("/v1/topics/:topic", post(handle_publish))
        .route("/v1/latest", get(handle_latest))
        .route("/v1/measurements", get(handle_range))
        .route("/v1/measurements/delayed", get(handle_delayed))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<IngestOutcome> for PublishResponse {
    fn from(outcome: IngestOutcome) -> Self {
        match outcome {
            IngestOutcome::Stored(SaveOutcome::Inserted) => Self {
                status: "stored".into(),
                reason: None,
            },
            IngestOutcome::Stored(SaveOutcome::AlreadyExists) => Self {
                status: "duplicate".into(),
                reason: None,
            },
            IngestOutcome::Rejected(reason) => Self {
                status: "rejected".into(),
                reason: Some(reason),
            },
        }
    }
}

/// Run blocking store work off the async runtime.
async fn blocking<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.unwrap_or_else(|e| {
        error!(error = %e, "store task failed");
        Err(StoreError::Task(e.to_string()).into())
    })
}

fn store_failure(e: StoreError) -> HandlerError {
    error!(error = %e, "store query failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Invalid measurements are acknowledged so the sender drops them; storage failures are not,
/// so an at-least-once sender retries.
async fn handle_publish(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    body: Bytes,
) -> Result<Json<PublishResponse>, HandlerError> {
    debug!(topic = %topic, bytes = body.len(), "received publish");

    let ingestor = state.ingestor.clone();
    let outcome = blocking(move || ingestor.ingest(body))
        .await
        .map_err(|e| match e {
            IngestError::Decompress(_) | IngestError::Decode(_) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            IngestError::Store(e) => store_failure(e),
        })?;

    Ok(Json(outcome.into()))
}

#[derive(Debug, Deserialize)]
struct LatestParams {
    #[serde(default)]
    devices: String,
}

async fn handle_latest(
    State(state): State<AppState>,
    Query(params): Query<LatestParams>,
) -> Result<Json<BTreeMap<String, StorableMeasurement>>, HandlerError> {
    let ids: Vec<String> = params
        .devices
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect();

    let store = state.store.clone();
    blocking(move || store.get_latest(&ids))
        .await
        .map(Json)
        .map_err(store_failure)
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    since: DateTime<Utc>,
    until: Option<DateTime<Utc>>,
}

async fn handle_range(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Result<Json<DeviceSeries>, HandlerError> {
    let store = state.store.clone();
    blocking(move || match params.until {
        Some(until) => store.between(params.since, until),
        None => store.since(params.since),
    })
    .await
    .map(Json)
    .map_err(store_failure)
}

#[derive(Debug, Deserialize)]
struct DelayedParams {
    since: DateTime<Utc>,
}

async fn handle_delayed(
    State(state): State<AppState>,
    Query(params): Query<DelayedParams>,
) -> Result<Json<DeviceSeries>, HandlerError> {
    let store = state.store.clone();
    blocking(move || store.delayed_since(params.since))
        .await
        .map(Json)
        .map_err(store_failure)
}
