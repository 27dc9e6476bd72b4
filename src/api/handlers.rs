//! API Handlers
//!
//! HTTP request handlers for each cache server endpoint.

use axum::{
    extract::{Path, State},
    Json,
};
use tokio::sync::watch;

use crate::engine::StorageEngine;
use crate::error::{CacheError, Result};
use crate::gc::GcState;
use crate::models::{
    GcStatusResponse, GetResponse, HealthResponse, PurgeRequest, PurgeResponse, SetRequest,
    SetResponse, StatsResponse,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Engine bound to this process's application
    pub engine: StorageEngine,
    /// Collector state, when this process runs a collector
    pub gc_state: Option<watch::Receiver<GcState>>,
}

impl AppState {
    /// Creates a new AppState without a collector.
    pub fn new(engine: StorageEngine) -> Self {
        Self {
            engine,
            gc_state: None,
        }
    }

    pub fn with_gc_state(mut self, gc_state: watch::Receiver<GcState>) -> Self {
        self.gc_state = Some(gc_state);
        self
    }
}

/// Handler for PUT /set
///
/// Stores a JSON value with a sliding TTL and indexes it in the given buckets.
/// Answers 503 when the cache failed open and nothing was stored.
pub async fn set_handler(
    State(state): State<AppState>,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>> {
    let provenance = req.provenance();
    let stored = state
        .engine
        .set(&req.key, &req.value, req.ttl, &req.buckets, &provenance)
        .await?;
    if !stored {
        return Err(CacheError::BackendUnavailable);
    }

    Ok(Json(SetResponse::new(req.key, req.buckets)))
}

/// Handler for GET /get/:key
///
/// A hit refreshes the entry's expiry and read count.
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>> {
    let raw = state
        .engine
        .get(&key)
        .await?
        .ok_or_else(|| CacheError::NotFound(key.clone()))?;
    let value = serde_json::from_str(&raw)?;

    Ok(Json(GetResponse::new(key, value)))
}

/// Handler for POST /purge
///
/// Deletes every entry in the named buckets.
pub async fn purge_handler(
    State(state): State<AppState>,
    Json(req): Json<PurgeRequest>,
) -> Result<Json<PurgeResponse>> {
    if !state.engine.purge_buckets(&req.buckets).await? {
        return Err(CacheError::BackendUnavailable);
    }

    Ok(Json(PurgeResponse::new(req.buckets)))
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let stats = state.engine.keyspace().stats().await;
    Json(StatsResponse::from(stats))
}

/// Handler for GET /health
///
/// Always 200; the body reports whether the cache is failing open.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::new(state.engine.is_online()))
}

/// Handler for GET /gc
pub async fn gc_handler(State(state): State<AppState>) -> Json<GcStatusResponse> {
    let gc_state = state.gc_state.as_ref().map(|state| *state.borrow());
    Json(GcStatusResponse {
        enabled: gc_state.is_some(),
        state: gc_state,
    })
}
