//! The thin `/resolve` HTTP handler wrapping the index manager and
//! resolver: parameter validation, snapshot selection, acquisition,
//! and error-taxonomy-to-status-code mapping.
//!
//! The `ApiError` / `IntoResponse` split mirrors the typed-error-to-status
//! mapping pattern used for other JSON APIs in this style: a typed error
//! enum at the library boundary, with the HTTP status mapping kept next to
//! the route it serves.

use std::sync::Arc;

use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::discovery;
use crate::error::ResolverError;
use crate::lockfile;
use crate::manager::{AcquireOptions, IndexManager};
use crate::resolver;
use crate::util;

/// Shared application state handed to every handler.
pub struct AppState {
    pub manager: IndexManager,
    pub archive_index_url: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/resolve", get(resolve_get).post(resolve_post))
        .with_state(state)
}

#[derive(Deserialize)]
pub struct ResolveParams {
    lockfile_base64: String,
    published_time: String,
}

#[derive(Serialize, Default)]
pub struct ResolveResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    commit_hash: Option<String>,
}

/// `GET /resolve?lockfile_base64=...&published_time=...`: parameters come
/// from the query string.
async fn resolve_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ResolveParams>,
) -> Result<Json<ResolveResponse>, ApiError> {
    resolve(state, params).await
}

/// `POST /resolve` with an `application/x-www-form-urlencoded` body
/// carrying the same two parameters.
async fn resolve_post(
    State(state): State<Arc<AppState>>,
    Form(params): Form<ResolveParams>,
) -> Result<Json<ResolveResponse>, ApiError> {
    resolve(state, params).await
}

async fn resolve(
    state: Arc<AppState>,
    params: ResolveParams,
) -> Result<Json<ResolveResponse>, ApiError> {
    if params.lockfile_base64.is_empty() || params.published_time.is_empty() {
        return Err(ApiError(ResolverError::invalid(
            "lockfile_base64 and published_time are required",
        )));
    }

    let published = util::parse_rfc3339(&params.published_time).map_err(ApiError)?;

    let lockfile_bytes = base64::engine::general_purpose::STANDARD
        .decode(&params.lockfile_base64)
        .map_err(|e| ApiError(ResolverError::invalid(format!("invalid base64: {e}"))))?;
    let lockfile_text = String::from_utf8(lockfile_bytes)
        .map_err(|e| ApiError(ResolverError::invalid(format!("lockfile is not utf-8: {e}"))))?;
    let packages = lockfile::parse_lockfile(&lockfile_text).map_err(ApiError)?;

    let snapshot_dates = discovery::list_available_snapshots(&state.archive_index_url)
        .map_err(ApiError)?;
    let keys =
        lockfile::select_relevant_keys(&snapshot_dates, published.date_naive()).map_err(ApiError)?;

    if keys.is_empty() {
        return Ok(Json(ResolveResponse::default()));
    }

    let mut handles = state
        .manager
        .acquire(
            keys,
            AcquireOptions {
                contains: Some(published),
            },
        )
        .await
        .map_err(ApiError)?;

    let result = resolver::find_registry_resolution(&handles, &packages, published);

    for handle in &mut handles {
        handle.close();
    }

    let resolution = result.map_err(ApiError)?;

    Ok(Json(ResolveResponse {
        commit_hash: Some(resolution.commit_hash),
    }))
}

/// Wraps [`ResolverError`] so it can implement [`IntoResponse`] here
/// without an orphan-rule violation (the error type lives in this crate
/// but a blanket `IntoResponse` impl for it would also need to live where
/// it's used as a handler's error type; keeping it in `http.rs` keeps the
/// status-code mapping next to the route it serves).
pub struct ApiError(ResolverError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "resolve request failed");

        let (status, retry_after) = match &self.0 {
            ResolverError::Invalid(_) => (StatusCode::BAD_REQUEST, None),
            ResolverError::RegistryOutOfDate {
                next_update_time, ..
            } => {
                let now = chrono::Utc::now();
                let secs = (*next_update_time - now).num_seconds().max(0);
                (StatusCode::SERVICE_UNAVAILABLE, Some(secs))
            }
            ResolverError::NotFound | ResolverError::NoMatches => (StatusCode::NOT_FOUND, None),
            ResolverError::Capacity => (StatusCode::SERVICE_UNAVAILABLE, None),
            ResolverError::Network(_) | ResolverError::Storage(_) | ResolverError::Update(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
            ResolverError::Cancelled => (StatusCode::from_u16(499).unwrap(), None),
        };

        let body = Json(serde_json::json!({ "error": self.0.to_string() }));

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert("Retry-After", secs.to_string().parse().unwrap());
        }
        response
    }
}
