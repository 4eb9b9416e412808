//! Webhook intake. Callers are authenticated by the source's HMAC key, not by
//! a session.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use superplane::Error;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub const MAX_BODY_BYTES: usize = 64 * 1024;

const GITHUB_SIGNATURE: &str = "x-hub-signature-256";
const SEMAPHORE_SIGNATURE: &str = "x-semaphore-signature-256";
const GENERIC_SIGNATURE: &str = "x-signature-256";

#[derive(Debug, Serialize)]
pub struct ReceiveResponse {
    pub event_id: Uuid,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/sources/{source_id}/github", post(github))
        .route("/api/v1/sources/{source_id}/semaphore", post(semaphore))
        .route("/api/v1/sources/{source_id}/webhook", post(webhook))
}

async fn github(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ReceiveResponse>)> {
    receive(&state, &source_id, &headers, &body, GITHUB_SIGNATURE).await
}

async fn semaphore(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ReceiveResponse>)> {
    receive(&state, &source_id, &headers, &body, SEMAPHORE_SIGNATURE).await
}

async fn webhook(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ReceiveResponse>)> {
    receive(&state, &source_id, &headers, &body, GENERIC_SIGNATURE).await
}

async fn receive(
    state: &AppState,
    source_id: &str,
    headers: &HeaderMap,
    body: &[u8],
    signature_header: &str,
) -> ApiResult<(StatusCode, Json<ReceiveResponse>)> {
    let source_id = Uuid::parse_str(source_id).map_err(|_| Error::not_found("event source"))?;
    let service = &state.core.service;
    let source = state
        .core
        .store
        .find_event_source(source_id)
        .await?
        .ok_or_else(|| Error::not_found("event source"))?;

    let signature = headers
        .get(signature_header)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::InvalidSignature("missing signature"))?;
    if !service.verify_signature(&source, body, signature)? {
        debug!(source_id = %source.id, "webhook signature mismatch");
        return Err(ApiError::InvalidSignature("invalid signature"));
    }

    let event = service.receive_event(&source, body, header_map(headers)).await?;
    info!(source_id = %source.id, event_id = %event.id, "event received");
    Ok((StatusCode::OK, Json(ReceiveResponse { event_id: event.id })))
}

/// Request headers as persisted with the event. Repeated headers are joined
/// with `, `; values that are not visible ASCII are skipped.
fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}
