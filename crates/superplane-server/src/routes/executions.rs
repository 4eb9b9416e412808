//! Callbacks from runners, authenticated by the execution token handed out at
//! dispatch.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use superplane::model::{Execution, ExecutionResult};
use superplane::Error;

use crate::auth::bearer_token;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub const MAX_BODY_BYTES: usize = 4 * 1024;

#[derive(Debug, Deserialize)]
pub struct OutputsRequest {
    pub execution_id: Uuid,
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct FinishRequest {
    pub reference_id: String,
    pub result: ExecutionResult,
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/outputs", post(push_outputs))
        .route("/api/v1/executions/finish", post(finish))
}

fn verify_token(state: &AppState, headers: &HeaderMap, execution_id: Uuid) -> ApiResult<()> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthenticated)?;
    state
        .core
        .signer
        .validate_subject(token, &execution_id.to_string())
        .map_err(|e| {
            debug!(%execution_id, error = %e, "rejected execution token");
            ApiError::Unauthenticated
        })?;
    Ok(())
}

async fn push_outputs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<OutputsRequest>,
) -> ApiResult<Json<Execution>> {
    verify_token(&state, &headers, request.execution_id)?;
    let execution = state
        .core
        .tracker
        .record_outputs(request.execution_id, request.outputs)
        .await?;
    Ok(Json(execution))
}

async fn finish(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<FinishRequest>,
) -> ApiResult<Json<Execution>> {
    let execution = state
        .core
        .store
        .find_execution_by_reference(&request.reference_id)
        .await?
        .ok_or_else(|| Error::not_found("execution"))?;
    verify_token(&state, &headers, execution.id)?;

    let execution = state
        .core
        .tracker
        .finish(execution.id, request.result, request.outputs)
        .await?;
    Ok(Json(execution))
}
