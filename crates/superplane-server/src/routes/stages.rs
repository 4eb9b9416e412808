use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use superplane::model::{Connection, Execution, Stage, StageEvent, StageEventState};
use superplane::StageSpec;

use super::canvases::split_list;
use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StageResponse {
    #[serde(flatten)]
    pub stage: Stage,
    pub connections: Vec<Connection>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StageEventQuery {
    /// Comma-separated stage event states; all states when absent.
    pub states: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/canvases/{canvas_id}/stages", get(list).post(create))
        .route("/api/v1/canvases/{canvas_id}/stages/{stage}", get(describe).put(update))
        .route("/api/v1/canvases/{canvas_id}/stages/{stage}/events", get(list_events))
        .route(
            "/api/v1/canvases/{canvas_id}/stages/{stage}/events/{event_id}/approve",
            post(approve_event),
        )
        .route(
            "/api/v1/canvases/{canvas_id}/stages/{stage}/events/{event_id}/cancel",
            post(cancel_event),
        )
        .route("/api/v1/canvases/{canvas_id}/stages/{stage}/executions", get(list_executions))
        .route(
            "/api/v1/canvases/{canvas_id}/stages/{stage}/executions/{execution_id}",
            get(describe_execution),
        )
        .route(
            "/api/v1/canvases/{canvas_id}/stages/{stage}/executions/{execution_id}/cancel",
            post(cancel_execution),
        )
}

async fn with_connections(state: &AppState, canvas_id: Uuid, stage: Stage) -> ApiResult<StageResponse> {
    let connections = state
        .core
        .service
        .list_connections(canvas_id, &stage.id.to_string())
        .await?;
    Ok(StageResponse { stage, connections })
}

async fn create(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(canvas_id): Path<Uuid>,
    Json(spec): Json<StageSpec>,
) -> ApiResult<(StatusCode, Json<StageResponse>)> {
    let stage = state.core.service.create_stage(canvas_id, spec, &user).await?;
    let response = with_connections(&state, canvas_id, stage).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn list(State(state): State<AppState>, Path(canvas_id): Path<Uuid>) -> ApiResult<Json<Vec<Stage>>> {
    Ok(Json(state.core.service.list_stages(canvas_id).await?))
}

async fn describe(
    State(state): State<AppState>,
    Path((canvas_id, stage)): Path<(Uuid, String)>,
) -> ApiResult<Json<StageResponse>> {
    let stage = state.core.service.describe_stage(canvas_id, &stage).await?;
    Ok(Json(with_connections(&state, canvas_id, stage).await?))
}

async fn update(
    State(state): State<AppState>,
    Path((canvas_id, stage)): Path<(Uuid, String)>,
    Json(spec): Json<StageSpec>,
) -> ApiResult<Json<StageResponse>> {
    let stage = state.core.service.update_stage(canvas_id, &stage, spec).await?;
    Ok(Json(with_connections(&state, canvas_id, stage).await?))
}

async fn list_events(
    State(state): State<AppState>,
    Path((canvas_id, stage)): Path<(Uuid, String)>,
    Query(query): Query<StageEventQuery>,
) -> ApiResult<Json<Vec<StageEvent>>> {
    let states = match query.states.as_deref() {
        Some(states) => split_list(states)
            .map(|s| StageEventState::parse(s).map_err(ApiError::from))
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    let events = state
        .core
        .service
        .list_stage_events(canvas_id, &stage, &states)
        .await?;
    Ok(Json(events))
}

async fn approve_event(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((canvas_id, stage, event_id)): Path<(Uuid, String, Uuid)>,
) -> ApiResult<Json<StageEvent>> {
    let event = state
        .core
        .service
        .approve_stage_event(canvas_id, &stage, event_id, &user)
        .await?;
    Ok(Json(event))
}

async fn cancel_event(
    State(state): State<AppState>,
    Path((canvas_id, stage, event_id)): Path<(Uuid, String, Uuid)>,
) -> ApiResult<Json<StageEvent>> {
    let event = state
        .core
        .service
        .cancel_stage_event(canvas_id, &stage, event_id)
        .await?;
    Ok(Json(event))
}

async fn list_executions(
    State(state): State<AppState>,
    Path((canvas_id, stage)): Path<(Uuid, String)>,
) -> ApiResult<Json<Vec<Execution>>> {
    Ok(Json(state.core.service.list_executions(canvas_id, &stage).await?))
}

async fn describe_execution(
    State(state): State<AppState>,
    Path((canvas_id, stage, execution_id)): Path<(Uuid, String, Uuid)>,
) -> ApiResult<Json<Execution>> {
    Ok(Json(
        state
            .core
            .service
            .describe_execution(canvas_id, &stage, execution_id)
            .await?,
    ))
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path((canvas_id, stage, execution_id)): Path<(Uuid, String, Uuid)>,
) -> ApiResult<Json<Execution>> {
    Ok(Json(
        state
            .core
            .service
            .cancel_execution(canvas_id, &stage, execution_id)
            .await?,
    ))
}
