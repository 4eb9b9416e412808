use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use superplane::authz::RoleDefinition;
use superplane::model::{Canvas, EventSource, Secret, StageEvent, Tag, TagFilter, TagState};
use superplane::DomainKind;

use super::organizations::{members_of, Member};
use crate::auth::{CurrentUser, OrgId};
use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateCanvas {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateEventSource {
    pub name: String,
}

/// The verification key is only ever returned here.
#[derive(Debug, Serialize)]
pub struct EventSourceCreated {
    pub event_source: EventSource,
    pub key: String,
    pub webhook_url: String,
}

#[derive(Debug, Deserialize)]
pub struct SecretRequest {
    pub name: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct SecretValues {
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct SecretResponse {
    #[serde(flatten)]
    pub secret: Secret,
    pub keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddMember {
    pub user_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TagQuery {
    pub name: Option<String>,
    pub value: Option<String>,
    /// Comma-separated tag states.
    pub states: Option<String>,
    /// Stage id or name.
    pub stage: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTag {
    pub name: String,
    pub value: String,
    pub state: TagState,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/canvases", get(list).post(create))
        .route("/api/v1/canvases/{canvas_id}", get(describe))
        .route(
            "/api/v1/canvases/{canvas_id}/event-sources",
            get(list_event_sources).post(create_event_source),
        )
        .route(
            "/api/v1/canvases/{canvas_id}/event-sources/{source}",
            get(describe_event_source),
        )
        .route("/api/v1/canvases/{canvas_id}/secrets", get(list_secrets).post(create_secret))
        .route(
            "/api/v1/canvases/{canvas_id}/secrets/{name}",
            get(describe_secret).put(update_secret).delete(delete_secret),
        )
        .route("/api/v1/canvases/{canvas_id}/roles", get(list_roles))
        .route("/api/v1/canvases/{canvas_id}/members", get(list_members).post(add_member))
        .route("/api/v1/canvases/{canvas_id}/members/{user_id}", delete(remove_member))
        .route("/api/v1/canvases/{canvas_id}/tags", get(list_tags).put(update_tag))
}

async fn create(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    OrgId(org_id): OrgId,
    Json(request): Json<CreateCanvas>,
) -> ApiResult<(StatusCode, Json<Canvas>)> {
    let canvas = state.core.service.create_canvas(org_id, &request.name, &user).await?;
    Ok((StatusCode::CREATED, Json(canvas)))
}

async fn list(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    OrgId(org_id): OrgId,
) -> ApiResult<Json<Vec<Canvas>>> {
    Ok(Json(state.core.service.list_canvases(org_id, &user).await?))
}

/// Canvases are addressed by id or name. Names fall outside the route table,
/// so the organization permission is checked here as well.
async fn describe(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    OrgId(org_id): OrgId,
    Path(canvas): Path<String>,
) -> ApiResult<Json<Canvas>> {
    state
        .core
        .enforcer
        .require(&user, DomainKind::Org, &org_id.to_string(), "canvas", "read")?;
    Ok(Json(state.core.service.describe_canvas(org_id, &canvas).await?))
}

async fn create_event_source(
    State(state): State<AppState>,
    Path(canvas_id): Path<Uuid>,
    Json(request): Json<CreateEventSource>,
) -> ApiResult<(StatusCode, Json<EventSourceCreated>)> {
    let created = state
        .core
        .service
        .create_event_source(canvas_id, &request.name)
        .await?;
    let webhook_url = format!("{}/api/v1/sources/{}/webhook", state.base_url, created.source.id);
    Ok((
        StatusCode::CREATED,
        Json(EventSourceCreated {
            event_source: created.source,
            key: created.key,
            webhook_url,
        }),
    ))
}

async fn list_event_sources(
    State(state): State<AppState>,
    Path(canvas_id): Path<Uuid>,
) -> ApiResult<Json<Vec<EventSource>>> {
    Ok(Json(state.core.service.list_event_sources(canvas_id).await?))
}

async fn describe_event_source(
    State(state): State<AppState>,
    Path((canvas_id, source)): Path<(Uuid, String)>,
) -> ApiResult<Json<EventSource>> {
    Ok(Json(
        state
            .core
            .service
            .describe_event_source(canvas_id, &source)
            .await?,
    ))
}

async fn create_secret(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(canvas_id): Path<Uuid>,
    Json(request): Json<SecretRequest>,
) -> ApiResult<(StatusCode, Json<SecretResponse>)> {
    let secret = state
        .core
        .service
        .create_secret(canvas_id, &request.name, &request.data, &user)
        .await?;
    let keys = request.data.into_keys().collect();
    Ok((StatusCode::CREATED, Json(SecretResponse { secret, keys })))
}

async fn list_secrets(State(state): State<AppState>, Path(canvas_id): Path<Uuid>) -> ApiResult<Json<Vec<Secret>>> {
    Ok(Json(state.core.service.list_secrets(canvas_id).await?))
}

async fn describe_secret(
    State(state): State<AppState>,
    Path((canvas_id, name)): Path<(Uuid, String)>,
) -> ApiResult<Json<SecretResponse>> {
    let service = &state.core.service;
    let secret = service.describe_secret(canvas_id, &name).await?;
    let keys = service.secret_keys(canvas_id, &name).await?;
    Ok(Json(SecretResponse { secret, keys }))
}

async fn update_secret(
    State(state): State<AppState>,
    Path((canvas_id, name)): Path<(Uuid, String)>,
    Json(request): Json<SecretValues>,
) -> ApiResult<Json<SecretResponse>> {
    let secret = state
        .core
        .service
        .update_secret(canvas_id, &name, &request.data)
        .await?;
    let keys = request.data.into_keys().collect();
    Ok(Json(SecretResponse { secret, keys }))
}

async fn delete_secret(
    State(state): State<AppState>,
    Path((canvas_id, name)): Path<(Uuid, String)>,
) -> ApiResult<StatusCode> {
    state.core.service.delete_secret(canvas_id, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_roles(State(state): State<AppState>, Path(canvas_id): Path<Uuid>) -> ApiResult<Json<Vec<RoleDefinition>>> {
    Ok(Json(state.core.service.list_roles(DomainKind::Canvas, canvas_id).await?))
}

async fn list_members(State(state): State<AppState>, Path(canvas_id): Path<Uuid>) -> ApiResult<Json<Vec<Member>>> {
    let members = state.core.service.list_members(DomainKind::Canvas, canvas_id).await?;
    Ok(Json(members_of(members)))
}

async fn add_member(
    State(state): State<AppState>,
    Path(canvas_id): Path<Uuid>,
    Json(request): Json<AddMember>,
) -> ApiResult<StatusCode> {
    state
        .core
        .service
        .add_canvas_member(canvas_id, &request.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_member(
    State(state): State<AppState>,
    Path((canvas_id, user_id)): Path<(Uuid, String)>,
) -> ApiResult<StatusCode> {
    state
        .core
        .service
        .remove_canvas_member(canvas_id, &user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_tags(
    State(state): State<AppState>,
    Path(canvas_id): Path<Uuid>,
    Query(query): Query<TagQuery>,
) -> ApiResult<Json<Vec<Tag>>> {
    let service = &state.core.service;
    let stage_id = match query.stage.as_deref() {
        Some(stage) => Some(service.describe_stage(canvas_id, stage).await?.id),
        None => None,
    };
    let states = match query.states.as_deref() {
        Some(states) => split_list(states)
            .map(|s| TagState::parse(s).map_err(ApiError::from))
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    let filter = TagFilter {
        stage_id,
        name: query.name,
        value: query.value,
        states,
        ..Default::default()
    };
    Ok(Json(service.list_stage_tags(canvas_id, filter).await?))
}

/// Returns the stage events the change requeued.
async fn update_tag(
    State(state): State<AppState>,
    Path(canvas_id): Path<Uuid>,
    Json(request): Json<UpdateTag>,
) -> ApiResult<Json<Vec<StageEvent>>> {
    let requeued = state
        .core
        .service
        .update_tag_state(canvas_id, &request.name, &request.value, request.state)
        .await?;
    Ok(Json(requeued))
}

pub(crate) fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}
