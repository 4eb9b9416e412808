use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use superplane::authz::RoleDefinition;
use superplane::model::Organization;
use superplane::DomainKind;

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateOrganization {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrganization {
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
pub struct RoleAssignment {
    pub user_id: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroup {
    pub name: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupMember {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct GroupResponse {
    pub name: String,
    pub role: String,
    pub users: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct Member {
    pub user_id: String,
    pub roles: Vec<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/organizations", get(list).post(create))
        .route(
            "/api/v1/organizations/{org_id}",
            get(describe).patch(update).delete(remove),
        )
        .route("/api/v1/organizations/{org_id}/roles", get(list_roles))
        .route("/api/v1/organizations/{org_id}/roles/assign", post(assign_role))
        .route("/api/v1/organizations/{org_id}/roles/remove", post(remove_role))
        .route("/api/v1/organizations/{org_id}/roles/{role}", get(describe_role))
        .route("/api/v1/organizations/{org_id}/users", get(list_users))
        .route("/api/v1/organizations/{org_id}/groups", get(list_groups).post(create_group))
        .route("/api/v1/organizations/{org_id}/groups/{group}", get(describe_group))
        .route(
            "/api/v1/organizations/{org_id}/groups/{group}/users",
            get(list_group_users).post(add_group_user),
        )
        .route(
            "/api/v1/organizations/{org_id}/groups/{group}/users/{user_id}",
            delete(remove_group_user),
        )
}

async fn create(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<CreateOrganization>,
) -> ApiResult<(StatusCode, Json<Organization>)> {
    let org = state
        .core
        .service
        .create_organization(&request.name, &request.display_name, &user)
        .await?;
    Ok((StatusCode::CREATED, Json(org)))
}

async fn list(State(state): State<AppState>, CurrentUser(user): CurrentUser) -> ApiResult<Json<Vec<Organization>>> {
    Ok(Json(state.core.service.list_organizations(&user).await?))
}

async fn describe(State(state): State<AppState>, Path(org_id): Path<Uuid>) -> ApiResult<Json<Organization>> {
    Ok(Json(state.core.service.describe_organization(org_id).await?))
}

async fn update(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
    Json(request): Json<UpdateOrganization>,
) -> ApiResult<Json<Organization>> {
    let org = state
        .core
        .service
        .update_organization(org_id, &request.display_name)
        .await?;
    Ok(Json(org))
}

async fn remove(State(state): State<AppState>, Path(org_id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.core.service.delete_organization(org_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_roles(State(state): State<AppState>, Path(org_id): Path<Uuid>) -> ApiResult<Json<Vec<RoleDefinition>>> {
    Ok(Json(state.core.service.list_roles(DomainKind::Org, org_id).await?))
}

async fn describe_role(
    State(state): State<AppState>,
    Path((org_id, role)): Path<(Uuid, String)>,
) -> ApiResult<Json<RoleDefinition>> {
    Ok(Json(state.core.service.describe_role(DomainKind::Org, org_id, &role).await?))
}

async fn assign_role(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
    Json(request): Json<RoleAssignment>,
) -> ApiResult<StatusCode> {
    state
        .core
        .service
        .assign_role(DomainKind::Org, org_id, &request.user_id, &request.role)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_role(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
    Json(request): Json<RoleAssignment>,
) -> ApiResult<StatusCode> {
    state
        .core
        .service
        .remove_role(DomainKind::Org, org_id, &request.user_id, &request.role)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_users(State(state): State<AppState>, Path(org_id): Path<Uuid>) -> ApiResult<Json<Vec<Member>>> {
    let members = state.core.service.list_members(DomainKind::Org, org_id).await?;
    Ok(Json(members_of(members)))
}

async fn list_groups(State(state): State<AppState>, Path(org_id): Path<Uuid>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.core.service.list_groups(org_id).await?))
}

async fn create_group(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
    Json(request): Json<CreateGroup>,
) -> ApiResult<StatusCode> {
    state
        .core
        .service
        .create_group(org_id, &request.name, &request.role)
        .await?;
    Ok(StatusCode::CREATED)
}

async fn describe_group(
    State(state): State<AppState>,
    Path((org_id, group)): Path<(Uuid, String)>,
) -> ApiResult<Json<GroupResponse>> {
    let users = state.core.service.group_users(org_id, &group).await?;
    let role = state.core.enforcer.group_role(&org_id.to_string(), &group)?;
    Ok(Json(GroupResponse { name: group, role, users }))
}

async fn list_group_users(
    State(state): State<AppState>,
    Path((org_id, group)): Path<(Uuid, String)>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.core.service.group_users(org_id, &group).await?))
}

async fn add_group_user(
    State(state): State<AppState>,
    Path((org_id, group)): Path<(Uuid, String)>,
    Json(request): Json<GroupMember>,
) -> ApiResult<StatusCode> {
    state
        .core
        .service
        .add_user_to_group(org_id, &group, &request.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_group_user(
    State(state): State<AppState>,
    Path((org_id, group, user_id)): Path<(Uuid, String, String)>,
) -> ApiResult<StatusCode> {
    state
        .core
        .service
        .remove_user_from_group(org_id, &group, &user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) fn members_of(members: BTreeMap<String, Vec<String>>) -> Vec<Member> {
    members
        .into_iter()
        .map(|(user_id, roles)| Member { user_id, roles })
        .collect()
}
