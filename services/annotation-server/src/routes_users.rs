use annotations::{validate::validate_name, Action, User, UserRole, Workspace};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgConnection;
use tracing::info;
use uuid::Uuid;

use crate::auth::{generate_api_key, CurrentUser};
use crate::error::{ApiError, ApiResult};
use crate::rows::{convert_all, UserRow, WorkspaceRow};
use crate::state::SharedState;

#[derive(Serialize)]
pub struct Me {
    #[serde(flatten)]
    pub user: User,
    pub workspaces: Vec<Uuid>,
}

pub async fn get_me(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<Me>> {
    let row: UserRow = sqlx::query_as(
        "SELECT id, username, first_name, role, inserted_at, updated_at FROM users WHERE id = $1",
    )
    .bind(user.id)
    .fetch_one(&state.pg_pool)
    .await?;

    Ok(Json(Me {
        user: row.try_into()?,
        workspaces: user.workspaces,
    }))
}

pub async fn list_users(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<serde_json::Value>> {
    user.authorize(Action::ManageUsers, None)?;

    let rows: Vec<UserRow> = sqlx::query_as(
        "SELECT id, username, first_name, role, inserted_at, updated_at FROM users ORDER BY inserted_at",
    )
    .fetch_all(&state.pg_pool)
    .await?;
    let items: Vec<User> = convert_all(rows)?;

    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
pub struct CreateUser {
    pub username: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default = "default_role")]
    pub role: UserRole,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub workspace_ids: Vec<Uuid>,
}

fn default_role() -> UserRole {
    UserRole::Annotator
}

#[derive(Serialize)]
pub struct CreatedUser {
    #[serde(flatten)]
    pub user: User,
    pub api_key: String,
}

pub async fn create_user(
    State(state): State<SharedState>,
    Extension(actor): Extension<CurrentUser>,
    Json(req): Json<CreateUser>,
) -> ApiResult<(StatusCode, Json<CreatedUser>)> {
    actor.authorize(Action::ManageUsers, None)?;
    validate_name(&req.username)?;

    let api_key = match req.api_key {
        Some(k) if k.trim().len() >= 8 => k,
        Some(_) => return Err(ApiError::Unprocessable("api_key must have at least 8 characters".into())),
        None => generate_api_key(),
    };

    let mut tx = state.pg_pool.begin().await?;

    let row: UserRow = sqlx::query_as(
        r#"
        INSERT INTO users (id, username, first_name, role, api_key)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, username, first_name, role, inserted_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&req.username)
    .bind(&req.first_name)
    .bind(req.role.as_str())
    .bind(&api_key)
    .fetch_one(&mut *tx)
    .await?;

    for workspace_id in &req.workspace_ids {
        add_member(&mut *tx, *workspace_id, row.id).await?;
    }

    tx.commit().await?;

    let user: User = row.try_into()?;
    info!(user_id=%user.id, username=%user.username, role=%user.role, "user created");
    Ok((StatusCode::CREATED, Json(CreatedUser { user, api_key })))
}

pub async fn list_workspaces(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let rows: Vec<WorkspaceRow> = if user.role == UserRole::Owner {
        sqlx::query_as("SELECT id, name, inserted_at, updated_at FROM workspaces ORDER BY inserted_at")
            .fetch_all(&state.pg_pool)
            .await?
    } else {
        sqlx::query_as(
            "SELECT id, name, inserted_at, updated_at FROM workspaces WHERE id = ANY($1) ORDER BY inserted_at",
        )
        .bind(&user.workspaces)
        .fetch_all(&state.pg_pool)
        .await?
    };
    let items: Vec<Workspace> = rows.into_iter().map(Workspace::from).collect();

    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
pub struct CreateWorkspace {
    pub name: String,
}

pub async fn create_workspace(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<CreateWorkspace>,
) -> ApiResult<(StatusCode, Json<Workspace>)> {
    user.authorize(Action::ManageWorkspaces, None)?;
    validate_name(&req.name)?;

    let row: WorkspaceRow = sqlx::query_as(
        r#"
        INSERT INTO workspaces (id, name)
        VALUES ($1, $2)
        RETURNING id, name, inserted_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&req.name)
    .fetch_one(&state.pg_pool)
    .await?;

    info!(workspace_id=%row.id, name=%row.name, "workspace created");
    Ok((StatusCode::CREATED, Json(row.into())))
}

#[derive(Deserialize)]
pub struct AddWorkspaceUser {
    pub user_id: Uuid,
}

pub async fn add_workspace_user(
    State(state): State<SharedState>,
    Extension(actor): Extension<CurrentUser>,
    Path(workspace_id): Path<Uuid>,
    Json(req): Json<AddWorkspaceUser>,
) -> ApiResult<StatusCode> {
    actor.authorize(Action::ManageWorkspaces, None)?;

    let mut tx = state.pg_pool.begin().await?;
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM workspaces WHERE id = $1)")
        .bind(workspace_id)
        .fetch_one(&mut *tx)
        .await?;
    if !exists {
        return Err(ApiError::not_found("workspace", workspace_id));
    }
    add_member(&mut *tx, workspace_id, req.user_id).await?;
    tx.commit().await?;

    info!(workspace_id=%workspace_id, user_id=%req.user_id, "workspace member added");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_member(conn: &mut PgConnection, workspace_id: Uuid, user_id: Uuid) -> ApiResult<()> {
    sqlx::query(
        r#"
        INSERT INTO workspaces_users (workspace_id, user_id)
        VALUES ($1, $2)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(workspace_id)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
