use annotations::Action;
use axum::{
    extract::{Path, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;

#[derive(Serialize, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub kind: String,
    pub status: String,
    pub payload: JsonValue,
    pub attempts: i32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

const JOB_COLUMNS: &str =
    "id, kind, status, payload, attempts, run_at, last_error, created_at, updated_at, finished_at";

pub async fn get_job(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobRow>> {
    user.authorize(Action::ReadJobs, None)?;

    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
    let row: Option<JobRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&state.pg_pool).await?;
    row.map(Json).ok_or_else(|| ApiError::not_found("job", id))
}

pub async fn list_jobs(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<serde_json::Value>> {
    user.authorize(Action::ReadJobs, None)?;

    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT 50");
    let items: Vec<JobRow> = sqlx::query_as(&sql).fetch_all(&state.pg_pool).await?;
    Ok(Json(serde_json::json!({ "items": items })))
}
