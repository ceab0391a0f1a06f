use annotations::{Action, Suggestion};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::jobs::enqueue_index_records;
use crate::routes_records::{check_suggestion, insert_suggestion, SuggestionInput};
use crate::rows::{
    convert_all, fetch_dataset, fetch_questions, fetch_record, SuggestionRow, SUGGESTION_COLUMNS,
};
use crate::state::SharedState;

pub async fn list_suggestions(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(record_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = fetch_record(&state.pg_pool, record_id).await?;
    let dataset = fetch_dataset(&state.pg_pool, record.dataset_id).await?;
    user.authorize(Action::ReadDataset, Some(dataset.workspace_id))?;

    let sql = format!("SELECT {SUGGESTION_COLUMNS} FROM suggestions WHERE record_id = $1 ORDER BY inserted_at");
    let rows: Vec<SuggestionRow> = sqlx::query_as(&sql).bind(record_id).fetch_all(&state.pg_pool).await?;
    let items: Vec<Suggestion> = convert_all(rows)?;

    Ok(Json(json!({ "items": items })))
}

/// One suggestion per question; a second PUT for the same question replaces it.
pub async fn upsert_suggestion(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(record_id): Path<Uuid>,
    Json(req): Json<SuggestionInput>,
) -> ApiResult<Json<Suggestion>> {
    let mut tx = state.pg_pool.begin().await?;
    let record = fetch_record(&mut *tx, record_id).await?;
    let dataset = fetch_dataset(&mut *tx, record.dataset_id).await?;
    user.authorize(Action::ManageSuggestions, Some(dataset.workspace_id))?;

    let questions = fetch_questions(&mut *tx, dataset.id).await?;
    check_suggestion(&questions, &req)?;

    let suggestion = insert_suggestion(&mut *tx, record_id, &req).await?;
    enqueue_index_records(&mut *tx, dataset.id, &[record_id]).await?;
    tx.commit().await?;

    info!(record_id=%record_id, question_id=%req.question_id, "suggestion saved");
    Ok(Json(suggestion))
}

pub async fn delete_suggestion(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let mut tx = state.pg_pool.begin().await?;
    let record_id: Option<Uuid> = sqlx::query_scalar("SELECT record_id FROM suggestions WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    let record_id = record_id.ok_or_else(|| ApiError::not_found("suggestion", id))?;
    let record = fetch_record(&mut *tx, record_id).await?;
    let dataset = fetch_dataset(&mut *tx, record.dataset_id).await?;
    user.authorize(Action::ManageSuggestions, Some(dataset.workspace_id))?;

    sqlx::query("DELETE FROM suggestions WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    enqueue_index_records(&mut *tx, dataset.id, &[record_id]).await?;
    tx.commit().await?;

    info!(suggestion_id=%id, record_id=%record_id, "suggestion deleted");
    Ok(StatusCode::NO_CONTENT)
}
