use annotations::{
    validate::{validate_field_settings, validate_name, validate_question_settings},
    Action, Dataset, DatasetStatus, Distribution, Field, FieldSettings, Question, QuestionSettings,
    UserRole, WebhookEvent,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use search_index::IndexSpec;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::events::notify_tx;
use crate::jobs::{enqueue_tx, JobKind};
use crate::rows::{
    convert_all, fetch_dataset, fetch_fields, fetch_questions, lock_dataset, DatasetRow, FieldRow,
    QuestionRow, DATASET_COLUMNS, FIELD_COLUMNS, QUESTION_COLUMNS,
};
use crate::state::SharedState;

/// Loads a dataset and checks `action` against its workspace.
pub async fn dataset_with_access(
    pool: &PgPool,
    user: &CurrentUser,
    dataset_id: Uuid,
    action: Action,
) -> ApiResult<Dataset> {
    let dataset = fetch_dataset(pool, dataset_id).await?;
    user.authorize(action, Some(dataset.workspace_id))?;
    Ok(dataset)
}

#[derive(Deserialize)]
pub struct ListDatasetsParams {
    pub workspace_id: Option<Uuid>,
}

pub async fn list_datasets(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Query(params): Query<ListDatasetsParams>,
) -> ApiResult<Json<JsonValue>> {
    let sql = format!(
        r#"
        SELECT {DATASET_COLUMNS} FROM datasets
        WHERE ($1::uuid IS NULL OR workspace_id = $1)
          AND ($2 OR workspace_id = ANY($3))
        ORDER BY inserted_at
        "#
    );
    let rows: Vec<DatasetRow> = sqlx::query_as(&sql)
        .bind(params.workspace_id)
        .bind(user.role == UserRole::Owner)
        .bind(&user.workspaces)
        .fetch_all(&state.pg_pool)
        .await?;
    let items: Vec<Dataset> = convert_all(rows)?;

    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
pub struct CreateDataset {
    pub name: String,
    #[serde(default)]
    pub guidelines: Option<String>,
    #[serde(default = "default_true")]
    pub allow_extra_metadata: bool,
    #[serde(default)]
    pub distribution: Option<Distribution>,
    pub workspace_id: Uuid,
}

fn default_true() -> bool {
    true
}

fn check_distribution(distribution: &Distribution) -> ApiResult<()> {
    distribution
        .validate()
        .map_err(|e| ApiError::Unprocessable(e.to_string()))
}

pub async fn create_dataset(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<CreateDataset>,
) -> ApiResult<(StatusCode, Json<Dataset>)> {
    user.authorize(Action::ManageDataset, Some(req.workspace_id))?;
    validate_name(&req.name)?;
    let distribution = req.distribution.unwrap_or_default();
    check_distribution(&distribution)?;

    let mut tx = state.pg_pool.begin().await?;

    let sql = format!(
        r#"
        INSERT INTO datasets (id, name, guidelines, allow_extra_metadata, status, distribution, workspace_id)
        VALUES ($1, $2, $3, $4, 'draft', $5, $6)
        RETURNING {DATASET_COLUMNS}
        "#
    );
    let row: DatasetRow = sqlx::query_as(&sql)
        .bind(Uuid::new_v4())
        .bind(&req.name)
        .bind(&req.guidelines)
        .bind(req.allow_extra_metadata)
        .bind(json!(distribution))
        .bind(req.workspace_id)
        .fetch_one(&mut *tx)
        .await?;
    let dataset: Dataset = row.try_into()?;

    notify_tx(&mut *tx, WebhookEvent::DatasetCreated, &dataset).await?;
    tx.commit().await?;

    info!(dataset_id=%dataset.id, name=%dataset.name, "dataset created");
    Ok((StatusCode::CREATED, Json(dataset)))
}

pub async fn get_dataset(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Dataset>> {
    let dataset = dataset_with_access(&state.pg_pool, &user, id, Action::ReadDataset).await?;
    Ok(Json(dataset))
}

#[derive(Deserialize)]
pub struct UpdateDataset {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub guidelines: Option<String>,
    #[serde(default)]
    pub allow_extra_metadata: Option<bool>,
    #[serde(default)]
    pub distribution: Option<Distribution>,
}

pub async fn update_dataset(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateDataset>,
) -> ApiResult<Json<Dataset>> {
    if let Some(name) = &req.name {
        validate_name(name)?;
    }
    if let Some(d) = &req.distribution {
        check_distribution(d)?;
    }

    let mut tx = state.pg_pool.begin().await?;
    let current = lock_dataset(&mut *tx, id).await?;
    user.authorize(Action::ManageDataset, Some(current.workspace_id))?;

    let distribution_changed = req
        .distribution
        .as_ref()
        .is_some_and(|d| *d != current.distribution);

    if distribution_changed && current.is_ready() {
        let has_responses: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM responses rs
                JOIN records r ON r.id = rs.record_id
                WHERE r.dataset_id = $1
            )
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if has_responses {
            return Err(ApiError::Conflict(
                "distribution cannot be modified for a published dataset with responses".into(),
            ));
        }
    }

    let sql = format!(
        r#"
        UPDATE datasets
        SET name = COALESCE($2, name),
            guidelines = COALESCE($3, guidelines),
            allow_extra_metadata = COALESCE($4, allow_extra_metadata),
            distribution = COALESCE($5, distribution),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {DATASET_COLUMNS}
        "#
    );
    let row: DatasetRow = sqlx::query_as(&sql)
        .bind(id)
        .bind(&req.name)
        .bind(&req.guidelines)
        .bind(req.allow_extra_metadata)
        .bind(req.distribution.as_ref().map(|d| json!(d)))
        .fetch_one(&mut *tx)
        .await?;
    let dataset: Dataset = row.try_into()?;

    if distribution_changed {
        enqueue_tx(&mut *tx, &JobKind::RefreshDatasetRecordsStatus { dataset_id: id }).await?;
    }
    notify_tx(&mut *tx, WebhookEvent::DatasetUpdated, &dataset).await?;
    tx.commit().await?;

    info!(dataset_id=%id, distribution_changed, "dataset updated");
    Ok(Json(dataset))
}

pub async fn delete_dataset(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let mut tx = state.pg_pool.begin().await?;
    let dataset = lock_dataset(&mut *tx, id).await?;
    user.authorize(Action::ManageDataset, Some(dataset.workspace_id))?;

    sqlx::query("DELETE FROM datasets WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    if dataset.is_ready() {
        enqueue_tx(&mut *tx, &JobKind::DeleteIndex { dataset_id: id }).await?;
    }
    notify_tx(&mut *tx, WebhookEvent::DatasetDeleted, &dataset).await?;
    tx.commit().await?;

    info!(dataset_id=%id, "dataset deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn publish_dataset(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Dataset>> {
    let mut tx = state.pg_pool.begin().await?;
    let dataset = lock_dataset(&mut *tx, id).await?;
    user.authorize(Action::ManageDataset, Some(dataset.workspace_id))?;

    if dataset.is_ready() {
        return Err(ApiError::Unprocessable("dataset is already published".into()));
    }

    let fields = fetch_fields(&mut *tx, id).await?;
    let questions = fetch_questions(&mut *tx, id).await?;
    check_publishable(&fields, &questions)?;

    let sql = format!(
        r#"
        UPDATE datasets
        SET status = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING {DATASET_COLUMNS}
        "#
    );
    let row: DatasetRow = sqlx::query_as(&sql)
        .bind(id)
        .bind(DatasetStatus::Ready.as_str())
        .fetch_one(&mut *tx)
        .await?;
    let published: Dataset = row.try_into()?;

    // The index must exist before the status change becomes visible.
    let spec = IndexSpec {
        dataset_id: id,
        fields: fields.iter().map(|f| f.name.clone()).collect(),
        questions: questions.iter().map(|q| q.name.clone()).collect(),
    };
    state.search.create_index(&spec).await?;

    notify_tx(&mut *tx, WebhookEvent::DatasetPublished, &published).await?;
    tx.commit().await?;

    info!(dataset_id=%id, "dataset published");
    Ok(Json(published))
}

fn check_publishable(fields: &[Field], questions: &[Question]) -> ApiResult<()> {
    if !fields.iter().any(|f| f.required) {
        return Err(ApiError::Unprocessable(
            "dataset cannot be published without required fields".into(),
        ));
    }
    if !questions.iter().any(|q| q.required) {
        return Err(ApiError::Unprocessable(
            "dataset cannot be published without required questions".into(),
        ));
    }
    Ok(())
}

pub async fn get_progress(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JsonValue>> {
    dataset_with_access(&state.pg_pool, &user, id, Action::ReadDataset).await?;

    let (total, completed): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*), COUNT(*) FILTER (WHERE status = 'completed')
        FROM records
        WHERE dataset_id = $1
        "#,
    )
    .bind(id)
    .fetch_one(&state.pg_pool)
    .await?;

    Ok(Json(json!({
        "total": total,
        "completed": completed,
        "pending": total - completed,
    })))
}

#[derive(Deserialize)]
pub struct CreateField {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub required: bool,
    pub settings: FieldSettings,
}

pub async fn list_fields(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JsonValue>> {
    dataset_with_access(&state.pg_pool, &user, id, Action::ReadDataset).await?;
    let items = fetch_fields(&state.pg_pool, id).await?;
    Ok(Json(json!({ "items": items })))
}

pub async fn create_field(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateField>,
) -> ApiResult<(StatusCode, Json<Field>)> {
    validate_name(&req.name)?;
    validate_field_settings(&req.settings)?;

    let mut tx = state.pg_pool.begin().await?;
    let dataset = lock_dataset(&mut *tx, id).await?;
    user.authorize(Action::ManageDataset, Some(dataset.workspace_id))?;
    if !dataset.is_draft() {
        return Err(ApiError::Unprocessable("fields can only be added to draft datasets".into()));
    }

    let sql = format!(
        r#"
        INSERT INTO fields (id, name, title, required, settings, dataset_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {FIELD_COLUMNS}
        "#
    );
    let row: FieldRow = sqlx::query_as(&sql)
        .bind(Uuid::new_v4())
        .bind(&req.name)
        .bind(&req.title)
        .bind(req.required)
        .bind(json!(req.settings))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(row.try_into()?)))
}

#[derive(Deserialize)]
pub struct CreateQuestion {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    pub settings: QuestionSettings,
}

pub async fn list_questions(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JsonValue>> {
    dataset_with_access(&state.pg_pool, &user, id, Action::ReadDataset).await?;
    let items = fetch_questions(&state.pg_pool, id).await?;
    Ok(Json(json!({ "items": items })))
}

pub async fn create_question(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateQuestion>,
) -> ApiResult<(StatusCode, Json<Question>)> {
    validate_name(&req.name)?;
    validate_question_settings(&req.settings)?;

    let mut tx = state.pg_pool.begin().await?;
    let dataset = lock_dataset(&mut *tx, id).await?;
    user.authorize(Action::ManageDataset, Some(dataset.workspace_id))?;
    if !dataset.is_draft() {
        return Err(ApiError::Unprocessable("questions can only be added to draft datasets".into()));
    }

    let sql = format!(
        r#"
        INSERT INTO questions (id, name, title, description, required, settings, dataset_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {QUESTION_COLUMNS}
        "#
    );
    let row: QuestionRow = sqlx::query_as(&sql)
        .bind(Uuid::new_v4())
        .bind(&req.name)
        .bind(&req.title)
        .bind(&req.description)
        .bind(req.required)
        .bind(json!(req.settings))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(row.try_into()?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use annotations::RatingOption;
    use chrono::Utc;

    fn field(required: bool) -> Field {
        Field {
            id: Uuid::new_v4(),
            name: "text".into(),
            title: "Text".into(),
            required,
            settings: FieldSettings::Text { use_markdown: false },
            dataset_id: Uuid::nil(),
            inserted_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn question(required: bool) -> Question {
        Question {
            id: Uuid::new_v4(),
            name: "rating".into(),
            title: "Rating".into(),
            description: None,
            required,
            settings: QuestionSettings::Rating {
                options: vec![RatingOption { value: 1 }, RatingOption { value: 2 }],
            },
            dataset_id: Uuid::nil(),
            inserted_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn publishing_needs_required_field_and_question() {
        assert!(check_publishable(&[field(true)], &[question(true)]).is_ok());
        assert!(check_publishable(&[field(false)], &[question(true)]).is_err());
        assert!(check_publishable(&[field(true)], &[question(false)]).is_err());
        assert!(check_publishable(&[], &[]).is_err());
    }

    #[test]
    fn only_overlap_distributions_are_accepted() {
        assert!(check_distribution(&Distribution::overlap(2)).is_ok());
        assert!(matches!(
            check_distribution(&Distribution::overlap(0)),
            Err(ApiError::Unprocessable(_))
        ));
        let other: Distribution =
            serde_json::from_value(json!({"strategy": "round_robin", "min_submitted": 1})).unwrap();
        assert!(matches!(check_distribution(&other), Err(ApiError::Unprocessable(_))));
    }
}
