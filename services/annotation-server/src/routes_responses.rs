//! Response mutations. Each one recounts the record's submitted responses in
//! the same serializable transaction, so these handlers all run inside
//! [`retry_serializable`].

use annotations::{
    validate::validate_response_values, Action, Response, ResponseStatus, WebhookEvent,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sqlx::PgConnection;
use tracing::info;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::events::notify_tx;
use crate::jobs::enqueue_index_records;
use crate::record_status::refresh_record_status;
use crate::retry::{begin_serializable, retry_serializable};
use crate::routes_datasets::dataset_with_access;
use crate::routes_records::{touch_dataset, MAX_BULK_ITEMS};
use crate::rows::{fetch_dataset, fetch_questions, fetch_record, fetch_response, ResponseRow, RESPONSE_COLUMNS};
use crate::state::SharedState;

#[derive(Clone, Debug, Deserialize)]
pub struct ResponseUpsert {
    pub status: ResponseStatus,
    #[serde(default)]
    pub values: Option<Map<String, JsonValue>>,
}

#[derive(sqlx::FromRow)]
struct UpsertRow {
    #[sqlx(flatten)]
    response: ResponseRow,
    inserted: bool,
}

/// Checks that the caller may answer `record_id` and that the values fit the
/// dataset's questions. Returns the dataset id.
async fn check_response(
    conn: &mut PgConnection,
    user: &CurrentUser,
    record_id: Uuid,
    req: &ResponseUpsert,
) -> ApiResult<Uuid> {
    let record = fetch_record(&mut *conn, record_id).await?;
    let dataset = fetch_dataset(&mut *conn, record.dataset_id).await?;
    user.authorize(Action::CreateResponse, Some(dataset.workspace_id))?;

    let questions = fetch_questions(&mut *conn, dataset.id).await?;
    validate_response_values(&questions, req.status, req.values.as_ref())?;
    Ok(dataset.id)
}

/// Inserts or replaces `user_id`'s response to `record_id` and runs the
/// follow-up work: status refresh, reindex, and the webhook event.
async fn upsert_response_tx(
    conn: &mut PgConnection,
    record_id: Uuid,
    user_id: Uuid,
    dataset_id: Uuid,
    req: &ResponseUpsert,
) -> ApiResult<Response> {
    let sql = format!(
        r#"
        INSERT INTO responses (id, record_id, user_id, status, "values")
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (record_id, user_id) DO UPDATE
        SET status = EXCLUDED.status, "values" = EXCLUDED."values", updated_at = NOW()
        RETURNING {RESPONSE_COLUMNS}, (xmax = 0) AS inserted
        "#
    );
    let row: UpsertRow = sqlx::query_as(&sql)
        .bind(Uuid::new_v4())
        .bind(record_id)
        .bind(user_id)
        .bind(req.status.as_str())
        .bind(req.values.clone().map(JsonValue::Object))
        .fetch_one(&mut *conn)
        .await?;
    let inserted = row.inserted;
    let response: Response = row.response.try_into()?;

    refresh_record_status(&mut *conn, record_id).await?;
    enqueue_index_records(&mut *conn, dataset_id, &[record_id]).await?;
    let event = if inserted {
        WebhookEvent::ResponseCreated
    } else {
        WebhookEvent::ResponseUpdated
    };
    notify_tx(&mut *conn, event, &response).await?;
    Ok(response)
}

pub async fn upsert_response(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(record_id): Path<Uuid>,
    Json(req): Json<ResponseUpsert>,
) -> ApiResult<(StatusCode, Json<Response>)> {
    let mut conn = state.pg_pool.acquire().await?;
    let dataset_id = check_response(&mut *conn, &user, record_id, &req).await?;
    drop(conn);

    let response = retry_serializable(&state.config.serializable_retry, || {
        let pool = state.pg_pool.clone();
        let req = req.clone();
        let user_id = user.id;
        async move {
            let mut tx = begin_serializable(&pool).await?;
            let response = upsert_response_tx(&mut *tx, record_id, user_id, dataset_id, &req).await?;
            tx.commit().await?;
            Ok::<_, ApiError>(response)
        }
    })
    .await?;

    touch_dataset(&state, dataset_id).await;
    info!(record_id=%record_id, user_id=%user.id, status=%response.status, "response saved");
    Ok((StatusCode::CREATED, Json(response)))
}

/// Loads a response and checks the caller may modify it. Returns it along with
/// its dataset id.
async fn owned_response(
    conn: &mut PgConnection,
    user: &CurrentUser,
    id: Uuid,
) -> ApiResult<(Response, Uuid)> {
    let response = fetch_response(&mut *conn, id).await?;
    let record = fetch_record(&mut *conn, response.record_id).await?;
    let dataset = fetch_dataset(&mut *conn, record.dataset_id).await?;
    user.authorize(
        Action::ModifyResponse {
            own: response.user_id == user.id,
        },
        Some(dataset.workspace_id),
    )?;
    Ok((response, dataset.id))
}

pub async fn update_response(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResponseUpsert>,
) -> ApiResult<Json<Response>> {
    let mut conn = state.pg_pool.acquire().await?;
    let (current, dataset_id) = owned_response(&mut *conn, &user, id).await?;
    let questions = fetch_questions(&mut *conn, dataset_id).await?;
    validate_response_values(&questions, req.status, req.values.as_ref())?;
    drop(conn);

    let record_id = current.record_id;
    let response = retry_serializable(&state.config.serializable_retry, || {
        let pool = state.pg_pool.clone();
        let req = req.clone();
        async move {
            let mut tx = begin_serializable(&pool).await?;
            let sql = format!(
                r#"
                UPDATE responses
                SET status = $2, "values" = $3, updated_at = NOW()
                WHERE id = $1
                RETURNING {RESPONSE_COLUMNS}
                "#
            );
            let row: Option<ResponseRow> = sqlx::query_as(&sql)
                .bind(id)
                .bind(req.status.as_str())
                .bind(req.values.clone().map(JsonValue::Object))
                .fetch_optional(&mut *tx)
                .await?;
            let response: Response = row.ok_or_else(|| ApiError::not_found("response", id))?.try_into()?;

            refresh_record_status(&mut *tx, record_id).await?;
            enqueue_index_records(&mut *tx, dataset_id, &[record_id]).await?;
            notify_tx(&mut *tx, WebhookEvent::ResponseUpdated, &response).await?;
            tx.commit().await?;
            Ok::<_, ApiError>(response)
        }
    })
    .await?;

    touch_dataset(&state, dataset_id).await;
    Ok(Json(response))
}

pub async fn delete_response(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let mut conn = state.pg_pool.acquire().await?;
    let (current, dataset_id) = owned_response(&mut *conn, &user, id).await?;
    drop(conn);

    let record_id = current.record_id;
    retry_serializable(&state.config.serializable_retry, || {
        let pool = state.pg_pool.clone();
        async move {
            let mut tx = begin_serializable(&pool).await?;
            let sql = format!("DELETE FROM responses WHERE id = $1 RETURNING {RESPONSE_COLUMNS}");
            let row: Option<ResponseRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *tx).await?;
            let Some(row) = row else {
                return Err(ApiError::not_found("response", id));
            };
            let response: Response = row.try_into()?;

            refresh_record_status(&mut *tx, record_id).await?;
            enqueue_index_records(&mut *tx, dataset_id, &[record_id]).await?;
            notify_tx(&mut *tx, WebhookEvent::ResponseDeleted, &response).await?;
            tx.commit().await?;
            Ok(())
        }
    })
    .await?;

    touch_dataset(&state, dataset_id).await;
    info!(response_id=%id, record_id=%record_id, "response deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Clone, Debug, Deserialize)]
pub struct BulkResponseItem {
    pub record_id: Uuid,
    #[serde(flatten)]
    pub response: ResponseUpsert,
}

#[derive(Deserialize)]
pub struct BulkResponses {
    pub items: Vec<BulkResponseItem>,
}

#[derive(Serialize)]
pub struct BulkItemResult {
    pub item: Option<Response>,
    pub error: Option<JsonValue>,
}

impl From<ApiResult<Response>> for BulkItemResult {
    fn from(result: ApiResult<Response>) -> Self {
        match result {
            Ok(item) => BulkItemResult { item: Some(item), error: None },
            Err(e) => BulkItemResult { item: None, error: Some(e.detail()) },
        }
    }
}

async fn upsert_bulk_item(
    state: &SharedState,
    user: &CurrentUser,
    dataset_id: Uuid,
    item: &BulkResponseItem,
) -> ApiResult<Response> {
    let mut conn = state.pg_pool.acquire().await?;
    let record_dataset = check_response(&mut *conn, user, item.record_id, &item.response).await?;
    drop(conn);
    if record_dataset != dataset_id {
        return Err(ApiError::not_found("record", item.record_id));
    }

    retry_serializable(&state.config.serializable_retry, || {
        let pool = state.pg_pool.clone();
        let req = item.response.clone();
        let record_id = item.record_id;
        let user_id = user.id;
        async move {
            let mut tx = begin_serializable(&pool).await?;
            let response = upsert_response_tx(&mut *tx, record_id, user_id, dataset_id, &req).await?;
            tx.commit().await?;
            Ok::<_, ApiError>(response)
        }
    })
    .await
}

/// Upserts the caller's responses one transaction per item; a failing item
/// does not roll back the others.
pub async fn upsert_responses_bulk(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(dataset_id): Path<Uuid>,
    Json(req): Json<BulkResponses>,
) -> ApiResult<Json<serde_json::Value>> {
    dataset_with_access(&state.pg_pool, &user, dataset_id, Action::CreateResponse).await?;
    if req.items.is_empty() || req.items.len() > MAX_BULK_ITEMS {
        return Err(ApiError::Unprocessable(format!(
            "expected between 1 and {MAX_BULK_ITEMS} responses"
        )));
    }

    let mut items = Vec::with_capacity(req.items.len());
    let mut failed = 0usize;
    for item in &req.items {
        let result = upsert_bulk_item(&state, &user, dataset_id, item).await;
        if result.is_err() {
            failed += 1;
        }
        items.push(BulkItemResult::from(result));
    }

    touch_dataset(&state, dataset_id).await;
    info!(dataset_id=%dataset_id, user_id=%user.id, total = items.len(), failed, "bulk responses processed");
    Ok(Json(serde_json::json!({ "items": items })))
}
