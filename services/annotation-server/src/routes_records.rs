use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use annotations::{
    validate::{validate_metadata, validate_record_fields, validate_response_values, validate_suggestion},
    Action, Field, Question, Record, RecordStatus, Response, ResponseStatus, Suggestion,
    SuggestionType, UserRole, ValidationError, WebhookEvent,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use search_index::{SearchQuery, MAX_LIMIT};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use sqlx::PgConnection;
use tracing::info;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::events::notify_tx;
use crate::jobs::{enqueue_index_records, enqueue_tx, JobKind};
use crate::record_status::refresh_record_status;
use crate::retry::{begin_serializable, retry_serializable};
use crate::routes_datasets::dataset_with_access;
use crate::rows::{
    convert_all, fetch_dataset, fetch_fields, fetch_questions, fetch_record, RecordRow, ResponseRow,
    SuggestionRow, RECORD_COLUMNS, RESPONSE_COLUMNS, SUGGESTION_COLUMNS,
};
use crate::state::SharedState;

pub const MAX_BULK_ITEMS: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Include {
    Responses,
    Suggestions,
}

impl Include {
    fn parse_list(raw: Option<&str>) -> ApiResult<Vec<Include>> {
        let Some(raw) = raw else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| match s {
                "responses" => Ok(Include::Responses),
                "suggestions" => Ok(Include::Suggestions),
                other => Err(ApiError::Unprocessable(format!("unknown include `{other}`"))),
            })
            .collect()
    }
}

#[derive(Serialize)]
pub struct RecordView {
    #[serde(flatten)]
    pub record: Record,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responses: Option<Vec<Response>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<Suggestion>>,
}

/// Attaches responses and suggestions. Annotators only see their own responses.
pub async fn load_views(
    conn: &mut PgConnection,
    user: &CurrentUser,
    records: Vec<Record>,
    include: &[Include],
) -> ApiResult<Vec<RecordView>> {
    let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();

    let mut responses: HashMap<Uuid, Vec<Response>> = HashMap::new();
    if include.contains(&Include::Responses) {
        let only_user = (user.role == UserRole::Annotator).then_some(user.id);
        let sql = format!(
            r#"
            SELECT {RESPONSE_COLUMNS} FROM responses
            WHERE record_id = ANY($1) AND ($2::uuid IS NULL OR user_id = $2)
            ORDER BY inserted_at
            "#
        );
        let rows: Vec<ResponseRow> = sqlx::query_as(&sql)
            .bind(&ids)
            .bind(only_user)
            .fetch_all(&mut *conn)
            .await?;
        for r in convert_all::<_, Response>(rows)? {
            responses.entry(r.record_id).or_default().push(r);
        }
    }

    let mut suggestions: HashMap<Uuid, Vec<Suggestion>> = HashMap::new();
    if include.contains(&Include::Suggestions) {
        let sql = format!(
            "SELECT {SUGGESTION_COLUMNS} FROM suggestions WHERE record_id = ANY($1) ORDER BY inserted_at"
        );
        let rows: Vec<SuggestionRow> = sqlx::query_as(&sql).bind(&ids).fetch_all(&mut *conn).await?;
        for s in convert_all::<_, Suggestion>(rows)? {
            suggestions.entry(s.record_id).or_default().push(s);
        }
    }

    Ok(records
        .into_iter()
        .map(|record| {
            let id = record.id;
            RecordView {
                record,
                responses: include
                    .contains(&Include::Responses)
                    .then(|| responses.remove(&id).unwrap_or_default()),
                suggestions: include
                    .contains(&Include::Suggestions)
                    .then(|| suggestions.remove(&id).unwrap_or_default()),
            }
        })
        .collect())
}

#[derive(Clone, Debug, Deserialize)]
pub struct InlineResponse {
    pub user_id: Uuid,
    pub status: ResponseStatus,
    #[serde(default)]
    pub values: Option<Map<String, JsonValue>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SuggestionInput {
    pub question_id: Uuid,
    pub value: JsonValue,
    #[serde(default)]
    pub score: Option<JsonValue>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<SuggestionType>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RecordCreate {
    pub fields: Map<String, JsonValue>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub responses: Vec<InlineResponse>,
    #[serde(default)]
    pub suggestions: Vec<SuggestionInput>,
}

#[derive(Deserialize)]
pub struct BulkRecords {
    pub items: Vec<RecordCreate>,
}

pub fn check_suggestion(questions: &[Question], s: &SuggestionInput) -> ApiResult<()> {
    let question = questions
        .iter()
        .find(|q| q.id == s.question_id)
        .ok_or_else(|| ValidationError::UnknownQuestion(s.question_id.to_string()))?;
    validate_suggestion(question, &s.value, s.score.as_ref())?;
    Ok(())
}

pub fn check_record_create(item: &RecordCreate, fields: &[Field], questions: &[Question]) -> ApiResult<()> {
    validate_record_fields(fields, &item.fields)?;
    if let Some(metadata) = item.metadata.as_ref().filter(|m| !m.is_null()) {
        validate_metadata(metadata)?;
    }

    let mut users = HashSet::new();
    for r in &item.responses {
        if !users.insert(r.user_id) {
            return Err(ApiError::Unprocessable(format!(
                "more than one response for user {}",
                r.user_id
            )));
        }
        validate_response_values(questions, r.status, r.values.as_ref())?;
    }

    let mut seen = HashSet::new();
    for s in &item.suggestions {
        if !seen.insert(s.question_id) {
            return Err(ApiError::Unprocessable(format!(
                "more than one suggestion for question {}",
                s.question_id
            )));
        }
        check_suggestion(questions, s)?;
    }
    Ok(())
}

pub async fn insert_suggestion(
    conn: &mut PgConnection,
    record_id: Uuid,
    s: &SuggestionInput,
) -> ApiResult<Suggestion> {
    let sql = format!(
        r#"
        INSERT INTO suggestions (id, record_id, question_id, value, score, agent, type)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (record_id, question_id) DO UPDATE
        SET value = EXCLUDED.value, score = EXCLUDED.score, agent = EXCLUDED.agent,
            type = EXCLUDED.type, updated_at = NOW()
        RETURNING {SUGGESTION_COLUMNS}
        "#
    );
    let row: SuggestionRow = sqlx::query_as(&sql)
        .bind(Uuid::new_v4())
        .bind(record_id)
        .bind(s.question_id)
        .bind(&s.value)
        .bind(&s.score)
        .bind(&s.agent)
        .bind(s.kind.map(|k| k.as_str()))
        .fetch_one(conn)
        .await?;
    row.try_into()
}

async fn insert_records(
    conn: &mut PgConnection,
    dataset_id: Uuid,
    items: &[RecordCreate],
) -> ApiResult<Vec<Record>> {
    let mut created = Vec::with_capacity(items.len());

    for item in items {
        let sql = format!(
            r#"
            INSERT INTO records (id, dataset_id, external_id, fields, metadata)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {RECORD_COLUMNS}
            "#
        );
        let row: RecordRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(dataset_id)
            .bind(&item.external_id)
            .bind(JsonValue::Object(item.fields.clone()))
            .bind(item.metadata.as_ref().filter(|m| !m.is_null()))
            .fetch_one(&mut *conn)
            .await?;
        let record_id = row.id;

        for r in &item.responses {
            let sql = format!(
                r#"
                INSERT INTO responses (id, record_id, user_id, status, "values")
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {RESPONSE_COLUMNS}
                "#
            );
            let row: ResponseRow = sqlx::query_as(&sql)
                .bind(Uuid::new_v4())
                .bind(record_id)
                .bind(r.user_id)
                .bind(r.status.as_str())
                .bind(r.values.clone().map(JsonValue::Object))
                .fetch_one(&mut *conn)
                .await?;
            let response: Response = row.try_into()?;
            notify_tx(&mut *conn, WebhookEvent::ResponseCreated, &response).await?;
        }

        for s in &item.suggestions {
            insert_suggestion(&mut *conn, record_id, s).await?;
        }

        if !item.responses.is_empty() {
            refresh_record_status(&mut *conn, record_id).await?;
        }

        let record = fetch_record(&mut *conn, record_id).await?;
        notify_tx(&mut *conn, WebhookEvent::RecordCreated, &record).await?;
        created.push(record);
    }

    let ids: Vec<Uuid> = created.iter().map(|r| r.id).collect();
    enqueue_index_records(&mut *conn, dataset_id, &ids).await?;
    Ok(created)
}

pub async fn create_records_bulk(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(dataset_id): Path<Uuid>,
    Json(req): Json<BulkRecords>,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
    let dataset = dataset_with_access(&state.pg_pool, &user, dataset_id, Action::ManageRecords).await?;
    if req.items.is_empty() || req.items.len() > MAX_BULK_ITEMS {
        return Err(ApiError::Unprocessable(format!(
            "expected between 1 and {MAX_BULK_ITEMS} records"
        )));
    }
    if !dataset.is_ready() {
        return Err(ApiError::Unprocessable(
            "records cannot be created for a non published dataset".into(),
        ));
    }

    let fields = fetch_fields(&state.pg_pool, dataset_id).await?;
    let questions = fetch_questions(&state.pg_pool, dataset_id).await?;
    for (idx, item) in req.items.iter().enumerate() {
        check_record_create(item, &fields, &questions)
            .map_err(|e| ApiError::Unprocessable(format!("record at position {idx} is not valid: {e}")))?;
    }

    let items = Arc::new(req.items);
    let created = retry_serializable(&state.config.serializable_retry, || {
        let pool = state.pg_pool.clone();
        let items = items.clone();
        async move {
            let mut tx = begin_serializable(&pool).await?;
            let created = insert_records(&mut *tx, dataset_id, &items).await?;
            tx.commit().await?;
            Ok::<_, ApiError>(created)
        }
    })
    .await?;

    touch_dataset(&state, dataset_id).await;
    info!(dataset_id=%dataset_id, count = created.len(), "records created");
    Ok((StatusCode::CREATED, Json(json!({ "items": created }))))
}

/// Bumps `last_activity_at` outside the mutation's transaction so that
/// concurrent annotators of one dataset do not conflict on the dataset row.
pub async fn touch_dataset(state: &SharedState, dataset_id: Uuid) {
    if let Err(e) = sqlx::query("UPDATE datasets SET last_activity_at = NOW() WHERE id = $1")
        .bind(dataset_id)
        .execute(&state.pg_pool)
        .await
    {
        tracing::warn!(dataset_id=%dataset_id, "failed to update dataset activity: {e:?}");
    }
}

#[derive(Deserialize)]
pub struct ListRecordsParams {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub include: Option<String>,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_records(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(dataset_id): Path<Uuid>,
    Query(params): Query<ListRecordsParams>,
) -> ApiResult<Json<JsonValue>> {
    dataset_with_access(&state.pg_pool, &user, dataset_id, Action::ReadDataset).await?;
    let include = Include::parse_list(params.include.as_deref())?;
    if params.offset < 0 || params.limit < 1 || params.limit > MAX_LIMIT as i64 {
        return Err(ApiError::Unprocessable(format!(
            "offset must be >= 0 and limit within 1..={MAX_LIMIT}"
        )));
    }
    let status = params.status.map(|s| s.as_str());

    let mut conn = state.pg_pool.acquire().await?;
    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM records WHERE dataset_id = $1 AND ($2::text IS NULL OR status = $2)",
    )
    .bind(dataset_id)
    .bind(status)
    .fetch_one(&mut *conn)
    .await?;

    let sql = format!(
        r#"
        SELECT {RECORD_COLUMNS} FROM records
        WHERE dataset_id = $1 AND ($2::text IS NULL OR status = $2)
        ORDER BY inserted_at, id
        OFFSET $3 LIMIT $4
        "#
    );
    let rows: Vec<RecordRow> = sqlx::query_as(&sql)
        .bind(dataset_id)
        .bind(status)
        .bind(params.offset)
        .bind(params.limit)
        .fetch_all(&mut *conn)
        .await?;
    let records: Vec<Record> = convert_all(rows)?;
    let items = load_views(&mut *conn, &user, records, &include).await?;

    Ok(Json(json!({ "items": items, "total": total })))
}

#[derive(Deserialize)]
pub struct DeleteRecordsParams {
    pub ids: String,
}

fn parse_ids(raw: &str) -> ApiResult<Vec<Uuid>> {
    let ids = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Uuid>().map_err(|_| ApiError::Unprocessable(format!("`{s}` is not a valid id"))))
        .collect::<ApiResult<Vec<_>>>()?;
    if ids.is_empty() || ids.len() > MAX_BULK_ITEMS {
        return Err(ApiError::Unprocessable(format!(
            "expected between 1 and {MAX_BULK_ITEMS} ids"
        )));
    }
    Ok(ids)
}

async fn delete_records_tx(conn: &mut PgConnection, dataset_id: Uuid, ids: &[Uuid]) -> ApiResult<usize> {
    let sql = format!(
        "DELETE FROM records WHERE dataset_id = $1 AND id = ANY($2) RETURNING {RECORD_COLUMNS}"
    );
    let rows: Vec<RecordRow> = sqlx::query_as(&sql)
        .bind(dataset_id)
        .bind(ids)
        .fetch_all(&mut *conn)
        .await?;
    let deleted: Vec<Record> = convert_all(rows)?;
    if deleted.is_empty() {
        return Ok(0);
    }

    let record_ids: Vec<Uuid> = deleted.iter().map(|r| r.id).collect();
    enqueue_tx(&mut *conn, &JobKind::DeleteRecords { dataset_id, record_ids }).await?;
    for record in &deleted {
        notify_tx(&mut *conn, WebhookEvent::RecordDeleted, record).await?;
    }
    Ok(deleted.len())
}

pub async fn delete_records(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(dataset_id): Path<Uuid>,
    Query(params): Query<DeleteRecordsParams>,
) -> ApiResult<StatusCode> {
    dataset_with_access(&state.pg_pool, &user, dataset_id, Action::ManageRecords).await?;
    let ids = parse_ids(&params.ids)?;

    let mut tx = state.pg_pool.begin().await?;
    let deleted = delete_records_tx(&mut *tx, dataset_id, &ids).await?;
    tx.commit().await?;

    info!(dataset_id=%dataset_id, deleted, "records deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct SearchRecords {
    #[serde(flatten)]
    pub query: SearchQuery,
    #[serde(default)]
    pub include: Vec<Include>,
}

/// Annotators may only filter on their own responses.
pub fn scope_query(user: &CurrentUser, mut query: SearchQuery) -> SearchQuery {
    if user.role == UserRole::Annotator {
        if let Some(filter) = query.filters.response.as_mut() {
            filter.user_id = Some(user.id);
        }
    }
    query
}

#[derive(Serialize)]
struct SearchHit {
    record: RecordView,
    query_score: Option<f32>,
}

pub async fn search_records(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(dataset_id): Path<Uuid>,
    Json(req): Json<SearchRecords>,
) -> ApiResult<Json<JsonValue>> {
    let dataset = dataset_with_access(&state.pg_pool, &user, dataset_id, Action::ReadDataset).await?;
    if !dataset.is_ready() {
        return Err(ApiError::Unprocessable("dataset is not published".into()));
    }

    let query = scope_query(&user, req.query);
    query.validate()?;
    let found = state.search.search(dataset_id, &query).await?;

    let ids: Vec<Uuid> = found.items.iter().map(|i| i.record_id).collect();
    let mut conn = state.pg_pool.acquire().await?;
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE dataset_id = $1 AND id = ANY($2)");
    let rows: Vec<RecordRow> = sqlx::query_as(&sql)
        .bind(dataset_id)
        .bind(&ids)
        .fetch_all(&mut *conn)
        .await?;
    let mut by_id: HashMap<Uuid, Record> = convert_all::<_, Record>(rows)?
        .into_iter()
        .map(|r| (r.id, r))
        .collect();

    // Keep engine order; hits deleted since the last sync are skipped.
    let mut scores = Vec::with_capacity(ids.len());
    let mut ordered = Vec::with_capacity(ids.len());
    for item in &found.items {
        if let Some(record) = by_id.remove(&item.record_id) {
            scores.push(item.score);
            ordered.push(record);
        }
    }

    let views = load_views(&mut *conn, &user, ordered, &req.include).await?;
    let items: Vec<SearchHit> = views
        .into_iter()
        .zip(scores)
        .map(|(record, query_score)| SearchHit { record, query_score })
        .collect();

    Ok(Json(json!({ "items": items, "total": found.total })))
}

#[derive(Deserialize)]
pub struct GetRecordParams {
    #[serde(default)]
    pub include: Option<String>,
}

pub async fn get_record(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Query(params): Query<GetRecordParams>,
) -> ApiResult<Json<RecordView>> {
    let include = match params.include.as_deref() {
        None => vec![Include::Responses, Include::Suggestions],
        raw => Include::parse_list(raw)?,
    };

    let mut conn = state.pg_pool.acquire().await?;
    let record = fetch_record(&mut *conn, id).await?;
    let dataset = fetch_dataset(&mut *conn, record.dataset_id).await?;
    user.authorize(Action::ReadDataset, Some(dataset.workspace_id))?;

    let mut views = load_views(&mut *conn, &user, vec![record], &include).await?;
    views.pop().map(Json).ok_or_else(|| ApiError::not_found("record", id))
}

#[derive(Deserialize)]
pub struct UpdateRecord {
    #[serde(default)]
    pub metadata: Option<JsonValue>,
    #[serde(default)]
    pub suggestions: Option<Vec<SuggestionInput>>,
}

pub async fn update_record(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateRecord>,
) -> ApiResult<Json<Record>> {
    let mut tx = state.pg_pool.begin().await?;
    let current = fetch_record(&mut *tx, id).await?;
    let dataset = fetch_dataset(&mut *tx, current.dataset_id).await?;
    user.authorize(Action::ManageRecords, Some(dataset.workspace_id))?;

    if let Some(metadata) = &req.metadata {
        if !metadata.is_null() {
            validate_metadata(metadata)?;
        }
        sqlx::query("UPDATE records SET metadata = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(Some(metadata).filter(|m| !m.is_null()))
            .execute(&mut *tx)
            .await?;
    }

    if let Some(suggestions) = &req.suggestions {
        let questions = fetch_questions(&mut *tx, dataset.id).await?;
        for s in suggestions {
            check_suggestion(&questions, s)?;
            insert_suggestion(&mut *tx, id, s).await?;
        }
    }

    let record = fetch_record(&mut *tx, id).await?;
    enqueue_index_records(&mut *tx, dataset.id, &[id]).await?;
    notify_tx(&mut *tx, WebhookEvent::RecordUpdated, &record).await?;
    tx.commit().await?;

    Ok(Json(record))
}

pub async fn delete_record(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let mut tx = state.pg_pool.begin().await?;
    let record = fetch_record(&mut *tx, id).await?;
    let dataset = fetch_dataset(&mut *tx, record.dataset_id).await?;
    user.authorize(Action::ManageRecords, Some(dataset.workspace_id))?;

    delete_records_tx(&mut *tx, dataset.id, &[id]).await?;
    tx.commit().await?;

    info!(record_id=%id, "record deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use annotations::{FieldSettings, LabelOption, QuestionSettings};
    use chrono::Utc;
    use search_index::{Filters, ResponseFilter, ResponseStatusFilter};

    fn field() -> Field {
        Field {
            id: Uuid::new_v4(),
            name: "text".into(),
            title: "Text".into(),
            required: true,
            settings: FieldSettings::Text { use_markdown: false },
            dataset_id: Uuid::nil(),
            inserted_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn label_question() -> Question {
        let opt = |v: &str| LabelOption { value: v.into(), text: None, description: None };
        Question {
            id: Uuid::new_v4(),
            name: "label".into(),
            title: "Label".into(),
            description: None,
            required: true,
            settings: QuestionSettings::LabelSelection {
                options: vec![opt("pos"), opt("neg")],
                visible_options: None,
            },
            dataset_id: Uuid::nil(),
            inserted_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn item(v: JsonValue) -> RecordCreate {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn record_items_are_checked_against_schema() {
        let fields = vec![field()];
        let q = label_question();
        let questions = vec![q.clone()];
        let user = Uuid::new_v4();

        let ok = item(json!({
            "fields": {"text": "hello"},
            "metadata": {"split": "train"},
            "responses": [{"user_id": user, "status": "submitted", "values": {"label": {"value": "pos"}}}],
            "suggestions": [{"question_id": q.id, "value": "neg", "score": 0.4, "type": "model"}]
        }));
        assert!(check_record_create(&ok, &fields, &questions).is_ok());

        let missing_field = item(json!({"fields": {}}));
        assert!(check_record_create(&missing_field, &fields, &questions).is_err());

        let bad_metadata = item(json!({"fields": {"text": "x"}, "metadata": [1, 2]}));
        assert!(check_record_create(&bad_metadata, &fields, &questions).is_err());

        let duplicate_user = item(json!({
            "fields": {"text": "x"},
            "responses": [
                {"user_id": user, "status": "draft"},
                {"user_id": user, "status": "discarded"}
            ]
        }));
        assert!(matches!(
            check_record_create(&duplicate_user, &fields, &questions),
            Err(ApiError::Unprocessable(_))
        ));

        let incomplete = item(json!({
            "fields": {"text": "x"},
            "responses": [{"user_id": user, "status": "submitted", "values": {}}]
        }));
        assert!(check_record_create(&incomplete, &fields, &questions).is_err());

        let bad_score = item(json!({
            "fields": {"text": "x"},
            "suggestions": [{"question_id": q.id, "value": "pos", "score": 1.5}]
        }));
        assert!(check_record_create(&bad_score, &fields, &questions).is_err());

        let unknown_question = item(json!({
            "fields": {"text": "x"},
            "suggestions": [{"question_id": Uuid::new_v4(), "value": "pos"}]
        }));
        assert!(check_record_create(&unknown_question, &fields, &questions).is_err());
    }

    #[test]
    fn ids_and_includes_are_parsed() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(parse_ids(&format!("{a}, {b}")).unwrap(), vec![a, b]);
        assert!(parse_ids("").is_err());
        assert!(parse_ids("nope").is_err());

        assert_eq!(
            Include::parse_list(Some("responses,suggestions")).unwrap(),
            vec![Include::Responses, Include::Suggestions]
        );
        assert!(Include::parse_list(Some("vectors")).is_err());
        assert!(Include::parse_list(None).unwrap().is_empty());
    }

    #[test]
    fn annotator_search_is_scoped_to_self() {
        let me = CurrentUser {
            id: Uuid::new_v4(),
            username: "ann".into(),
            role: UserRole::Annotator,
            workspaces: vec![],
        };
        let query = SearchQuery {
            filters: Filters {
                response: Some(ResponseFilter {
                    statuses: vec![ResponseStatusFilter::Submitted],
                    user_id: Some(Uuid::new_v4()),
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let scoped = scope_query(&me, query.clone());
        assert_eq!(scoped.filters.response.unwrap().user_id, Some(me.id));

        let admin = CurrentUser { role: UserRole::Admin, ..me };
        assert_eq!(scope_query(&admin, query.clone()), query);
    }

    #[test]
    fn search_body_accepts_flat_query() {
        let req: SearchRecords = serde_json::from_value(json!({
            "text": {"q": "hello"},
            "limit": 10,
            "include": ["responses"]
        }))
        .unwrap();
        assert_eq!(req.query.limit, 10);
        assert_eq!(req.query.text.unwrap().q, "hello");
        assert_eq!(req.include, vec![Include::Responses]);
    }
}
