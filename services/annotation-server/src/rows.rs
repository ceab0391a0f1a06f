//! Row mappings between Postgres and the domain types.
//!
//! Enum columns are TEXT and structured settings are JSONB, so every row type
//! converts through `TryFrom`; a value that fails to parse means the row was
//! written by something other than this server.

use annotations::{
    Dataset, Distribution, Field, Question, Record, Response, Suggestion, User, Webhook,
    WebhookEvent, Workspace,
};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

type Ts = DateTime<Utc>;

fn corrupt(table: &str, id: Uuid, e: impl std::fmt::Display) -> ApiError {
    ApiError::Other(anyhow::anyhow!("corrupt {table} row {id}: {e}"))
}

fn json_object(value: JsonValue) -> Option<serde_json::Map<String, JsonValue>> {
    match value {
        JsonValue::Object(map) => Some(map),
        _ => None,
    }
}

pub const DATASET_COLUMNS: &str = "id, name, guidelines, allow_extra_metadata, status, distribution, workspace_id, inserted_at, updated_at, last_activity_at";
pub const FIELD_COLUMNS: &str = "id, name, title, required, settings, dataset_id, inserted_at, updated_at";
pub const QUESTION_COLUMNS: &str = "id, name, title, description, required, settings, dataset_id, inserted_at, updated_at";
pub const RECORD_COLUMNS: &str = "id, dataset_id, external_id, fields, metadata, status, count_submitted_responses, version, inserted_at, updated_at";
pub const RESPONSE_COLUMNS: &str = r#"id, record_id, user_id, status, "values", inserted_at, updated_at"#;
pub const SUGGESTION_COLUMNS: &str = "id, record_id, question_id, value, score, agent, type, inserted_at, updated_at";
pub const WEBHOOK_COLUMNS: &str = "id, url, secret, events, enabled, description, inserted_at, updated_at";

#[derive(sqlx::FromRow)]
pub struct WorkspaceRow {
    pub id: Uuid,
    pub name: String,
    pub inserted_at: Ts,
    pub updated_at: Ts,
}

impl From<WorkspaceRow> for Workspace {
    fn from(r: WorkspaceRow) -> Self {
        Workspace {
            id: r.id,
            name: r.name,
            inserted_at: r.inserted_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub first_name: Option<String>,
    pub role: String,
    pub inserted_at: Ts,
    pub updated_at: Ts,
}

impl TryFrom<UserRow> for User {
    type Error = ApiError;

    fn try_from(r: UserRow) -> ApiResult<Self> {
        Ok(User {
            role: r.role.parse().map_err(|e| corrupt("users", r.id, e))?,
            id: r.id,
            username: r.username,
            first_name: r.first_name,
            inserted_at: r.inserted_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct DatasetRow {
    pub id: Uuid,
    pub name: String,
    pub guidelines: Option<String>,
    pub allow_extra_metadata: bool,
    pub status: String,
    pub distribution: JsonValue,
    pub workspace_id: Uuid,
    pub inserted_at: Ts,
    pub updated_at: Ts,
    pub last_activity_at: Ts,
}

impl TryFrom<DatasetRow> for Dataset {
    type Error = ApiError;

    fn try_from(r: DatasetRow) -> ApiResult<Self> {
        let distribution: Distribution =
            serde_json::from_value(r.distribution).map_err(|e| corrupt("datasets", r.id, e))?;
        Ok(Dataset {
            status: r.status.parse().map_err(|e| corrupt("datasets", r.id, e))?,
            id: r.id,
            name: r.name,
            guidelines: r.guidelines,
            allow_extra_metadata: r.allow_extra_metadata,
            distribution,
            workspace_id: r.workspace_id,
            inserted_at: r.inserted_at,
            updated_at: r.updated_at,
            last_activity_at: r.last_activity_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct FieldRow {
    pub id: Uuid,
    pub name: String,
    pub title: String,
    pub required: bool,
    pub settings: JsonValue,
    pub dataset_id: Uuid,
    pub inserted_at: Ts,
    pub updated_at: Ts,
}

impl TryFrom<FieldRow> for Field {
    type Error = ApiError;

    fn try_from(r: FieldRow) -> ApiResult<Self> {
        Ok(Field {
            settings: serde_json::from_value(r.settings).map_err(|e| corrupt("fields", r.id, e))?,
            id: r.id,
            name: r.name,
            title: r.title,
            required: r.required,
            dataset_id: r.dataset_id,
            inserted_at: r.inserted_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct QuestionRow {
    pub id: Uuid,
    pub name: String,
    pub title: String,
    pub description: Option<String>,
    pub required: bool,
    pub settings: JsonValue,
    pub dataset_id: Uuid,
    pub inserted_at: Ts,
    pub updated_at: Ts,
}

impl TryFrom<QuestionRow> for Question {
    type Error = ApiError;

    fn try_from(r: QuestionRow) -> ApiResult<Self> {
        Ok(Question {
            settings: serde_json::from_value(r.settings).map_err(|e| corrupt("questions", r.id, e))?,
            id: r.id,
            name: r.name,
            title: r.title,
            description: r.description,
            required: r.required,
            dataset_id: r.dataset_id,
            inserted_at: r.inserted_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct RecordRow {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub external_id: Option<String>,
    pub fields: JsonValue,
    pub metadata: Option<JsonValue>,
    pub status: String,
    pub count_submitted_responses: i64,
    pub version: i64,
    pub inserted_at: Ts,
    pub updated_at: Ts,
}

impl TryFrom<RecordRow> for Record {
    type Error = ApiError;

    fn try_from(r: RecordRow) -> ApiResult<Self> {
        let fields = json_object(r.fields).ok_or_else(|| corrupt("records", r.id, "fields is not an object"))?;
        Ok(Record {
            status: r.status.parse().map_err(|e| corrupt("records", r.id, e))?,
            id: r.id,
            dataset_id: r.dataset_id,
            external_id: r.external_id,
            fields,
            metadata: r.metadata.and_then(json_object),
            count_submitted_responses: r.count_submitted_responses,
            version: r.version,
            inserted_at: r.inserted_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct ResponseRow {
    pub id: Uuid,
    pub record_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub values: Option<JsonValue>,
    pub inserted_at: Ts,
    pub updated_at: Ts,
}

impl TryFrom<ResponseRow> for Response {
    type Error = ApiError;

    fn try_from(r: ResponseRow) -> ApiResult<Self> {
        Ok(Response {
            status: r.status.parse().map_err(|e| corrupt("responses", r.id, e))?,
            id: r.id,
            record_id: r.record_id,
            user_id: r.user_id,
            values: r.values.and_then(json_object),
            inserted_at: r.inserted_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct SuggestionRow {
    pub id: Uuid,
    pub record_id: Uuid,
    pub question_id: Uuid,
    pub value: JsonValue,
    pub score: Option<JsonValue>,
    pub agent: Option<String>,
    #[sqlx(rename = "type")]
    pub kind: Option<String>,
    pub inserted_at: Ts,
    pub updated_at: Ts,
}

impl TryFrom<SuggestionRow> for Suggestion {
    type Error = ApiError;

    fn try_from(r: SuggestionRow) -> ApiResult<Self> {
        let kind = r
            .kind
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e| corrupt("suggestions", r.id, e))?;
        Ok(Suggestion {
            id: r.id,
            record_id: r.record_id,
            question_id: r.question_id,
            value: r.value,
            score: r.score,
            agent: r.agent,
            kind,
            inserted_at: r.inserted_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct WebhookRow {
    pub id: Uuid,
    pub url: String,
    pub secret: String,
    pub events: Vec<String>,
    pub enabled: bool,
    pub description: Option<String>,
    pub inserted_at: Ts,
    pub updated_at: Ts,
}

impl TryFrom<WebhookRow> for Webhook {
    type Error = ApiError;

    fn try_from(r: WebhookRow) -> ApiResult<Self> {
        let events = r
            .events
            .iter()
            .map(|e| e.parse::<WebhookEvent>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| corrupt("webhooks", r.id, e))?;
        Ok(Webhook {
            id: r.id,
            url: r.url,
            secret: r.secret,
            events,
            enabled: r.enabled,
            description: r.description,
            inserted_at: r.inserted_at,
            updated_at: r.updated_at,
        })
    }
}

pub fn convert_all<R, T>(rows: Vec<R>) -> ApiResult<Vec<T>>
where
    T: TryFrom<R, Error = ApiError>,
{
    rows.into_iter().map(T::try_from).collect()
}

pub async fn fetch_dataset<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> ApiResult<Dataset> {
    let sql = format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE id = $1");
    let row: Option<DatasetRow> = sqlx::query_as(&sql).bind(id).fetch_optional(ex).await?;
    row.ok_or_else(|| ApiError::not_found("dataset", id))?.try_into()
}

/// Row-locks the dataset for the rest of the transaction.
pub async fn lock_dataset<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> ApiResult<Dataset> {
    let sql = format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE id = $1 FOR UPDATE");
    let row: Option<DatasetRow> = sqlx::query_as(&sql).bind(id).fetch_optional(ex).await?;
    row.ok_or_else(|| ApiError::not_found("dataset", id))?.try_into()
}

pub async fn fetch_fields<'e, E: PgExecutor<'e>>(ex: E, dataset_id: Uuid) -> ApiResult<Vec<Field>> {
    let sql = format!("SELECT {FIELD_COLUMNS} FROM fields WHERE dataset_id = $1 ORDER BY inserted_at, id");
    let rows: Vec<FieldRow> = sqlx::query_as(&sql).bind(dataset_id).fetch_all(ex).await?;
    convert_all(rows)
}

pub async fn fetch_questions<'e, E: PgExecutor<'e>>(ex: E, dataset_id: Uuid) -> ApiResult<Vec<Question>> {
    let sql = format!("SELECT {QUESTION_COLUMNS} FROM questions WHERE dataset_id = $1 ORDER BY inserted_at, id");
    let rows: Vec<QuestionRow> = sqlx::query_as(&sql).bind(dataset_id).fetch_all(ex).await?;
    convert_all(rows)
}

pub async fn fetch_record<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> ApiResult<Record> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = $1");
    let row: Option<RecordRow> = sqlx::query_as(&sql).bind(id).fetch_optional(ex).await?;
    row.ok_or_else(|| ApiError::not_found("record", id))?.try_into()
}

pub async fn fetch_response<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> ApiResult<Response> {
    let sql = format!("SELECT {RESPONSE_COLUMNS} FROM responses WHERE id = $1");
    let row: Option<ResponseRow> = sqlx::query_as(&sql).bind(id).fetch_optional(ex).await?;
    row.ok_or_else(|| ApiError::not_found("response", id))?.try_into()
}

pub async fn fetch_webhook<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> ApiResult<Webhook> {
    let sql = format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = $1");
    let row: Option<WebhookRow> = sqlx::query_as(&sql).bind(id).fetch_optional(ex).await?;
    row.ok_or_else(|| ApiError::not_found("webhook", id))?.try_into()
}
