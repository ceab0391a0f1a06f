use annotations::{Action, Webhook, WebhookEvent};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::rows::{convert_all, fetch_webhook, WebhookRow, WEBHOOK_COLUMNS};
use crate::state::SharedState;
use crate::webhooks::generate_secret;

pub fn check_url(url: &str) -> ApiResult<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ApiError::Unprocessable(format!("invalid webhook url: {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host().is_some() => Ok(()),
        _ => Err(ApiError::Unprocessable("webhook url must be http(s) with a host".into())),
    }
}

/// Deduplicates while keeping the caller's order.
pub fn check_events(events: &[WebhookEvent]) -> ApiResult<Vec<String>> {
    if events.is_empty() {
        return Err(ApiError::Unprocessable("at least one event is required".into()));
    }
    let mut names: Vec<String> = Vec::with_capacity(events.len());
    for e in events {
        if !names.iter().any(|n| n == e.as_str()) {
            names.push(e.as_str().to_string());
        }
    }
    Ok(names)
}

pub async fn list_webhooks(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<serde_json::Value>> {
    user.authorize(Action::ManageWebhooks, None)?;

    let sql = format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks ORDER BY inserted_at");
    let rows: Vec<WebhookRow> = sqlx::query_as(&sql).fetch_all(&state.pg_pool).await?;
    let items: Vec<Webhook> = convert_all(rows)?;

    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
pub struct CreateWebhook {
    pub url: String,
    pub events: Vec<WebhookEvent>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn create_webhook(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<CreateWebhook>,
) -> ApiResult<(StatusCode, Json<Webhook>)> {
    user.authorize(Action::ManageWebhooks, None)?;
    check_url(&req.url)?;
    let events = check_events(&req.events)?;

    let sql = format!(
        r#"
        INSERT INTO webhooks (id, url, secret, events, enabled, description)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {WEBHOOK_COLUMNS}
        "#
    );
    let row: WebhookRow = sqlx::query_as(&sql)
        .bind(Uuid::new_v4())
        .bind(&req.url)
        .bind(generate_secret())
        .bind(&events)
        .bind(req.enabled)
        .bind(&req.description)
        .fetch_one(&state.pg_pool)
        .await?;
    let webhook: Webhook = row.try_into()?;

    info!(webhook_id=%webhook.id, url=%webhook.url, events = events.len(), "webhook created");
    Ok((StatusCode::CREATED, Json(webhook)))
}

#[derive(Deserialize)]
pub struct UpdateWebhook {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub events: Option<Vec<WebhookEvent>>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
}

pub async fn update_webhook(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateWebhook>,
) -> ApiResult<Json<Webhook>> {
    user.authorize(Action::ManageWebhooks, None)?;
    if let Some(url) = &req.url {
        check_url(url)?;
    }
    let events = req.events.as_deref().map(check_events).transpose()?;

    let sql = format!(
        r#"
        UPDATE webhooks
        SET url = COALESCE($2, url),
            events = COALESCE($3, events),
            enabled = COALESCE($4, enabled),
            description = COALESCE($5, description),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {WEBHOOK_COLUMNS}
        "#
    );
    let row: Option<WebhookRow> = sqlx::query_as(&sql)
        .bind(id)
        .bind(&req.url)
        .bind(&events)
        .bind(req.enabled)
        .bind(&req.description)
        .fetch_optional(&state.pg_pool)
        .await?;
    let webhook: Webhook = row.ok_or_else(|| ApiError::not_found("webhook", id))?.try_into()?;

    info!(webhook_id=%id, enabled = webhook.enabled, "webhook updated");
    Ok(Json(webhook))
}

pub async fn delete_webhook(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    user.authorize(Action::ManageWebhooks, None)?;
    fetch_webhook(&state.pg_pool, id).await?;

    // Pending deliveries go with it (ON DELETE CASCADE).
    sqlx::query("DELETE FROM webhooks WHERE id = $1")
        .bind(id)
        .execute(&state.pg_pool)
        .await?;

    info!(webhook_id=%id, "webhook deleted");
    Ok(StatusCode::NO_CONTENT)
}
