//! Keeps `records.status` in line with the dataset distribution policy.
//!
//! Callers run [`refresh_record_status`] inside the serializable transaction
//! that changed the record's responses; the conflict retry loop around that
//! transaction is what makes the recount safe under concurrent submissions.

use annotations::{Distribution, DistributionError, RecordStatus, StatusChange, WebhookEvent};
use serde_json::Value as JsonValue;
use sqlx::{PgConnection, Row};
use tracing::info;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::events::notify_tx;
use crate::rows::fetch_record;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusRefresh {
    pub record_id: Uuid,
    pub dataset_id: Uuid,
    pub submitted: u64,
    pub change: StatusChange,
}

pub fn evaluate(
    distribution: &Distribution,
    previous: RecordStatus,
    submitted: u64,
) -> Result<StatusChange, DistributionError> {
    Ok(StatusChange {
        previous,
        current: distribution.record_status(submitted)?,
    })
}

pub async fn refresh_record_status(conn: &mut PgConnection, record_id: Uuid) -> ApiResult<StatusRefresh> {
    let row = sqlx::query(
        r#"
        SELECT r.dataset_id, r.status, d.distribution
        FROM records r
        JOIN datasets d ON d.id = r.dataset_id
        WHERE r.id = $1
        FOR UPDATE OF r
        "#,
    )
    .bind(record_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| ApiError::not_found("record", record_id))?;

    let dataset_id: Uuid = row.try_get("dataset_id")?;
    let previous: RecordStatus = row
        .try_get::<String, _>("status")?
        .parse()
        .map_err(|e| ApiError::Other(anyhow::anyhow!("record {record_id}: {e}")))?;
    let distribution: Distribution = serde_json::from_value(row.try_get::<JsonValue, _>("distribution")?)
        .map_err(|e| ApiError::Other(anyhow::anyhow!("dataset {dataset_id} distribution: {e}")))?;

    let submitted: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM responses WHERE record_id = $1 AND status = 'submitted'",
    )
    .bind(record_id)
    .fetch_one(&mut *conn)
    .await?;
    let submitted = submitted.max(0) as u64;

    let change = evaluate(&distribution, previous, submitted)?;

    sqlx::query(
        r#"
        UPDATE records
        SET status = $2, count_submitted_responses = $3, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(record_id)
    .bind(change.current.as_str())
    .bind(submitted as i64)
    .execute(&mut *conn)
    .await?;

    if change.completed_now() {
        let record = fetch_record(&mut *conn, record_id).await?;
        notify_tx(&mut *conn, WebhookEvent::RecordCompleted, &record).await?;
        info!(record_id=%record_id, submitted, "record completed");
    }

    Ok(StatusRefresh {
        record_id,
        dataset_id,
        submitted,
        change,
    })
}
