//! Search sync jobs. Rows are written in the same transaction as the SQL
//! mutation that makes them necessary and executed by the worker loop.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgConnection;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum JobKind {
    IndexRecords { dataset_id: Uuid, record_ids: Vec<Uuid> },
    DeleteRecords { dataset_id: Uuid, record_ids: Vec<Uuid> },
    DeleteIndex { dataset_id: Uuid },
    RefreshDatasetRecordsStatus { dataset_id: Uuid },
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::IndexRecords { .. } => "index_records",
            JobKind::DeleteRecords { .. } => "delete_records",
            JobKind::DeleteIndex { .. } => "delete_index",
            JobKind::RefreshDatasetRecordsStatus { .. } => "refresh_dataset_records_status",
        }
    }

    pub fn payload(&self) -> serde_json::Result<JsonValue> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("payload")
            .map(JsonValue::take)
            .unwrap_or(JsonValue::Null))
    }

    pub fn from_parts(kind: &str, payload: JsonValue) -> serde_json::Result<Self> {
        serde_json::from_value(serde_json::json!({ "kind": kind, "payload": payload }))
    }
}

pub async fn enqueue_tx(conn: &mut PgConnection, job: &JobKind) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO jobs (id, kind, payload, status)
        VALUES ($1, $2, $3, 'pending')
        "#,
    )
    .bind(id)
    .bind(job.name())
    .bind(job.payload()?)
    .execute(conn)
    .await?;
    Ok(id)
}

/// Queues a reindex for `record_ids`; a no-op for an empty slice.
pub async fn enqueue_index_records(
    conn: &mut PgConnection,
    dataset_id: Uuid,
    record_ids: &[Uuid],
) -> anyhow::Result<Option<Uuid>> {
    if record_ids.is_empty() {
        return Ok(None);
    }
    let job = JobKind::IndexRecords {
        dataset_id,
        record_ids: record_ids.to_vec(),
    };
    enqueue_tx(conn, &job).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_and_payload_are_stored_separately() {
        let dataset_id = Uuid::new_v4();
        let job = JobKind::DeleteIndex { dataset_id };
        assert_eq!(job.name(), "delete_index");
        assert_eq!(job.payload().unwrap(), json!({ "dataset_id": dataset_id }));

        let back = JobKind::from_parts(job.name(), job.payload().unwrap()).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(JobKind::from_parts("hf_download", json!({})).is_err());
    }
}
