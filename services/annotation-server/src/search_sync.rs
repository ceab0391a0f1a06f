//! Applies search sync jobs to the configured engine.
//!
//! Documents are always rebuilt from the current SQL state, so running the
//! same job twice (after a lease expiry, or a retry) converges to the same index.
//! Each document carries its record's `version`; engines never replace a
//! document with an older one, whatever order concurrent jobs finish in.

use std::collections::{BTreeMap, HashMap, HashSet};

use annotations::{Record, ResponseStatus};
use anyhow::{Context, Result};
use search_index::{IndexSpec, RecordDocument, ResponseDoc, SearchEngine, SearchError, SuggestionDoc};
use serde_json::Value as JsonValue;
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::jobs::{enqueue_index_records, JobKind};
use crate::record_status::refresh_record_status;
use crate::retry::{begin_serializable, retry_serializable};
use crate::rows::{convert_all, fetch_fields, fetch_questions, RecordRow, RECORD_COLUMNS};
use crate::state::SharedState;

pub const REFRESH_BATCH_SIZE: i64 = 200;

#[derive(sqlx::FromRow)]
pub struct ResponseDocRow {
    pub record_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub values: Option<JsonValue>,
}

#[derive(sqlx::FromRow)]
pub struct SuggestionDocRow {
    pub record_id: Uuid,
    pub question_name: String,
    pub value: JsonValue,
    pub score: Option<JsonValue>,
    pub agent: Option<String>,
}

pub fn build_documents(
    records: Vec<Record>,
    responses: Vec<ResponseDocRow>,
    suggestions: Vec<SuggestionDocRow>,
) -> Result<Vec<RecordDocument>> {
    let mut by_record: HashMap<Uuid, RecordDocument> = records
        .into_iter()
        .map(|r| {
            let doc = RecordDocument {
                id: r.id,
                external_id: r.external_id,
                fields: r.fields,
                metadata: r.metadata.unwrap_or_default(),
                status: r.status,
                responses: BTreeMap::new(),
                suggestions: BTreeMap::new(),
                version: r.version,
                inserted_at: r.inserted_at,
                updated_at: r.updated_at,
            };
            (doc.id, doc)
        })
        .collect();

    for r in responses {
        let Some(doc) = by_record.get_mut(&r.record_id) else {
            continue;
        };
        let status: ResponseStatus = r
            .status
            .parse()
            .with_context(|| format!("response of record {}", r.record_id))?;
        let values = match r.values {
            Some(JsonValue::Object(map)) => Some(map),
            _ => None,
        };
        doc.responses.insert(r.user_id, ResponseDoc { status, values });
    }

    for s in suggestions {
        if let Some(doc) = by_record.get_mut(&s.record_id) {
            doc.suggestions.insert(
                s.question_name,
                SuggestionDoc {
                    value: s.value,
                    score: s.score,
                    agent: s.agent,
                },
            );
        }
    }

    let mut docs: Vec<RecordDocument> = by_record.into_values().collect();
    docs.sort_by_key(|d| (d.inserted_at, d.id));
    Ok(docs)
}

/// Reads records with their responses and suggestions. Call inside one
/// snapshot so each document matches the version it carries.
pub async fn load_record_documents(
    conn: &mut PgConnection,
    dataset_id: Uuid,
    record_ids: &[Uuid],
) -> Result<Vec<RecordDocument>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE dataset_id = $1 AND id = ANY($2)");
    let rows: Vec<RecordRow> = sqlx::query_as(&sql)
        .bind(dataset_id)
        .bind(record_ids)
        .fetch_all(&mut *conn)
        .await?;
    let records: Vec<Record> = convert_all(rows)?;
    let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();

    let responses: Vec<ResponseDocRow> = sqlx::query_as(
        r#"SELECT record_id, user_id, status, "values" FROM responses WHERE record_id = ANY($1)"#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    let suggestions: Vec<SuggestionDocRow> = sqlx::query_as(
        r#"
        SELECT s.record_id, q.name AS question_name, s.value, s.score, s.agent
        FROM suggestions s
        JOIN questions q ON q.id = s.question_id
        WHERE s.record_id = ANY($1)
        "#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    build_documents(records, responses, suggestions)
}

pub async fn run_job(state: &SharedState, job: &JobKind) -> Result<()> {
    match job {
        JobKind::IndexRecords {
            dataset_id,
            record_ids,
        } => index_records(state, *dataset_id, record_ids).await,
        JobKind::DeleteRecords {
            dataset_id,
            record_ids,
        } => ignore_missing_index(state.search.delete_records(*dataset_id, record_ids).await),
        JobKind::DeleteIndex { dataset_id } => {
            state.search.delete_index(*dataset_id).await?;
            info!(dataset_id=%dataset_id, "search index deleted");
            Ok(())
        }
        JobKind::RefreshDatasetRecordsStatus { dataset_id } => {
            refresh_dataset_records_status(state, *dataset_id).await
        }
    }
}

fn ignore_missing_index(result: search_index::Result<()>) -> Result<()> {
    match result {
        Err(SearchError::IndexNotFound(dataset_id)) => {
            warn!(dataset_id=%dataset_id, "search index missing, skipping sync");
            Ok(())
        }
        other => Ok(other?),
    }
}

async fn index_records(state: &SharedState, dataset_id: Uuid, record_ids: &[Uuid]) -> Result<()> {
    let mut tx = state.pg_pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
        .execute(&mut *tx)
        .await?;
    let docs = load_record_documents(&mut *tx, dataset_id, record_ids).await?;
    tx.commit().await?;

    let found: HashSet<Uuid> = docs.iter().map(|d| d.id).collect();
    let gone: Vec<Uuid> = record_ids.iter().copied().filter(|id| !found.contains(id)).collect();

    if !docs.is_empty() {
        match state.search.index_records(dataset_id, &docs).await {
            Err(SearchError::IndexNotFound(_)) => {
                return recover_missing_index(state, dataset_id).await;
            }
            other => other?,
        }
    }
    if !gone.is_empty() {
        ignore_missing_index(state.search.delete_records(dataset_id, &gone).await)?;
    }
    Ok(())
}

/// The engine lost the index of a dataset (in-memory engine after a restart,
/// or an index dropped behind our back). A published dataset gets its index
/// back along with a full reindex; a draft or deleted one has nothing to sync.
async fn recover_missing_index(state: &SharedState, dataset_id: Uuid) -> Result<()> {
    let ready: Option<bool> = sqlx::query_scalar("SELECT status = 'ready' FROM datasets WHERE id = $1")
        .bind(dataset_id)
        .fetch_optional(&state.pg_pool)
        .await?;
    if ready != Some(true) {
        warn!(dataset_id=%dataset_id, "search index missing for unpublished dataset, skipping sync");
        return Ok(());
    }

    warn!(dataset_id=%dataset_id, "search index missing, rebuilding");
    reindex_dataset(&state.pg_pool, state.search.as_ref(), dataset_id).await?;
    Ok(())
}

pub async fn index_spec(conn: &mut PgConnection, dataset_id: Uuid) -> Result<IndexSpec> {
    let fields = fetch_fields(&mut *conn, dataset_id).await?;
    let questions = fetch_questions(&mut *conn, dataset_id).await?;
    Ok(IndexSpec {
        dataset_id,
        fields: fields.into_iter().map(|f| f.name).collect(),
        questions: questions.into_iter().map(|q| q.name).collect(),
    })
}

/// Creates the dataset's index if missing and queues every record for
/// indexing, one job per batch. Returns the number of records queued.
pub async fn reindex_dataset(pool: &PgPool, search: &dyn SearchEngine, dataset_id: Uuid) -> Result<usize> {
    let mut conn = pool.acquire().await?;
    let spec = index_spec(&mut *conn, dataset_id).await?;
    drop(conn);
    search
        .create_index(&spec)
        .await
        .with_context(|| format!("creating search index of dataset {dataset_id}"))?;

    let mut after: Option<Uuid> = None;
    let mut queued = 0usize;
    loop {
        let batch = record_id_batch(pool, dataset_id, after).await?;
        let Some(last) = batch.last().copied() else {
            break;
        };
        let mut tx = pool.begin().await?;
        enqueue_index_records(&mut *tx, dataset_id, &batch).await?;
        tx.commit().await?;
        queued += batch.len();
        after = Some(last);
    }
    Ok(queued)
}

/// Recreates the index of every published dataset. The in-memory engine starts
/// empty, so this runs once at startup before the worker loop.
pub async fn rebuild_indexes(pool: &PgPool, search: &dyn SearchEngine) -> Result<usize> {
    let datasets: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM datasets WHERE status = 'ready' ORDER BY id")
        .fetch_all(pool)
        .await?;

    let mut queued = 0usize;
    for dataset_id in &datasets {
        queued += reindex_dataset(pool, search, *dataset_id).await?;
    }
    info!(datasets = datasets.len(), records = queued, "search indexes rebuilt");
    Ok(queued)
}

async fn record_id_batch(pool: &PgPool, dataset_id: Uuid, after: Option<Uuid>) -> Result<Vec<Uuid>> {
    let batch = sqlx::query_scalar(
        r#"
        SELECT id FROM records
        WHERE dataset_id = $1 AND ($2::uuid IS NULL OR id > $2)
        ORDER BY id
        LIMIT $3
        "#,
    )
    .bind(dataset_id)
    .bind(after)
    .bind(REFRESH_BATCH_SIZE)
    .fetch_all(pool)
    .await?;
    Ok(batch)
}

/// Recomputes every record of a dataset after a distribution change, one
/// serializable transaction per record, one reindex job per batch.
async fn refresh_dataset_records_status(state: &SharedState, dataset_id: Uuid) -> Result<()> {
    let policy = &state.config.serializable_retry;
    let mut after: Option<Uuid> = None;
    let mut total = 0usize;
    let mut changed_total = 0usize;

    loop {
        let batch = record_id_batch(&state.pg_pool, dataset_id, after).await?;

        let Some(last) = batch.last().copied() else {
            break;
        };

        let mut changed = Vec::new();
        for record_id in &batch {
            let refresh = retry_serializable(policy, || {
                let pool = state.pg_pool.clone();
                let record_id = *record_id;
                async move {
                    let mut tx = begin_serializable(&pool).await?;
                    let refresh = refresh_record_status(&mut *tx, record_id).await?;
                    tx.commit().await?;
                    Ok::<_, ApiError>(refresh)
                }
            })
            .await;

            match refresh {
                Ok(r) if r.change.changed() => changed.push(r.record_id),
                Ok(_) => {}
                // deleted while the job was running
                Err(ApiError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !changed.is_empty() {
            let mut tx = state.pg_pool.begin().await?;
            enqueue_index_records(&mut *tx, dataset_id, &changed).await?;
            tx.commit().await?;
        }

        total += batch.len();
        changed_total += changed.len();
        after = Some(last);
    }

    info!(dataset_id=%dataset_id, total, changed = changed_total, "dataset record statuses refreshed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use annotations::RecordStatus;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn record(minutes_ago: i64) -> Record {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        Record {
            id: Uuid::new_v4(),
            dataset_id: Uuid::nil(),
            external_id: Some(format!("ext-{minutes_ago}")),
            fields: json!({"text": "hello"}).as_object().cloned().unwrap(),
            metadata: None,
            status: RecordStatus::Pending,
            count_submitted_responses: 0,
            version: 1,
            inserted_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn documents_group_responses_and_suggestions() {
        let a = record(2);
        let b = record(1);
        let user = Uuid::new_v4();

        let docs = build_documents(
            vec![b.clone(), a.clone()],
            vec![
                ResponseDocRow {
                    record_id: a.id,
                    user_id: user,
                    status: "submitted".into(),
                    values: Some(json!({"label": {"value": "pos"}})),
                },
                ResponseDocRow {
                    record_id: Uuid::new_v4(),
                    user_id: user,
                    status: "draft".into(),
                    values: None,
                },
            ],
            vec![SuggestionDocRow {
                record_id: b.id,
                question_name: "label".into(),
                value: json!("neg"),
                score: Some(json!(0.7)),
                agent: Some("model-v1".into()),
            }],
        )
        .unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, a.id);
        assert_eq!(docs[0].responses[&user].status, ResponseStatus::Submitted);
        assert!(docs[0].metadata.is_empty());
        assert_eq!(docs[1].suggestions["label"].value, json!("neg"));
        assert!(docs[1].responses.is_empty());
    }

    #[test]
    fn corrupt_response_status_is_an_error() {
        let a = record(1);
        let res = build_documents(
            vec![a.clone()],
            vec![ResponseDocRow {
                record_id: a.id,
                user_id: Uuid::new_v4(),
                status: "maybe".into(),
                values: None,
            }],
            vec![],
        );
        assert!(res.is_err());
    }
}
