use std::sync::Arc;
use std::time::Duration;

use annotations::DistributionError;
use anyhow::Result;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::jobs::JobKind;
use crate::retry::RetrySchedule;
use crate::search_sync::run_job;
use crate::state::SharedState;

const POLL_EVERY: Duration = Duration::from_secs(1);
const LEASE_SECS: i64 = 30;
const HEARTBEAT_EVERY: Duration = Duration::from_secs(10);

pub async fn run_worker_loop(state: SharedState) {
    let wid = state.config.hostname.clone();
    let slots = Arc::new(Semaphore::new(state.config.job_workers));
    info!(worker_id=%wid, workers = state.config.job_workers, "worker_loop: started");

    loop {
        let Ok(permit) = slots.clone().acquire_owned().await else {
            warn!("worker_loop: semaphore closed, stopping");
            return;
        };

        match claim_one_job(&state.pg_pool, &wid).await {
            Ok(Some(job)) => {
                let st = state.clone();
                let wid2 = wid.clone();
                tokio::spawn(async move {
                    if let Err(e) = execute_job(st, job, wid2).await {
                        error!("job execute error: {e:?}");
                    }
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                sleep(POLL_EVERY).await;
            }
            Err(e) => {
                drop(permit);
                warn!("worker_loop: claim failed: {e:?}");
                sleep(POLL_EVERY).await;
            }
        }
    }
}

/// Claims one due job and runs it on the current task. Returns `false` when
/// nothing was due.
pub async fn run_one(state: &SharedState, wid: &str) -> Result<bool> {
    match claim_one_job(&state.pg_pool, wid).await? {
        Some(job) => {
            execute_job(state.clone(), job, wid.to_string()).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    kind: String,
    payload: JsonValue,
    attempts: i32,
}

#[derive(Debug, Clone)]
struct ClaimedJob {
    id: Uuid,
    kind: String,
    payload: JsonValue,
    attempts: u32,
}

async fn claim_one_job(pool: &PgPool, wid: &str) -> Result<Option<ClaimedJob>> {
    let mut tx: Transaction<Postgres> = pool.begin().await?;

    // Due pending jobs, or running jobs whose worker stopped heartbeating.
    let row: Option<JobRow> = sqlx::query_as(
        r#"
        SELECT id, kind, payload, attempts
        FROM jobs
        WHERE
          (status = 'pending' AND run_at <= NOW())
          OR (
              status = 'running'
              AND (lease_until IS NULL OR lease_until < NOW())
          )
        ORDER BY run_at ASC, created_at ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(r) = row else {
        tx.commit().await?;
        return Ok(None);
    };

    sqlx::query(
        r#"
        UPDATE jobs
        SET
          status = 'running',
          lease_owner = $2,
          lease_until = NOW() + ($3 * INTERVAL '1 second'),
          attempts = attempts + 1,
          updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(r.id)
    .bind(wid)
    .bind(LEASE_SECS)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Some(ClaimedJob {
        id: r.id,
        kind: r.kind,
        payload: r.payload,
        attempts: (r.attempts + 1).max(1) as u32,
    }))
}

async fn heartbeat(pool: &PgPool, job_id: Uuid, wid: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET lease_until = NOW() + ($3 * INTERVAL '1 second'),
            updated_at = NOW()
        WHERE id = $1
          AND status = 'running'
          AND lease_owner = $2
        "#,
    )
    .bind(job_id)
    .bind(wid)
    .bind(LEASE_SECS)
    .execute(pool)
    .await?;
    Ok(())
}

async fn execute_job(state: SharedState, job: ClaimedJob, wid: String) -> Result<()> {
    info!(job_id=%job.id, kind=%job.kind, attempts=%job.attempts, "worker: starting job");

    let kind = match JobKind::from_parts(&job.kind, job.payload.clone()) {
        Ok(k) => k,
        Err(e) => {
            fail_job(&state.pg_pool, job.id, format!("invalid job {}: {e}", job.kind)).await?;
            return Ok(());
        }
    };

    let cancel = CancellationToken::new();
    let cancel_hb = cancel.clone();
    let pool = state.pg_pool.clone();
    let job_id = job.id;
    let wid_hb = wid.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_hb.cancelled() => break,
                _ = sleep(HEARTBEAT_EVERY) => {
                    if let Err(e) = heartbeat(&pool, job_id, &wid_hb).await {
                        warn!(job_id=%job_id, "heartbeat failed: {:?}", e);
                    }
                }
            }
        }
    });

    let outcome = run_job(&state, &kind).await;
    cancel.cancel();

    match outcome {
        Ok(()) => {
            finish_job(&state.pg_pool, job.id).await?;
            info!(job_id=%job.id, kind=%job.kind, "worker: job done");
        }
        Err(e) => {
            let msg = format!("{e:#}");
            match next_step(&state.config.job_retry, job.attempts, is_fatal(&e)) {
                Some(delay) => {
                    retry_job(&state.pg_pool, job.id, delay, &msg).await?;
                    warn!(job_id=%job.id, attempts=%job.attempts, ?delay, error=%msg, "worker: job will be retried");
                }
                None => {
                    fail_job(&state.pg_pool, job.id, msg.clone()).await?;
                    error!(job_id=%job.id, attempts=%job.attempts, error=%msg, "worker: job failed");
                }
            }
        }
    }

    Ok(())
}

/// Delay before the job runs again, or `None` when it must be marked failed.
fn next_step(schedule: &RetrySchedule, attempts: u32, fatal: bool) -> Option<Duration> {
    if fatal {
        return None;
    }
    schedule.delay_after(attempts)
}

fn is_fatal(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause.downcast_ref::<ApiError>().is_some_and(ApiError::is_fatal)
            || matches!(
                cause.downcast_ref::<DistributionError>(),
                Some(DistributionError::UnsupportedStrategy(_))
            )
    })
}

async fn finish_job(pool: &PgPool, job_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status='done',
            lease_owner=NULL,
            lease_until=NULL,
            last_error=NULL,
            updated_at=NOW(),
            finished_at=NOW()
        WHERE id=$1
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

async fn retry_job(pool: &PgPool, job_id: Uuid, delay: Duration, msg: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status='pending',
            run_at=NOW() + ($2 * INTERVAL '1 second'),
            lease_owner=NULL,
            lease_until=NULL,
            last_error=$3,
            updated_at=NOW()
        WHERE id=$1
        "#,
    )
    .bind(job_id)
    .bind(delay.as_secs_f64())
    .bind(msg)
    .execute(pool)
    .await?;
    Ok(())
}

async fn fail_job(pool: &PgPool, job_id: Uuid, msg: String) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status='failed',
            lease_owner=NULL,
            lease_until=NULL,
            last_error=$2,
            updated_at=NOW(),
            finished_at=NOW()
        WHERE id=$1
        "#,
    )
    .bind(job_id)
    .bind(&msg)
    .execute(pool)
    .await?;
    Ok(())
}
