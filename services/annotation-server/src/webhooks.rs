//! Webhook delivery from the `webhook_outbox` table.
//!
//! Messages are signed following the Standard Webhooks scheme: the
//! `webhook-signature` header carries `v1,<base64 hmac-sha256>` over
//! `"{id}.{timestamp}.{body}"`, keyed with the decoded `whsec_` secret.

use std::time::Duration;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::retry::RetrySchedule;
use crate::state::SharedState;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const LEASE_DURATION: i64 = 60; // seconds
pub const SECRET_PREFIX: &str = "whsec_";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid webhook secret")]
    InvalidSecret,

    #[error("HTTP {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry(Duration),
    Failed,
}

/// `attempts` includes the delivery that just failed.
pub fn failure_outcome(schedule: &RetrySchedule, attempts: u32) -> FailureOutcome {
    match schedule.delay_after(attempts) {
        Some(delay) => FailureOutcome::Retry(delay),
        None => FailureOutcome::Failed,
    }
}

pub fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("{SECRET_PREFIX}{}", STANDARD.encode(bytes))
}

pub fn sign_payload(secret: &str, msg_id: &str, ts: i64, body: &str) -> Result<String, DeliveryError> {
    let encoded = secret.strip_prefix(SECRET_PREFIX).unwrap_or(secret);
    let key = STANDARD.decode(encoded).map_err(|_| DeliveryError::InvalidSecret)?;

    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| DeliveryError::InvalidSecret)?;
    mac.update(format!("{msg_id}.{ts}.{body}").as_bytes());
    Ok(format!("v1,{}", STANDARD.encode(mac.finalize().into_bytes())))
}

pub async fn deliver(
    client: &reqwest::Client,
    url: &str,
    secret: &str,
    msg_id: Uuid,
    ts: i64,
    body: String,
) -> Result<(), DeliveryError> {
    let msg_id = msg_id.to_string();
    let signature = sign_payload(secret, &msg_id, ts, &body)?;

    let resp = client
        .post(url)
        .header("content-type", "application/json")
        .header("webhook-id", &msg_id)
        .header("webhook-timestamp", ts.to_string())
        .header("webhook-signature", signature)
        .body(body)
        .send()
        .await?;

    if resp.status().is_success() {
        Ok(())
    } else {
        Err(DeliveryError::Status(resp.status().as_u16()))
    }
}

pub async fn run_webhook_dispatcher(state: SharedState) {
    let client = match reqwest::Client::builder()
        .timeout(state.config.webhook_timeout)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            error!("webhook_dispatcher: cannot build http client: {e:?}");
            return;
        }
    };
    let hostname = state.config.hostname.clone();
    let schedule = state.config.webhook_retry.clone();

    info!(max_attempts = schedule.max_attempts(), "webhook_dispatcher: started");

    loop {
        match claim_and_send(&state.pg_pool, &client, &schedule, &hostname).await {
            Ok(true) => {}
            Ok(false) => tokio::time::sleep(POLL_INTERVAL).await,
            Err(e) => {
                error!("webhook_dispatcher: error: {e:?}");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

/// Delivers the oldest due outbox row. Returns `false` when nothing was due.
pub async fn claim_and_send(
    pool: &PgPool,
    client: &reqwest::Client,
    schedule: &RetrySchedule,
    hostname: &str,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        SELECT o.id, o.webhook_id, o.event_type, o.event, o.attempts, w.url, w.secret, w.enabled
        FROM webhook_outbox o
        JOIN webhooks w ON w.id = o.webhook_id
        WHERE o.status IN ('pending', 'retrying')
          AND o.next_attempt_at <= NOW()
          AND (o.locked_until IS NULL OR o.locked_until < NOW())
        ORDER BY o.next_attempt_at ASC
        LIMIT 1
        FOR UPDATE OF o SKIP LOCKED
        "#,
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.commit().await?;
        return Ok(false);
    };

    let id: Uuid = row.try_get("id")?;
    let webhook_id: Uuid = row.try_get("webhook_id")?;
    let event_type: String = row.try_get("event_type")?;
    let event: serde_json::Value = row.try_get("event")?;
    let attempts: i32 = row.try_get("attempts")?;
    let url: String = row.try_get("url")?;
    let secret: String = row.try_get("secret")?;
    let enabled: bool = row.try_get("enabled")?;

    if !enabled {
        sqlx::query(
            r#"
            UPDATE webhook_outbox
            SET status='dropped', last_error='webhook disabled', updated_at=NOW()
            WHERE id=$1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(id=%id, webhook_id=%webhook_id, "webhook: dropped, webhook disabled");
        return Ok(true);
    }

    sqlx::query(
        r#"
        UPDATE webhook_outbox
        SET locked_by = $1, locked_until = NOW() + ($2 * INTERVAL '1 second')
        WHERE id = $3
        "#,
    )
    .bind(hostname)
    .bind(LEASE_DURATION)
    .bind(id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    let ts = Utc::now().timestamp();
    match deliver(client, &url, &secret, id, ts, event.to_string()).await {
        Ok(()) => {
            sqlx::query(
                r#"
                UPDATE webhook_outbox
                SET status='delivered', attempts=attempts + 1, delivered_at=NOW(),
                    locked_by=NULL, locked_until=NULL, last_error=NULL, updated_at=NOW()
                WHERE id=$1
                "#,
            )
            .bind(id)
            .execute(pool)
            .await?;
            info!(id=%id, webhook_id=%webhook_id, event=%event_type, "webhook: delivered");
        }
        Err(e) => {
            let err_msg = e.to_string();
            handle_failure(pool, id, attempts, schedule, &err_msg).await?;
            warn!(id=%id, webhook_id=%webhook_id, event=%event_type, error=%err_msg, "webhook: delivery failed");
        }
    }

    Ok(true)
}

async fn handle_failure(
    pool: &PgPool,
    id: Uuid,
    attempts: i32,
    schedule: &RetrySchedule,
    err_msg: &str,
) -> Result<()> {
    let new_attempts = attempts.max(0) as u32 + 1;

    match failure_outcome(schedule, new_attempts) {
        FailureOutcome::Failed => {
            sqlx::query(
                r#"
                UPDATE webhook_outbox
                SET status='failed', attempts=$1, locked_by=NULL, locked_until=NULL,
                    last_error=$2, updated_at=NOW()
                WHERE id=$3
                "#,
            )
            .bind(new_attempts as i32)
            .bind(err_msg)
            .bind(id)
            .execute(pool)
            .await?;
            warn!(id=%id, attempts=new_attempts, "webhook: giving up");
        }
        FailureOutcome::Retry(delay) => {
            sqlx::query(
                r#"
                UPDATE webhook_outbox
                SET status='retrying', attempts=$1, next_attempt_at=NOW() + ($2 * INTERVAL '1 second'),
                    locked_by=NULL, locked_until=NULL, last_error=$3, updated_at=NOW()
                WHERE id=$4
                "#,
            )
            .bind(new_attempts as i32)
            .bind(delay.as_secs() as i64)
            .bind(err_msg)
            .bind(id)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn signature_matches_reference_vector() {
        let sig = sign_payload(
            "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw",
            "msg_p5jXN8AQM9LWM0D4loKWxJek",
            1614265330,
            r#"{"test": 2432232314}"#,
        )
        .unwrap();
        assert_eq!(sig, "v1,g0hM9SsE+OTPJTGt/tmIKtSyZlE3uFJELVlNIOLJ1OE=");
    }

    #[test]
    fn bad_secret_is_rejected() {
        assert!(matches!(
            sign_payload("whsec_not base64!", "id", 1, "{}"),
            Err(DeliveryError::InvalidSecret)
        ));
    }

    #[test]
    fn generated_secrets_decode_to_32_bytes() {
        let s = generate_secret();
        assert!(s.starts_with(SECRET_PREFIX));
        let key = STANDARD.decode(&s[SECRET_PREFIX.len()..]).unwrap();
        assert_eq!(key.len(), 32);
        assert_ne!(s, generate_secret());
    }

    #[test]
    fn failures_retry_until_schedule_is_exhausted() {
        let schedule = RetrySchedule::parse("10,60,180").unwrap();
        let outcomes: Vec<FailureOutcome> = (1..=schedule.max_attempts())
            .map(|n| failure_outcome(&schedule, n))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                FailureOutcome::Retry(Duration::from_secs(10)),
                FailureOutcome::Retry(Duration::from_secs(60)),
                FailureOutcome::Retry(Duration::from_secs(180)),
                FailureOutcome::Failed,
            ]
        );
    }

    #[tokio::test]
    async fn delivery_sends_signed_headers() {
        let server = MockServer::start().await;
        let secret = generate_secret();
        let msg_id = Uuid::new_v4();
        let body = r#"{"type":"record.completed","data":{}}"#.to_string();
        let expected = sign_payload(&secret, &msg_id.to_string(), 1700000000, &body).unwrap();

        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("webhook-id", msg_id.to_string().as_str()))
            .and(header("webhook-timestamp", "1700000000"))
            .and(header_exists("webhook-signature"))
            .and(header_exists("content-type"))
            .and(body_string(body.clone()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        deliver(&client, &format!("{}/hook", server.uri()), &secret, msg_id, 1700000000, body)
            .await
            .unwrap();

        // `v1,<base64>` contains a comma, so compare the raw header value
        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let sent = received[0].headers.get("webhook-signature").unwrap();
        assert_eq!(sent.to_str().unwrap(), expected);
    }

    #[tokio::test]
    async fn non_2xx_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = deliver(&client, &server.uri(), &generate_secret(), Uuid::new_v4(), 1, "{}".into())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Status(503)));
        assert_eq!(err.to_string(), "HTTP 503");
    }

    #[tokio::test]
    async fn timeouts_are_transport_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let err = deliver(&client, &server.uri(), &generate_secret(), Uuid::new_v4(), 1, "{}".into())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)));
    }
}
