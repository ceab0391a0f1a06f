use annotations::WebhookEvent;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::PgConnection;

pub const EVENT_VERSION: u32 = 1;

pub fn envelope(event: WebhookEvent, data: JsonValue) -> JsonValue {
    serde_json::json!({
        "type": event.as_str(),
        "version": EVENT_VERSION,
        "timestamp": Utc::now(),
        "data": data,
    })
}

/// Queues one outbox row per enabled webhook subscribed to `event`. Must run in
/// the transaction of the mutation it describes so nothing is announced for a
/// rolled back change.
pub async fn notify_tx<T: Serialize>(
    conn: &mut PgConnection,
    event: WebhookEvent,
    data: &T,
) -> anyhow::Result<u64> {
    let data = serde_json::to_value(data)?;
    let result = sqlx::query(
        r#"
        INSERT INTO webhook_outbox (id, webhook_id, event_type, event)
        SELECT gen_random_uuid(), w.id, $1, $2
        FROM webhooks w
        WHERE w.enabled AND $1 = ANY(w.events)
        "#,
    )
    .bind(event.as_str())
    .bind(envelope(event, data))
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_carries_type_and_data() {
        let e = envelope(WebhookEvent::RecordCompleted, json!({"id": "r1"}));
        assert_eq!(e["type"], "record.completed");
        assert_eq!(e["version"], 1);
        assert_eq!(e["data"]["id"], "r1");
        assert!(e["timestamp"].is_string());
    }
}
