use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use crate::state::SharedState;

pub async fn get_status(State(state): State<SharedState>) -> (StatusCode, Json<JsonValue>) {
    let database = match sqlx::query("SELECT 1").execute(&state.pg_pool).await {
        Ok(_) => "ok".to_string(),
        Err(e) => {
            warn!("status: postgres ping failed: {e:?}");
            "unavailable".to_string()
        }
    };

    let info = state.search.info();
    let search = match state.search.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => {
            warn!(engine=%info.name, "status: search engine ping failed: {e}");
            "unavailable".to_string()
        }
    };

    let healthy = database == "ok" && search == "ok";
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "database": database,
            "search_engine": {
                "name": info.name,
                "url": info.url,
                "status": search,
            },
        })),
    )
}
