pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod record_status;
pub mod retry;
pub mod routes_datasets;
pub mod routes_jobs;
pub mod routes_records;
pub mod routes_responses;
pub mod routes_status;
pub mod routes_suggestions;
pub mod routes_users;
pub mod routes_webhooks;
pub mod rows;
pub mod search_sync;
pub mod state;
pub mod webhooks;
pub mod worker_loop;

use std::sync::Arc;

use axum::{
    routing::{delete, get, patch, post, put},
    Router,
};
use search_index::{ElasticsearchEngine, InMemorySearchEngine, SearchEngine};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::{AppConfig, SearchEngineKind};
use crate::state::SharedState;

pub fn build_search_engine(cfg: &AppConfig) -> Arc<dyn SearchEngine> {
    match &cfg.search_engine {
        SearchEngineKind::Memory => Arc::new(InMemorySearchEngine::new()),
        SearchEngineKind::Elasticsearch { url, index_prefix } => {
            Arc::new(ElasticsearchEngine::new(url.clone(), index_prefix.clone()))
        }
    }
}

pub fn build_router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/me", get(routes_users::get_me))
        .route("/users", get(routes_users::list_users).post(routes_users::create_user))
        .route(
            "/workspaces",
            get(routes_users::list_workspaces).post(routes_users::create_workspace),
        )
        .route("/workspaces/:id/users", post(routes_users::add_workspace_user))
        .route(
            "/datasets",
            get(routes_datasets::list_datasets).post(routes_datasets::create_dataset),
        )
        .route(
            "/datasets/:id",
            get(routes_datasets::get_dataset)
                .patch(routes_datasets::update_dataset)
                .delete(routes_datasets::delete_dataset),
        )
        .route("/datasets/:id/publish", put(routes_datasets::publish_dataset))
        .route("/datasets/:id/progress", get(routes_datasets::get_progress))
        .route(
            "/datasets/:id/fields",
            get(routes_datasets::list_fields).post(routes_datasets::create_field),
        )
        .route(
            "/datasets/:id/questions",
            get(routes_datasets::list_questions).post(routes_datasets::create_question),
        )
        .route(
            "/datasets/:id/records",
            get(routes_records::list_records).delete(routes_records::delete_records),
        )
        .route("/datasets/:id/records/bulk", post(routes_records::create_records_bulk))
        .route("/datasets/:id/records/search", post(routes_records::search_records))
        .route(
            "/datasets/:id/responses/bulk",
            post(routes_responses::upsert_responses_bulk),
        )
        .route(
            "/records/:id",
            get(routes_records::get_record)
                .patch(routes_records::update_record)
                .delete(routes_records::delete_record),
        )
        .route("/records/:id/responses", post(routes_responses::upsert_response))
        .route(
            "/records/:id/suggestions",
            get(routes_suggestions::list_suggestions).put(routes_suggestions::upsert_suggestion),
        )
        .route(
            "/responses/:id",
            put(routes_responses::update_response).delete(routes_responses::delete_response),
        )
        .route("/suggestions/:id", delete(routes_suggestions::delete_suggestion))
        .route(
            "/webhooks",
            get(routes_webhooks::list_webhooks).post(routes_webhooks::create_webhook),
        )
        .route(
            "/webhooks/:id",
            patch(routes_webhooks::update_webhook).delete(routes_webhooks::delete_webhook),
        )
        .route("/jobs", get(routes_jobs::list_jobs))
        .route("/jobs/:id", get(routes_jobs::get_job))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let api = protected.route("/status", get(routes_status::get_status));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
