use std::sync::Arc;

use search_index::SearchEngine;
use sqlx::PgPool;

use crate::config::AppConfig;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub pg_pool: PgPool,
    pub config: AppConfig,
    pub search: Arc<dyn SearchEngine>,
}

impl AppState {
    pub fn new(pg_pool: PgPool, config: AppConfig, search: Arc<dyn SearchEngine>) -> Self {
        Self {
            pg_pool,
            config,
            search,
        }
    }
}
