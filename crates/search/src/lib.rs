//! Search engine integration for annotation records.
//!
//! The relational store is the source of truth; engines only hold a
//! denormalized copy of each record, rebuilt on every sync.

mod document;
mod elastic;
mod memory;
mod query;

pub use document::{IndexSpec, RecordDocument, ResponseDoc, SuggestionDoc};
pub use elastic::ElasticsearchEngine;
pub use memory::InMemorySearchEngine;
pub use query::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("index for dataset {0} not found")]
    IndexNotFound(Uuid),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("search engine request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("search engine returned {status}: {body}")]
    Engine { status: u16, body: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SearchError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineInfo {
    pub name: String,
    pub url: Option<String>,
}

#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Creates the dataset index; succeeds if it already exists.
    async fn create_index(&self, spec: &IndexSpec) -> Result<()>;
    /// Drops the dataset index; succeeds if it does not exist.
    async fn delete_index(&self, dataset_id: Uuid) -> Result<()>;
    /// Inserts or replaces documents.
    async fn index_records(&self, dataset_id: Uuid, docs: &[RecordDocument]) -> Result<()>;
    /// Removes documents; unknown ids are ignored.
    async fn delete_records(&self, dataset_id: Uuid, ids: &[Uuid]) -> Result<()>;
    async fn search(&self, dataset_id: Uuid, query: &SearchQuery) -> Result<SearchResponse>;
    async fn ping(&self) -> Result<()>;
    fn info(&self) -> EngineInfo;
}
