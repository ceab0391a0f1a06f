use annotations::{RecordStatus, ResponseStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::SearchError;

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 1000;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TextQuery {
    pub q: String,
    /// Restricts the match to a single record field.
    #[serde(default)]
    pub field: Option<String>,
}

/// `Pending` matches records the user (or anyone, without a user) has not responded to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatusFilter {
    Draft,
    Submitted,
    Discarded,
    Pending,
}

impl ResponseStatusFilter {
    pub fn matches(&self, status: Option<ResponseStatus>) -> bool {
        match (self, status) {
            (ResponseStatusFilter::Pending, None) => true,
            (ResponseStatusFilter::Draft, Some(ResponseStatus::Draft)) => true,
            (ResponseStatusFilter::Submitted, Some(ResponseStatus::Submitted)) => true,
            (ResponseStatusFilter::Discarded, Some(ResponseStatus::Discarded)) => true,
            _ => false,
        }
    }

    pub fn as_response_status(&self) -> Option<ResponseStatus> {
        match self {
            ResponseStatusFilter::Draft => Some(ResponseStatus::Draft),
            ResponseStatusFilter::Submitted => Some(ResponseStatus::Submitted),
            ResponseStatusFilter::Discarded => Some(ResponseStatus::Discarded),
            ResponseStatusFilter::Pending => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseFilter {
    pub statuses: Vec<ResponseStatusFilter>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TermsFilter {
    pub key: String,
    pub values: Vec<JsonValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default)]
    pub record_status: Vec<RecordStatus>,
    #[serde(default)]
    pub response: Option<ResponseFilter>,
    #[serde(default)]
    pub metadata: Vec<TermsFilter>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    InsertedAt,
    UpdatedAt,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::InsertedAt => "inserted_at",
            SortField::UpdatedAt => "updated_at",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub field: SortField,
    #[serde(default = "default_order")]
    pub order: SortOrder,
}

fn default_order() -> SortOrder {
    SortOrder::Asc
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub text: Option<TextQuery>,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default)]
    pub sort: Vec<Order>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: None,
            filters: Filters::default(),
            sort: Vec::new(),
            offset: 0,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl SearchQuery {
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.limit == 0 || self.limit > MAX_LIMIT {
            return Err(SearchError::InvalidQuery(format!(
                "limit must be between 1 and {MAX_LIMIT}"
            )));
        }
        if let Some(text) = &self.text {
            if text.q.trim().is_empty() {
                return Err(SearchError::InvalidQuery("text query cannot be empty".into()));
            }
        }
        if let Some(r) = &self.filters.response {
            if r.statuses.is_empty() {
                return Err(SearchError::InvalidQuery(
                    "response filter needs at least one status".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchItem {
    pub record_id: Uuid,
    pub score: Option<f32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub items: Vec<SearchItem>,
    pub total: u64,
}
