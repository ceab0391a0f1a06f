use std::collections::BTreeMap;

use annotations::{RecordStatus, ResponseStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// What a search index needs to know about a dataset to lay out its mappings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexSpec {
    pub dataset_id: Uuid,
    pub fields: Vec<String>,
    pub questions: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseDoc {
    pub status: ResponseStatus,
    #[serde(default)]
    pub values: Option<Map<String, JsonValue>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuggestionDoc {
    pub value: JsonValue,
    #[serde(default)]
    pub score: Option<JsonValue>,
    #[serde(default)]
    pub agent: Option<String>,
}

/// Denormalized view of a record with its responses and suggestions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordDocument {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub fields: Map<String, JsonValue>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
    pub status: RecordStatus,
    /// Keyed by user id.
    #[serde(default)]
    pub responses: BTreeMap<Uuid, ResponseDoc>,
    /// Keyed by question name.
    #[serde(default)]
    pub suggestions: BTreeMap<String, SuggestionDoc>,
    /// Source row version; a write carrying a lower version than the indexed
    /// document is dropped.
    #[serde(default)]
    pub version: i64,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecordDocument {
    pub fn response_statuses(&self) -> Vec<ResponseStatus> {
        let mut out: Vec<ResponseStatus> = Vec::new();
        for r in self.responses.values() {
            if !out.contains(&r.status) {
                out.push(r.status);
            }
        }
        out
    }

    /// Concatenated text for one field or for every string field.
    pub fn text_for(&self, field: Option<&str>) -> String {
        let mut buf = String::new();
        let mut push = |v: &JsonValue| collect_text(v, &mut buf);
        match field {
            Some(name) => {
                if let Some(v) = self.fields.get(name) {
                    push(v);
                }
            }
            None => self.fields.values().for_each(push),
        }
        buf
    }
}

fn collect_text(value: &JsonValue, buf: &mut String) {
    match value {
        JsonValue::String(s) => {
            buf.push_str(s);
            buf.push(' ');
        }
        JsonValue::Array(items) => items.iter().for_each(|i| collect_text(i, buf)),
        JsonValue::Object(map) => map.values().for_each(|v| collect_text(v, buf)),
        _ => {}
    }
}
