use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

use crate::distribution::Distribution;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

// Status enums are stored as TEXT columns and travel as snake_case JSON strings.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

text_enum!(UserRole, "user role", {
    Owner => "owner",
    Admin => "admin",
    Annotator => "annotator",
});

text_enum!(DatasetStatus, "dataset status", {
    Draft => "draft",
    Ready => "ready",
});

text_enum!(RecordStatus, "record status", {
    Pending => "pending",
    Completed => "completed",
});

text_enum!(ResponseStatus, "response status", {
    Draft => "draft",
    Submitted => "submitted",
    Discarded => "discarded",
});

text_enum!(SuggestionType, "suggestion type", {
    Model => "model",
    Human => "human",
});

text_enum!(WebhookEvent, "webhook event", {
    DatasetCreated => "dataset.created",
    DatasetUpdated => "dataset.updated",
    DatasetDeleted => "dataset.deleted",
    DatasetPublished => "dataset.published",
    RecordCreated => "record.created",
    RecordUpdated => "record.updated",
    RecordDeleted => "record.deleted",
    RecordCompleted => "record.completed",
    ResponseCreated => "response.created",
    ResponseUpdated => "response.updated",
    ResponseDeleted => "response.deleted",
});

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub first_name: Option<String>,
    pub role: UserRole,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    pub name: String,
    pub guidelines: Option<String>,
    pub allow_extra_metadata: bool,
    pub status: DatasetStatus,
    pub distribution: Distribution,
    pub workspace_id: Uuid,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Dataset {
    pub fn is_draft(&self) -> bool {
        self.status == DatasetStatus::Draft
    }

    pub fn is_ready(&self) -> bool {
        self.status == DatasetStatus::Ready
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldSettings {
    Text {
        #[serde(default)]
        use_markdown: bool,
    },
    Image,
    Chat {
        #[serde(default = "default_true")]
        use_markdown: bool,
    },
    Custom {
        template: String,
        #[serde(default)]
        advanced_mode: bool,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Field {
    pub id: Uuid,
    pub name: String,
    pub title: String,
    pub required: bool,
    pub settings: FieldSettings,
    pub dataset_id: Uuid,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatingOption {
    pub value: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelOption {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionsOrder {
    #[default]
    Natural,
    Suggestion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestionSettings {
    Text {
        #[serde(default)]
        use_markdown: bool,
    },
    Rating {
        options: Vec<RatingOption>,
    },
    LabelSelection {
        options: Vec<LabelOption>,
        #[serde(default)]
        visible_options: Option<u32>,
    },
    MultiLabelSelection {
        options: Vec<LabelOption>,
        #[serde(default)]
        visible_options: Option<u32>,
        #[serde(default)]
        options_order: OptionsOrder,
    },
    Ranking {
        options: Vec<LabelOption>,
    },
}

impl QuestionSettings {
    pub fn type_name(&self) -> &'static str {
        match self {
            QuestionSettings::Text { .. } => "text",
            QuestionSettings::Rating { .. } => "rating",
            QuestionSettings::LabelSelection { .. } => "label_selection",
            QuestionSettings::MultiLabelSelection { .. } => "multi_label_selection",
            QuestionSettings::Ranking { .. } => "ranking",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub name: String,
    pub title: String,
    pub description: Option<String>,
    pub required: bool,
    pub settings: QuestionSettings,
    pub dataset_id: Uuid,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub external_id: Option<String>,
    pub fields: Map<String, JsonValue>,
    pub metadata: Option<Map<String, JsonValue>>,
    pub status: RecordStatus,
    pub count_submitted_responses: i64,
    /// Bumped by every change to the record, its responses or its suggestions.
    pub version: i64,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Response values are keyed by question name, each wrapping the answer as `{"value": ...}`.
pub type ResponseValues = Map<String, JsonValue>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: Uuid,
    pub record_id: Uuid,
    pub user_id: Uuid,
    pub status: ResponseStatus,
    pub values: Option<ResponseValues>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: Uuid,
    pub record_id: Uuid,
    pub question_id: Uuid,
    pub value: JsonValue,
    pub score: Option<JsonValue>,
    pub agent: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<SuggestionType>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub url: String,
    pub secret: String,
    pub events: Vec<WebhookEvent>,
    pub enabled: bool,
    pub description: Option<String>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
