use std::collections::HashSet;

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::schema::{Field, FieldSettings, LabelOption, Question, QuestionSettings, ResponseStatus};

pub const MAX_NAME_LEN: usize = 200;
pub const RATING_MIN: i64 = 0;
pub const RATING_MAX: i64 = 10;
pub const MIN_VISIBLE_OPTIONS: u32 = 3;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid name `{0}`: use lowercase letters, digits, `-` or `_` (max 200 chars)")]
    InvalidName(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("unknown field `{0}`")]
    UnknownField(String),

    #[error("field `{field}`: {message}")]
    InvalidFieldValue { field: String, message: String },

    #[error("metadata must be a JSON object")]
    InvalidMetadata,

    #[error("unknown question `{0}`")]
    UnknownQuestion(String),

    #[error("missing value for required question `{0}`")]
    MissingAnswer(String),

    #[error("question `{question}`: {message}")]
    InvalidAnswer { question: String, message: String },

    #[error("invalid score: {0}")]
    InvalidScore(String),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidName(name.to_string()))
    }
}

pub fn validate_field_settings(settings: &FieldSettings) -> Result<()> {
    if let FieldSettings::Custom { template, .. } = settings {
        if template.trim().is_empty() {
            return Err(ValidationError::InvalidSettings(
                "custom field template cannot be empty".into(),
            ));
        }
    }
    Ok(())
}

pub fn validate_question_settings(settings: &QuestionSettings) -> Result<()> {
    match settings {
        QuestionSettings::Text { .. } => Ok(()),
        QuestionSettings::Rating { options } => {
            if options.len() < 2 {
                return Err(ValidationError::InvalidSettings(
                    "rating questions need at least 2 options".into(),
                ));
            }
            let mut seen = HashSet::new();
            for o in options {
                if !(RATING_MIN..=RATING_MAX).contains(&o.value) {
                    return Err(ValidationError::InvalidSettings(format!(
                        "rating value {} outside {RATING_MIN}..={RATING_MAX}",
                        o.value
                    )));
                }
                if !seen.insert(o.value) {
                    return Err(ValidationError::InvalidSettings(format!(
                        "duplicate rating value {}",
                        o.value
                    )));
                }
            }
            Ok(())
        }
        QuestionSettings::LabelSelection { options, visible_options }
        | QuestionSettings::MultiLabelSelection { options, visible_options, .. } => {
            validate_label_options(options)?;
            if let Some(v) = visible_options {
                if *v < MIN_VISIBLE_OPTIONS || *v as usize > options.len() {
                    return Err(ValidationError::InvalidSettings(format!(
                        "visible_options must be between {MIN_VISIBLE_OPTIONS} and {}",
                        options.len()
                    )));
                }
            }
            Ok(())
        }
        QuestionSettings::Ranking { options } => validate_label_options(options),
    }
}

fn validate_label_options(options: &[LabelOption]) -> Result<()> {
    if options.len() < 2 {
        return Err(ValidationError::InvalidSettings(
            "at least 2 options are required".into(),
        ));
    }
    let mut seen = HashSet::new();
    for o in options {
        if o.value.trim().is_empty() {
            return Err(ValidationError::InvalidSettings("option values cannot be empty".into()));
        }
        if !seen.insert(o.value.as_str()) {
            return Err(ValidationError::InvalidSettings(format!(
                "duplicate option `{}`",
                o.value
            )));
        }
    }
    Ok(())
}

/// Record field values must cover every required field and nothing else.
pub fn validate_record_fields(fields: &[Field], values: &Map<String, JsonValue>) -> Result<()> {
    for name in values.keys() {
        if !fields.iter().any(|f| &f.name == name) {
            return Err(ValidationError::UnknownField(name.clone()));
        }
    }

    for field in fields {
        match values.get(&field.name) {
            None | Some(JsonValue::Null) => {
                if field.required {
                    return Err(ValidationError::MissingField(field.name.clone()));
                }
            }
            Some(v) => validate_field_value(field, v)?,
        }
    }
    Ok(())
}

fn validate_field_value(field: &Field, value: &JsonValue) -> Result<()> {
    let invalid = |message: &str| ValidationError::InvalidFieldValue {
        field: field.name.clone(),
        message: message.to_string(),
    };

    match &field.settings {
        FieldSettings::Text { .. } | FieldSettings::Image => {
            if !value.is_string() {
                return Err(invalid("expected a string"));
            }
        }
        FieldSettings::Chat { .. } => {
            let messages = value.as_array().ok_or_else(|| invalid("expected a list of messages"))?;
            for m in messages {
                let has_role = m.get("role").map(JsonValue::is_string).unwrap_or(false);
                let has_content = m.get("content").map(JsonValue::is_string).unwrap_or(false);
                if !has_role || !has_content {
                    return Err(invalid("chat messages need string `role` and `content`"));
                }
            }
        }
        FieldSettings::Custom { .. } => {}
    }
    Ok(())
}

pub fn validate_metadata(metadata: &JsonValue) -> Result<Map<String, JsonValue>> {
    match metadata {
        JsonValue::Object(map) => Ok(map.clone()),
        _ => Err(ValidationError::InvalidMetadata),
    }
}

/// Validates response values for a given status.
///
/// Submitted responses must answer every required question. Draft and discarded
/// responses may be partial, but any value present must still be well formed.
pub fn validate_response_values(
    questions: &[Question],
    status: ResponseStatus,
    values: Option<&Map<String, JsonValue>>,
) -> Result<()> {
    let empty = Map::new();
    let values = values.unwrap_or(&empty);

    for (name, wrapped) in values {
        let question = questions
            .iter()
            .find(|q| &q.name == name)
            .ok_or_else(|| ValidationError::UnknownQuestion(name.clone()))?;

        let value = wrapped.get("value").ok_or_else(|| ValidationError::InvalidAnswer {
            question: name.clone(),
            message: "expected an object with a `value` key".into(),
        })?;

        validate_question_value(question, value, status == ResponseStatus::Submitted)?;
    }

    if status == ResponseStatus::Submitted {
        for q in questions.iter().filter(|q| q.required) {
            if !values.contains_key(&q.name) {
                return Err(ValidationError::MissingAnswer(q.name.clone()));
            }
        }
    }
    Ok(())
}

/// Validates a single answer against its question. `complete` requires rankings
/// to cover every option.
pub fn validate_question_value(question: &Question, value: &JsonValue, complete: bool) -> Result<()> {
    let invalid = |message: String| ValidationError::InvalidAnswer {
        question: question.name.clone(),
        message,
    };

    match &question.settings {
        QuestionSettings::Text { .. } => match value.as_str() {
            Some(s) if !s.trim().is_empty() => Ok(()),
            Some(_) => Err(invalid("text value cannot be empty".into())),
            None => Err(invalid("expected a string".into())),
        },
        QuestionSettings::Rating { options } => {
            let v = value
                .as_i64()
                .ok_or_else(|| invalid("expected an integer".into()))?;
            if options.iter().any(|o| o.value == v) {
                Ok(())
            } else {
                Err(invalid(format!("{v} is not a valid rating option")))
            }
        }
        QuestionSettings::LabelSelection { options, .. } => {
            let v = value.as_str().ok_or_else(|| invalid("expected a string".into()))?;
            ensure_option(options, v).map_err(invalid)
        }
        QuestionSettings::MultiLabelSelection { options, .. } => {
            let items = value
                .as_array()
                .ok_or_else(|| invalid("expected a list of labels".into()))?;
            if items.is_empty() {
                return Err(invalid("at least one label is required".into()));
            }
            let mut seen = HashSet::new();
            for item in items {
                let v = item.as_str().ok_or_else(|| invalid("labels must be strings".into()))?;
                ensure_option(options, v).map_err(invalid)?;
                if !seen.insert(v) {
                    return Err(invalid(format!("duplicate label `{v}`")));
                }
            }
            Ok(())
        }
        QuestionSettings::Ranking { options } => {
            let items = value
                .as_array()
                .ok_or_else(|| invalid("expected a list of ranked options".into()))?;
            let mut seen = HashSet::new();
            for item in items {
                let v = item
                    .get("value")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| invalid("ranked items need a string `value`".into()))?;
                ensure_option(options, v).map_err(invalid)?;
                if !seen.insert(v) {
                    return Err(invalid(format!("option `{v}` ranked twice")));
                }
                if let Some(rank) = item.get("rank").filter(|r| !r.is_null()) {
                    let rank = rank
                        .as_u64()
                        .ok_or_else(|| invalid("rank must be a positive integer".into()))?;
                    if rank == 0 || rank as usize > options.len() {
                        return Err(invalid(format!(
                            "rank {rank} outside 1..={}",
                            options.len()
                        )));
                    }
                }
            }
            if complete && seen.len() != options.len() {
                return Err(invalid("all options must be ranked".into()));
            }
            Ok(())
        }
    }
}

fn ensure_option(options: &[LabelOption], value: &str) -> std::result::Result<(), String> {
    if options.iter().any(|o| o.value == value) {
        Ok(())
    } else {
        Err(format!("`{value}` is not a valid option"))
    }
}

/// Suggestion values follow answer rules; scores are either one number or one
/// number per item of a list value, each within 0..=1.
pub fn validate_suggestion(question: &Question, value: &JsonValue, score: Option<&JsonValue>) -> Result<()> {
    validate_question_value(question, value, false)?;

    let Some(score) = score.filter(|s| !s.is_null()) else {
        return Ok(());
    };

    let check = |s: &JsonValue| -> Result<()> {
        let n = s
            .as_f64()
            .ok_or_else(|| ValidationError::InvalidScore("expected a number".into()))?;
        if (0.0..=1.0).contains(&n) {
            Ok(())
        } else {
            Err(ValidationError::InvalidScore(format!("{n} outside 0..=1")))
        }
    };

    match (score, value) {
        (JsonValue::Array(scores), JsonValue::Array(items)) => {
            if scores.len() != items.len() {
                return Err(ValidationError::InvalidScore(format!(
                    "expected {} scores, got {}",
                    items.len(),
                    scores.len()
                )));
            }
            scores.iter().try_for_each(check)
        }
        (JsonValue::Array(_), _) => Err(ValidationError::InvalidScore(
            "a list of scores requires a list value".into(),
        )),
        (s, _) => check(s),
    }
}
