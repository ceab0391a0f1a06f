use annotations::{DistributionError, ValidationError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use search_index::SearchError;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::retry::RetryableError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Distribution(#[from] DistributionError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn not_found(kind: &str, id: Uuid) -> Self {
        ApiError::NotFound(format!("{kind} with id `{id}` not found"))
    }

    pub fn forbidden() -> Self {
        ApiError::Forbidden("not allowed to perform this action".to_string())
    }

    /// Errors that no amount of retrying will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApiError::Distribution(DistributionError::UnsupportedStrategy(_)))
    }

    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::Unprocessable(_) | ApiError::Validation(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable_entity")
            }
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Distribution(DistributionError::InvalidMinSubmitted(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable_entity")
            }
            ApiError::Distribution(DistributionError::UnsupportedStrategy(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "unsupported_distribution_strategy")
            }
            ApiError::Search(SearchError::InvalidQuery(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable_entity")
            }
            ApiError::Search(SearchError::IndexNotFound(_)) => (StatusCode::NOT_FOUND, "index_not_found"),
            ApiError::Search(_) => (StatusCode::BAD_GATEWAY, "search_engine_error"),
            ApiError::Database(e) => match db_code(e).as_deref() {
                Some("23505") => (StatusCode::CONFLICT, "conflict"),
                Some("23503") => (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable_entity"),
                _ if matches!(e, sqlx::Error::RowNotFound) => (StatusCode::NOT_FOUND, "not_found"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            },
            ApiError::Other(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }

    /// Body of the `detail` object, also reported per item by bulk endpoints.
    pub fn detail(&self) -> serde_json::Value {
        json!({
            "code": self.parts().1,
            "message": self.message(),
        })
    }

    fn message(&self) -> String {
        match self {
            ApiError::Database(e) => match db_code(e).as_deref() {
                Some("23505") => "resource already exists".to_string(),
                Some("23503") => "referenced resource does not exist".to_string(),
                _ if matches!(e, sqlx::Error::RowNotFound) => "resource not found".to_string(),
                _ => "database error".to_string(),
            },
            ApiError::Other(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

fn db_code(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

impl RetryableError for ApiError {
    fn is_serialization_conflict(&self) -> bool {
        match self {
            ApiError::Database(e) => e.is_serialization_conflict(),
            ApiError::Other(e) => e
                .downcast_ref::<sqlx::Error>()
                .map(RetryableError::is_serialization_conflict)
                .unwrap_or(false),
            _ => false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, _) = self.parts();
        if status.is_server_error() {
            error!(error = ?self, "request failed");
        }

        let body = Json(json!({ "detail": self.detail() }));

        (status, body).into_response()
    }
}
