use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use shyllm_core::ValidationError;
use thiserror::Error;

/// Everything a request handler can fail with, mapped onto HTTP responses.
///
/// Generation faults keep their cause for logging, but the response only
/// ever carries the fixed message.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    MalformedBody(#[from] JsonRejection),

    #[error("Unauthorized API key provided.")]
    Unauthorized,

    #[error("Failed to generate text.")]
    Generation(#[source] anyhow::Error),

    #[error("Error streaming text.")]
    Streaming(#[source] anyhow::Error),
}

#[derive(Debug, Serialize)]
pub struct FieldDetail {
    pub loc: Vec<String>,
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Detail {
    Message(String),
    Fields(Vec<FieldDetail>),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub detail: Detail,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::MalformedBody(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Generation(_) | ApiError::Streaming(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> Detail {
        match self {
            ApiError::Validation(err) => Detail::Fields(
                err.errors()
                    .iter()
                    .map(|field| FieldDetail {
                        loc: vec!["body".to_string(), field.field().to_string()],
                        msg: field.to_string(),
                        kind: "value_error",
                    })
                    .collect(),
            ),
            ApiError::MalformedBody(rejection) => Detail::Fields(vec![FieldDetail {
                loc: vec!["body".to_string()],
                msg: rejection.body_text(),
                kind: "json_invalid",
            }]),
            other => Detail::Message(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorResponse { detail: self.detail() })).into_response()
    }
}
