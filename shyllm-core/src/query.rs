//! Request schema for text generation

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::GenerationParams;

fn default_max_length() -> i64 {
    100
}

fn default_temperature() -> f64 {
    1.0
}

fn default_top_p() -> f64 {
    0.95
}

/// Input query for text generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub prompt: String,
    #[serde(default = "default_max_length")]
    pub max_length: i64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
}

/// A single rejected field
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("Prompt cannot be empty")]
    EmptyPrompt,
    #[error("max_length must be a positive integer")]
    NonPositiveMaxLength(i64),
}

impl FieldError {
    pub fn field(&self) -> &'static str {
        match self {
            FieldError::EmptyPrompt => "prompt",
            FieldError::NonPositiveMaxLength(_) => "max_length",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} validation error(s) for Query", .0.len())]
pub struct ValidationError(pub Vec<FieldError>);

impl ValidationError {
    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }
}

/// A query whose fields passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidQuery {
    prompt: String,
    max_length: usize,
    temperature: f64,
    top_p: f64,
}

impl ValidQuery {
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            max_length: self.max_length,
            temperature: self.temperature,
            top_p: self.top_p,
            seed: None,
        }
    }
}

impl Query {
    /// Check every field, collecting all failures.
    ///
    /// The emptiness check runs on the prompt as sent; surrounding
    /// whitespace is stripped only afterwards.
    pub fn validate(self) -> Result<ValidQuery, ValidationError> {
        let mut errors = Vec::new();
        if self.prompt.is_empty() {
            errors.push(FieldError::EmptyPrompt);
        }
        let max_length = match usize::try_from(self.max_length) {
            Ok(n) if n > 0 => n,
            _ => {
                errors.push(FieldError::NonPositiveMaxLength(self.max_length));
                0
            }
        };
        if !errors.is_empty() {
            return Err(ValidationError(errors));
        }

        Ok(ValidQuery {
            prompt: self.prompt.trim().to_string(),
            max_length,
            temperature: self.temperature,
            top_p: self.top_p,
        })
    }
}
