//! REST endpoints over the generation pipeline

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shyllm_core::{PipelineCache, TextGenerator, ValidQuery};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    cache: Arc<PipelineCache>,
    model_name: Arc<str>,
    api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(cache: PipelineCache, model_name: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            cache: Arc::new(cache),
            model_name: Arc::from(model_name.into()),
            api_key: api_key.map(Arc::from),
        }
    }

    pub fn cache(&self) -> &PipelineCache {
        &self.cache
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct AuthParams {
    pub api_key: String,
}

impl AuthParams {
    /// Pick `api_key` out of the query pairs. When the key is repeated the
    /// last value wins.
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let api_key = pairs
            .into_iter()
            .rev()
            .find(|(name, _)| name == "api_key")
            .map(|(_, value)| value)
            .unwrap_or_default();
        Self { api_key }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub prompt: String,
    pub response: String,
}

/// Reject a supplied key that does not match the configured one.
///
/// An empty key is always let through, whether or not a secret is set.
pub fn authorize(supplied: &str, configured: Option<&str>) -> Result<(), ApiError> {
    if !supplied.is_empty() && Some(supplied) != configured {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

fn parse_query(body: Result<Json<shyllm_core::Query>, JsonRejection>) -> Result<ValidQuery, ApiError> {
    let Json(query) = body?;
    Ok(query.validate()?)
}

fn preview(prompt: &str) -> String {
    prompt.chars().take(50).collect()
}

/// Fetch (or lazily load) the configured pipeline on a blocking thread.
async fn pipeline(state: &AppState) -> anyhow::Result<Arc<dyn TextGenerator>> {
    let cache = Arc::clone(&state.cache);
    let model_name = Arc::clone(&state.model_name);
    tokio::task::spawn_blocking(move || cache.get_or_load(&model_name)).await?
}

async fn root() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "LLM Backend is running!".to_string(),
    })
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn generate_text(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
    body: Result<Json<shyllm_core::Query>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let query = parse_query(body)?;
    let auth = AuthParams::from_pairs(pairs);
    authorize(&auth.api_key, state.api_key.as_deref())?;
    info!(
        "Generate request: prompt='{}' max_length={}",
        preview(query.prompt()),
        query.max_length()
    );

    let prompt = query.prompt().to_string();
    let params = query.params();
    let result = match pipeline(&state).await {
        Ok(pipeline) => tokio::task::spawn_blocking(move || pipeline.generate(&prompt, &params))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|generated| generated),
        Err(e) => Err(e),
    };

    let response = result.map_err(|e| {
        error!("Error generating text: {:#}", e);
        ApiError::Generation(e)
    })?;

    Ok(Json(GenerateResponse {
        prompt: query.prompt().to_string(),
        response,
    }))
}

async fn stream_text(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
    body: Result<Json<shyllm_core::Query>, JsonRejection>,
) -> Result<Response, ApiError> {
    let query = parse_query(body)?;
    let auth = AuthParams::from_pairs(pairs);
    authorize(&auth.api_key, state.api_key.as_deref())?;
    info!("Stream request: prompt='{}'", preview(query.prompt()));

    let pipeline = pipeline(&state).await.map_err(|e| {
        error!("Error streaming text: {:#}", e);
        ApiError::Streaming(e)
    })?;

    let (tx, rx) = mpsc::channel::<io::Result<String>>(32);
    let prompt = query.prompt().to_string();
    let params = query.params();
    tokio::task::spawn_blocking(move || {
        if tx.blocking_send(Ok(prompt.clone())).is_err() {
            return;
        }
        let mut forward = |text: &str| {
            // A closed channel means the client went away; the rest is dropped.
            let _ = tx.blocking_send(Ok(text.to_string()));
        };
        if let Err(e) = pipeline.generate_streaming(&prompt, &params, &mut forward) {
            error!("Error streaming text: {:#}", e);
            let _ = tx.blocking_send(Err(io::Error::new(io::ErrorKind::Other, "Error streaming text.")));
        }
    });

    let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(chunks),
    )
        .into_response())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/generate", post(generate_text))
        .route("/stream", post(stream_text))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
