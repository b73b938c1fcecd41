//! shyLLM Core - text generation behind a small, swappable pipeline seam
//!
//! This crate implements:
//! - Causal LM inference (LLaMA and Qwen2 families) via candle-transformers
//! - Model loading from HuggingFace Hub
//! - Temperature and top-p sampling, plain and streaming
//! - The generation request schema and its validation
//! - A single-slot, lazily populated pipeline cache

pub mod model;
pub mod engine;
pub mod pipeline;
pub mod query;

pub use model::{ModelArch, ModelConfig, LoadedModel, load_model, select_device, TokenOutputStream};
pub use engine::{InferenceEngine, EngineConfig, EngineStats, HubLoader, generation_budget, full_text};
pub use pipeline::{GenerationParams, PipelineCache, PipelineLoader, TextGenerator};
pub use query::{FieldError, Query, ValidQuery, ValidationError};
