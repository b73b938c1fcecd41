//! Generation pipeline seam and the single-slot pipeline cache
//!
//! The HTTP layer only ever talks to a [`TextGenerator`]. Where it comes
//! from is decided by a [`PipelineLoader`], and [`PipelineCache`] keeps the
//! most recently loaded one for the lifetime of the process.

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Sampling parameters for one generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Upper bound on prompt tokens plus generated tokens
    pub max_length: usize,
    pub temperature: f64,
    pub top_p: f64,
    /// Fixed RNG seed; a fresh random seed is used when absent
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: 100,
            temperature: 1.0,
            top_p: 0.95,
            seed: None,
        }
    }
}

/// Maps a prompt and sampling parameters to generated text.
///
/// Both methods return the full text: the prompt followed by the
/// continuation.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;

    /// Like [`generate`](TextGenerator::generate), but also hands every
    /// decoded increment of the continuation to `on_text` as it is produced.
    fn generate_streaming(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_text: &mut dyn FnMut(&str),
    ) -> Result<String> {
        let text = self.generate(prompt, params)?;
        if let Some(continuation) = text.strip_prefix(prompt) {
            on_text(continuation);
        }
        Ok(text)
    }
}

/// Builds a pipeline for a model id. May block for a long time.
pub trait PipelineLoader: Send + Sync {
    fn load(&self, model_id: &str) -> Result<Arc<dyn TextGenerator>>;
}

struct CachedPipeline {
    model_id: String,
    pipeline: Arc<dyn TextGenerator>,
}

/// Single-slot memo of the most recently loaded pipeline.
///
/// Readers share the slot; the first caller for a model id takes the write
/// lock and loads while others wait. Failed loads are not remembered. There
/// is no invalidation: a pipeline stays until a different model id is
/// requested.
pub struct PipelineCache {
    loader: Arc<dyn PipelineLoader>,
    slot: RwLock<Option<CachedPipeline>>,
}

impl PipelineCache {
    pub fn new(loader: Arc<dyn PipelineLoader>) -> Self {
        Self {
            loader,
            slot: RwLock::new(None),
        }
    }

    /// Cached pipeline for `model_id`, if that is what the slot holds.
    pub fn cached(&self, model_id: &str) -> Option<Arc<dyn TextGenerator>> {
        self.slot
            .read()
            .as_ref()
            .filter(|cached| cached.model_id == model_id)
            .map(|cached| Arc::clone(&cached.pipeline))
    }

    pub fn cached_model_id(&self) -> Option<String> {
        self.slot.read().as_ref().map(|cached| cached.model_id.clone())
    }

    pub fn get_or_load(&self, model_id: &str) -> Result<Arc<dyn TextGenerator>> {
        if let Some(pipeline) = self.cached(model_id) {
            return Ok(pipeline);
        }

        let mut slot = self.slot.write();
        if let Some(cached) = slot.as_ref().filter(|cached| cached.model_id == model_id) {
            return Ok(Arc::clone(&cached.pipeline));
        }

        info!("Loading pipeline for model {}", model_id);
        let pipeline = self.loader.load(model_id).map_err(|e| {
            error!("Error loading model {}: {:#}", model_id, e);
            e
        })?;

        *slot = Some(CachedPipeline {
            model_id: model_id.to_string(),
            pipeline: Arc::clone(&pipeline),
        });
        Ok(pipeline)
    }
}
