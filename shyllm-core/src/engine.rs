//! Inference engine - runs prompt prefill and token-by-token decode
//!
//! [`InferenceEngine`] is the candle-backed [`TextGenerator`]; [`HubLoader`]
//! builds one from a HuggingFace model id.

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::{debug, info};

use crate::model::{
    create_logits_processor, default_dtype, load_model, select_device, LoadedModel, ModelConfig,
    TokenOutputStream,
};
use crate::pipeline::{GenerationParams, PipelineLoader, TextGenerator};

/// Configuration for the inference engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model configuration
    pub model_config: ModelConfig,
    /// Repeat penalty (1.0 = no penalty)
    pub repeat_penalty: f32,
    /// Context size for repeat penalty
    pub repeat_last_n: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_config: ModelConfig::default(),
            repeat_penalty: 1.0,
            repeat_last_n: 64,
        }
    }
}

impl EngineConfig {
    pub fn with_model(model_config: ModelConfig) -> Self {
        Self {
            model_config,
            ..Default::default()
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub device: String,
    pub model_id: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dtype: String,
}

/// Number of tokens that may still be generated when `max_length` bounds
/// prompt and continuation together.
///
/// A prompt that encodes to no tokens has nothing to prefill, so nothing is
/// generated for it.
pub fn generation_budget(prompt_tokens: usize, max_length: usize) -> usize {
    if prompt_tokens == 0 {
        return 0;
    }
    max_length.saturating_sub(prompt_tokens)
}

/// Prompt followed by the continuation, where the continuation is the decoded
/// full sequence minus the part it shares with the decoded prompt.
///
/// The shared part is measured in chars, so a prompt whose last token decodes
/// differently once more tokens follow still keeps the whole continuation.
pub fn full_text(prompt: &str, decoded_prompt: &str, decoded_all: &str) -> String {
    let shared: usize = decoded_prompt
        .chars()
        .zip(decoded_all.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();
    let continuation = decoded_all.get(shared..).unwrap_or_default();
    format!("{}{}", prompt, continuation)
}

/// Inference engine that performs actual model execution
pub struct InferenceEngine {
    config: EngineConfig,
    device: Device,
    model: Mutex<LoadedModel>,
}

impl InferenceEngine {
    /// Create a new inference engine with the specified model
    pub fn new(config: EngineConfig, device: Device) -> Result<Self> {
        info!("Initializing inference engine...");
        let model = load_model(&config.model_config, &device)?;
        info!("Loaded model architecture: {:?}", model.arch);

        Ok(Self {
            config,
            device,
            model: Mutex::new(model),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn lock(&self) -> MutexGuard<'_, LoadedModel> {
        self.model.lock()
    }

    /// Encode a prompt to tokens
    pub fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
        let model = self.lock();
        model
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("Tokenization error: {}", e))
            .map(|enc| enc.get_ids().to_vec())
    }

    /// Decode tokens to text
    pub fn decode(&self, tokens: &[u32]) -> Result<String> {
        let model = self.lock();
        model
            .tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Decode error: {}", e))
    }

    fn apply_repeat_penalty(&self, logits: Tensor, tokens: &[u32]) -> Result<Tensor> {
        if self.config.repeat_penalty == 1.0 {
            return Ok(logits);
        }
        let start_at = tokens.len().saturating_sub(self.config.repeat_last_n);
        Ok(candle_transformers::utils::apply_repeat_penalty(
            &logits,
            self.config.repeat_penalty,
            &tokens[start_at..],
        )?)
    }

    /// Run prefill plus decode, handing every accepted token to `on_token`.
    ///
    /// Holds the model lock for the whole generation. Returns the generated
    /// token ids (prompt excluded).
    fn run<F>(&self, prompt_tokens: &[u32], params: &GenerationParams, mut on_token: F) -> Result<Vec<u32>>
    where
        F: FnMut(u32) -> Result<()>,
    {
        let budget = generation_budget(prompt_tokens.len(), params.max_length);
        let mut generated = Vec::with_capacity(budget);
        if budget == 0 {
            debug!(
                "Nothing to generate for a prompt of {} tokens with max_length {}",
                prompt_tokens.len(),
                params.max_length
            );
            return Ok(generated);
        }

        let seed = params.seed.unwrap_or_else(rand::random);
        let mut logits_processor = create_logits_processor(seed, params.temperature, params.top_p);

        let mut model = self.lock();
        model.reset()?;

        let mut tokens = prompt_tokens.to_vec();
        let mut index_pos = 0;
        while generated.len() < budget {
            let context = if index_pos == 0 { &tokens[..] } else { &tokens[tokens.len() - 1..] };
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = model.model.forward(&input, index_pos)?;
            let logits = self.apply_repeat_penalty(logits, &tokens)?;
            index_pos += context.len();

            let next_token = logits_processor.sample(&logits)?;
            if model.is_eos(next_token) {
                break;
            }

            generated.push(next_token);
            tokens.push(next_token);
            on_token(next_token)?;
        }

        Ok(generated)
    }

    /// Get engine statistics
    pub fn stats(&self) -> Result<EngineStats> {
        let model = self.lock();
        Ok(EngineStats {
            device: format!("{:?}", self.device),
            model_id: self.config.model_config.model_id.clone(),
            vocab_size: model.vocab_size(),
            hidden_size: model.hidden_size(),
            num_layers: model.num_layers(),
            dtype: format!("{:?}", model.dtype),
        })
    }
}

impl TextGenerator for InferenceEngine {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let prompt_tokens = self.encode(prompt)?;
        let start_time = std::time::Instant::now();
        let generated = self.run(&prompt_tokens, params, |_| Ok(()))?;

        let mut all_tokens = prompt_tokens.clone();
        all_tokens.extend_from_slice(&generated);
        let text = full_text(prompt, &self.decode(&prompt_tokens)?, &self.decode(&all_tokens)?);

        info!(
            "Generated {} tokens at {:.2} tok/s",
            generated.len(),
            generated.len() as f64 / start_time.elapsed().as_secs_f64()
        );
        Ok(text)
    }

    fn generate_streaming(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_text: &mut dyn FnMut(&str),
    ) -> Result<String> {
        let prompt_tokens = self.encode(prompt)?;
        let tokenizer = self.lock().tokenizer.clone();
        let mut stream = TokenOutputStream::new(tokenizer);

        let generated = self.run(&prompt_tokens, params, |token| {
            if let Some(text) = stream.next_token(token)? {
                on_text(&text);
            }
            Ok(())
        })?;
        if let Some(rest) = stream.decode_rest()? {
            on_text(&rest);
        }
        debug!("Streamed {} tokens", stream.get_tokens().len());

        let mut all_tokens = prompt_tokens.clone();
        all_tokens.extend_from_slice(&generated);
        Ok(full_text(prompt, &self.decode(&prompt_tokens)?, &self.decode(&all_tokens)?))
    }
}

/// Loads [`InferenceEngine`]s from the HuggingFace Hub.
#[derive(Debug, Clone)]
pub struct HubLoader {
    revision: String,
    device: Device,
    dtype: DType,
}

impl HubLoader {
    /// Loader on the best available device.
    pub fn new(revision: impl Into<String>) -> Result<Self> {
        let device = select_device()?;
        let dtype = default_dtype(&device);
        info!("Using device {:?} with {:?} weights", device, dtype);
        Ok(Self::with_device(revision, device, dtype))
    }

    pub fn with_device(revision: impl Into<String>, device: Device, dtype: DType) -> Self {
        Self {
            revision: revision.into(),
            device,
            dtype,
        }
    }
}

impl PipelineLoader for HubLoader {
    fn load(&self, model_id: &str) -> Result<Arc<dyn TextGenerator>> {
        let model_config = ModelConfig::new(model_id, self.revision.clone(), self.dtype);
        let engine = InferenceEngine::new(EngineConfig::with_model(model_config), self.device.clone())?;
        Ok(Arc::new(engine))
    }
}
