//! Model loading and management
//!
//! Downloads models from the HuggingFace Hub and loads them into memory as
//! causal language models ready for token-by-token decoding.

use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::{self, Llama, LlamaConfig, LlamaEosToks};
use candle_transformers::models::qwen2;
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::PathBuf;
use tokenizers::Tokenizer;
use tracing::info;

/// Tokens commonly used as end-of-sequence markers across model families.
const EOS_TOKEN_STRINGS: &[&str] = &["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>"];

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArch {
    Llama,
    Qwen2,
}

impl ModelArch {
    /// Resolve the architecture from the `model_type` field of `config.json`.
    pub fn from_model_type(model_type: &str) -> Option<Self> {
        match model_type.to_lowercase().as_str() {
            "llama" | "mistral" => Some(ModelArch::Llama),
            "qwen2" => Some(ModelArch::Qwen2),
            _ => None,
        }
    }

    /// Best-effort guess from the hub id, used when `config.json` has no `model_type`.
    pub fn from_model_id(model_id: &str) -> Self {
        let lower = model_id.to_lowercase();
        if lower.contains("qwen") {
            ModelArch::Qwen2
        } else {
            ModelArch::Llama
        }
    }
}

/// Configuration for model loading
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// HuggingFace model ID (e.g., "Qwen/Qwen2.5-Coder-7B-Instruct")
    pub model_id: String,
    /// Model revision/branch
    pub revision: String,
    /// Data type for model weights
    pub dtype: DType,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "Qwen/Qwen2.5-Coder-7B-Instruct".to_string(),
            revision: "main".to_string(),
            dtype: DType::F32,
        }
    }
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>, revision: impl Into<String>, dtype: DType) -> Self {
        Self {
            model_id: model_id.into(),
            revision: revision.into(),
            dtype,
        }
    }
}

/// A causal LM with its own KV cache.
pub enum CausalModel {
    Llama {
        model: Llama,
        cache: llama::Cache,
        config: llama::Config,
    },
    Qwen2(qwen2::ModelForCausalLM),
}

impl CausalModel {
    /// Run a forward pass and return the logits of the last position as a 1-D tensor.
    pub fn forward(&mut self, input: &Tensor, index_pos: usize) -> Result<Tensor> {
        let logits = match self {
            CausalModel::Llama { model, cache, .. } => model.forward(input, index_pos, cache)?,
            CausalModel::Qwen2(model) => model.forward(input, index_pos)?,
        };
        let mut logits = logits.squeeze(0)?;
        if logits.dims().len() == 2 {
            logits = logits.squeeze(0)?;
        }
        Ok(logits.to_dtype(DType::F32)?)
    }

    /// Drop all cached keys/values so the next forward starts a fresh sequence.
    pub fn clear_kv_cache(&mut self, dtype: DType, device: &Device) -> Result<()> {
        match self {
            CausalModel::Llama { cache, config, .. } => {
                *cache = llama::Cache::new(true, dtype, config, device)?;
            }
            CausalModel::Qwen2(model) => model.clear_kv_cache(),
        }
        Ok(())
    }
}

/// Loaded model ready for inference
pub struct LoadedModel {
    pub model: CausalModel,
    pub tokenizer: Tokenizer,
    pub arch: ModelArch,
    pub device: Device,
    pub dtype: DType,
    pub eos_token_ids: Vec<u32>,
    vocab_size: usize,
    hidden_size: usize,
    num_layers: usize,
}

impl LoadedModel {
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_token_ids.contains(&token)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.model.clear_kv_cache(self.dtype, &self.device)
    }
}

/// Load safetensors files, preferring a sharded index when the repo has one
fn load_safetensors(api: &hf_hub::api::sync::ApiRepo) -> Result<Vec<PathBuf>> {
    let index_file = match api.get("model.safetensors.index.json") {
        Ok(path) => path,
        Err(_) => return Ok(vec![api.get("model.safetensors")?]),
    };

    let json: serde_json::Value = serde_json::from_reader(&std::fs::File::open(&index_file)?)?;
    let weight_map = match json.get("weight_map") {
        Some(serde_json::Value::Object(map)) => map,
        _ => bail!("no weight map in {:?}", index_file),
    };

    let mut shards = std::collections::BTreeSet::new();
    for value in weight_map.values() {
        if let Some(file) = value.as_str() {
            shards.insert(file.to_string());
        }
    }

    shards
        .iter()
        .map(|file| api.get(file).map_err(|e| anyhow!("Failed to fetch {}: {}", file, e)))
        .collect()
}

fn eos_from_tokenizer(tokenizer: &Tokenizer) -> Vec<u32> {
    EOS_TOKEN_STRINGS
        .iter()
        .filter_map(|tok| tokenizer.token_to_id(tok))
        .collect()
}

/// Load a model from HuggingFace Hub
pub fn load_model(config: &ModelConfig, device: &Device) -> Result<LoadedModel> {
    info!("Loading model: {}", config.model_id);

    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        config.model_id.clone(),
        RepoType::Model,
        config.revision.clone(),
    ));

    info!("Loading tokenizer...");
    let tokenizer_file = repo.get("tokenizer.json")?;
    let tokenizer = Tokenizer::from_file(&tokenizer_file)
        .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

    info!("Loading model config...");
    let config_file = repo.get("config.json")?;
    let raw_config = std::fs::read(&config_file)?;
    let config_json: serde_json::Value = serde_json::from_slice(&raw_config)?;
    let arch = config_json
        .get("model_type")
        .and_then(|v| v.as_str())
        .and_then(ModelArch::from_model_type)
        .unwrap_or_else(|| ModelArch::from_model_id(&config.model_id));
    info!("Model architecture: {:?}", arch);

    info!("Loading model weights...");
    let filenames = load_safetensors(&repo)?;
    info!("Loading {} safetensor file(s)", filenames.len());
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&filenames, config.dtype, device)? };

    let mut eos_token_ids = eos_from_tokenizer(&tokenizer);
    let (model, vocab_size, hidden_size, num_layers) = match arch {
        ModelArch::Llama => {
            let llama_config: LlamaConfig = serde_json::from_slice(&raw_config)?;
            let model_config = llama_config.into_config(false);
            match &model_config.eos_token_id {
                Some(LlamaEosToks::Single(id)) => eos_token_ids.push(*id),
                Some(LlamaEosToks::Multiple(ids)) => eos_token_ids.extend(ids.iter().copied()),
                None => {}
            }
            let model = Llama::load(vb, &model_config)
                .map_err(|e| anyhow!("Failed to load model: {}", e))?;
            let cache = llama::Cache::new(true, config.dtype, &model_config, device)?;
            let dims = (
                model_config.vocab_size,
                model_config.hidden_size,
                model_config.num_hidden_layers,
            );
            (
                CausalModel::Llama {
                    model,
                    cache,
                    config: model_config,
                },
                dims.0,
                dims.1,
                dims.2,
            )
        }
        ModelArch::Qwen2 => {
            let qwen_config: qwen2::Config = serde_json::from_slice(&raw_config)?;
            let model = qwen2::ModelForCausalLM::new(&qwen_config, vb)
                .map_err(|e| anyhow!("Failed to load model: {}", e))?;
            (
                CausalModel::Qwen2(model),
                qwen_config.vocab_size,
                qwen_config.hidden_size,
                qwen_config.num_hidden_layers,
            )
        }
    };
    eos_token_ids.sort_unstable();
    eos_token_ids.dedup();

    info!("Model loaded successfully!");
    info!("  - Vocab size: {}", vocab_size);
    info!("  - Hidden size: {}", hidden_size);
    info!("  - Layers: {}", num_layers);
    info!("  - EOS tokens: {:?}", eos_token_ids);

    Ok(LoadedModel {
        model,
        tokenizer,
        arch,
        device: device.clone(),
        dtype: config.dtype,
        eos_token_ids,
        vocab_size,
        hidden_size,
        num_layers,
    })
}

/// Pick the best available device: CUDA, then Metal, then CPU.
pub fn select_device() -> Result<Device> {
    if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// F16 on accelerators, F32 on CPU
pub fn default_dtype(device: &Device) -> DType {
    if device.is_cpu() {
        DType::F32
    } else {
        DType::F16
    }
}

/// Token output stream for incremental decoding
pub struct TokenOutputStream {
    tokenizer: Tokenizer,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl TokenOutputStream {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Decode error: {}", e))
    }

    pub fn next_token(&mut self, token: u32) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        self.tokens.push(token);
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() && text.chars().last().map_or(false, |c| !c.is_whitespace()) {
            let fresh = text.get(prev_text.len()..).unwrap_or_default().to_string();
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(fresh))
        } else {
            Ok(None)
        }
    }

    pub fn decode_rest(&self) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() {
            Ok(text.get(prev_text.len()..).map(str::to_string))
        } else {
            Ok(None)
        }
    }

    pub fn get_tokens(&self) -> &[u32] {
        &self.tokens
    }
}

/// Create a logits processor with sampling parameters
///
/// A temperature of zero (or below) means greedy decoding. A `top_p` of 1.0
/// or more disables nucleus filtering.
pub fn create_logits_processor(seed: u64, temperature: f64, top_p: f64) -> LogitsProcessor {
    let sampling = if temperature <= 0. {
        Sampling::ArgMax
    } else if top_p > 0. && top_p < 1. {
        Sampling::TopP { p: top_p, temperature }
    } else {
        Sampling::All { temperature }
    };
    LogitsProcessor::from_sampling(seed, sampling)
}
