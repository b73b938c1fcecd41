use anyhow::{anyhow, Result};
use shyllm_core::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Echo;

impl TextGenerator for Echo {
    fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String> {
        Ok(format!("{} world", prompt))
    }
}

#[derive(Default)]
struct CountingLoader {
    loads: AtomicUsize,
    failures_left: AtomicUsize,
}

impl CountingLoader {
    fn failing_first(n: usize) -> Self {
        Self {
            loads: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(n),
        }
    }
}

impl PipelineLoader for CountingLoader {
    fn load(&self, _model_id: &str) -> Result<Arc<dyn TextGenerator>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(anyhow!("weights not found"));
        }
        Ok(Arc::new(Echo))
    }
}

fn query(prompt: &str, max_length: i64) -> Query {
    Query {
        prompt: prompt.to_string(),
        max_length,
        temperature: 1.0,
        top_p: 0.95,
    }
}

#[test]
fn test_query_defaults_from_json() {
    let q: Query = serde_json::from_str(r#"{"prompt": "Hello"}"#).unwrap();

    assert_eq!(q.prompt, "Hello");
    assert_eq!(q.max_length, 100);
    assert_eq!(q.temperature, 1.0);
    assert_eq!(q.top_p, 0.95);
}

#[test]
fn test_query_requires_prompt() {
    let result = serde_json::from_str::<Query>(r#"{"max_length": 10}"#);
    assert!(result.is_err());
}

#[test]
fn test_query_rejects_empty_prompt() {
    let err = query("", 10).validate().unwrap_err();
    assert_eq!(err.errors(), &[FieldError::EmptyPrompt]);
    assert_eq!(err.errors()[0].to_string(), "Prompt cannot be empty");
    assert_eq!(err.errors()[0].field(), "prompt");
}

#[test]
fn test_query_rejects_non_positive_max_length() {
    for bad in [0, -1, -100] {
        let err = query("Hi", bad).validate().unwrap_err();
        assert_eq!(err.errors(), &[FieldError::NonPositiveMaxLength(bad)]);
        assert_eq!(err.errors()[0].field(), "max_length");
    }
}

#[test]
fn test_query_collects_all_errors() {
    let err = query("", 0).validate().unwrap_err();
    assert_eq!(err.errors().len(), 2);
    assert_eq!(err.to_string(), "2 validation error(s) for Query");
}

#[test]
fn test_query_strips_prompt_after_validation() {
    let valid = query("  Tell me a joke \n", 42).validate().unwrap();
    assert_eq!(valid.prompt(), "Tell me a joke");
    assert_eq!(valid.max_length(), 42);

    // Only the empty string is rejected; whitespace passes and strips to nothing.
    let blank = query("   ", 5).validate().unwrap();
    assert_eq!(blank.prompt(), "");
}

#[test]
fn test_valid_query_params() {
    let mut q = query("Hi", 64);
    q.temperature = 0.2;
    q.top_p = 0.5;
    let params = q.validate().unwrap().params();

    assert_eq!(params.max_length, 64);
    assert_eq!(params.temperature, 0.2);
    assert_eq!(params.top_p, 0.5);
    assert_eq!(params.seed, None);
}

#[test]
fn test_generation_params_defaults() {
    let params = GenerationParams::default();

    assert_eq!(params.max_length, 100);
    assert_eq!(params.temperature, 1.0);
    assert_eq!(params.top_p, 0.95);
    assert_eq!(params.seed, None);
}

#[test]
fn test_generation_budget() {
    assert_eq!(generation_budget(10, 100), 90);
    assert_eq!(generation_budget(100, 100), 0);
    assert_eq!(generation_budget(150, 100), 0);
    assert_eq!(generation_budget(1, 1), 0);
    assert_eq!(generation_budget(1, 2), 1);
}

#[test]
fn test_empty_prompt_tokens_generate_nothing() {
    // A whitespace-only prompt is stripped to "" and may encode to no tokens.
    assert_eq!(generation_budget(0, 1), 0);
    assert_eq!(generation_budget(0, 100), 0);
    assert_eq!(full_text("", "", ""), "");
}

#[test]
fn test_full_text_keeps_original_prompt() {
    let text = full_text("Hello", "Hello", "Hello, my name is Bob");
    assert_eq!(text, "Hello, my name is Bob");

    // Tokenizer normalisation of the prompt must not leak into the result.
    let text = full_text("Hi  there", "Hi there", "Hi there friend");
    assert_eq!(text, "Hi  there friend");

    assert_eq!(full_text("Hi", "Hi", "Hi"), "Hi");
}

#[test]
fn test_full_text_prompt_ending_mid_char() {
    // The prompt's trailing bytes decode to a replacement char on their own,
    // and to an emoji once the next token completes them.
    let text = full_text("x", "x\u{FFFD}", "x\u{1F600}!");
    assert_eq!(text, "x\u{1F600}!");

    let text = full_text("ab", "ab", "a\u{65E5}x");
    assert_eq!(text, "ab\u{65E5}x");
}

#[test]
fn test_default_streaming_emits_continuation() {
    let mut chunks = Vec::new();
    let text = Echo
        .generate_streaming("Hello", &GenerationParams::default(), &mut |t| chunks.push(t.to_string()))
        .unwrap();

    assert_eq!(text, "Hello world");
    assert_eq!(chunks, vec![" world".to_string()]);
}

#[test]
fn test_model_arch_detection() {
    assert_eq!(ModelArch::from_model_type("llama"), Some(ModelArch::Llama));
    assert_eq!(ModelArch::from_model_type("mistral"), Some(ModelArch::Llama));
    assert_eq!(ModelArch::from_model_type("qwen2"), Some(ModelArch::Qwen2));
    assert_eq!(ModelArch::from_model_type("gpt2"), None);

    assert_eq!(ModelArch::from_model_id("Qwen/Qwen2.5-Coder-7B-Instruct"), ModelArch::Qwen2);
    assert_eq!(ModelArch::from_model_id("TinyLlama/TinyLlama-1.1B-Chat-v1.0"), ModelArch::Llama);
}

#[test]
fn test_cache_loads_once() {
    let loader = Arc::new(CountingLoader::default());
    let cache = PipelineCache::new(loader.clone());

    assert!(cache.cached("m").is_none());
    let first = cache.get_or_load("m").unwrap();
    let second = cache.get_or_load("m").unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert_eq!(cache.cached_model_id().as_deref(), Some("m"));
}

#[test]
fn test_cache_does_not_remember_failures() {
    let loader = Arc::new(CountingLoader::failing_first(1));
    let cache = PipelineCache::new(loader.clone());

    let err = cache.get_or_load("m").err().unwrap();
    assert!(err.to_string().contains("weights not found"));
    assert!(cache.cached("m").is_none());

    let pipeline = cache.get_or_load("m").unwrap();
    assert_eq!(pipeline.generate("Hi", &GenerationParams::default()).unwrap(), "Hi world");
    assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
}

#[test]
fn test_cache_single_slot_replaced_by_new_model() {
    let loader = Arc::new(CountingLoader::default());
    let cache = PipelineCache::new(loader.clone());

    cache.get_or_load("a").unwrap();
    cache.get_or_load("b").unwrap();
    assert!(cache.cached("a").is_none());
    assert!(cache.cached("b").is_some());

    cache.get_or_load("a").unwrap();
    assert_eq!(loader.loads.load(Ordering::SeqCst), 3);
}

#[test]
fn test_cache_shared_across_threads() {
    let loader = Arc::new(CountingLoader::default());
    let cache = Arc::new(PipelineCache::new(loader.clone()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.get_or_load("m").map(|_| ()).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
}
