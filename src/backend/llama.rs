//! llama.cpp backend
//!
//! # Architecture
//!
//! llama-cpp-2 ties a `LlamaContext` to a borrow of its `LlamaModel`. A handle
//! needs to own both and recreate the context on reset, so the model lives in
//! an `Arc` that every session also holds, and the context's borrow is
//! widened to `'static`. Sessions declare the context before the `Arc`, so
//! the context is always freed first.
//!
//! None of these types are `Send` upstream because they wrap raw pointers.
//! The registry only touches them under the owning handle's lock, one
//! thread at a time, which is what llama.cpp requires.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaLoraAdapter, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};

use crate::backend::gguf::GgufHeader;
use crate::backend::{
    Backend, EngineError, ModelParams, NativeContext, NativeModel, SamplingStrategy, Token,
};

/// Process-wide llama.cpp backend. Initialize once.
pub struct LlamaCppBackend {
    backend: Arc<LlamaBackend>,
}

impl LlamaCppBackend {
    /// Initializes llama.cpp and routes its logs into `tracing`.
    pub fn init() -> Result<Self, EngineError> {
        send_logs_to_tracing(LogOptions::default());
        let backend = LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
        tracing::info!("LlamaBackend initialized");
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

impl Backend for LlamaCppBackend {
    type Model = LlamaWeights;

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<LlamaWeights, EngineError> {
        let header = GgufHeader::read_path(path)?;
        tracing::debug!(
            "GGUF v{} with {} tensors at {}",
            header.version,
            header.tensor_count,
            path.display()
        );

        let mut model_params = LlamaModelParams::default();
        if let Some(layers) = params.gpu_layers {
            model_params = model_params.with_n_gpu_layers(layers);
        }

        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        tracing::debug!(
            "Model {}: {} params, {} vocab, {} training ctx",
            path.display(),
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );

        Ok(LlamaWeights {
            adapters: Vec::new(),
            model: Arc::new(model),
            backend: Arc::clone(&self.backend),
        })
    }

    fn default_context_len(&self) -> i64 {
        LlamaContextParams::default()
            .n_ctx()
            .map_or(0, |n| i64::from(n.get()))
    }

    fn supports_adapters(&self) -> bool {
        true
    }
}

/// Loaded weights plus the adapters attached to them
pub struct LlamaWeights {
    adapters: Vec<(LlamaLoraAdapter, f32)>,
    model: Arc<LlamaModel>,
    backend: Arc<LlamaBackend>,
}

// SAFETY: only used under the owning handle's lock
unsafe impl Send for LlamaWeights {}

impl NativeModel for LlamaWeights {
    type Context = LlamaSession;

    fn new_context(&mut self, n_ctx: NonZeroU32) -> Result<LlamaSession, EngineError> {
        let params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(n_ctx.get());

        let ctx = self
            .model
            .new_context(&self.backend, params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;
        // SAFETY: the session keeps the model alive through its own `Arc` and
        // drops the context first.
        let ctx = unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(ctx) };

        let session = LlamaSession {
            ctx,
            logits_at: 0,
            model: Arc::clone(&self.model),
        };
        for (adapter, scale) in &mut self.adapters {
            session
                .ctx
                .lora_adapter_set(adapter, *scale)
                .map_err(|e| EngineError::Adapter(e.to_string()))?;
        }
        Ok(session)
    }

    fn tokenize(&self, text: &str, capacity: usize) -> Result<Vec<Token>, EngineError> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        if tokens.len() > capacity {
            return Err(EngineError::Tokenization(format!(
                "prompt needs {} tokens, scratch holds {}",
                tokens.len(),
                capacity
            )));
        }
        Ok(tokens.into_iter().map(|t| Token(t.0)).collect())
    }

    fn eos_token(&self) -> Token {
        Token(self.model.token_eos().0)
    }

    fn token_to_piece(&self, token: Token, buf: &mut [u8]) -> usize {
        let bytes = match self.model.token_to_bytes(LlamaToken(token.0), Special::Plaintext) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("No text for token {}: {}", token.0, e);
                return 0;
            }
        };
        let n = bytes.len().min(buf.len().saturating_sub(1));
        buf[..n].copy_from_slice(&bytes[..n]);
        if let Some(end) = buf.get_mut(n) {
            *end = 0;
        }
        n
    }

    fn apply_adapter(
        &mut self,
        path: &Path,
        scale: f32,
        active: Option<&mut LlamaSession>,
    ) -> Result<(), EngineError> {
        GgufHeader::read_path(path)?;
        let mut adapter = self
            .model
            .lora_adapter_init(path)
            .map_err(|e| EngineError::Adapter(e.to_string()))?;
        if let Some(session) = active {
            session
                .ctx
                .lora_adapter_set(&mut adapter, scale)
                .map_err(|e| EngineError::Adapter(e.to_string()))?;
        }
        self.adapters.push((adapter, scale));
        Ok(())
    }
}

/// A decoding context and the model it borrows from
pub struct LlamaSession {
    ctx: LlamaContext<'static>,
    /// Batch index of the last token evaluated with logits
    logits_at: i32,
    model: Arc<LlamaModel>,
}

// SAFETY: only used under the owning handle's lock
unsafe impl Send for LlamaSession {}

impl NativeContext for LlamaSession {
    type Sampler = LlamaSampler;

    fn evaluate(&mut self, tokens: &[Token], n_past: u32) -> Result<(), EngineError> {
        if n_past == 0 {
            // Priming again starts a new sequence
            self.ctx.clear_kv_cache();
        }

        let mut batch = LlamaBatch::new(tokens.len().max(1), 1);
        let last = tokens.len().saturating_sub(1);
        for (i, token) in tokens.iter().enumerate() {
            let pos = n_past as i32 + i as i32;
            batch
                .add(LlamaToken(token.0), pos, &[0], i == last)
                .map_err(|e| EngineError::Evaluate(format!("Failed to add token to batch: {e}")))?;
        }

        self.ctx
            .decode(&mut batch)
            .map_err(|e| EngineError::Evaluate(e.to_string()))?;
        self.logits_at = batch.n_tokens() - 1;
        Ok(())
    }

    fn sampler(&self, strategy: &SamplingStrategy) -> Result<LlamaSampler, EngineError> {
        let sampler = match *strategy {
            SamplingStrategy::Greedy => LlamaSampler::greedy(),
            SamplingStrategy::Probabilistic {
                temperature,
                top_p,
                top_k,
                seed,
            } => LlamaSampler::chain_simple([
                LlamaSampler::top_k(top_k),
                LlamaSampler::top_p(top_p, 1),
                LlamaSampler::temp(temperature),
                LlamaSampler::dist(seed),
            ]),
        };
        Ok(sampler)
    }

    fn sample(&mut self, sampler: &mut LlamaSampler) -> Token {
        let token = sampler.sample(&self.ctx, self.logits_at);
        sampler.accept(token);
        Token(token.0)
    }
}

impl Drop for LlamaSession {
    fn drop(&mut self) {
        tracing::trace!(
            "Freeing context ({} model refs)",
            Arc::strong_count(&self.model)
        );
    }
}
