//! Inference engine contract
//!
//! The registry and the decode loop only talk to the native engine through
//! these traits. The production implementation lives in [`llama`] and wraps
//! llama-cpp-2; tests drive the same code through a scripted backend.

pub mod gguf;
#[cfg(feature = "llama")]
pub mod llama;

#[cfg(test)]
pub(crate) mod fake;

use std::num::NonZeroU32;
use std::path::Path;

use thiserror::Error;

use crate::backend::gguf::GgufError;

/// Errors reported by the native engine
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Evaluation failed: {0}")]
    Evaluate(String),

    #[error("Adapter failed: {0}")]
    Adapter(String),

    #[error("Sampler failed: {0}")]
    Sampler(String),
}

impl From<GgufError> for EngineError {
    fn from(e: GgufError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// A vocabulary token id as the engine understands it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub i32);

/// Parameters for loading model weights
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelParams {
    /// GPU layers to offload; `None` keeps the engine default
    pub gpu_layers: Option<u32>,
}

impl ModelParams {
    /// Only a positive count overrides the engine default.
    pub fn with_gpu_layers(gpu_layers: i32) -> Self {
        Self {
            gpu_layers: u32::try_from(gpu_layers).ok().filter(|n| *n > 0),
        }
    }
}

/// How the next token is picked from the context's logits
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingStrategy {
    /// Always take the highest-probability token
    Greedy,
    /// Engine's general-purpose sampler chain
    Probabilistic {
        temperature: f32,
        top_p: f32,
        top_k: i32,
        seed: u32,
    },
}

impl SamplingStrategy {
    /// Picks greedy decoding at or below `threshold`, the sampler chain above it.
    pub fn select(temperature: f32, top_p: f32, top_k: i32, seed: u32, threshold: f32) -> Self {
        if temperature <= threshold {
            SamplingStrategy::Greedy
        } else {
            SamplingStrategy::Probabilistic {
                temperature,
                top_p,
                top_k,
                seed,
            }
        }
    }

    pub fn is_greedy(&self) -> bool {
        matches!(self, SamplingStrategy::Greedy)
    }
}

/// Entry point into a native engine build
pub trait Backend: Send + Sync {
    type Model: NativeModel;

    /// Loads weights from `path`.
    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Self::Model, EngineError>;

    /// Context length the engine would pick by default. May be non-positive.
    fn default_context_len(&self) -> i64;

    /// Whether this build can apply low-rank adapters at all.
    fn supports_adapters(&self) -> bool;
}

/// Loaded model weights
pub trait NativeModel: Send {
    type Context: NativeContext;

    /// Creates a fresh decoding context over these weights.
    fn new_context(&mut self, n_ctx: NonZeroU32) -> Result<Self::Context, EngineError>;

    /// Tokenizes `text`, failing if it needs more than `capacity` tokens.
    fn tokenize(&self, text: &str, capacity: usize) -> Result<Vec<Token>, EngineError>;

    /// End-of-sequence marker of the vocabulary.
    fn eos_token(&self) -> Token;

    /// Writes the text of `token` into `buf` and returns the byte count.
    ///
    /// At most `buf.len() - 1` bytes are written and the byte after them is
    /// zeroed. Zero means the token has no printable text.
    fn token_to_piece(&self, token: Token, buf: &mut [u8]) -> usize;

    /// Loads the adapter at `path` onto these weights. The adapter is also
    /// attached to `active` and to every context created afterwards.
    fn apply_adapter(
        &mut self,
        path: &Path,
        scale: f32,
        active: Option<&mut Self::Context>,
    ) -> Result<(), EngineError>;
}

/// Mutable decoding state bound to one model
pub trait NativeContext: Send {
    type Sampler;

    /// Evaluates `tokens` at positions starting from `n_past`.
    fn evaluate(&mut self, tokens: &[Token], n_past: u32) -> Result<(), EngineError>;

    /// Builds a sampler. It is released when dropped.
    fn sampler(&self, strategy: &SamplingStrategy) -> Result<Self::Sampler, EngineError>;

    /// Samples one token from the logits of the last evaluation.
    fn sample(&mut self, sampler: &mut Self::Sampler) -> Token;
}
