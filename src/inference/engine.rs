//! Autoregressive decode loop
//!
//! Tokenizes the prompt, primes the context at position 0, then samples and
//! evaluates one token at a time until the budget, an end-of-sequence token,
//! an empty piece, or an evaluation failure. Text gathered before a failure
//! is returned, not discarded.

use crate::backend::{Backend, NativeContext, NativeModel, SamplingStrategy};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::inference::request::{GenerateRequest, Generation, StopReason};
use crate::registry::{ModelHandle, ModelRegistry};

/// Scratch sizes and sampler policy for the decode loop
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeLimits {
    pub token_capacity: usize,
    pub piece_capacity: usize,
    pub greedy_threshold: f32,
    /// 0 = fresh random seed per call
    pub seed: u32,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for DecodeLimits {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            token_capacity: config.token_capacity,
            piece_capacity: config.piece_capacity,
            greedy_threshold: config.greedy_threshold,
            seed: config.seed,
        }
    }
}

/// Runs one generation on `handle`.
pub fn generate<M: NativeModel>(
    handle: &ModelHandle<M>,
    request: &GenerateRequest<'_>,
    limits: &DecodeLimits,
) -> Result<Generation> {
    generate_streaming(handle, request, limits, |_| {})
}

/// Like [`generate`], handing every fragment to `on_piece` as it is appended.
pub fn generate_streaming<M, F>(
    handle: &ModelHandle<M>,
    request: &GenerateRequest<'_>,
    limits: &DecodeLimits,
    mut on_piece: F,
) -> Result<Generation>
where
    M: NativeModel,
    F: FnMut(&[u8]),
{
    // Held for the whole call: one decode at a time per handle
    let mut guard = handle.lock();
    let slot = &mut *guard;
    let (Some(model), Some(ctx)) = (slot.model.as_ref(), slot.context.as_mut()) else {
        return Err(BridgeError::ContextMissing);
    };

    let prompt = model.tokenize(request.prompt, limits.token_capacity)?;
    if prompt.is_empty() {
        return Err(BridgeError::EmptyTokenization);
    }
    tracing::debug!("Tokenized prompt into {} tokens", prompt.len());

    ctx.evaluate(&prompt, 0)
        .map_err(BridgeError::PromptEvaluation)?;

    let seed = if limits.seed == 0 { rand_seed() } else { limits.seed };
    let strategy = SamplingStrategy::select(
        request.temperature,
        request.top_p,
        request.top_k,
        seed,
        limits.greedy_threshold,
    );
    // Dropped on every return below, which frees the native sampler
    let mut sampler = ctx.sampler(&strategy)?;

    let eos = model.eos_token();
    let budget = usize::try_from(request.max_tokens).unwrap_or(0);
    let mut scratch = vec![0u8; limits.piece_capacity.max(2)];
    let mut output = Vec::with_capacity(1024);
    let mut emitted = 0usize;
    let mut stop = StopReason::Budget;

    while emitted < budget {
        let token = ctx.sample(&mut sampler);
        if token == eos {
            tracing::debug!("End of sequence after {} tokens", emitted);
            stop = StopReason::EndOfSequence;
            break;
        }

        let written = model.token_to_piece(token, &mut scratch);
        if written == 0 {
            tracing::debug!("Token {:?} has no text, stopping", token);
            stop = StopReason::EmptyPiece;
            break;
        }
        let piece = until_nul(&scratch[..written.min(scratch.len() - 1)]);
        output.extend_from_slice(piece);
        on_piece(piece);

        let n_past = prompt.len() + emitted;
        emitted += 1;

        if let Err(e) = ctx.evaluate(&[token], n_past as u32) {
            tracing::warn!(
                "Evaluation failed after {} tokens, returning partial output: {}",
                emitted,
                e
            );
            stop = StopReason::EvalFailed(e);
            break;
        }
    }
    drop(sampler);

    Ok(Generation {
        bytes: output,
        prompt_tokens: prompt.len(),
        tokens: emitted,
        stop,
    })
}

/// The piece as a C string would see it: everything before the first NUL.
fn until_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|b| *b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    (RandomState::new().build_hasher().finish() as u32).max(1)
}

impl<B: Backend> ModelRegistry<B> {
    /// Runs one generation on `handle` with this registry's limits.
    pub fn generate(
        &self,
        handle: &ModelHandle<B::Model>,
        request: &GenerateRequest<'_>,
    ) -> Result<Generation> {
        generate(handle, request, &DecodeLimits::from(self.config()))
    }
}
