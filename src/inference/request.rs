//! Generation request and result types

use std::borrow::Cow;

use crate::backend::EngineError;
use crate::error::{BridgeError, Result};

/// One generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest<'a> {
    pub prompt: &'a str,
    /// Upper bound on emitted tokens; non-positive emits nothing
    pub max_tokens: i32,
    /// Temperature for sampling (at or below the greedy threshold = greedy)
    pub temperature: f32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Top-k sampling parameter (non-positive = disabled)
    pub top_k: i32,
}

impl<'a> GenerateRequest<'a> {
    pub fn new(prompt: &'a str) -> Self {
        Self {
            prompt,
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
        }
    }

    pub fn max_tokens(mut self, max_tokens: i32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn top_k(mut self, top_k: i32) -> Self {
        self.top_k = top_k;
        self
    }
}

/// Why the decode loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// `max_tokens` fragments were appended
    Budget,
    /// The sampler produced the end-of-sequence marker
    EndOfSequence,
    /// A sampled token had no text
    EmptyPiece,
    /// Evaluating a sampled token failed; the text so far is kept
    EvalFailed(EngineError),
}

impl StopReason {
    /// Returns true if decoding stopped on a native failure
    pub fn is_failure(&self) -> bool {
        matches!(self, StopReason::EvalFailed(_))
    }

    pub fn as_error(&self) -> Option<&EngineError> {
        match self {
            StopReason::EvalFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// Accumulated output of one generation call
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub(crate) bytes: Vec<u8>,
    pub(crate) prompt_tokens: usize,
    pub(crate) tokens: usize,
    pub(crate) stop: StopReason,
}

impl Generation {
    /// Raw output bytes, exactly as the engine produced them
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Output as text; invalid UTF-8 is replaced
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// Untruncated output length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of prompt tokens evaluated during priming
    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    /// Number of fragments appended to the output
    pub fn tokens(&self) -> usize {
        self.tokens
    }

    pub fn stop(&self) -> &StopReason {
        &self.stop
    }

    /// Copies as much output as fits into `out`, always NUL-terminated.
    ///
    /// Returns the untruncated length; a value `>= out.len()` means the copy
    /// was cut short.
    pub fn write_c_str(&self, out: &mut [u8]) -> Result<usize> {
        let Some(room) = out.len().checked_sub(1) else {
            return Err(BridgeError::InvalidArgument("invalid output buffer"));
        };
        let n = self.bytes.len().min(room);
        out[..n].copy_from_slice(&self.bytes[..n]);
        out[n] = 0;
        Ok(self.bytes.len())
    }
}
