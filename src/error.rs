//! Errors returned by the public API

use thiserror::Error;

use crate::backend::EngineError;

/// Coarse classification of a [`BridgeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Null or empty input, detected before any native call
    InvalidArgument,
    /// A native load, context, tokenize or evaluate call failed
    ResourceUnavailable,
    /// The engine build lacks the requested capability
    Unsupported,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    #[error("{0}")]
    InvalidArgument(&'static str),

    #[error("handle {0} is not loaded")]
    UnknownHandle(u64),

    #[error("model missing in handle")]
    ModelMissing,

    #[error("model/context missing")]
    ContextMissing,

    #[error("tokenize produced empty result")]
    EmptyTokenization,

    #[error("prompt evaluation failed: {0}")]
    PromptEvaluation(EngineError),

    #[error("lora adapters are not available in this llama build")]
    AdaptersUnsupported,

    #[error("panic inside {0}")]
    Panicked(&'static str),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::InvalidArgument(_) | BridgeError::UnknownHandle(_) => {
                ErrorKind::InvalidArgument
            }
            BridgeError::AdaptersUnsupported => ErrorKind::Unsupported,
            BridgeError::ModelMissing
            | BridgeError::ContextMissing
            | BridgeError::EmptyTokenization
            | BridgeError::PromptEvaluation(_)
            | BridgeError::Panicked(_)
            | BridgeError::Engine(_) => ErrorKind::ResourceUnavailable,
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
