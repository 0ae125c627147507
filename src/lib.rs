//! Llama Bridge
//!
//! A C-callable layer over llama.cpp: a registry that keeps one loaded model
//! per path, LoRA adapter application, and a bounded token-by-token decode
//! loop. The Rust API returns `Result`s; the `ffi` module turns them into
//! sentinels plus a per-thread last-error string for C callers.

pub mod backend;
pub mod config;
pub mod error;
pub mod ffi;
pub mod inference;
pub mod logging;
pub mod registry;

pub use backend::{Backend, EngineError, NativeContext, NativeModel, SamplingStrategy, Token};
pub use config::{load_config, BridgeConfig};
pub use error::{BridgeError, ErrorKind, Result};
pub use inference::{GenerateRequest, Generation, StopReason};
pub use registry::{HandleId, HandleInfo, ModelHandle, ModelRegistry};
