//! Text generation
//!
//! The decode loop and the request/result types around it.

pub mod engine;
pub mod request;

// Re-export main types for convenience
pub use engine::{generate, generate_streaming, DecodeLimits};
pub use request::{GenerateRequest, Generation, StopReason};
