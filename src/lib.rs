//! Financial SMS Extraction Pipeline
//!
//! Turns raw bank and UPI SMS traffic into structured transaction
//! records:
//! - Pattern classifier separates financial messages from noise
//! - LLM extraction with multi-strategy JSON recovery
//! - Deterministic rule-based fallback when the model is unavailable
//! - Pattern-keyed cache so templated messages skip the model
//! - Adaptive rate limiting and batch sizing from observed latency
//! - Retry with backoff, dead-lettering and resumable checkpoints
//!
//! FLOW:
//! CLASSIFY → (CACHE | LLM | FALLBACK) → VALIDATE → PERSIST → CHECKPOINT

pub mod cache;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod error;
pub mod fallback;
pub mod limiter;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod recovery;
pub mod store;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use pipeline::{Pipeline, RunSummary};
