//! pagelink - cross-document relevance analysis.
//!
//! Splits large documents into bounded page-range chunks, distributes
//! chunk-analysis calls across a pool of interchangeable service
//! credentials with failover and cooldowns, repairs the often-malformed
//! responses, and merges everything into one ordered, deduplicated,
//! score-filtered result.

pub mod analyzer;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod documents;
pub mod error;
pub mod merge;
pub mod models;
pub mod parse;
pub mod progress;
pub mod service;
