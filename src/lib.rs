//! Emma: a personal email automation service.
//!
//! The service polls local mail sources, records every handled message in a
//! SQLite ledger keyed by a stable dedup hash, enriches messages through an
//! optional LLM collaborator (classification, analysis, action item
//! extraction), and periodically folds unhandled mail into delivered
//! digests.

pub mod actions;
pub mod config;
pub mod daemon;
pub mod digest;
pub mod error;
pub mod llm;
pub mod models;
pub mod monitor;
pub mod rules;
pub mod sources;
pub mod store;

pub use error::EmmaError;
