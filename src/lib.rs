//! hubwarden - an always-on agent for a public registry of AI artifacts
//!
//! This crate provides:
//! - An incremental crawl orchestrator with backoff and a persisted task scheduler
//! - A hybrid (SQLite FTS5 + vector index) knowledge store
//! - A priority evaluator that turns watched authors/tags into alert events
//! - A supervisor that restarts stalled components under a restart budget

pub mod commands;
pub mod config;
pub mod crawl;
pub mod embed;
pub mod error;
pub mod knowledge;
pub mod meta;
pub mod models;
pub mod priority;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod supervisor;

pub use config::Config;
pub use error::{Error, Result};
