//! # kgdb Common Library
//!
//! Shared code for the kgdb gene-evidence services:
//! - Error type used across crates
//! - Configuration loading and root folder resolution
//! - SQLite schema initialization
//! - Database row models (genes, evidence, staging, progress, scores)

pub mod config;
pub mod db;
pub mod error;

pub use error::{Error, Result};
