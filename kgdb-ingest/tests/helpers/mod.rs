//! Test Helper Utilities
//!
//! Shared utilities for kgdb-ingest integration tests

#![allow(dead_code)]

pub mod authority;
pub mod db_utils;
pub mod mock_upstream;
pub mod sources;

pub use authority::StaticAuthority;
pub use db_utils::create_test_db;
pub use mock_upstream::MockUpstream;
pub use sources::{classification_source, count_source, fast_retry, test_config, test_services};
