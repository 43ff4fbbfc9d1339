//! Database schema and models

pub mod init;
pub mod models;

pub use init::{init_database, init_schema};
pub use models::*;
