//! Crosspost - scheduled publishing to social platforms
//!
//! This library holds the post lifecycle, the delayed publish queue and its
//! workers, the credential vault, token refresh and webhook ingestion. The
//! `xp-*` binaries are thin front-ends over [`service::CrosspostService`].

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod preflight;
pub mod providers;
pub mod queue;
pub mod scheduling;
pub mod service;
pub mod tokens;
pub mod types;
pub mod vault;
pub mod webhooks;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{CrosspostError, Result};
pub use types::{Post, PostStatus, Provider};
