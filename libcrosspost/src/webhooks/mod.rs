//! Inbound provider webhooks
//!
//! [`handlers`] knows each provider's handshake, signature scheme and event
//! shapes. [`ingest`] decides what gets stored, and [`http`] exposes it all
//! as an axum router.

pub mod handlers;
pub mod http;
pub mod ingest;
pub mod signature;

pub use handlers::{handler_for, HandshakeResponse, NormalizedEvent, PostRef, WebhookHandler};
pub use http::router;
pub use ingest::{IngestOutcome, WebhookIngestor};
