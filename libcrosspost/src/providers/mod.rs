//! Provider adapters
//!
//! Each third-party platform plays up to three roles, and each role is its
//! own trait so an adapter only implements what the platform supports:
//!
//! - [`Publisher`]: deliver a post and report where it landed
//! - [`TokenExchanger`]: swap an OAuth code or refresh token for new tokens
//! - [`WebhookHandler`](crate::webhooks::WebhookHandler): verify and classify
//!   inbound events
//!
//! The [`ProviderRegistry`] maps a [`Provider`] to an implementation of each role.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> libcrosspost::error::Result<()> {
//! use std::sync::Arc;
//! use libcrosspost::providers::{mock::MockProvider, ProviderRegistry};
//! use libcrosspost::types::Provider;
//!
//! let mut registry = ProviderRegistry::new();
//! let twitter = Arc::new(MockProvider::success(Provider::Twitter));
//! registry.register_publisher(twitter.clone());
//! registry.register_exchanger(twitter);
//! assert!(registry.publisher(Provider::Twitter).is_some());
//! # Ok(())
//! # }
//! ```

pub mod http;
pub mod mock;
pub mod registry;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, TokenError};
use crate::types::{MediaRef, PostOptions, Provider};

pub use registry::ProviderRegistry;

/// Everything a provider needs to publish one post
#[derive(Debug)]
pub struct PublishRequest {
    pub access_token: SecretString,
    pub caption: String,
    pub media: Option<MediaRef>,
    /// Pinterest board, when the target names one
    pub board_id: Option<String>,
    pub options: PostOptions,
}

/// Where a published post ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub external_id: String,
    pub external_url: Option<String>,
}

/// Tokens returned by a code exchange or refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime in seconds from the moment of issue
    #[serde(default)]
    pub expires_in: Option<i64>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenGrant {
    /// Absolute expiry given the issue time.
    ///
    /// `expires_in` is provider input; out-of-range lifetimes saturate.
    pub fn expires_at(&self, issued_at: i64) -> Option<i64> {
        self.expires_in.map(|secs| issued_at.saturating_add(secs))
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    fn provider(&self) -> Provider;

    /// Publish a post. Errors are classified so the queue can decide on retry.
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PlatformError>;
}

#[async_trait]
pub trait TokenExchanger: Send + Sync {
    fn provider(&self) -> Provider;

    async fn exchange_code(&self, code: &str, redirect_uri: &str)
        -> Result<TokenGrant, TokenError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError>;
}
