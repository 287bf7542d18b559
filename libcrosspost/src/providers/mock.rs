//! Mock provider for tests and local demos
//!
//! [`MockProvider`] implements both [`Publisher`] and [`TokenExchanger`] with
//! scripted behavior: it can fail the first N publishes, fail every publish,
//! add latency, or answer refreshes with a fixed error. Call counters are
//! shared through `Arc` so a test can keep a [`MockConfig`] clone and inspect
//! what the worker did after handing the provider away.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::time::sleep;

use super::{PublishReceipt, PublishRequest, Publisher, TokenExchanger, TokenGrant};
use crate::error::{PlatformError, TokenError};
use crate::types::Provider;

/// Configuration for mock provider behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub provider: Provider,

    /// Errors returned by successive publish calls before succeeding
    pub publish_failures: Arc<Mutex<VecDeque<PlatformError>>>,

    /// When set, every publish fails with this error
    pub always_fail: Option<PlatformError>,

    /// When set, every refresh and exchange fails with this error
    pub token_error: Option<TokenError>,

    /// Lifetime reported for issued tokens
    pub expires_in: Option<i64>,

    /// Simulated network latency
    pub delay: Duration,

    pub publish_call_count: Arc<Mutex<usize>>,
    pub refresh_call_count: Arc<Mutex<usize>>,

    /// Captions received, in call order
    pub published_captions: Arc<Mutex<Vec<String>>>,

    /// Access tokens presented to publish, in call order
    pub seen_tokens: Arc<Mutex<Vec<String>>>,
}

impl MockConfig {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            publish_failures: Arc::new(Mutex::new(VecDeque::new())),
            always_fail: None,
            token_error: None,
            expires_in: Some(3600),
            delay: Duration::from_millis(0),
            publish_call_count: Arc::new(Mutex::new(0)),
            refresh_call_count: Arc::new(Mutex::new(0)),
            published_captions: Arc::new(Mutex::new(Vec::new())),
            seen_tokens: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_call_count.lock().map(|c| *c).unwrap_or(0)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_call_count.lock().map(|c| *c).unwrap_or(0)
    }

    pub fn captions(&self) -> Vec<String> {
        self.published_captions
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.seen_tokens.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

pub struct MockProvider {
    config: MockConfig,
}

impl MockProvider {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// Always publishes and refreshes successfully
    pub fn success(provider: Provider) -> Self {
        Self::new(MockConfig::new(provider))
    }

    /// Fails every publish with `error`
    pub fn failing(provider: Provider, error: PlatformError) -> Self {
        let mut config = MockConfig::new(provider);
        config.always_fail = Some(error);
        Self::new(config)
    }

    /// Fails the first `times` publishes with a network error, then succeeds
    pub fn flaky(provider: Provider, times: usize) -> Self {
        let config = MockConfig::new(provider);
        if let Ok(mut queue) = config.publish_failures.lock() {
            for attempt in 1..=times {
                queue.push_back(PlatformError::Network(format!(
                    "simulated outage (attempt {})",
                    attempt
                )));
            }
        }
        Self::new(config)
    }

    /// Every refresh and code exchange fails with `error`
    pub fn token_failure(provider: Provider, error: TokenError) -> Self {
        let mut config = MockConfig::new(provider);
        config.token_error = Some(error);
        Self::new(config)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.config.delay = delay;
        self
    }

    /// Handle on the shared counters
    pub fn config(&self) -> MockConfig {
        self.config.clone()
    }

    fn bump(counter: &Arc<Mutex<usize>>) -> usize {
        match counter.lock() {
            Ok(mut c) => {
                *c += 1;
                *c
            }
            Err(_) => 0,
        }
    }

    fn grant(&self, call: usize) -> TokenGrant {
        TokenGrant {
            access_token: format!("{}-access-{}", self.config.provider, call),
            refresh_token: Some(format!("{}-refresh-{}", self.config.provider, call)),
            token_type: "Bearer".to_string(),
            expires_in: self.config.expires_in,
        }
    }
}

#[async_trait]
impl Publisher for MockProvider {
    fn provider(&self) -> Provider {
        self.config.provider
    }

    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PlatformError> {
        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        let call = Self::bump(&self.config.publish_call_count);

        if let Ok(mut tokens) = self.config.seen_tokens.lock() {
            tokens.push(request.access_token.expose_secret().to_string());
        }

        if let Some(error) = &self.config.always_fail {
            return Err(error.clone());
        }

        let scripted = self
            .config
            .publish_failures
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }

        if let Ok(mut captions) = self.config.published_captions.lock() {
            captions.push(request.caption.clone());
        }

        let external_id = format!("{}-{}", self.config.provider, call);
        Ok(PublishReceipt {
            external_url: Some(format!(
                "https://{}.example/posts/{}",
                self.config.provider, external_id
            )),
            external_id,
        })
    }
}

#[async_trait]
impl TokenExchanger for MockProvider {
    fn provider(&self) -> Provider {
        self.config.provider
    }

    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<TokenGrant, TokenError> {
        if let Some(error) = &self.config.token_error {
            return Err(error.clone());
        }
        if code.is_empty() {
            return Err(TokenError::Failed("empty authorization code".to_string()));
        }
        Ok(self.grant(0))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, TokenError> {
        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        let call = Self::bump(&self.config.refresh_call_count);

        if let Some(error) = &self.config.token_error {
            return Err(error.clone());
        }
        Ok(self.grant(call))
    }
}
