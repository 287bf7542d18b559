//! Provider lookup by role

use std::collections::HashMap;
use std::sync::Arc;

use super::http::HttpProvider;
use super::{Publisher, TokenExchanger};
use crate::config::Config;
use crate::error::Result;
use crate::types::Provider;
use crate::webhooks::{handler_for, WebhookHandler};

/// Maps each provider to its implementation of every role it supports
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    publishers: HashMap<Provider, Arc<dyn Publisher>>,
    exchangers: HashMap<Provider, Arc<dyn TokenExchanger>>,
    webhooks: HashMap<Provider, Arc<dyn WebhookHandler>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP adapters and webhook handlers for every known provider, using
    /// `[providers.<name>]` settings where present
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();

        for provider in Provider::ALL {
            let settings = config.provider(provider);
            let adapter = Arc::new(HttpProvider::new(provider, &settings)?);
            registry.register_publisher(adapter.clone());
            registry.register_exchanger(adapter);
            registry.register_webhook(handler_for(provider, &settings));
        }

        Ok(registry)
    }

    /// Replaces any publisher already registered for the same provider
    pub fn register_publisher(&mut self, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(publisher.provider(), publisher);
    }

    pub fn register_exchanger(&mut self, exchanger: Arc<dyn TokenExchanger>) {
        self.exchangers.insert(exchanger.provider(), exchanger);
    }

    pub fn register_webhook(&mut self, handler: Arc<dyn WebhookHandler>) {
        self.webhooks.insert(handler.provider(), handler);
    }

    pub fn publisher(&self, provider: Provider) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(&provider).cloned()
    }

    pub fn exchanger(&self, provider: Provider) -> Option<Arc<dyn TokenExchanger>> {
        self.exchangers.get(&provider).cloned()
    }

    pub fn webhook_handler(&self, provider: Provider) -> Option<Arc<dyn WebhookHandler>> {
        self.webhooks.get(&provider).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProvider;

    #[test]
    fn test_empty_registry() {
        let registry = ProviderRegistry::new();
        for provider in Provider::ALL {
            assert!(registry.publisher(provider).is_none());
            assert!(registry.exchanger(provider).is_none());
            assert!(registry.webhook_handler(provider).is_none());
        }
    }

    #[test]
    fn test_register_mock_roles_independently() {
        let mut registry = ProviderRegistry::new();
        let mock = Arc::new(MockProvider::success(Provider::Twitter));
        registry.register_publisher(mock);

        assert!(registry.publisher(Provider::Twitter).is_some());
        assert!(registry.exchanger(Provider::Twitter).is_none());
        assert!(registry.publisher(Provider::Linkedin).is_none());
    }

    #[test]
    fn test_later_registration_wins() {
        let mut registry = ProviderRegistry::new();
        let first = Arc::new(MockProvider::success(Provider::Youtube));
        let second = Arc::new(MockProvider::success(Provider::Youtube));
        let handle = second.config();

        registry.register_publisher(first);
        registry.register_publisher(second);

        let publisher = registry.publisher(Provider::Youtube).unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime
            .block_on(publisher.publish(&crate::providers::PublishRequest {
                access_token: secrecy::SecretString::from("t".to_string()),
                caption: "c".to_string(),
                media: None,
                board_id: None,
                options: Default::default(),
            }))
            .unwrap();
        assert_eq!(handle.publish_calls(), 1);
    }

    #[test]
    fn test_from_config_covers_every_provider() {
        let registry = ProviderRegistry::from_config(&Config::default_config()).unwrap();
        for provider in Provider::ALL {
            assert!(registry.publisher(provider).is_some(), "{}", provider);
            assert!(registry.exchanger(provider).is_some(), "{}", provider);
            assert!(registry.webhook_handler(provider).is_some(), "{}", provider);
        }
    }
}
