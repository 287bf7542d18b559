//! Turns verified deliveries into stored webhook events
//!
//! Verification failures are logged and dropped. They are never stored and
//! never surface as an error to the caller, so the provider sees success and
//! does not retry. Only structural problems (unknown provider, database
//! failure) are returned as errors.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Serialize;

use super::handlers::{HandshakeResponse, NormalizedEvent, PostRef, WebhookHandler};
use crate::db::Database;
use crate::error::{Result, WebhookError};
use crate::providers::ProviderRegistry;
use crate::service::events::{Event, EventBus};
use crate::types::{Provider, WebhookEvent, WebhookEventStatus, WebhookEventType};

/// What happened to a POST delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum IngestOutcome {
    /// Verified, classified and persisted
    Stored { id: i64 },
    /// Verified but classified `other`
    Ignored,
    /// Failed verification or could not be parsed
    Dropped,
}

pub struct WebhookIngestor {
    registry: ProviderRegistry,
    db: Database,
    events: Option<EventBus>,
}

impl WebhookIngestor {
    pub fn new(registry: ProviderRegistry, db: Database) -> Self {
        Self {
            registry,
            db,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn handler(&self, provider: &str) -> Result<Arc<dyn WebhookHandler>> {
        let provider = Provider::from_str(provider)
            .map_err(|_| WebhookError::NoHandler(provider.to_string()))?;
        self.registry
            .webhook_handler(provider)
            .ok_or_else(|| WebhookError::NoHandler(provider.to_string()).into())
    }

    /// Answer a GET subscription handshake
    pub fn handle_get(
        &self,
        provider: &str,
        query: &HashMap<String, String>,
    ) -> Result<HandshakeResponse> {
        let handler = self.handler(provider)?;
        match handler.handshake(query) {
            Ok(response) => {
                tracing::info!(provider = %handler.provider(), "Webhook handshake accepted");
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(provider = %handler.provider(), error = %e, "Webhook handshake rejected");
                Err(e.into())
            }
        }
    }

    /// Verify, classify and store a POST delivery
    pub async fn handle_post(
        &self,
        provider: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<IngestOutcome> {
        let handler = self.handler(provider)?;
        let platform = handler.provider();

        let signature = match handler.verify(headers, body) {
            Ok(signature) => signature,
            Err(e) => {
                tracing::warn!(provider = %platform, error = %e, "Dropping unverified webhook");
                return Ok(IngestOutcome::Dropped);
            }
        };

        let NormalizedEvent {
            event_type,
            payload,
            post_ref,
        } = match handler.normalize(body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(provider = %platform, error = %e, "Dropping unparseable webhook");
                return Ok(IngestOutcome::Dropped);
            }
        };

        if event_type == WebhookEventType::Other {
            tracing::debug!(provider = %platform, "Ignoring unclassified webhook");
            return Ok(IngestOutcome::Ignored);
        }

        let post_id = self.resolve_post(post_ref).await?;

        // Redeliveries are stored again; providers send no dedup key
        let event = WebhookEvent {
            id: None,
            platform,
            event_type,
            payload,
            signature: Some(signature),
            status: WebhookEventStatus::Received,
            post_id: post_id.clone(),
            error_message: None,
            created_at: chrono::Utc::now().timestamp(),
        };
        let id = self.db.create_webhook_event(&event).await?;

        tracing::info!(
            provider = %platform,
            event_type = event_type.as_str(),
            post_id = post_id.as_deref().unwrap_or("-"),
            event_id = id,
            "Stored webhook event"
        );

        if let Some(events) = &self.events {
            events.emit(Event::WebhookReceived {
                platform: platform.to_string(),
                event_type: event_type.as_str().to_string(),
                post_id,
            });
        }

        Ok(IngestOutcome::Stored { id })
    }

    async fn resolve_post(&self, post_ref: Option<PostRef>) -> Result<Option<String>> {
        match post_ref {
            Some(PostRef::PostId(id)) => {
                if self.db.post_exists(&id).await? {
                    Ok(Some(id))
                } else {
                    Ok(None)
                }
            }
            Some(PostRef::ExternalId(external_id)) => {
                self.db.find_post_by_external_id(&external_id).await
            }
            None => Ok(None),
        }
    }
}
