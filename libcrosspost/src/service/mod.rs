//! Service layer for Crosspost
//!
//! A single facade, [`CrosspostService`], owns the shared resources and
//! hands out the sub-services the binaries talk to:
//!
//! - [`ScheduleService`]: post lifecycle, preflight and enqueueing
//! - [`ConnectionService`]: OAuth connections and vault key rotation
//! - [`PublishWorker`]: queue consumers that publish due posts
//! - [`WebhookIngestor`]: inbound provider webhooks
//! - [`EventBus`]: progress events for anything that wants to watch
//!
//! # Example
//!
//! ```no_run
//! use chrono::{Duration, Utc};
//! use libcrosspost::service::CrosspostService;
//! use libcrosspost::service::schedule::ScheduleRequest;
//! use libcrosspost::types::{PlatformTarget, PostOptions, Provider};
//!
//! # async fn example() -> libcrosspost::Result<()> {
//! let service = CrosspostService::new().await?;
//!
//! let request = ScheduleRequest {
//!     post_id: None,
//!     owner_id: "owner-1".to_string(),
//!     caption: "Launch day".to_string(),
//!     media: None,
//!     scheduled_at: Utc::now() + Duration::hours(1),
//!     platforms: vec![PlatformTarget::with_board(Provider::Pinterest, "123")],
//!     options: PostOptions::default(),
//! };
//!
//! let response = service.schedule().upsert(request).await?;
//! println!("{} is {}", response.id, response.status);
//! # Ok(())
//! # }
//! ```

pub mod connections;
pub mod events;
pub mod schedule;

pub use connections::{ConnectionService, ConnectionSummary};
pub use events::{Event, EventBus, EventReceiver};
pub use schedule::ScheduleService;

use std::sync::Arc;
use std::time::Duration;

use crate::providers::ProviderRegistry;
use crate::queue::QueueCapability;
use crate::tokens::TokenRefresher;
use crate::vault::Vault;
use crate::webhooks::WebhookIngestor;
use crate::worker::{PublishWorker, WorkerGroup};
use crate::{Config, Database, Result};

/// Main service facade
///
/// The vault is optional at construction: the webhook receiver and read-only
/// commands work without key material. Anything that touches tokens asks for
/// it through [`CrosspostService::vault`] and gets the configuration error.
pub struct CrosspostService {
    config: Arc<Config>,
    db: Database,
    registry: ProviderRegistry,
    vault: Option<Arc<Vault>>,
    queue: QueueCapability,
    schedule: ScheduleService,
    event_bus: EventBus,
}

impl CrosspostService {
    /// Create a service from the default configuration file
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    /// Create a service from a loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated, or a
    /// provider's HTTP client cannot be built.
    pub async fn from_config(config: Config) -> Result<Self> {
        let db_path = config.resolve_db_path();
        let db = Database::new(&db_path.to_string_lossy()).await?;

        let registry = ProviderRegistry::from_config(&config)?;
        let queue = QueueCapability::from_config(&config.queue, &db);

        let vault = match Vault::from_config(&config.vault) {
            Ok(vault) => Some(Arc::new(vault)),
            Err(e) => {
                tracing::debug!(error = %e, "Vault keys unavailable; token operations disabled");
                None
            }
        };

        tracing::debug!(
            db = %db_path.display(),
            queue = ?queue,
            vault = vault.is_some(),
            "Service initialized"
        );

        Ok(Self::from_parts(config, db, registry, vault, queue))
    }

    /// Assemble a service from already-built parts
    pub fn from_parts(
        config: Config,
        db: Database,
        registry: ProviderRegistry,
        vault: Option<Arc<Vault>>,
        queue: QueueCapability,
    ) -> Self {
        Self {
            schedule: ScheduleService::new(db.clone(), queue.clone()),
            config: Arc::new(config),
            db,
            registry,
            vault,
            queue,
            event_bus: EventBus::new(100),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Access the database directly
    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn queue(&self) -> &QueueCapability {
        &self.queue
    }

    pub fn schedule(&self) -> &ScheduleService {
        &self.schedule
    }

    /// The credential vault, or the error that kept it from loading
    pub fn vault(&self) -> Result<Arc<Vault>> {
        match &self.vault {
            Some(vault) => Ok(vault.clone()),
            None => Ok(Arc::new(Vault::from_config(&self.config.vault)?)),
        }
    }

    pub fn connections(&self) -> Result<ConnectionService> {
        Ok(ConnectionService::new(
            self.db.clone(),
            self.registry.clone(),
            self.vault()?,
        ))
    }

    /// A publish worker bound to the configured queue
    pub fn worker(&self) -> Result<PublishWorker> {
        let queue = match &self.queue {
            QueueCapability::Available(queue) => queue.clone(),
            QueueCapability::Unavailable { reason } => {
                return Err(crate::error::QueueError::Unavailable(reason.clone()).into())
            }
        };
        let vault = self.vault()?;
        let tokens = TokenRefresher::new(self.db.clone(), vault, self.registry.clone());
        Ok(PublishWorker::new(
            self.db.clone(),
            queue,
            self.registry.clone(),
            tokens,
            self.event_bus.clone(),
        ))
    }

    /// Start `queue.concurrency` workers
    pub fn spawn_workers(&self) -> Result<WorkerGroup> {
        let worker = self.worker()?;
        Ok(WorkerGroup::spawn(
            self.config.queue.concurrency,
            worker,
            Duration::from_secs(self.config.queue.poll_interval_secs),
        ))
    }

    pub fn webhook_ingestor(&self) -> WebhookIngestor {
        WebhookIngestor::new(self.registry.clone(), self.db.clone())
            .with_events(self.event_bus.clone())
    }

    /// Subscribe to service events
    ///
    /// Returns a receiver that will receive progress events from workers and
    /// the webhook receiver. Multiple subscribers are supported.
    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.event_bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use serial_test::serial;

    async fn service(vault: Option<Arc<Vault>>) -> CrosspostService {
        let config = Config::default_config();
        let db = Database::in_memory().await.unwrap();
        CrosspostService::from_parts(
            config,
            db,
            ProviderRegistry::new(),
            vault,
            QueueCapability::available(Arc::new(MemoryQueue::default())),
        )
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_vault_surfaces_config_error() {
        std::env::remove_var("CROSSPOST_VAULT_KEY");
        let service = service(None).await;
        assert!(service.vault().is_err());
        assert!(service.connections().is_err());
        assert!(service.worker().is_err());
        // Webhooks need no key material
        let _ingestor = service.webhook_ingestor();
    }

    #[tokio::test]
    async fn test_worker_requires_queue() {
        let vault = Arc::new(
            Vault::from_secrets(1, vec![(1, secrecy::SecretString::from("k".to_string()))])
                .unwrap(),
        );
        let mut service = service(Some(vault)).await;
        assert!(service.worker().is_ok());

        service.queue = QueueCapability::unavailable("off");
        assert!(matches!(
            service.worker(),
            Err(crate::CrosspostError::Queue(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribers_share_one_bus() {
        let service = service(None).await;
        let _a = service.subscribe();
        let _b = service.subscribe();
        assert_eq!(service.events().subscriber_count(), 2);
    }
}
