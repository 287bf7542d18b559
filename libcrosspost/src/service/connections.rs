//! Provider connections: OAuth code exchange, listing and disconnect
//!
//! Tokens are sealed by the vault before they touch the database and are
//! never returned from this service.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{CrosspostError, PlatformError, Result};
use crate::providers::ProviderRegistry;
use crate::tokens::TokenRefresher;
use crate::types::{Connection, Provider};
use crate::vault::{RotationReport, Sealed, Vault};

/// What callers get to see about a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: String,
    pub owner_id: String,
    pub provider: Provider,
    pub token_type: String,
    pub expires_at: Option<i64>,
    pub has_refresh_token: bool,
    /// Vault key version the access token is sealed under; 0 for legacy
    pub key_version: u32,
    pub updated_at: i64,
}

impl From<&Connection> for ConnectionSummary {
    fn from(connection: &Connection) -> Self {
        let key_version = match connection.access_token.parse::<Sealed>() {
            Ok(Sealed::Versioned { version, .. }) => version,
            _ => 0,
        };
        Self {
            id: connection.id.clone(),
            owner_id: connection.owner_id.clone(),
            provider: connection.provider,
            token_type: connection.token_type.clone(),
            expires_at: connection.expires_at,
            has_refresh_token: connection.refresh_token.is_some(),
            key_version,
            updated_at: connection.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct ConnectionService {
    db: Database,
    registry: ProviderRegistry,
    vault: Arc<Vault>,
    tokens: TokenRefresher,
}

impl ConnectionService {
    pub fn new(db: Database, registry: ProviderRegistry, vault: Arc<Vault>) -> Self {
        let tokens = TokenRefresher::new(db.clone(), vault.clone(), registry.clone());
        Self {
            db,
            registry,
            vault,
            tokens,
        }
    }

    /// Exchange an authorization code and store the sealed tokens.
    ///
    /// Reconnecting replaces the tokens of the existing connection.
    pub async fn connect(
        &self,
        owner_id: &str,
        provider: Provider,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ConnectionSummary> {
        let exchanger = self.registry.exchanger(provider).ok_or_else(|| {
            PlatformError::NotConfigured(format!("no token exchanger for {}", provider))
        })?;

        let grant = exchanger.exchange_code(code, redirect_uri).await?;

        let now = chrono::Utc::now().timestamp();
        let existing = self.db.get_connection(owner_id, provider).await?;
        let connection = Connection {
            id: existing
                .as_ref()
                .map(|c| c.id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            owner_id: owner_id.to_string(),
            provider,
            access_token: self.vault.encrypt(&grant.access_token)?,
            refresh_token: match &grant.refresh_token {
                Some(token) => Some(self.vault.encrypt(token)?),
                None => None,
            },
            token_type: grant.token_type.clone(),
            expires_at: grant.expires_at(now),
            created_at: existing.as_ref().map(|c| c.created_at).unwrap_or(now),
            updated_at: now,
        };

        self.db.upsert_connection(&connection).await?;
        info!(
            owner_id,
            provider = %provider,
            reconnect = existing.is_some(),
            "Connected provider"
        );

        Ok(ConnectionSummary::from(&connection))
    }

    pub async fn list(&self, owner_id: Option<&str>) -> Result<Vec<ConnectionSummary>> {
        let connections = self.db.list_connections(owner_id).await?;
        Ok(connections.iter().map(ConnectionSummary::from).collect())
    }

    /// Remove a connection. Returns false if there was none.
    pub async fn disconnect(&self, owner_id: &str, provider: Provider) -> Result<bool> {
        let removed = self.db.delete_connection(owner_id, provider).await?;
        if removed {
            info!(owner_id, provider = %provider, "Disconnected provider");
        }
        Ok(removed)
    }

    /// Force a token refresh regardless of expiry
    pub async fn refresh(&self, owner_id: &str, provider: Provider) -> Result<ConnectionSummary> {
        let connection = self
            .db
            .get_connection(owner_id, provider)
            .await?
            .ok_or_else(|| {
                CrosspostError::NotFound(format!("{} connection for {}", provider, owner_id))
            })?;

        self.tokens.refresh(&connection).await?;

        let refreshed = self
            .db
            .get_connection(owner_id, provider)
            .await?
            .ok_or_else(|| {
                CrosspostError::NotFound(format!("{} connection for {}", provider, owner_id))
            })?;
        Ok(ConnectionSummary::from(&refreshed))
    }

    /// Re-seal every stored token under the current key version
    pub async fn rotate_keys(&self) -> Result<RotationReport> {
        self.vault.rotate(&self.db).await
    }

    pub fn tokens(&self) -> &TokenRefresher {
        &self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TokenError;
    use crate::providers::mock::MockProvider;
    use secrecy::{ExposeSecret, SecretString};

    fn vault() -> Arc<Vault> {
        Arc::new(
            Vault::from_secrets(1, vec![(1, SecretString::from("test-key".to_string()))]).unwrap(),
        )
    }

    async fn service(mock: MockProvider) -> (ConnectionService, Database, Arc<Vault>) {
        let db = Database::in_memory().await.unwrap();
        let vault = vault();
        let mut registry = ProviderRegistry::new();
        registry.register_exchanger(Arc::new(mock));
        (
            ConnectionService::new(db.clone(), registry, vault.clone()),
            db,
            vault,
        )
    }

    #[tokio::test]
    async fn test_connect_seals_tokens() {
        let (service, db, vault) = service(MockProvider::success(Provider::Linkedin)).await;

        let summary = service
            .connect("owner-1", Provider::Linkedin, "auth-code", "https://app/cb")
            .await
            .unwrap();
        assert!(summary.has_refresh_token);
        assert_eq!(summary.key_version, 1);
        assert!(summary.expires_at.is_some());

        let stored = db
            .get_connection("owner-1", Provider::Linkedin)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.access_token.contains("linkedin-access"));
        assert_eq!(
            vault.decrypt(&stored.access_token).unwrap().expose_secret(),
            "linkedin-access-0"
        );
    }

    #[tokio::test]
    async fn test_reconnect_keeps_connection_id() {
        let (service, _db, _vault) = service(MockProvider::success(Provider::Linkedin)).await;
        let first = service
            .connect("owner-1", Provider::Linkedin, "a", "https://app/cb")
            .await
            .unwrap();
        let second = service
            .connect("owner-1", Provider::Linkedin, "b", "https://app/cb")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(service.list(Some("owner-1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_exchanger() {
        let (service, _db, _vault) = service(MockProvider::success(Provider::Linkedin)).await;
        let err = service
            .connect("owner-1", Provider::Tiktok, "a", "https://app/cb")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CrosspostError::Platform(PlatformError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_code_stores_nothing() {
        let (service, db, _vault) = service(MockProvider::token_failure(
            Provider::Linkedin,
            TokenError::ReconnectRequired("invalid_grant".to_string()),
        ))
        .await;
        assert!(service
            .connect("owner-1", Provider::Linkedin, "a", "https://app/cb")
            .await
            .is_err());
        assert!(db.list_connections(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_and_disconnect() {
        let (service, _db, _vault) = service(MockProvider::success(Provider::Linkedin)).await;
        service
            .connect("owner-1", Provider::Linkedin, "a", "https://app/cb")
            .await
            .unwrap();

        let refreshed = service.refresh("owner-1", Provider::Linkedin).await.unwrap();
        assert!(refreshed.has_refresh_token);

        assert!(service.disconnect("owner-1", Provider::Linkedin).await.unwrap());
        assert!(!service.disconnect("owner-1", Provider::Linkedin).await.unwrap());
        assert!(matches!(
            service.refresh("owner-1", Provider::Linkedin).await,
            Err(CrosspostError::NotFound(_))
        ));
    }
}
