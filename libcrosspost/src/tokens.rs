//! Valid access tokens on demand
//!
//! A stored token is used as-is while it has no expiry or expires more than
//! five minutes from now. Otherwise it is refreshed through the provider's
//! [`TokenExchanger`](crate::providers::TokenExchanger) and the new tokens are
//! sealed back into the connection row.
//!
//! There is no cross-job lock on a connection. Two workers holding the same
//! stale token may both refresh it; providers that rotate refresh tokens on
//! use will reject the loser, which then surfaces as a reconnect prompt.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::db::Database;
use crate::error::{PlatformError, Result, TokenError};
use crate::providers::ProviderRegistry;
use crate::types::Connection;
use crate::vault::Vault;

/// Tokens expiring within this window are refreshed before use
pub const REFRESH_SKEW_SECS: i64 = 5 * 60;

pub fn is_token_valid(expires_at: Option<i64>, now: i64) -> bool {
    match expires_at {
        None => true,
        Some(expires_at) => expires_at.saturating_sub(now) > REFRESH_SKEW_SECS,
    }
}

#[derive(Clone)]
pub struct TokenRefresher {
    db: Database,
    vault: Arc<Vault>,
    registry: ProviderRegistry,
}

impl TokenRefresher {
    pub fn new(db: Database, vault: Arc<Vault>, registry: ProviderRegistry) -> Self {
        Self {
            db,
            vault,
            registry,
        }
    }

    /// Plaintext access token for `connection`, refreshing first if needed
    pub async fn valid_access_token(&self, connection: &Connection) -> Result<SecretString> {
        let now = chrono::Utc::now().timestamp();
        if is_token_valid(connection.expires_at, now) {
            return Ok(self.vault.decrypt(&connection.access_token)?);
        }

        tracing::debug!(
            connection_id = %connection.id,
            provider = %connection.provider,
            expires_at = connection.expires_at,
            "Access token expired or expiring, refreshing"
        );
        self.refresh(connection).await
    }

    /// Refresh unconditionally and persist the result
    pub async fn refresh(&self, connection: &Connection) -> Result<SecretString> {
        let provider = connection.provider;

        let sealed_refresh = connection.refresh_token.as_deref().ok_or_else(|| {
            TokenError::ReconnectRequired(format!(
                "{} connection has no refresh token",
                provider.display_name()
            ))
        })?;
        let refresh_token = self.vault.decrypt(sealed_refresh)?;

        let exchanger = self.registry.exchanger(provider).ok_or_else(|| {
            PlatformError::NotConfigured(format!("no token exchanger for {}", provider))
        })?;

        let grant = match exchanger.refresh(refresh_token.expose_secret()).await {
            Ok(grant) => grant,
            Err(e) => {
                match &e {
                    TokenError::ReconnectRequired(_) => tracing::warn!(
                        connection_id = %connection.id,
                        provider = %provider,
                        error = %e,
                        "Refresh rejected, user must reconnect"
                    ),
                    _ => tracing::warn!(
                        connection_id = %connection.id,
                        provider = %provider,
                        transient = e.is_transient(),
                        error = %e,
                        "Token refresh failed"
                    ),
                }
                return Err(e.into());
            }
        };

        let issued_at = chrono::Utc::now().timestamp();
        let sealed_access = self.vault.encrypt(&grant.access_token)?;
        // Keep the old refresh token unless the provider issued a new one
        let sealed_refresh = match &grant.refresh_token {
            Some(token) => Some(self.vault.encrypt(token)?),
            None => connection.refresh_token.clone(),
        };
        let expires_at = grant.expires_at(issued_at);

        self.db
            .update_connection_tokens(
                &connection.id,
                &sealed_access,
                sealed_refresh.as_deref(),
                expires_at,
            )
            .await?;

        tracing::info!(
            connection_id = %connection.id,
            provider = %provider,
            expires_at = expires_at,
            "Refreshed access token"
        );

        Ok(SecretString::from(grant.access_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrosspostError;
    use crate::providers::mock::{MockConfig, MockProvider};
    use crate::types::Provider;

    fn vault() -> Arc<Vault> {
        Arc::new(
            Vault::from_secrets(1, vec![(1, SecretString::from("test-key".to_string()))]).unwrap(),
        )
    }

    async fn setup(
        mock: MockProvider,
        expires_at: Option<i64>,
        refresh_token: Option<&str>,
    ) -> (TokenRefresher, Database, Connection, MockConfig, Arc<Vault>) {
        let db = Database::in_memory().await.unwrap();
        let vault = vault();
        let handle = mock.config();
        let mut registry = ProviderRegistry::new();
        registry.register_exchanger(Arc::new(mock));

        let now = chrono::Utc::now().timestamp();
        let connection = Connection {
            id: "conn-1".to_string(),
            owner_id: "owner-1".to_string(),
            provider: Provider::Linkedin,
            access_token: vault.encrypt("old-access").unwrap(),
            refresh_token: refresh_token.map(|t| vault.encrypt(t).unwrap()),
            token_type: "Bearer".to_string(),
            expires_at,
            created_at: now,
            updated_at: now,
        };
        db.upsert_connection(&connection).await.unwrap();

        (
            TokenRefresher::new(db.clone(), vault.clone(), registry),
            db,
            connection,
            handle,
            vault,
        )
    }

    #[test]
    fn test_validity_window() {
        let now = 1_000_000;
        assert!(is_token_valid(None, now));
        assert!(is_token_valid(Some(now + 301), now));
        assert!(!is_token_valid(Some(now + 300), now));
        assert!(!is_token_valid(Some(now + 60), now));
        assert!(!is_token_valid(Some(now - 60), now));
        assert!(is_token_valid(Some(i64::MAX), now));
        assert!(!is_token_valid(Some(i64::MIN), now));
    }

    #[tokio::test]
    async fn test_refresh_with_huge_lifetime_is_stored() {
        let soon = chrono::Utc::now().timestamp() + 60;
        let mut config = MockConfig::new(Provider::Linkedin);
        config.expires_in = Some(i64::MAX);
        let (refresher, db, connection, _handle, _vault) =
            setup(MockProvider::new(config), Some(soon), Some("r")).await;

        let token = refresher.valid_access_token(&connection).await.unwrap();
        assert_eq!(token.expose_secret(), "linkedin-access-1");

        let stored = db
            .get_connection("owner-1", Provider::Linkedin)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.expires_at, Some(i64::MAX));
        assert!(is_token_valid(stored.expires_at, chrono::Utc::now().timestamp()));
    }

    #[tokio::test]
    async fn test_valid_token_is_not_refreshed() {
        let expires = chrono::Utc::now().timestamp() + 3600;
        let (refresher, _db, connection, handle, _vault) =
            setup(MockProvider::success(Provider::Linkedin), Some(expires), Some("r")).await;

        let token = refresher.valid_access_token(&connection).await.unwrap();
        assert_eq!(token.expose_secret(), "old-access");
        assert_eq!(handle.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_token_without_expiry_is_valid() {
        let (refresher, _db, connection, handle, _vault) =
            setup(MockProvider::success(Provider::Linkedin), None, None).await;
        let token = refresher.valid_access_token(&connection).await.unwrap();
        assert_eq!(token.expose_secret(), "old-access");
        assert_eq!(handle.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_persisted() {
        let soon = chrono::Utc::now().timestamp() + 60;
        let (refresher, db, connection, handle, vault) =
            setup(MockProvider::success(Provider::Linkedin), Some(soon), Some("r")).await;

        let token = refresher.valid_access_token(&connection).await.unwrap();
        assert_eq!(token.expose_secret(), "linkedin-access-1");
        assert_eq!(handle.refresh_calls(), 1);

        let stored = db
            .get_connection("owner-1", Provider::Linkedin)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            vault.decrypt(&stored.access_token).unwrap().expose_secret(),
            "linkedin-access-1"
        );
        assert_eq!(
            vault
                .decrypt(stored.refresh_token.as_deref().unwrap())
                .unwrap()
                .expose_secret(),
            "linkedin-refresh-1"
        );
        let expires_at = stored.expires_at.unwrap();
        assert!(expires_at > chrono::Utc::now().timestamp() + 3000);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_requires_reconnect() {
        let past = chrono::Utc::now().timestamp() - 10;
        let (refresher, _db, connection, handle, _vault) =
            setup(MockProvider::success(Provider::Linkedin), Some(past), None).await;

        let err = refresher.valid_access_token(&connection).await.unwrap_err();
        assert!(matches!(
            err,
            CrosspostError::Token(TokenError::ReconnectRequired(_))
        ));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(handle.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_classification_is_preserved() {
        let past = chrono::Utc::now().timestamp() - 10;
        for error in [
            TokenError::ReconnectRequired("invalid_grant".to_string()),
            TokenError::Transient("503".to_string()),
            TokenError::Failed("weird".to_string()),
        ] {
            let (refresher, db, connection, _handle, vault) = setup(
                MockProvider::token_failure(Provider::Linkedin, error.clone()),
                Some(past),
                Some("r"),
            )
            .await;

            match refresher.valid_access_token(&connection).await {
                Err(CrosspostError::Token(got)) => assert_eq!(got, error),
                other => panic!("unexpected result {:?}", other.map(|_| ())),
            }

            // Nothing persisted on failure
            let stored = db
                .get_connection("owner-1", Provider::Linkedin)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(
                vault.decrypt(&stored.access_token).unwrap().expose_secret(),
                "old-access"
            );
        }
    }

    #[tokio::test]
    async fn test_missing_exchanger_is_not_configured() {
        let past = chrono::Utc::now().timestamp() - 10;
        let (_refresher, db, connection, _handle, vault) =
            setup(MockProvider::success(Provider::Linkedin), Some(past), Some("r")).await;

        let bare = TokenRefresher::new(db, vault, ProviderRegistry::new());
        assert!(matches!(
            bare.refresh(&connection).await,
            Err(CrosspostError::Platform(PlatformError::NotConfigured(_)))
        ));
    }
}
