//! Integration tests for vault key rotation over stored connections

use std::sync::Arc;

use libcrosspost::providers::mock::MockProvider;
use libcrosspost::providers::ProviderRegistry;
use libcrosspost::service::{ConnectionService, CrosspostService};
use libcrosspost::vault::{Sealed, Vault};
use libcrosspost::{Config, Database, Provider};
use secrecy::{ExposeSecret, SecretString};
use serial_test::serial;
use tempfile::TempDir;

fn key(secret: &str) -> SecretString {
    SecretString::from(secret.to_string())
}

async fn connected_service(vault: Arc<Vault>, db: Database) -> ConnectionService {
    let mut registry = ProviderRegistry::new();
    registry.register_exchanger(Arc::new(MockProvider::success(Provider::Linkedin)));
    registry.register_exchanger(Arc::new(MockProvider::success(Provider::Youtube)));
    ConnectionService::new(db, registry, vault)
}

#[tokio::test]
async fn test_rotation_moves_tokens_to_current_key() {
    let db = Database::in_memory().await.unwrap();

    let v1 = Arc::new(Vault::from_secrets(1, vec![(1, key("first"))]).unwrap());
    let service = connected_service(v1, db.clone()).await;
    service
        .connect("owner-1", Provider::Linkedin, "code", "https://app/cb")
        .await
        .unwrap();
    service
        .connect("owner-1", Provider::Youtube, "code", "https://app/cb")
        .await
        .unwrap();

    // Operator adds key 2 and makes it current
    let v2 = Arc::new(
        Vault::from_secrets(2, vec![(1, key("first")), (2, key("second"))]).unwrap(),
    );
    let service = connected_service(v2, db.clone()).await;

    let report = service.rotate_keys().await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.rotated, 2);
    assert!(report.failed.is_empty());

    // Nothing left to do
    let again = service.rotate_keys().await.unwrap();
    assert_eq!(again.examined, 2);
    assert_eq!(again.rotated, 0);

    // Key 1 can now be retired
    let only_v2 = Vault::from_secrets(2, vec![(2, key("second"))]).unwrap();
    for connection in db.list_connections(None).await.unwrap() {
        let sealed: Sealed = connection.access_token.parse().unwrap();
        assert!(matches!(sealed, Sealed::Versioned { version: 2, .. }));
        let access = only_v2.decrypt(&connection.access_token).unwrap();
        assert_eq!(
            access.expose_secret(),
            format!("{}-access-0", connection.provider)
        );
        let refresh = only_v2
            .decrypt(connection.refresh_token.as_deref().unwrap())
            .unwrap();
        assert_eq!(
            refresh.expose_secret(),
            format!("{}-refresh-0", connection.provider)
        );
    }

    let summaries = service.list(Some("owner-1")).await.unwrap();
    assert!(summaries.iter().all(|s| s.key_version == 2));
}

#[tokio::test]
async fn test_rotation_reports_undecryptable_connections() {
    let db = Database::in_memory().await.unwrap();

    let stranger = Arc::new(Vault::from_secrets(1, vec![(1, key("unknown"))]).unwrap());
    connected_service(stranger, db.clone())
        .await
        .connect("owner-1", Provider::Linkedin, "code", "https://app/cb")
        .await
        .unwrap();

    let vault = Arc::new(
        Vault::from_secrets(2, vec![(1, key("first")), (2, key("second"))]).unwrap(),
    );
    let report = connected_service(vault, db.clone())
        .await
        .rotate_keys()
        .await
        .unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.rotated, 0);
    assert_eq!(report.failed.len(), 1);
}

#[tokio::test]
#[serial]
async fn test_vault_keys_from_environment() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("rotation.db");
    let config = Config::from_toml(&format!(
        r#"
[database]
path = "{}"

[vault]
current_version = 2

[[vault.keys]]
version = 1
secret_env = "XP_ROTATION_KEY_V1"

[[vault.keys]]
version = 2
secret_env = "XP_ROTATION_KEY_V2"
"#,
        db_path.to_string_lossy().replace('\\', "\\\\")
    ))
    .unwrap();

    std::env::remove_var("CROSSPOST_DB_PATH");
    std::env::set_var("XP_ROTATION_KEY_V1", "first");
    std::env::remove_var("XP_ROTATION_KEY_V2");

    let service = CrosspostService::from_config(config.clone()).await.unwrap();
    assert!(service.connections().is_err());

    std::env::set_var("XP_ROTATION_KEY_V2", "second");
    let service = CrosspostService::from_config(config).await.unwrap();
    let vault = service.vault().unwrap();
    assert_eq!(vault.current_version(), 2);

    let report = service.connections().unwrap().rotate_keys().await.unwrap();
    assert_eq!(report.examined, 0);

    std::env::remove_var("XP_ROTATION_KEY_V1");
    std::env::remove_var("XP_ROTATION_KEY_V2");
}
