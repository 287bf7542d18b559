//! Credential vault: OAuth tokens encrypted at rest
//!
//! Tokens are sealed with AES-256-GCM under a versioned key and stored as
//!
//! ```text
//! <keyVersion>:<ivHex>:<authTagHex>:<cipherHex>
//! ```
//!
//! Values written before key versioning existed use the three-field form
//! `<ivHex>:<authTagHex>:<cipherHex>` and are read with the oldest configured
//! key. They are only rewritten by [`Vault::rotate`].
//!
//! Each key version is derived from a secret held in an environment variable,
//! so adding a `[[vault.keys]]` entry and bumping `current_version` is all a
//! rotation needs on the configuration side.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::config::{read_secret_env, VaultConfig};
use crate::db::Database;
use crate::error::{ConfigError, Result, VaultError};

type HmacSha256 = Hmac<Sha256>;

const KEY_LENGTH: usize = 32;
const IV_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

/// IV, tag and ciphertext of one sealed value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub iv: [u8; IV_LENGTH],
    pub tag: [u8; TAG_LENGTH],
    pub ciphertext: Vec<u8>,
}

/// A stored token, decoded once at the boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sealed {
    /// Three-field form from before key versioning
    Legacy(Envelope),
    Versioned { version: u32, envelope: Envelope },
}

impl Sealed {
    pub fn envelope(&self) -> &Envelope {
        match self {
            Sealed::Legacy(envelope) => envelope,
            Sealed::Versioned { envelope, .. } => envelope,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Sealed::Legacy(_))
    }
}

impl FromStr for Sealed {
    type Err = VaultError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [iv, tag, cipher] => Ok(Sealed::Legacy(decode_envelope(iv, tag, cipher)?)),
            [version, iv, tag, cipher] => {
                let version = version.parse::<u32>().map_err(|_| {
                    VaultError::Malformed(format!("key version '{}' is not a number", version))
                })?;
                Ok(Sealed::Versioned {
                    version,
                    envelope: decode_envelope(iv, tag, cipher)?,
                })
            }
            _ => Err(VaultError::Malformed(format!(
                "expected 3 or 4 ':'-separated fields, found {}",
                parts.len()
            ))),
        }
    }
}

impl fmt::Display for Sealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = self.envelope();
        if let Sealed::Versioned { version, .. } = self {
            write!(f, "{}:", version)?;
        }
        write!(
            f,
            "{}:{}:{}",
            hex::encode(e.iv),
            hex::encode(e.tag),
            hex::encode(&e.ciphertext)
        )
    }
}

fn decode_envelope(iv: &str, tag: &str, cipher: &str) -> std::result::Result<Envelope, VaultError> {
    let iv_bytes = hex::decode(iv).map_err(|e| VaultError::Malformed(format!("iv: {}", e)))?;
    let tag_bytes = hex::decode(tag).map_err(|e| VaultError::Malformed(format!("tag: {}", e)))?;
    let ciphertext =
        hex::decode(cipher).map_err(|e| VaultError::Malformed(format!("ciphertext: {}", e)))?;

    let iv: [u8; IV_LENGTH] = iv_bytes.try_into().map_err(|v: Vec<u8>| {
        VaultError::Malformed(format!("iv must be {} bytes, got {}", IV_LENGTH, v.len()))
    })?;
    let tag: [u8; TAG_LENGTH] = tag_bytes.try_into().map_err(|v: Vec<u8>| {
        VaultError::Malformed(format!("tag must be {} bytes, got {}", TAG_LENGTH, v.len()))
    })?;

    Ok(Envelope {
        iv,
        tag,
        ciphertext,
    })
}

/// Derive the AES key for `version` from its secret
fn derive_key(
    secret: &SecretString,
    version: u32,
) -> std::result::Result<Zeroizing<[u8; KEY_LENGTH]>, VaultError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
    mac.update(format!("crosspost-vault-v{}", version).as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Summary of a key rotation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RotationReport {
    /// Connections inspected
    pub examined: usize,
    /// Connections rewritten under the current key
    pub rotated: usize,
    /// Connections that could not be decrypted, with the reason
    pub failed: Vec<(String, String)>,
}

/// Versioned key ring plus seal/open operations
pub struct Vault {
    current_version: u32,
    keys: BTreeMap<u32, Zeroizing<[u8; KEY_LENGTH]>>,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("current_version", &self.current_version)
            .field("versions", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Vault {
    /// Build the key ring from `[vault]` config, reading each key's secret
    /// from its environment variable
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        let mut secrets = Vec::with_capacity(config.keys.len());
        for key in &config.keys {
            let secret = read_secret_env(&key.secret_env).ok_or_else(|| {
                ConfigError::MissingField(format!(
                    "environment variable {} (vault key v{})",
                    key.secret_env, key.version
                ))
            })?;
            secrets.push((key.version, secret));
        }
        Ok(Self::from_secrets(config.current_version, secrets)?)
    }

    pub fn from_secrets(
        current_version: u32,
        secrets: Vec<(u32, SecretString)>,
    ) -> std::result::Result<Self, VaultError> {
        let mut keys = BTreeMap::new();
        for (version, secret) in secrets {
            if secret.expose_secret().is_empty() {
                return Err(VaultError::InvalidKey(format!(
                    "secret for key version {} is empty",
                    version
                )));
            }
            keys.insert(version, derive_key(&secret, version)?);
        }

        if !keys.contains_key(&current_version) {
            return Err(VaultError::UnknownKeyVersion(current_version));
        }

        Ok(Self {
            current_version,
            keys,
        })
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// Version assumed for legacy three-field values
    pub fn oldest_version(&self) -> u32 {
        self.keys
            .keys()
            .next()
            .copied()
            .unwrap_or(self.current_version)
    }

    fn cipher_for(&self, version: u32) -> std::result::Result<Aes256Gcm, VaultError> {
        let key = self
            .keys
            .get(&version)
            .ok_or(VaultError::UnknownKeyVersion(version))?;
        Aes256Gcm::new_from_slice(key.as_slice()).map_err(|e| VaultError::InvalidKey(e.to_string()))
    }

    /// Seal `plaintext` under the current key
    pub fn encrypt(&self, plaintext: &str) -> std::result::Result<String, VaultError> {
        let cipher = self.cipher_for(self.current_version)?;

        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        // aes-gcm appends the tag; the stored form keeps it in its own field
        let split = sealed.len() - TAG_LENGTH;
        let tag_bytes = sealed.split_off(split);
        let mut tag = [0u8; TAG_LENGTH];
        tag.copy_from_slice(&tag_bytes);

        Ok(Sealed::Versioned {
            version: self.current_version,
            envelope: Envelope {
                iv,
                tag,
                ciphertext: sealed,
            },
        }
        .to_string())
    }

    /// Open a stored value. Any tampering is an [`VaultError::Authentication`] failure.
    pub fn decrypt(&self, stored: &str) -> std::result::Result<SecretString, VaultError> {
        let sealed: Sealed = stored.parse()?;
        self.open(&sealed)
    }

    fn open(&self, sealed: &Sealed) -> std::result::Result<SecretString, VaultError> {
        let version = match sealed {
            Sealed::Legacy(_) => self.oldest_version(),
            Sealed::Versioned { version, .. } => *version,
        };
        let cipher = self.cipher_for(version)?;
        let envelope = sealed.envelope();

        let mut combined = Vec::with_capacity(envelope.ciphertext.len() + TAG_LENGTH);
        combined.extend_from_slice(&envelope.ciphertext);
        combined.extend_from_slice(&envelope.tag);

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&envelope.iv), combined.as_slice())
                .map_err(|_| VaultError::Authentication)?,
        );

        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| VaultError::Malformed("decrypted token is not UTF-8".to_string()))?;
        Ok(SecretString::from(text.to_string()))
    }

    /// Re-seal under the current key, or `None` if already current
    pub fn reseal(&self, stored: &str) -> std::result::Result<Option<String>, VaultError> {
        let sealed: Sealed = stored.parse()?;
        if let Sealed::Versioned { version, .. } = &sealed {
            if *version == self.current_version {
                return Ok(None);
            }
        }
        let plaintext = self.open(&sealed)?;
        Ok(Some(self.encrypt(plaintext.expose_secret())?))
    }

    /// Move every stored connection onto the current key version.
    ///
    /// Connections already on the current version are left untouched, so a
    /// second run reports zero rotations. A connection whose tokens cannot be
    /// opened is recorded in the report and skipped.
    pub async fn rotate(&self, db: &Database) -> Result<RotationReport> {
        let mut report = RotationReport::default();

        for connection in db.list_connections(None).await? {
            report.examined += 1;

            let access = self.reseal(&connection.access_token);
            let refresh = connection
                .refresh_token
                .as_deref()
                .map(|t| self.reseal(t))
                .transpose();

            let (access, refresh) = match (access, refresh) {
                (Ok(a), Ok(r)) => (a, r.flatten()),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(
                        connection_id = %connection.id,
                        provider = %connection.provider,
                        error = %e,
                        "Skipping connection during key rotation"
                    );
                    report.failed.push((connection.id.clone(), e.to_string()));
                    continue;
                }
            };

            if access.is_none() && refresh.is_none() {
                continue;
            }

            let new_access = access.unwrap_or_else(|| connection.access_token.clone());
            let new_refresh = refresh.or_else(|| connection.refresh_token.clone());

            db.update_connection_tokens(
                &connection.id,
                &new_access,
                new_refresh.as_deref(),
                connection.expires_at,
            )
            .await?;

            tracing::info!(
                connection_id = %connection.id,
                provider = %connection.provider,
                version = self.current_version,
                "Rotated connection tokens"
            );
            report.rotated += 1;
        }

        Ok(report)
    }
}
