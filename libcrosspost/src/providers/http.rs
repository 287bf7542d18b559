//! reqwest-backed provider adapter
//!
//! One [`HttpProvider`] serves every platform. The per-platform differences
//! (publish route, request body shape, where the new post id lives in the
//! response, permalink format) are small tables keyed by [`Provider`]. Token
//! exchange is plain OAuth 2.0 against the provider's token endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{PublishReceipt, PublishRequest, Publisher, TokenExchanger, TokenGrant};
use crate::config::ProviderConfig;
use crate::error::{PlatformError, TokenError};
use crate::types::Provider;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Production API base for each provider
pub fn default_api_base(provider: Provider) -> &'static str {
    match provider {
        Provider::Instagram | Provider::Facebook => "https://graph.facebook.com/v19.0",
        Provider::Tiktok => "https://open.tiktokapis.com",
        Provider::Twitter => "https://api.twitter.com",
        Provider::Linkedin => "https://api.linkedin.com",
        Provider::Pinterest => "https://api.pinterest.com",
        Provider::Youtube => "https://www.googleapis.com",
    }
}

/// Production OAuth token endpoint for each provider
pub fn default_token_url(provider: Provider) -> &'static str {
    match provider {
        Provider::Instagram | Provider::Facebook => {
            "https://graph.facebook.com/v19.0/oauth/access_token"
        }
        Provider::Tiktok => "https://open.tiktokapis.com/v2/oauth/token/",
        Provider::Twitter => "https://api.twitter.com/2/oauth2/token",
        Provider::Linkedin => "https://www.linkedin.com/oauth/v2/accessToken",
        Provider::Pinterest => "https://api.pinterest.com/v5/oauth/token",
        Provider::Youtube => "https://oauth2.googleapis.com/token",
    }
}

/// Publish route and JSON pointer to the new post's id
fn publish_route(provider: Provider) -> (&'static str, &'static str) {
    match provider {
        Provider::Twitter => ("/2/tweets", "/data/id"),
        Provider::Linkedin => ("/v2/ugcPosts", "/id"),
        Provider::Pinterest => ("/v5/pins", "/id"),
        Provider::Facebook => ("/me/feed", "/id"),
        Provider::Instagram => ("/me/media_publish", "/id"),
        Provider::Tiktok => ("/v2/post/publish/content/init/", "/data/publish_id"),
        Provider::Youtube => ("/youtube/v3/videos", "/id"),
    }
}

fn permalink(provider: Provider, external_id: &str) -> Option<String> {
    match provider {
        Provider::Twitter => Some(format!("https://twitter.com/i/web/status/{}", external_id)),
        Provider::Linkedin => Some(format!(
            "https://www.linkedin.com/feed/update/{}",
            external_id
        )),
        Provider::Pinterest => Some(format!("https://www.pinterest.com/pin/{}", external_id)),
        Provider::Facebook => Some(format!("https://www.facebook.com/{}", external_id)),
        Provider::Youtube => Some(format!("https://www.youtube.com/watch?v={}", external_id)),
        // Instagram and TikTok only expose permalinks after async processing
        Provider::Instagram | Provider::Tiktok => None,
    }
}

fn publish_body(provider: Provider, request: &PublishRequest) -> Value {
    let text_field = match provider {
        Provider::Twitter => "text",
        Provider::Facebook => "message",
        Provider::Pinterest | Provider::Youtube => "description",
        _ => "caption",
    };

    let mut body = json!({ text_field: request.caption });

    if let Some(media) = &request.media {
        body["media"] = json!({ "type": media.kind.as_str(), "url": media.url });
    }
    if let Some(board_id) = &request.board_id {
        body["board_id"] = json!(board_id);
    }
    if let Some(language) = &request.options.language {
        body["language"] = json!(language);
    }

    body
}

/// OAuth error body, as returned by every provider we talk to
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: Option<String>,
    error_description: Option<String>,
    message: Option<String>,
}

/// Classify a failed token endpoint response.
///
/// `invalid_grant`, or a description mentioning an expired or revoked grant,
/// means the user has to reconnect. Server errors are transient. Everything
/// else is a plain failure.
pub fn classify_token_failure(status: StatusCode, body: &str) -> TokenError {
    if status.is_server_error() {
        return TokenError::Transient(format!("token endpoint returned {}", status));
    }

    let parsed: Option<OAuthErrorBody> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|b| b.error.clone())
        .unwrap_or_default();
    let description = parsed
        .as_ref()
        .and_then(|b| b.error_description.clone().or_else(|| b.message.clone()))
        .unwrap_or_else(|| body.chars().take(200).collect());

    let lowered = description.to_lowercase();
    if code == "invalid_grant" || lowered.contains("expired") || lowered.contains("revoked") {
        return TokenError::ReconnectRequired(if code.is_empty() {
            description
        } else {
            format!("{}: {}", code, description)
        });
    }

    TokenError::Failed(if code.is_empty() {
        format!("{} {}", status, description)
    } else {
        format!("{}: {}", code, description)
    })
}

fn classify_transport(error: &reqwest::Error) -> TokenError {
    TokenError::Transient(format!("token request failed: {}", error))
}

fn classify_publish_failure(status: StatusCode, body: &str) -> PlatformError {
    let snippet: String = body.chars().take(300).collect();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            PlatformError::Authentication(format!("{}: {}", status, snippet))
        }
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimit(snippet),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            PlatformError::Validation(format!("{}: {}", status, snippet))
        }
        s if s.is_server_error() => PlatformError::Network(format!("{}: {}", status, snippet)),
        _ => PlatformError::Posting(format!("{}: {}", status, snippet)),
    }
}

/// Generic OAuth + REST adapter for one provider
pub struct HttpProvider {
    provider: Provider,
    client: Client,
    api_base: String,
    token_url: String,
    client_id: Option<String>,
    client_secret: Option<SecretString>,
}

impl HttpProvider {
    pub fn new(provider: Provider, config: &ProviderConfig) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("crosspost/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlatformError::NotConfigured(format!("HTTP client: {}", e)))?;

        Ok(Self {
            provider,
            client,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| default_api_base(provider).to_string())
                .trim_end_matches('/')
                .to_string(),
            token_url: config
                .token_url
                .clone()
                .unwrap_or_else(|| default_token_url(provider).to_string()),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret(),
        })
    }

    /// Override the client secret (normally read from the environment)
    pub fn with_client_secret(mut self, secret: SecretString) -> Self {
        self.client_secret = Some(secret);
        self
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenGrant, TokenError> {
        let client_id = self.client_id.as_deref().ok_or_else(|| {
            TokenError::Failed(format!("no client_id configured for {}", self.provider))
        })?;

        let mut form: Vec<(&str, &str)> = params.to_vec();
        form.push(("client_id", client_id));
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.expose_secret()));
        }

        let response = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| classify_transport(&e))?;

        if !status.is_success() {
            let error = classify_token_failure(status, &body);
            warn!(provider = %self.provider, %status, error = %error, "Token endpoint rejected request");
            return Err(error);
        }

        serde_json::from_str::<TokenGrant>(&body)
            .map_err(|e| TokenError::Failed(format!("unreadable token response: {}", e)))
    }
}

#[async_trait]
impl Publisher for HttpProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PlatformError> {
        let (route, id_pointer) = publish_route(self.provider);
        let url = format!("{}{}", self.api_base, route);
        debug!(provider = %self.provider, %url, "Publishing");

        let response = self
            .client
            .post(&url)
            .bearer_auth(request.access_token.expose_secret())
            .json(&publish_body(self.provider, request))
            .send()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_publish_failure(status, &body));
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| PlatformError::Posting(format!("unreadable response: {}", e)))?;

        let external_id = match value.pointer(id_pointer) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(PlatformError::Posting(format!(
                    "response has no post id at {}",
                    id_pointer
                )))
            }
        };

        Ok(PublishReceipt {
            external_url: permalink(self.provider, &external_id),
            external_id,
        })
    }
}

#[async_trait]
impl TokenExchanger for HttpProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, TokenError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}
