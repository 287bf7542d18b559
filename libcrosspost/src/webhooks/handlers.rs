//! Per-provider webhook handling: handshakes, signatures and classification
//!
//! | Provider            | Handshake                      | Signature header                  | Scheme                    |
//! |---------------------|--------------------------------|-----------------------------------|---------------------------|
//! | facebook, instagram | `hub.verify_token` echo        | `X-Hub-Signature-256: sha256=hex` | HMAC-SHA256 over body     |
//! | youtube             | `hub.challenge` echo           | `X-Hub-Signature: sha1=hex`       | HMAC-SHA1 over body       |
//! | twitter             | `crc_token` response token     | `X-Twitter-Webhooks-Signature`    | HMAC-SHA256, base64       |
//! | linkedin            | `challengeCode` response       | `X-LI-Signature`                  | HMAC-SHA256, hex          |
//! | tiktok              | none                           | `TikTok-Signature: t=..,s=..`     | HMAC-SHA256 over `t.body` |
//! | pinterest           | none                           | `X-Pinterest-Signature`           | HMAC-SHA256, base64       |
//!
//! A handler without a configured secret rejects every delivery.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use super::signature::{constant_time_eq, sign, verify, Algorithm, Encoding};
use crate::config::ProviderConfig;
use crate::error::WebhookError;
use crate::types::{Provider, WebhookEventType};

/// Body of a successful GET handshake
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeResponse {
    Text(String),
    Json(Value),
}

/// How a delivery refers to one of our posts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostRef {
    /// Our own id, echoed back through provider metadata
    PostId(String),
    /// The platform's id for the published item
    ExternalId(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub event_type: WebhookEventType,
    pub payload: Value,
    pub post_ref: Option<PostRef>,
}

pub trait WebhookHandler: Send + Sync {
    fn provider(&self) -> Provider;

    /// Answer a GET subscription handshake
    fn handshake(&self, query: &HashMap<String, String>)
        -> Result<HandshakeResponse, WebhookError>;

    /// Verify a POST delivery, returning the signature that matched
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<String, WebhookError>;

    /// Parse and classify a verified delivery
    fn normalize(&self, body: &[u8]) -> Result<NormalizedEvent, WebhookError>;
}

/// Build the handler for `provider` from its config section
pub fn handler_for(provider: Provider, settings: &ProviderConfig) -> Arc<dyn WebhookHandler> {
    Arc::new(ProviderWebhook::new(
        provider,
        settings.webhook_secret(),
        settings.verify_token(),
    ))
}

pub fn signature_header(provider: Provider) -> &'static str {
    match provider {
        Provider::Facebook | Provider::Instagram => "x-hub-signature-256",
        Provider::Youtube => "x-hub-signature",
        Provider::Twitter => "x-twitter-webhooks-signature",
        Provider::Linkedin => "x-li-signature",
        Provider::Tiktok => "tiktok-signature",
        Provider::Pinterest => "x-pinterest-signature",
    }
}

pub struct ProviderWebhook {
    provider: Provider,
    secret: Option<SecretString>,
    verify_token: Option<SecretString>,
}

impl ProviderWebhook {
    pub fn new(
        provider: Provider,
        secret: Option<SecretString>,
        verify_token: Option<SecretString>,
    ) -> Self {
        Self {
            provider,
            secret,
            verify_token,
        }
    }

    fn secret(&self) -> Result<&[u8], WebhookError> {
        self.secret
            .as_ref()
            .map(|s| s.expose_secret().as_bytes())
            .ok_or_else(|| WebhookError::MissingSecret(self.provider.to_string()))
    }
}

fn param<'a>(query: &'a HashMap<String, String>, name: &str) -> Result<&'a str, WebhookError> {
    query
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| WebhookError::HandshakeRejected(format!("missing {}", name)))
}

/// Split `t=<ts>,s=<sig>` into its parts
fn parse_tiktok_signature(raw: &str) -> Option<(&str, &str)> {
    let mut timestamp = None;
    let mut signature = None;
    for part in raw.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = Some(v),
            Some(("s", v)) => signature = Some(v),
            _ => {}
        }
    }
    Some((timestamp?, signature?))
}

impl WebhookHandler for ProviderWebhook {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn handshake(
        &self,
        query: &HashMap<String, String>,
    ) -> Result<HandshakeResponse, WebhookError> {
        match self.provider {
            Provider::Facebook | Provider::Instagram => {
                let mode = param(query, "hub.mode")?;
                let token = param(query, "hub.verify_token")?;
                let challenge = param(query, "hub.challenge")?;

                if mode != "subscribe" {
                    return Err(WebhookError::HandshakeRejected(format!(
                        "unexpected hub.mode {}",
                        mode
                    )));
                }
                let expected = self.verify_token.as_ref().ok_or_else(|| {
                    WebhookError::HandshakeRejected("no verify token configured".to_string())
                })?;
                if !constant_time_eq(expected.expose_secret().as_bytes(), token.as_bytes()) {
                    return Err(WebhookError::HandshakeRejected(
                        "verify token mismatch".to_string(),
                    ));
                }
                Ok(HandshakeResponse::Text(challenge.to_string()))
            }
            Provider::Youtube => {
                let challenge = param(query, "hub.challenge")?;
                if let Some(mode) = query.get("hub.mode") {
                    if mode != "subscribe" && mode != "unsubscribe" {
                        return Err(WebhookError::HandshakeRejected(format!(
                            "unexpected hub.mode {}",
                            mode
                        )));
                    }
                }
                Ok(HandshakeResponse::Text(challenge.to_string()))
            }
            Provider::Twitter => {
                let crc = param(query, "crc_token")?;
                let secret = self.secret()?;
                let token = sign(Algorithm::Sha256, Encoding::Base64, secret, crc.as_bytes());
                Ok(HandshakeResponse::Json(
                    json!({ "response_token": format!("sha256={}", token) }),
                ))
            }
            Provider::Linkedin => {
                let code = param(query, "challengeCode")?;
                let secret = self.secret()?;
                Ok(HandshakeResponse::Json(json!({
                    "challengeCode": code,
                    "challengeResponse": sign(Algorithm::Sha256, Encoding::Hex, secret, code.as_bytes()),
                })))
            }
            Provider::Tiktok | Provider::Pinterest => Err(WebhookError::NoHandler(format!(
                "{} handshake",
                self.provider
            ))),
        }
    }

    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<String, WebhookError> {
        let secret = self.secret()?;
        let header = signature_header(self.provider);
        let raw = headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| WebhookError::MissingSignature(header.to_string()))?;

        let valid = match self.provider {
            Provider::Facebook | Provider::Instagram => raw
                .strip_prefix("sha256=")
                .is_some_and(|sig| verify(Algorithm::Sha256, Encoding::Hex, secret, body, sig)),
            Provider::Youtube => raw
                .strip_prefix("sha1=")
                .is_some_and(|sig| verify(Algorithm::Sha1, Encoding::Hex, secret, body, sig)),
            Provider::Twitter => raw
                .strip_prefix("sha256=")
                .is_some_and(|sig| verify(Algorithm::Sha256, Encoding::Base64, secret, body, sig)),
            Provider::Linkedin => {
                let sig = raw.strip_prefix("hmacsha256=").unwrap_or(raw);
                verify(Algorithm::Sha256, Encoding::Hex, secret, body, sig)
            }
            Provider::Tiktok => match parse_tiktok_signature(raw) {
                Some((timestamp, sig)) => {
                    let mut signed = Vec::with_capacity(timestamp.len() + 1 + body.len());
                    signed.extend_from_slice(timestamp.as_bytes());
                    signed.push(b'.');
                    signed.extend_from_slice(body);
                    verify(Algorithm::Sha256, Encoding::Hex, secret, &signed, sig)
                }
                None => false,
            },
            Provider::Pinterest => verify(Algorithm::Sha256, Encoding::Base64, secret, body, raw),
        };

        if valid {
            Ok(raw.to_string())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }

    fn normalize(&self, body: &[u8]) -> Result<NormalizedEvent, WebhookError> {
        if self.provider == Provider::Youtube {
            return classify_youtube(body);
        }

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        let (event_type, external_id) = match self.provider {
            Provider::Facebook | Provider::Instagram => classify_meta(&payload),
            Provider::Twitter => classify_twitter(&payload),
            Provider::Linkedin => classify_linkedin(&payload),
            Provider::Tiktok => classify_tiktok(&payload),
            Provider::Pinterest => classify_pinterest(&payload),
            Provider::Youtube => (WebhookEventType::Other, None),
        };

        let post_ref = explicit_post_id(&payload)
            .map(PostRef::PostId)
            .or_else(|| external_id.map(PostRef::ExternalId));

        Ok(NormalizedEvent {
            event_type,
            payload,
            post_ref,
        })
    }
}

fn str_at(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Our post id, when the provider echoes back metadata we attached
fn explicit_post_id(payload: &Value) -> Option<String> {
    str_at(payload, "/post_id").or_else(|| str_at(payload, "/metadata/post_id"))
}

fn classify_meta(payload: &Value) -> (WebhookEventType, Option<String>) {
    let field = str_at(payload, "/entry/0/changes/0/field").unwrap_or_default();
    let verb = str_at(payload, "/entry/0/changes/0/value/verb").unwrap_or_default();
    let status = str_at(payload, "/entry/0/changes/0/value/status")
        .unwrap_or_default()
        .to_uppercase();

    match field.as_str() {
        "feed" if verb == "add" => (
            WebhookEventType::PostPublished,
            str_at(payload, "/entry/0/changes/0/value/post_id"),
        ),
        "media" => {
            let media_id = str_at(payload, "/entry/0/changes/0/value/media_id");
            match status.as_str() {
                "FINISHED" | "PUBLISHED" => (WebhookEventType::MediaProcessed, media_id),
                "ERROR" | "EXPIRED" => (WebhookEventType::MediaFailed, media_id),
                _ => (WebhookEventType::Other, None),
            }
        }
        "permissions" if verb == "revoke" || verb == "revoked" => {
            (WebhookEventType::TokenRevoked, None)
        }
        "deauthorize" => (WebhookEventType::AccountDeauthorized, None),
        _ => (WebhookEventType::Other, None),
    }
}

fn classify_twitter(payload: &Value) -> (WebhookEventType, Option<String>) {
    if let Some(events) = payload.get("tweet_create_events").and_then(Value::as_array) {
        if !events.is_empty() {
            return (
                WebhookEventType::PostPublished,
                str_at(payload, "/tweet_create_events/0/id_str"),
            );
        }
    }
    if payload.pointer("/user_event/revoke").is_some() {
        return (WebhookEventType::TokenRevoked, None);
    }
    (WebhookEventType::Other, None)
}

fn classify_linkedin(payload: &Value) -> (WebhookEventType, Option<String>) {
    let kind = str_at(payload, "/type").unwrap_or_default().to_uppercase();
    let entity = str_at(payload, "/entity").or_else(|| str_at(payload, "/shareUrn"));
    match kind.as_str() {
        "SHARE_CREATED" | "POST_CREATED" => (WebhookEventType::PostPublished, entity),
        "SHARE_FAILED" | "POST_FAILED" => (WebhookEventType::PostFailed, entity),
        "MEMBER_TOKEN_REVOKED" | "APP_REVOKED" => (WebhookEventType::TokenRevoked, None),
        "ACCESS_TOKEN_EXPIRED" => (WebhookEventType::TokenExpired, None),
        _ => (WebhookEventType::Other, None),
    }
}

fn classify_tiktok(payload: &Value) -> (WebhookEventType, Option<String>) {
    let event = str_at(payload, "/event").unwrap_or_default();

    // `content` is a JSON document encoded as a string
    let content: Option<Value> = match payload.get("content") {
        Some(Value::String(s)) => serde_json::from_str(s).ok(),
        Some(v @ Value::Object(_)) => Some(v.clone()),
        _ => None,
    };
    let publish_id = content.as_ref().and_then(|c| str_at(c, "/publish_id"));

    match event.as_str() {
        "post.publish.complete" | "post.publish.publicly_available" => {
            (WebhookEventType::PostPublished, publish_id)
        }
        "post.publish.failed" => (WebhookEventType::PostFailed, publish_id),
        "post.publish.inbox_delivered" => (WebhookEventType::MediaProcessed, publish_id),
        "authorization.removed" => (WebhookEventType::AccountDeauthorized, None),
        _ => (WebhookEventType::Other, None),
    }
}

fn classify_pinterest(payload: &Value) -> (WebhookEventType, Option<String>) {
    let kind = str_at(payload, "/event_type")
        .unwrap_or_default()
        .to_lowercase()
        .replace('_', ".");
    match kind.as_str() {
        "pin.created" => (WebhookEventType::PostPublished, str_at(payload, "/pin_id")),
        "media.upload.succeeded" => (WebhookEventType::MediaProcessed, str_at(payload, "/media_id")),
        "media.upload.failed" => (WebhookEventType::MediaFailed, str_at(payload, "/media_id")),
        "token.revoked" | "user.token.revoked" => (WebhookEventType::TokenRevoked, None),
        "user.deauthorized" => (WebhookEventType::AccountDeauthorized, None),
        _ => (WebhookEventType::Other, None),
    }
}

/// What a WebSub notification carries once the Atom markup is read
#[derive(Debug, Default, PartialEq)]
struct AtomNotification {
    deleted: bool,
    video_id: Option<String>,
}

fn read_atom(feed: &str) -> Result<AtomNotification, WebhookError> {
    let mut reader = Reader::from_str(feed);
    reader.config_mut().trim_text(true);

    let mut notification = AtomNotification::default();
    let mut in_video_id = false;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(tag)) => match tag.name().as_ref() {
                b"at:deleted-entry" => notification.deleted = true,
                b"yt:videoId" => in_video_id = true,
                _ => {}
            },
            Ok(XmlEvent::Empty(tag)) => {
                if tag.name().as_ref() == b"at:deleted-entry" {
                    notification.deleted = true;
                }
            }
            Ok(XmlEvent::Text(text)) if in_video_id => {
                let id = text
                    .unescape()
                    .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
                if !id.is_empty() && notification.video_id.is_none() {
                    notification.video_id = Some(id.into_owned());
                }
            }
            Ok(XmlEvent::End(tag)) => {
                if tag.name().as_ref() == b"yt:videoId" {
                    in_video_id = false;
                }
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(WebhookError::MalformedPayload(e.to_string())),
        }
    }

    Ok(notification)
}

/// YouTube pushes Atom XML; a new entry means a video went live
fn classify_youtube(body: &[u8]) -> Result<NormalizedEvent, WebhookError> {
    let feed = std::str::from_utf8(body)
        .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
    let notification = read_atom(feed)?;

    let event = match notification.video_id {
        Some(video_id) if !notification.deleted => NormalizedEvent {
            event_type: WebhookEventType::PostPublished,
            payload: json!({ "feed": feed, "video_id": video_id }),
            post_ref: Some(PostRef::ExternalId(video_id)),
        },
        _ => NormalizedEvent {
            event_type: WebhookEventType::Other,
            payload: json!({ "feed": feed }),
            post_ref: None,
        },
    };
    Ok(event)
}
