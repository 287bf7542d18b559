//! Core types for Crosspost

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CrosspostError;

/// Third-party platforms a post can be delivered to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Instagram,
    Tiktok,
    Twitter,
    Linkedin,
    Pinterest,
    Youtube,
    Facebook,
}

impl Provider {
    pub const ALL: [Provider; 7] = [
        Provider::Instagram,
        Provider::Tiktok,
        Provider::Twitter,
        Provider::Linkedin,
        Provider::Pinterest,
        Provider::Youtube,
        Provider::Facebook,
    ];

    /// Lowercase identifier used in storage, URLs and config
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Instagram => "instagram",
            Provider::Tiktok => "tiktok",
            Provider::Twitter => "twitter",
            Provider::Linkedin => "linkedin",
            Provider::Pinterest => "pinterest",
            Provider::Youtube => "youtube",
            Provider::Facebook => "facebook",
        }
    }

    /// Human-facing name used in preflight messages
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Instagram => "Instagram",
            Provider::Tiktok => "TikTok",
            Provider::Twitter => "Twitter",
            Provider::Linkedin => "LinkedIn",
            Provider::Pinterest => "Pinterest",
            Provider::Youtube => "YouTube",
            Provider::Facebook => "Facebook",
        }
    }

    /// Caption length limit shown in post details. Not enforced here.
    pub fn character_limit(&self) -> usize {
        match self {
            Provider::Instagram => 2200,
            Provider::Tiktok => 2200,
            Provider::Twitter => 280,
            Provider::Linkedin => 3000,
            Provider::Pinterest => 500,
            Provider::Youtube => 5000,
            Provider::Facebook => 63206,
        }
    }

    /// Whether a publish target must name a board
    pub fn requires_board(&self) -> bool {
        matches!(self, Provider::Pinterest)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = CrosspostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Provider::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| CrosspostError::InvalidInput(format!("Unknown provider: {}", s)))
    }
}

/// Lifecycle state of a post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Draft,
    ScheduledPending,
    Scheduled,
    Queued,
    Publishing,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::ScheduledPending => "scheduled_pending",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Queued => "queued",
            PostStatus::Publishing => "publishing",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    /// States that have passed preflight and therefore carry no issue list
    pub fn is_cleared(&self) -> bool {
        matches!(
            self,
            PostStatus::Scheduled
                | PostStatus::Queued
                | PostStatus::Publishing
                | PostStatus::Published
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PostStatus::Published | PostStatus::Failed)
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = CrosspostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "scheduled_pending" => Ok(PostStatus::ScheduledPending),
            "scheduled" => Ok(PostStatus::Scheduled),
            "queued" => Ok(PostStatus::Queued),
            "publishing" => Ok(PostStatus::Publishing),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            other => Err(CrosspostError::InvalidInput(format!(
                "Unknown post status: {}",
                other
            ))),
        }
    }
}

/// One requested destination for a post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformTarget {
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_id: Option<String>,
}

impl PlatformTarget {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            board_id: None,
        }
    }

    pub fn with_board(provider: Provider, board_id: impl Into<String>) -> Self {
        Self {
            provider,
            board_id: Some(board_id.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

/// Reference to media held in the external blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub url: String,
}

/// Authoring options carried through untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Readiness of one requested platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightResult {
    pub provider: Provider,
    pub connected: bool,
    pub issues: Vec<String>,
}

impl PreflightResult {
    pub fn is_ready(&self) -> bool {
        self.connected && self.issues.is_empty()
    }
}

/// A schedulable unit of content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub owner_id: String,
    pub caption: String,
    pub media: Option<MediaRef>,
    pub scheduled_at: Option<i64>,
    pub status: PostStatus,
    pub platforms: Vec<PlatformTarget>,
    pub preflight_issues: Option<Vec<PreflightResult>>,
    pub job_id: Option<String>,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub options: PostOptions,
    /// Optimistic-concurrency counter, bumped by every persisted update
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Post {
    /// A fresh draft with no scheduling or job state
    pub fn new_draft(owner_id: impl Into<String>, caption: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            caption: caption.into(),
            media: None,
            scheduled_at: None,
            status: PostStatus::Draft,
            platforms: Vec::new(),
            preflight_issues: Some(Vec::new()),
            job_id: None,
            external_id: None,
            external_url: None,
            options: PostOptions::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `status`, keeping the issue list consistent with it.
    ///
    /// Cleared states drop the issue list; every other state keeps whatever
    /// list it had, or an empty one.
    pub fn set_status(&mut self, status: PostStatus) {
        self.status = status;
        if status.is_cleared() {
            self.preflight_issues = None;
        } else if self.preflight_issues.is_none() {
            self.preflight_issues = Some(Vec::new());
        }
    }

    /// Record a preflight run. Returns true when every platform is ready.
    pub fn apply_preflight(&mut self, results: Vec<PreflightResult>) -> bool {
        let blocking: Vec<PreflightResult> =
            results.into_iter().filter(|r| !r.is_ready()).collect();

        if blocking.is_empty() {
            self.set_status(PostStatus::Scheduled);
            true
        } else {
            self.status = PostStatus::ScheduledPending;
            self.preflight_issues = Some(blocking);
            false
        }
    }

    /// Caption length in characters, as the platforms count it
    pub fn caption_length(&self) -> usize {
        self.caption.chars().count()
    }
}

/// A stored OAuth connection. Token fields hold vault-sealed strings.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub owner_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            _ => LogLevel::Info,
        }
    }
}

/// Append-only timeline entry for a post
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLog {
    pub id: Option<i64>,
    pub post_id: String,
    pub level: LogLevel,
    pub message: String,
    pub raw: Option<serde_json::Value>,
    pub created_at: i64,
}

impl JobLog {
    pub fn new(post_id: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: None,
            post_id: post_id.to_string(),
            level,
            message: message.into(),
            raw: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

/// Successful delivery of a post to one platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRecord {
    pub id: Option<i64>,
    pub post_id: String,
    pub provider: Provider,
    pub external_id: String,
    pub external_url: Option<String>,
    pub published_at: i64,
}

/// Normalized classification of an inbound provider event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "post.published")]
    PostPublished,
    #[serde(rename = "post.failed")]
    PostFailed,
    #[serde(rename = "token.revoked")]
    TokenRevoked,
    #[serde(rename = "token.expired")]
    TokenExpired,
    #[serde(rename = "account.deauthorized")]
    AccountDeauthorized,
    #[serde(rename = "media.processed")]
    MediaProcessed,
    #[serde(rename = "media.failed")]
    MediaFailed,
    #[serde(rename = "other")]
    Other,
}

impl WebhookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventType::PostPublished => "post.published",
            WebhookEventType::PostFailed => "post.failed",
            WebhookEventType::TokenRevoked => "token.revoked",
            WebhookEventType::TokenExpired => "token.expired",
            WebhookEventType::AccountDeauthorized => "account.deauthorized",
            WebhookEventType::MediaProcessed => "media.processed",
            WebhookEventType::MediaFailed => "media.failed",
            WebhookEventType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "post.published" => WebhookEventType::PostPublished,
            "post.failed" => WebhookEventType::PostFailed,
            "token.revoked" => WebhookEventType::TokenRevoked,
            "token.expired" => WebhookEventType::TokenExpired,
            "account.deauthorized" => WebhookEventType::AccountDeauthorized,
            "media.processed" => WebhookEventType::MediaProcessed,
            "media.failed" => WebhookEventType::MediaFailed,
            _ => WebhookEventType::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventStatus {
    Received,
    Processed,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Received => "received",
            WebhookEventStatus::Processed => "processed",
            WebhookEventStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processed" => WebhookEventStatus::Processed,
            "failed" => WebhookEventStatus::Failed,
            _ => WebhookEventStatus::Received,
        }
    }
}

/// A verified, classified inbound webhook delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Option<i64>,
    pub platform: Provider,
    pub event_type: WebhookEventType,
    pub payload: serde_json::Value,
    pub signature: Option<String>,
    pub status: WebhookEventStatus,
    pub post_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trip_through_str() {
        for provider in Provider::ALL {
            let parsed: Provider = provider.as_str().parse().unwrap();
            assert_eq!(parsed, provider);
        }
        assert_eq!("  Pinterest ".parse::<Provider>().unwrap(), Provider::Pinterest);
        assert!("myspace".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_character_limits() {
        assert_eq!(Provider::Instagram.character_limit(), 2200);
        assert_eq!(Provider::Tiktok.character_limit(), 2200);
        assert_eq!(Provider::Twitter.character_limit(), 280);
        assert_eq!(Provider::Linkedin.character_limit(), 3000);
        assert_eq!(Provider::Pinterest.character_limit(), 500);
        assert_eq!(Provider::Youtube.character_limit(), 5000);
        assert_eq!(Provider::Facebook.character_limit(), 63206);
    }

    #[test]
    fn test_only_pinterest_requires_board() {
        let requiring: Vec<Provider> = Provider::ALL
            .iter()
            .copied()
            .filter(|p| p.requires_board())
            .collect();
        assert_eq!(requiring, vec![Provider::Pinterest]);
    }

    #[test]
    fn test_post_status_serialization() {
        let json = serde_json::to_string(&PostStatus::ScheduledPending).unwrap();
        assert_eq!(json, r#""scheduled_pending""#);
        let parsed: PostStatus = serde_json::from_str(r#""publishing""#).unwrap();
        assert_eq!(parsed, PostStatus::Publishing);
        assert_eq!("failed".parse::<PostStatus>().unwrap(), PostStatus::Failed);
        assert!("pending".parse::<PostStatus>().is_err());
    }

    #[test]
    fn test_new_draft_respects_issue_invariant() {
        let post = Post::new_draft("owner-1", "Hello world");
        assert_eq!(post.status, PostStatus::Draft);
        assert_eq!(post.preflight_issues, Some(vec![]));
        assert!(post.job_id.is_none());
        assert!(post.scheduled_at.is_none());
    }

    #[test]
    fn test_set_status_keeps_issue_invariant_for_every_state() {
        let states = [
            PostStatus::Draft,
            PostStatus::ScheduledPending,
            PostStatus::Scheduled,
            PostStatus::Queued,
            PostStatus::Publishing,
            PostStatus::Published,
            PostStatus::Failed,
        ];
        for status in states {
            let mut post = Post::new_draft("owner", "caption");
            post.set_status(PostStatus::Scheduled);
            post.set_status(status);
            assert_eq!(
                post.preflight_issues.is_none(),
                status.is_cleared(),
                "invariant broken for {}",
                status
            );
        }
    }

    #[test]
    fn test_apply_preflight_keeps_only_blocking_entries() {
        let mut post = Post::new_draft("owner", "caption");
        let ready = post.apply_preflight(vec![
            PreflightResult {
                provider: Provider::Twitter,
                connected: true,
                issues: vec![],
            },
            PreflightResult {
                provider: Provider::Pinterest,
                connected: false,
                issues: vec!["No pinterest connection found".to_string()],
            },
        ]);

        assert!(!ready);
        assert_eq!(post.status, PostStatus::ScheduledPending);
        let issues = post.preflight_issues.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].provider, Provider::Pinterest);
    }

    #[test]
    fn test_apply_preflight_all_ready_clears_issues() {
        let mut post = Post::new_draft("owner", "caption");
        let ready = post.apply_preflight(vec![PreflightResult {
            provider: Provider::Linkedin,
            connected: true,
            issues: vec![],
        }]);
        assert!(ready);
        assert_eq!(post.status, PostStatus::Scheduled);
        assert!(post.preflight_issues.is_none());
    }

    #[test]
    fn test_platform_target_wire_format() {
        let target: PlatformTarget =
            serde_json::from_str(r#"{"provider":"pinterest","boardId":"123"}"#).unwrap();
        assert_eq!(target, PlatformTarget::with_board(Provider::Pinterest, "123"));

        let json = serde_json::to_string(&PlatformTarget::new(Provider::Twitter)).unwrap();
        assert_eq!(json, r#"{"provider":"twitter"}"#);
    }

    #[test]
    fn test_media_ref_uses_type_field() {
        let media: MediaRef =
            serde_json::from_str(r#"{"type":"video","url":"https://cdn.example/v.mp4"}"#).unwrap();
        assert_eq!(media.kind, MediaKind::Video);
    }

    #[test]
    fn test_webhook_event_type_names() {
        assert_eq!(
            serde_json::to_string(&WebhookEventType::AccountDeauthorized).unwrap(),
            r#""account.deauthorized""#
        );
        assert_eq!(
            WebhookEventType::parse("media.processed"),
            WebhookEventType::MediaProcessed
        );
        assert_eq!(WebhookEventType::parse("something"), WebhookEventType::Other);
    }

    #[test]
    fn test_caption_length_counts_characters() {
        let post = Post::new_draft("owner", "héllo 👋");
        assert_eq!(post.caption_length(), 7);
    }
}
