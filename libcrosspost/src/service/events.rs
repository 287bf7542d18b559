//! Publish tracking events
//!
//! An in-process broadcast bus that the worker and webhook ingestion emit to.
//! Emitting never blocks: with no subscribers the event is dropped, and a
//! lagging subscriber loses the oldest events first.
//!
//! `PublishFailed` is the terminal tracking event for a post and is emitted
//! exactly once, when the last retry is exhausted.
//!
//! # Example
//!
//! ```no_run
//! use libcrosspost::service::events::{Event, EventBus};
//!
//! # async fn example() {
//! let bus = EventBus::new(100);
//! let mut receiver = bus.subscribe();
//!
//! bus.emit(Event::PublishStarted {
//!     post_id: "abc123".to_string(),
//!     attempt: 1,
//!     providers: vec!["twitter".to_string()],
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("{}", serde_json::to_string(&event).unwrap());
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before lagging kicks in
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A worker picked up the post's job
    PublishStarted {
        post_id: String,
        attempt: u32,
        providers: Vec<String>,
    },

    /// Every requested platform accepted the post
    PublishSucceeded {
        post_id: String,
        external_id: Option<String>,
        external_url: Option<String>,
    },

    /// An attempt failed and another is scheduled
    PublishRetrying {
        post_id: String,
        attempt: u32,
        retry_at_ms: i64,
        error: String,
    },

    /// Retries exhausted; the post is now `failed`
    PublishFailed {
        post_id: String,
        attempts: u32,
        error: String,
    },

    /// A verified webhook was stored
    WebhookReceived {
        platform: String,
        event_type: String,
        post_id: Option<String>,
    },
}

impl Event {
    pub fn post_id(&self) -> Option<&str> {
        match self {
            Event::PublishStarted { post_id, .. }
            | Event::PublishSucceeded { post_id, .. }
            | Event::PublishRetrying { post_id, .. }
            | Event::PublishFailed { post_id, .. } => Some(post_id),
            Event::WebhookReceived { post_id, .. } => post_id.as_deref(),
        }
    }
}
