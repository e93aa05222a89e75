//! Transport layer - the backend collaborator contract and its adapters
//!
//! [`Backend`] is everything the messaging layer needs from the hosted
//! service: row CRUD for messages, conversations, reactions, presence and
//! typing flags, file upload, and a change feed per [`Topic`].

mod memory;
mod realtime;
mod rest;

pub use memory::MemoryBackend;
pub use realtime::RealtimeClient;
pub use rest::RestBackend;

use crate::error::Result;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

pub const MESSAGES_TABLE: &str = "messages";
pub const CONVERSATIONS_TABLE: &str = "conversations";
pub const REACTIONS_TABLE: &str = "message_reactions";
pub const PRESENCE_TABLE: &str = "user_presence";
pub const TYPING_TABLE: &str = "typing_indicators";

pub const VOICE_BUCKET: &str = "voice-messages";
pub const IMAGE_BUCKET: &str = "message-images";

#[async_trait]
pub trait Backend: Send + Sync {
    /// Messages of one conversation, oldest first.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    async fn insert_message(&self, message: &NewMessage) -> Result<Message>;

    async fn update_message(&self, message_id: &str, patch: &MessagePatch) -> Result<Message>;

    /// Flags every unread message of the conversation not sent by `reader_id` as read.
    async fn mark_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Conversations the user takes part in, most recent activity first.
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>>;

    async fn touch_conversation(&self, conversation_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn list_reactions(&self, message_id: &str) -> Result<Vec<Reaction>>;

    async fn add_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<Reaction>;

    async fn remove_reaction(&self, reaction_id: &str) -> Result<()>;

    async fn fetch_presence(&self, user_id: &str) -> Result<Option<Presence>>;

    async fn upsert_presence(&self, presence: &Presence) -> Result<()>;

    async fn upsert_typing(&self, signal: &TypingSignal) -> Result<()>;

    /// Stores a file and returns its public URL.
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>, mime_type: &str)
        -> Result<String>;

    async fn subscribe(&self, topic: Topic) -> Result<Subscription>;
}

/// Live change feed for one topic.
///
/// Dropping the handle (or calling [`Subscription::stop`]) unsubscribes.
/// Events already queued may still be read after that, so consumers keep
/// their own "still current" guard.
pub struct Subscription {
    topic: Topic,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    on_stop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        topic: Topic,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        on_stop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic,
            events,
            on_stop: Some(Box::new(on_stop)),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next change, or `None` once the feed has closed.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn stop(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(on_stop) = self.on_stop.take() {
            tracing::debug!("Unsubscribing from {}", self.topic.channel_name());
            on_stop();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.on_stop.is_some())
            .finish()
    }
}
