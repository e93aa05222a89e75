//! Data models for Rentroom messaging

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Prefix of client-generated ids for messages the backend has not confirmed yet.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Content written over a message deleted for everyone.
pub const TOMBSTONE_CONTENT: &str = "This message was deleted";

/// Content of a voice message row; the audio itself lives at `voice_url`.
pub const VOICE_CONTENT: &str = "🎤 Voice message";

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Voice,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub voice_duration: Option<u32>,
    #[serde(default)]
    pub voice_url: Option<String>,
    /// Quoted message shown above the bubble. Attached locally, never stored.
    #[serde(default, skip_serializing)]
    pub reply_to: Option<ReplyPreview>,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        is_temp_id(&self.id)
    }

    pub fn is_deleted(&self) -> bool {
        self.message_type == MessageKind::Deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub id: String,
    pub sender_id: String,
    pub content: String,
}

impl From<&Message> for ReplyPreview {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            sender_id: msg.sender_id.clone(),
            content: msg.content.clone(),
        }
    }
}

/// Insert payload for the messages table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    pub message_type: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_duration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_url: Option<String>,
}

impl NewMessage {
    pub fn text(conversation_id: &str, sender_id: &str, content: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }
}

/// Partial update of a message row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub message_type: Option<MessageKind>,
    pub clear_voice: bool,
}

impl MessagePatch {
    pub fn tombstone() -> Self {
        Self {
            content: Some(TOMBSTONE_CONTENT.to_string()),
            message_type: Some(MessageKind::Deleted),
            clear_voice: true,
        }
    }

    pub fn apply(&self, msg: &mut Message) {
        if let Some(ref content) = self.content {
            msg.content = content.clone();
        }
        if let Some(kind) = self.message_type {
            msg.message_type = kind;
        }
        if self.clear_voice {
            msg.voice_url = None;
            msg.voice_duration = None;
        }
    }

    /// Row body for a PATCH request. Cleared voice fields are sent as explicit nulls.
    pub fn to_row(&self) -> Value {
        let mut row = Map::new();
        if let Some(ref content) = self.content {
            row.insert("content".into(), json!(content));
        }
        if let Some(kind) = self.message_type {
            row.insert("message_type".into(), json!(kind));
        }
        if self.clear_voice {
            row.insert("voice_url".into(), Value::Null);
            row.insert("voice_duration".into(), Value::Null);
        }
        Value::Object(row)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Read,
}

/// One displayed timeline entry.
///
/// A `Pending` entry carries a message whose id is a client temp id. Only the
/// timeline reducer may turn a `Pending` into a `Confirmed`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEntry {
    Pending(Message),
    Confirmed(Message),
}

impl ChatEntry {
    pub fn message(&self) -> &Message {
        match self {
            ChatEntry::Pending(m) | ChatEntry::Confirmed(m) => m,
        }
    }

    pub fn id(&self) -> &str {
        &self.message().id
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ChatEntry::Pending(_))
    }

    pub fn status(&self) -> MessageStatus {
        match self {
            ChatEntry::Pending(_) => MessageStatus::Pending,
            ChatEntry::Confirmed(m) if m.read => MessageStatus::Read,
            ChatEntry::Confirmed(_) => MessageStatus::Sent,
        }
    }
}

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub renter_id: String,
    pub landlord_id: String,
    #[serde(default)]
    pub listing_ref: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn involves(&self, user_id: &str) -> bool {
        self.renter_id == user_id || self.landlord_id == user_id
    }

    /// The other participant as seen by `user_id`.
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.renter_id == user_id {
            &self.landlord_id
        } else {
            &self.renter_id
        }
    }
}

// ============================================================================
// Reactions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
}

impl Reaction {
    pub fn matches(&self, message_id: &str, user_id: &str, emoji: &str) -> bool {
        self.message_id == message_id && self.user_id == user_id && self.emoji == emoji
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_reacted: bool,
}

// ============================================================================
// Presence & typing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub conversation_id: String,
    pub user_id: String,
    pub is_typing: bool,
}

// ============================================================================
// Realtime
// ============================================================================

/// Change-feed channel a client can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Message inserts/updates, reaction changes and typing signals of one conversation.
    Conversation(String),
    /// Presence row changes of one user.
    Presence(String),
}

impl Topic {
    pub fn channel_name(&self) -> String {
        match self {
            Topic::Conversation(id) => format!("conversation:{}", id),
            Topic::Presence(user_id) => format!("presence:{}", user_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    MessageInserted(Message),
    MessageUpdated(Message),
    ReactionsChanged { message_id: String },
    PresenceUpdated(Presence),
    Typing(TypingSignal),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "alice".to_string(),
            content: "hi".to_string(),
            created_at: Utc::now(),
            read: false,
            read_at: None,
            reply_to_id: None,
            message_type: MessageKind::Voice,
            voice_duration: Some(4),
            voice_url: Some("https://files/v.webm".to_string()),
            reply_to: None,
        }
    }

    #[test]
    fn test_tombstone_clears_voice_payload() {
        let mut msg = message("m1");
        MessagePatch::tombstone().apply(&mut msg);

        assert_eq!(msg.content, TOMBSTONE_CONTENT);
        assert!(msg.is_deleted());
        assert!(msg.voice_url.is_none());
        assert!(msg.voice_duration.is_none());
    }

    #[test]
    fn test_patch_row_sends_explicit_nulls() {
        let row = MessagePatch::tombstone().to_row();
        assert_eq!(row["message_type"], "deleted");
        assert!(row["voice_url"].is_null());
        assert!(row.get("read").is_none());
    }

    #[test]
    fn test_entry_status() {
        assert_eq!(ChatEntry::Pending(message("temp-1")).status(), MessageStatus::Pending);

        let mut read = message("m1");
        read.read = true;
        assert_eq!(ChatEntry::Confirmed(read).status(), MessageStatus::Read);
        assert_eq!(ChatEntry::Confirmed(message("m2")).status(), MessageStatus::Sent);
    }

    #[test]
    fn test_message_row_ignores_missing_optionals() {
        let row = json!({
            "id": "m-42",
            "conversation_id": "c1",
            "sender_id": "bob",
            "content": "Hello",
            "created_at": "2024-05-01T10:00:00Z"
        });
        let msg: Message = serde_json::from_value(row).unwrap();
        assert_eq!(msg.message_type, MessageKind::Text);
        assert!(!msg.read);
        assert!(!msg.is_pending());
    }

    #[test]
    fn test_conversation_peer() {
        let conv = Conversation {
            id: "c1".to_string(),
            renter_id: "rita".to_string(),
            landlord_id: "lars".to_string(),
            listing_ref: None,
            last_message_at: None,
        };
        assert_eq!(conv.peer_of("rita"), "lars");
        assert_eq!(conv.peer_of("lars"), "rita");
        assert!(!conv.involves("mallory"));
    }
}
