//! Message store accessor
//!
//! Thin pass-through to the [`Backend`] that turns chat actions into row
//! operations. Reads degrade to empty results; writes return their error to
//! the caller, which owns any retry or rollback.

use crate::error::{Error, Result};
use crate::models::*;
use crate::network::{Backend, IMAGE_BUCKET, VOICE_BUCKET};
use chrono::Utc;
use std::sync::Arc;

#[derive(Clone)]
pub struct MessageStore {
    backend: Arc<dyn Backend>,
}

impl MessageStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Messages oldest first, with reply previews resolved from the same list.
    pub async fn list_messages(&self, conversation_id: &str) -> Vec<Message> {
        match self.try_list_messages(conversation_id).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!("Failed to load messages for {}: {}", conversation_id, e);
                Vec::new()
            }
        }
    }

    /// Like [`MessageStore::list_messages`] but lets the caller tell an empty
    /// conversation from a failed read.
    pub async fn try_list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let mut messages = self.backend.list_messages(conversation_id).await?;
        messages.sort_by_key(|m| m.created_at);
        attach_reply_previews(&mut messages);
        Ok(messages)
    }

    pub async fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<Message> {
        self.insert(NewMessage::text(conversation_id, sender_id, content))
            .await
    }

    pub async fn create_reply_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        reply_to: &Message,
    ) -> Result<Message> {
        let new = NewMessage {
            reply_to_id: Some(reply_to.id.clone()),
            ..NewMessage::text(conversation_id, sender_id, content)
        };
        let mut msg = self.insert(new).await?;
        msg.reply_to = Some(ReplyPreview::from(reply_to));
        Ok(msg)
    }

    pub async fn create_voice_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        blob: Vec<u8>,
        duration_secs: u32,
    ) -> Result<Message> {
        if blob.is_empty() {
            return Err(Error::validation("voice message", "recording is empty"));
        }
        let path = format!(
            "{}/{}-{}.webm",
            conversation_id,
            sender_id,
            Utc::now().timestamp_millis()
        );
        let url = self
            .backend
            .upload(VOICE_BUCKET, &path, blob, "audio/webm")
            .await?;

        self.insert(NewMessage {
            message_type: MessageKind::Voice,
            voice_duration: Some(duration_secs),
            voice_url: Some(url),
            ..NewMessage::text(conversation_id, sender_id, VOICE_CONTENT)
        })
        .await
    }

    pub async fn create_image_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<Message> {
        let extension = match mime_type {
            "image/png" => "png",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "jpg",
        };
        let path = format!(
            "{}/{}-{}.{}",
            conversation_id,
            sender_id,
            Utc::now().timestamp_millis(),
            extension
        );
        let url = self
            .backend
            .upload(IMAGE_BUCKET, &path, bytes, mime_type)
            .await?;

        self.insert(NewMessage {
            message_type: MessageKind::Image,
            ..NewMessage::text(conversation_id, sender_id, &url)
        })
        .await
    }

    async fn insert(&self, new: NewMessage) -> Result<Message> {
        let msg = self.backend.insert_message(&new).await?;

        // The conversation list orders by this column; a stale value only misorders it.
        if let Err(e) = self
            .backend
            .touch_conversation(&msg.conversation_id, msg.created_at)
            .await
        {
            tracing::warn!("Failed to bump conversation {}: {}", msg.conversation_id, e);
        }
        Ok(msg)
    }

    pub async fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<()> {
        self.backend
            .mark_read(conversation_id, reader_id, Utc::now())
            .await
    }

    /// Replaces the message for both participants with a tombstone.
    pub async fn delete_for_everyone(&self, message: &Message, user_id: &str) -> Result<Message> {
        if message.sender_id != user_id {
            return Err(Error::Forbidden(format!(
                "only the sender can delete message {}",
                message.id
            )));
        }
        if message.is_pending() {
            return Err(Error::validation("message", "not yet delivered"));
        }
        self.backend
            .update_message(&message.id, &MessagePatch::tombstone())
            .await
    }

    pub async fn list_conversations(&self, user_id: &str) -> Vec<Conversation> {
        match self.backend.list_conversations(user_id).await {
            Ok(conversations) => conversations,
            Err(e) => {
                tracing::warn!("Failed to load conversations for {}: {}", user_id, e);
                Vec::new()
            }
        }
    }

    pub async fn list_reactions(&self, message_id: &str) -> Vec<Reaction> {
        match self.backend.list_reactions(message_id).await {
            Ok(reactions) => reactions,
            Err(e) => {
                tracing::warn!("Failed to load reactions for {}: {}", message_id, e);
                Vec::new()
            }
        }
    }
}

fn attach_reply_previews(messages: &mut [Message]) {
    let previews: Vec<Option<ReplyPreview>> = messages
        .iter()
        .map(|m| {
            m.reply_to_id.as_ref().and_then(|target| {
                messages
                    .iter()
                    .find(|candidate| &candidate.id == target)
                    .map(ReplyPreview::from)
            })
        })
        .collect();

    for (msg, preview) in messages.iter_mut().zip(previews) {
        if preview.is_some() {
            msg.reply_to = preview;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryBackend;

    fn store() -> (MemoryBackend, MessageStore) {
        let backend = MemoryBackend::new();
        backend.add_conversation(Conversation {
            id: "c1".to_string(),
            renter_id: "rita".to_string(),
            landlord_id: "lars".to_string(),
            listing_ref: Some("room-12".to_string()),
            last_message_at: None,
        });
        let store = MessageStore::new(Arc::new(backend.clone()));
        (backend, store)
    }

    #[tokio::test]
    async fn test_failed_read_degrades_to_empty() {
        let (backend, store) = store();
        store.create_message("c1", "rita", "Hi").await.unwrap();

        backend.set_offline(true);
        assert!(store.list_messages("c1").await.is_empty());
        assert!(store.list_conversations("rita").await.is_empty());
    }

    #[tokio::test]
    async fn test_create_bumps_conversation() {
        let (backend, store) = store();
        let msg = store.create_message("c1", "rita", "Hi").await.unwrap();

        let conv = backend.conversation("c1").unwrap();
        assert_eq!(conv.last_message_at, Some(msg.created_at));
    }

    #[tokio::test]
    async fn test_reply_preview_survives_reload() {
        let (_, store) = store();
        let original = store.create_message("c1", "lars", "Is it furnished?").await.unwrap();
        let reply = store
            .create_reply_message("c1", "rita", "Yes", &original)
            .await
            .unwrap();
        assert_eq!(reply.reply_to.as_ref().map(|p| p.id.as_str()), Some(original.id.as_str()));

        let loaded = store.list_messages("c1").await;
        assert_eq!(loaded[1].reply_to.as_ref().unwrap().content, "Is it furnished?");
    }

    #[tokio::test]
    async fn test_delete_for_everyone_requires_sender() {
        let (_, store) = store();
        let msg = store.create_message("c1", "lars", "Deposit is 500").await.unwrap();

        let err = store.delete_for_everyone(&msg, "rita").await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let deleted = store.delete_for_everyone(&msg, "lars").await.unwrap();
        assert_eq!(deleted.content, TOMBSTONE_CONTENT);
        assert_eq!(deleted.message_type, MessageKind::Deleted);
    }

    #[tokio::test]
    async fn test_voice_message_uploads_and_links() {
        let (_, store) = store();
        let msg = store
            .create_voice_message("c1", "rita", vec![1, 2, 3], 7)
            .await
            .unwrap();

        assert_eq!(msg.message_type, MessageKind::Voice);
        assert_eq!(msg.content, VOICE_CONTENT);
        assert_eq!(msg.voice_duration, Some(7));
        assert!(msg.voice_url.unwrap().starts_with("memory://voice-messages/c1/"));

        let err = store
            .create_voice_message("c1", "rita", Vec::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
