//! In-process backend
//!
//! Keeps every table in memory and feeds subscribers the same change events
//! the realtime socket would. Used for offline demos and for tests, where a
//! second participant is simulated by calling the [`Backend`] methods directly.

use super::{Backend, Subscription};
use crate::error::{Error, Result};
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct State {
    messages: Vec<Message>,
    conversations: Vec<Conversation>,
    reactions: Vec<Reaction>,
    presence: HashMap<String, Presence>,
    typing: HashMap<(String, String), TypingSignal>,
    files: HashMap<String, Vec<u8>>,
    subscribers: Vec<(u64, Topic, mpsc::UnboundedSender<ChangeEvent>)>,
    next_id: u64,
    offline: bool,
    response_delay: Option<Duration>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn publish(&mut self, topic: &Topic, event: ChangeEvent) {
        self.subscribers.retain(|(_, t, tx)| {
            if t != topic {
                return true;
            }
            tx.send(event.clone()).is_ok()
        });
    }

    fn publish_reaction_change(&mut self, message_id: &str) {
        let event = ChangeEvent::ReactionsChanged {
            message_id: message_id.to_string(),
        };
        self.subscribers.retain(|(_, t, tx)| {
            if !matches!(t, Topic::Conversation(_)) {
                return true;
            }
            tx.send(event.clone()).is_ok()
        });
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Delays write responses after their change event has been published,
    /// so subscribers see the push before the caller sees the response.
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        self.state.lock().response_delay = delay;
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        self.state.lock().conversations.push(conversation);
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.state
            .lock()
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned()
    }

    pub fn presence_of(&self, user_id: &str) -> Option<Presence> {
        self.state.lock().presence.get(user_id).cloned()
    }

    pub fn typing_of(&self, conversation_id: &str, user_id: &str) -> Option<bool> {
        self.state
            .lock()
            .typing
            .get(&(conversation_id.to_string(), user_id.to_string()))
            .map(|s| s.is_typing)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .subscribers
            .iter()
            .filter(|(_, _, tx)| !tx.is_closed())
            .count()
    }

    /// Ends every live feed, the way a dropped socket would.
    pub fn drop_feeds(&self) {
        self.state.lock().subscribers.clear();
    }

    fn online(&self) -> Result<()> {
        if self.state.lock().offline {
            return Err(Error::Network("backend unreachable".to_string()));
        }
        Ok(())
    }

    async fn respond<T>(&self, value: T) -> Result<T> {
        let delay = self.state.lock().response_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(value)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.online()?;
        let mut messages = self.messages(conversation_id);
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message> {
        self.online()?;
        let stored = {
            let mut state = self.state.lock();
            let stored = Message {
                id: state.next_id("m"),
                conversation_id: message.conversation_id.clone(),
                sender_id: message.sender_id.clone(),
                content: message.content.clone(),
                created_at: Utc::now(),
                read: false,
                read_at: None,
                reply_to_id: message.reply_to_id.clone(),
                message_type: message.message_type,
                voice_duration: message.voice_duration,
                voice_url: message.voice_url.clone(),
                reply_to: None,
            };
            state.messages.push(stored.clone());
            let topic = Topic::Conversation(stored.conversation_id.clone());
            state.publish(&topic, ChangeEvent::MessageInserted(stored.clone()));
            stored
        };
        self.respond(stored).await
    }

    async fn update_message(&self, message_id: &str, patch: &MessagePatch) -> Result<Message> {
        self.online()?;
        let updated = {
            let mut state = self.state.lock();
            let msg = state
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or_else(|| Error::NotFound(message_id.to_string()))?;
            patch.apply(msg);
            let updated = msg.clone();
            let topic = Topic::Conversation(updated.conversation_id.clone());
            state.publish(&topic, ChangeEvent::MessageUpdated(updated.clone()));
            updated
        };
        self.respond(updated).await
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<()> {
        self.online()?;
        let mut state = self.state.lock();
        let mut changed = Vec::new();
        for msg in state.messages.iter_mut() {
            if msg.conversation_id == conversation_id && msg.sender_id != reader_id && !msg.read {
                msg.read = true;
                msg.read_at = Some(read_at);
                changed.push(msg.clone());
            }
        }
        let topic = Topic::Conversation(conversation_id.to_string());
        for msg in changed {
            state.publish(&topic, ChangeEvent::MessageUpdated(msg));
        }
        Ok(())
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        self.online()?;
        let mut conversations: Vec<Conversation> = self
            .state
            .lock()
            .conversations
            .iter()
            .filter(|c| c.involves(user_id))
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(conversations)
    }

    async fn touch_conversation(&self, conversation_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.online()?;
        let mut state = self.state.lock();
        if let Some(conv) = state.conversations.iter_mut().find(|c| c.id == conversation_id) {
            conv.last_message_at = Some(at);
        }
        Ok(())
    }

    async fn list_reactions(&self, message_id: &str) -> Result<Vec<Reaction>> {
        self.online()?;
        Ok(self
            .state
            .lock()
            .reactions
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn add_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<Reaction> {
        self.online()?;
        let mut state = self.state.lock();
        if let Some(existing) = state
            .reactions
            .iter()
            .find(|r| r.matches(message_id, user_id, emoji))
        {
            return Ok(existing.clone());
        }
        let reaction = Reaction {
            id: state.next_id("r"),
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            emoji: emoji.to_string(),
        };
        state.reactions.push(reaction.clone());
        state.publish_reaction_change(message_id);
        Ok(reaction)
    }

    async fn remove_reaction(&self, reaction_id: &str) -> Result<()> {
        self.online()?;
        let mut state = self.state.lock();
        if let Some(pos) = state.reactions.iter().position(|r| r.id == reaction_id) {
            let removed = state.reactions.remove(pos);
            state.publish_reaction_change(&removed.message_id);
        }
        Ok(())
    }

    async fn fetch_presence(&self, user_id: &str) -> Result<Option<Presence>> {
        self.online()?;
        Ok(self.presence_of(user_id))
    }

    async fn upsert_presence(&self, presence: &Presence) -> Result<()> {
        self.online()?;
        let mut state = self.state.lock();
        state
            .presence
            .insert(presence.user_id.clone(), presence.clone());
        let topic = Topic::Presence(presence.user_id.clone());
        state.publish(&topic, ChangeEvent::PresenceUpdated(presence.clone()));
        Ok(())
    }

    async fn upsert_typing(&self, signal: &TypingSignal) -> Result<()> {
        self.online()?;
        let mut state = self.state.lock();
        state.typing.insert(
            (signal.conversation_id.clone(), signal.user_id.clone()),
            signal.clone(),
        );
        let topic = Topic::Conversation(signal.conversation_id.clone());
        state.publish(&topic, ChangeEvent::Typing(signal.clone()));
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _mime_type: &str,
    ) -> Result<String> {
        self.online()?;
        let key = format!("{}/{}", bucket, path);
        self.state.lock().files.insert(key.clone(), bytes);
        Ok(format!("memory://{}", key))
    }

    async fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        self.online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.subscribers.push((id, topic.clone(), tx));
            id
        };

        let state = self.state.clone();
        Ok(Subscription::new(topic, rx, move || {
            state.lock().subscribers.retain(|(sub_id, _, _)| *sub_id != id);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_is_published_to_conversation_only() {
        let backend = MemoryBackend::new();
        let mut c1 = backend.subscribe(Topic::Conversation("c1".into())).await.unwrap();
        let mut c2 = backend.subscribe(Topic::Conversation("c2".into())).await.unwrap();

        let stored = backend
            .insert_message(&NewMessage::text("c1", "alice", "Hello"))
            .await
            .unwrap();

        assert_eq!(
            c1.next().await,
            Some(ChangeEvent::MessageInserted(stored))
        );
        assert!(c2.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stopped_subscription_is_removed() {
        let backend = MemoryBackend::new();
        let sub = backend.subscribe(Topic::Presence("bob".into())).await.unwrap();
        assert_eq!(backend.subscriber_count(), 1);

        sub.stop();
        assert_eq!(backend.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_fails_every_call() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);

        let err = backend
            .insert_message(&NewMessage::text("c1", "alice", "Hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(backend.messages("c1").is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_skips_own_messages() {
        let backend = MemoryBackend::new();
        backend
            .insert_message(&NewMessage::text("c1", "alice", "mine"))
            .await
            .unwrap();
        backend
            .insert_message(&NewMessage::text("c1", "bob", "theirs"))
            .await
            .unwrap();

        backend.mark_read("c1", "alice", Utc::now()).await.unwrap();

        let messages = backend.messages("c1");
        assert!(!messages[0].read);
        assert!(messages[1].read);
        assert!(messages[1].read_at.is_some());
    }
}
