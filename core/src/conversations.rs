//! Conversation list with previews and unread counters

use crate::models::*;
use crate::store::MessageStore;
use std::cmp::Ordering;

const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub peer_id: String,
    pub last_message: Option<String>,
    pub unread_count: u32,
}

pub fn preview(msg: &Message) -> String {
    match msg.message_type {
        MessageKind::Voice => VOICE_CONTENT.to_string(),
        MessageKind::Image => "📷 Photo".to_string(),
        MessageKind::Deleted => TOMBSTONE_CONTENT.to_string(),
        MessageKind::Text => {
            if msg.content.chars().count() > PREVIEW_CHARS {
                let cut: String = msg.content.chars().take(PREVIEW_CHARS).collect();
                format!("{}…", cut)
            } else {
                msg.content.clone()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationList {
    user_id: String,
    items: Vec<ConversationSummary>,
}

impl ConversationList {
    pub fn from_rows(user_id: &str, rows: Vec<Conversation>) -> Self {
        let items = rows
            .into_iter()
            .filter(|c| c.involves(user_id))
            .map(|conversation| ConversationSummary {
                peer_id: conversation.peer_of(user_id).to_string(),
                conversation,
                last_message: None,
                unread_count: 0,
            })
            .collect();
        let mut list = Self {
            user_id: user_id.to_string(),
            items,
        };
        list.sort();
        list
    }

    /// Fetches conversations and derives preview and unread count from each message list.
    pub async fn load(store: &MessageStore, user_id: &str) -> Self {
        let mut list = Self::from_rows(user_id, store.list_conversations(user_id).await);
        for item in list.items.iter_mut() {
            let messages = store.list_messages(&item.conversation.id).await;
            item.last_message = messages.last().map(preview);
            item.unread_count = messages
                .iter()
                .filter(|m| m.sender_id != user_id && !m.read)
                .count() as u32;
        }
        tracing::debug!("Loaded {} conversations for {}", list.items.len(), user_id);
        list
    }

    pub fn ordered(&self) -> &[ConversationSummary] {
        &self.items
    }

    pub fn get(&self, conversation_id: &str) -> Option<&ConversationSummary> {
        self.items
            .iter()
            .find(|i| i.conversation.id == conversation_id)
    }

    pub fn total_unread(&self) -> u32 {
        self.items.iter().map(|i| i.unread_count).sum()
    }

    /// Moves the conversation to the top. Messages from the peer count as
    /// unread unless that conversation is currently open.
    pub fn record_message(&mut self, msg: &Message, open_conversation: Option<&str>) -> bool {
        let Some(item) = self
            .items
            .iter_mut()
            .find(|i| i.conversation.id == msg.conversation_id)
        else {
            return false;
        };

        if item
            .conversation
            .last_message_at
            .map_or(true, |at| at <= msg.created_at)
        {
            item.conversation.last_message_at = Some(msg.created_at);
            item.last_message = Some(preview(msg));
        }
        if msg.sender_id != self.user_id && open_conversation != Some(msg.conversation_id.as_str()) {
            item.unread_count += 1;
        }
        self.sort();
        true
    }

    pub fn mark_read(&mut self, conversation_id: &str) {
        if let Some(item) = self
            .items
            .iter_mut()
            .find(|i| i.conversation.id == conversation_id)
        {
            item.unread_count = 0;
        }
    }

    fn sort(&mut self) {
        self.items.sort_by(|a, b| {
            match (a.conversation.last_message_at, b.conversation.last_message_at) {
                (Some(a), Some(b)) => b.cmp(&a),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn conversation(id: &str, minutes_ago: Option<i64>) -> Conversation {
        Conversation {
            id: id.to_string(),
            renter_id: "rita".to_string(),
            landlord_id: format!("landlord-{}", id),
            listing_ref: None,
            last_message_at: minutes_ago.map(|m| Utc::now() - Duration::minutes(m)),
        }
    }

    fn message(conversation_id: &str, sender: &str, content: &str) -> Message {
        Message {
            id: "m-1".to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            read: false,
            read_at: None,
            reply_to_id: None,
            message_type: MessageKind::Text,
            voice_duration: None,
            voice_url: None,
            reply_to: None,
        }
    }

    #[test]
    fn test_most_recent_first_and_silent_last() {
        let list = ConversationList::from_rows(
            "rita",
            vec![
                conversation("a", None),
                conversation("b", Some(30)),
                conversation("c", Some(5)),
            ],
        );
        let ids: Vec<&str> = list.ordered().iter().map(|i| i.conversation.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
        assert_eq!(list.ordered()[0].peer_id, "landlord-c");
    }

    #[test]
    fn test_peer_message_bumps_and_counts() {
        let mut list = ConversationList::from_rows(
            "rita",
            vec![conversation("a", Some(60)), conversation("b", Some(5))],
        );

        assert!(list.record_message(&message("a", "landlord-a", "Viewing at 5?"), None));
        assert_eq!(list.ordered()[0].conversation.id, "a");
        assert_eq!(list.ordered()[0].unread_count, 1);
        assert_eq!(list.ordered()[0].last_message.as_deref(), Some("Viewing at 5?"));

        // Own messages and messages in the open conversation do not count.
        list.record_message(&message("a", "rita", "Sure"), None);
        list.record_message(&message("b", "landlord-b", "Hi"), Some("b"));
        assert_eq!(list.total_unread(), 1);

        list.mark_read("a");
        assert_eq!(list.total_unread(), 0);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(60);
        let text = preview(&message("a", "rita", &long));
        assert_eq!(text.chars().count(), PREVIEW_CHARS + 1);

        let mut voice = message("a", "rita", VOICE_CONTENT);
        voice.message_type = MessageKind::Voice;
        assert_eq!(preview(&voice), VOICE_CONTENT);
    }
}
