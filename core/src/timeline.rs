//! Optimistic reconciliation of the displayed message sequence
//!
//! [`Timeline::apply`] is the only place where a pending entry may collapse
//! into its server-confirmed twin. Every other component feeds it actions and
//! reads back the resulting [`Merge`].
//!
//! Entries keep arrival order. Nothing here re-sorts by timestamp: new entries
//! go to the tail, replacements happen in place.

use crate::models::*;
use chrono::Utc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Initial fetch. Pending entries already on screen stay at the tail.
    Load(Vec<Message>),
    /// Locally created message, `id` must be a temp id.
    AddPending(Message),
    /// Direct response to our own insert.
    Confirm { temp_id: String, message: Message },
    /// The insert failed; the pending entry goes away.
    Reject { temp_id: String },
    /// Row pushed by the change feed (or any other server-confirmed message).
    Incoming(Message),
    /// Row update pushed by the change feed.
    Updated(Message),
    /// Local-only removal.
    Remove { id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Merge {
    Loaded(usize),
    Appended,
    /// A pending entry was replaced by its confirmed row.
    Collapsed,
    /// An existing confirmed entry was refreshed in place.
    Refreshed,
    /// Duplicate delivery, nothing changed.
    Dropped,
    /// The entry was taken out; carries the removed message.
    Removed(Message),
    /// Target not found.
    Ignored,
}

impl Merge {
    pub fn changed(&self) -> bool {
        !matches!(self, Merge::Dropped | Merge::Ignored)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Vec<ChatEntry>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ChatEntry> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id() == id)
    }

    fn confirmed_position(&self, id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| matches!(e, ChatEntry::Confirmed(m) if m.id == id))
    }

    fn pending_twin(&self, msg: &Message) -> Option<usize> {
        self.entries.iter().position(|e| {
            matches!(e, ChatEntry::Pending(p) if p.sender_id == msg.sender_id && p.content == msg.content)
        })
    }

    pub fn apply(&mut self, action: Action) -> Merge {
        let merge = match action {
            Action::Load(messages) => self.load(messages),
            Action::AddPending(message) => {
                debug_assert!(message.is_pending());
                self.entries.push(ChatEntry::Pending(message));
                Merge::Appended
            }
            Action::Confirm { temp_id, message } => self.confirm(&temp_id, message),
            Action::Reject { temp_id } => match self.position(&temp_id) {
                Some(pos) if self.entries[pos].is_pending() => {
                    Merge::Removed(self.entries.remove(pos).message().clone())
                }
                _ => Merge::Ignored,
            },
            Action::Incoming(message) => self.incoming(message),
            Action::Updated(message) => match self.confirmed_position(&message.id) {
                Some(pos) => {
                    self.replace(pos, message);
                    Merge::Refreshed
                }
                None => Merge::Ignored,
            },
            Action::Remove { id } => match self.position(&id) {
                Some(pos) => Merge::Removed(self.entries.remove(pos).message().clone()),
                None => Merge::Ignored,
            },
        };
        tracing::debug!(?merge, entries = self.entries.len(), "timeline merge");
        merge
    }

    fn load(&mut self, messages: Vec<Message>) -> Merge {
        let pending: Vec<ChatEntry> = self
            .entries
            .drain(..)
            .filter(|e| e.is_pending())
            .collect();

        for msg in messages {
            if self.confirmed_position(&msg.id).is_none() {
                self.entries.push(ChatEntry::Confirmed(msg));
            }
        }
        let loaded = self.entries.len();
        self.entries.extend(pending);
        Merge::Loaded(loaded)
    }

    fn confirm(&mut self, temp_id: &str, message: Message) -> Merge {
        let pending = self
            .position(temp_id)
            .filter(|&pos| self.entries[pos].is_pending());
        let existing = self.confirmed_position(&message.id);

        match (pending, existing) {
            // The push already delivered this row, possibly onto another pending twin.
            (Some(pos), Some(_)) => {
                let removed = self.entries.remove(pos);
                let mut message = message;
                if message.reply_to.is_none() {
                    message.reply_to = removed.message().reply_to.clone();
                }
                match self.confirmed_position(&message.id) {
                    Some(existing) => self.replace(existing, message),
                    None => self.push_confirmed(message),
                }
                Merge::Collapsed
            }
            (Some(pos), None) => {
                self.replace(pos, message);
                Merge::Collapsed
            }
            (None, Some(pos)) => {
                self.replace(pos, message);
                Merge::Refreshed
            }
            // Our pending entry was consumed by a different push; the row is real, show it.
            (None, None) => {
                self.push_confirmed(message);
                Merge::Appended
            }
        }
    }

    fn incoming(&mut self, message: Message) -> Merge {
        if self.confirmed_position(&message.id).is_some() {
            return Merge::Dropped;
        }
        match self.pending_twin(&message) {
            Some(pos) => {
                self.replace(pos, message);
                Merge::Collapsed
            }
            None => {
                self.push_confirmed(message);
                Merge::Appended
            }
        }
    }

    fn push_confirmed(&mut self, mut message: Message) {
        self.resolve_preview(&mut message);
        self.entries.push(ChatEntry::Confirmed(message));
    }

    /// Swaps the entry at `pos` for a confirmed row, keeping a locally attached preview.
    fn replace(&mut self, pos: usize, mut message: Message) {
        if message.reply_to.is_none() {
            message.reply_to = self.entries[pos].message().reply_to.clone();
        }
        self.resolve_preview(&mut message);
        self.entries[pos] = ChatEntry::Confirmed(message);
    }

    fn resolve_preview(&self, message: &mut Message) {
        if message.reply_to.is_some() {
            return;
        }
        if let Some(target) = message.reply_to_id.as_deref().and_then(|id| self.get(id)) {
            message.reply_to = Some(ReplyPreview::from(target.message()));
        }
    }
}

/// Client-only id for an optimistic entry.
pub fn new_temp_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}{}-{}",
        TEMP_ID_PREFIX,
        Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

pub fn pending_message(
    conversation_id: &str,
    sender_id: &str,
    content: &str,
    reply_to: Option<&Message>,
) -> Message {
    Message {
        id: new_temp_id(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        content: content.to_string(),
        created_at: Utc::now(),
        read: false,
        read_at: None,
        reply_to_id: reply_to.map(|m| m.id.clone()),
        message_type: MessageKind::Text,
        voice_duration: None,
        voice_url: None,
        reply_to: reply_to.map(ReplyPreview::from),
    }
}

/// Whether the view should jump to a newly appended message.
pub fn should_follow(distance_from_bottom: f64, near_bottom_px: f64, own_message: bool) -> bool {
    own_message || distance_from_bottom <= near_bottom_px
}
