//! Reaction rows per message
//!
//! Rows are kept per user so a toggle can tell whether *this* user already
//! reacted with *this* emoji; grouping into counts happens only for display.

use crate::models::{Reaction, ReactionGroup};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct ReactionAggregator {
    by_message: HashMap<String, Vec<Reaction>>,
}

impl ReactionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, message_id: &str, user_id: &str, emoji: &str) -> Option<&Reaction> {
        self.by_message
            .get(message_id)?
            .iter()
            .find(|r| r.matches(message_id, user_id, emoji))
    }

    /// Adds a row unless the same (message, user, emoji) triple is already present.
    pub fn insert(&mut self, reaction: Reaction) -> bool {
        if self
            .find(&reaction.message_id, &reaction.user_id, &reaction.emoji)
            .is_some()
        {
            return false;
        }
        self.by_message
            .entry(reaction.message_id.clone())
            .or_default()
            .push(reaction);
        true
    }

    pub fn remove(&mut self, message_id: &str, reaction_id: &str) -> Option<Reaction> {
        let rows = self.by_message.get_mut(message_id)?;
        let pos = rows.iter().position(|r| r.id == reaction_id)?;
        let removed = rows.remove(pos);
        if rows.is_empty() {
            self.by_message.remove(message_id);
        }
        Some(removed)
    }

    /// Replaces every row of one message with a fresh fetch.
    pub fn replace_all(&mut self, message_id: &str, rows: Vec<Reaction>) {
        let mut deduped: Vec<Reaction> = Vec::with_capacity(rows.len());
        for row in rows.into_iter().filter(|r| r.message_id == message_id) {
            if !deduped
                .iter()
                .any(|r| r.matches(&row.message_id, &row.user_id, &row.emoji))
            {
                deduped.push(row);
            }
        }

        if deduped.is_empty() {
            self.by_message.remove(message_id);
        } else {
            self.by_message.insert(message_id.to_string(), deduped);
        }
    }

    pub fn rows(&self, message_id: &str) -> &[Reaction] {
        self.by_message
            .get(message_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Emoji counts in order of first appearance.
    pub fn groups(&self, message_id: &str, viewer_id: &str) -> Vec<ReactionGroup> {
        let mut groups: Vec<ReactionGroup> = Vec::new();
        for row in self.rows(message_id) {
            match groups.iter_mut().find(|g| g.emoji == row.emoji) {
                Some(group) => {
                    group.count += 1;
                    group.user_reacted |= row.user_id == viewer_id;
                }
                None => groups.push(ReactionGroup {
                    emoji: row.emoji.clone(),
                    count: 1,
                    user_reacted: row.user_id == viewer_id,
                }),
            }
        }
        groups
    }

    pub fn clear(&mut self) {
        self.by_message.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reaction(id: &str, user: &str, emoji: &str) -> Reaction {
        Reaction {
            id: id.to_string(),
            message_id: "m-7".to_string(),
            user_id: user.to_string(),
            emoji: emoji.to_string(),
        }
    }

    #[test]
    fn test_duplicate_triple_is_not_stored_twice() {
        let mut reactions = ReactionAggregator::new();
        assert!(reactions.insert(reaction("r1", "alice", "❤️")));
        assert!(!reactions.insert(reaction("r2", "alice", "❤️")));
        assert_eq!(reactions.rows("m-7").len(), 1);
    }

    #[test]
    fn test_groups_count_and_flag_viewer() {
        let mut reactions = ReactionAggregator::new();
        reactions.replace_all(
            "m-7",
            vec![
                reaction("r1", "alice", "❤️"),
                reaction("r2", "bob", "👍"),
                reaction("r3", "bob", "❤️"),
            ],
        );

        let groups = reactions.groups("m-7", "alice");
        assert_eq!(
            groups,
            vec![
                ReactionGroup { emoji: "❤️".to_string(), count: 2, user_reacted: true },
                ReactionGroup { emoji: "👍".to_string(), count: 1, user_reacted: false },
            ]
        );
    }

    #[test]
    fn test_remove_last_row_forgets_message() {
        let mut reactions = ReactionAggregator::new();
        reactions.insert(reaction("r1", "alice", "❤️"));

        let removed = reactions.remove("m-7", "r1").unwrap();
        assert_eq!(removed.emoji, "❤️");
        assert!(reactions.rows("m-7").is_empty());
        assert!(reactions.find("m-7", "alice", "❤️").is_none());
    }

    #[test]
    fn test_replace_all_ignores_foreign_rows() {
        let mut reactions = ReactionAggregator::new();
        let mut foreign = reaction("r9", "bob", "😂");
        foreign.message_id = "m-8".to_string();

        reactions.replace_all("m-7", vec![reaction("r1", "alice", "❤️"), foreign]);
        assert_eq!(reactions.rows("m-7").len(), 1);
        assert!(reactions.rows("m-8").is_empty());
    }
}
