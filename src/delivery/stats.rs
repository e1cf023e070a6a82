//! Thread counters, recomputed from the full message set.

use chrono::{DateTime, Utc};

use crate::model::entity::{ContactId, Message, Thread};

/// A consistent snapshot of a thread's derived fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadStats {
    pub count_unread: usize,
    pub count_trashed: usize,
    pub count_draft: usize,
    pub count_starred: usize,
    pub count_sender: usize,
    pub count_messages: usize,
    /// Newest `sent_at` among messages not in the trash.
    pub messaged_at: Option<DateTime<Utc>>,
    /// `None` keeps the thread's current snippet.
    pub snippet: Option<String>,
    pub sender_names: Vec<String>,
}

impl ThreadStats {
    /// Counters and `messaged_at` for `messages`. Snippet and sender names
    /// need collaborators and are filled in by the caller.
    pub fn compute(messages: &[Message]) -> Self {
        let mut stats = Self {
            count_messages: messages.len(),
            ..Self::default()
        };
        for m in messages {
            if m.is_trashed {
                stats.count_trashed += 1;
                continue;
            }
            if m.is_unread {
                stats.count_unread += 1;
            }
            if m.is_starred {
                stats.count_starred += 1;
            }
            if m.is_draft {
                stats.count_draft += 1;
            } else if m.is_sender {
                stats.count_sender += 1;
            }
            let at = sent_or_created(m);
            if stats.messaged_at.map_or(true, |cur| at > cur) {
                stats.messaged_at = Some(at);
            }
        }
        stats
    }

    /// Write the snapshot onto `thread`.
    pub fn apply(self, thread: &mut Thread) {
        thread.count_unread = self.count_unread;
        thread.count_trashed = self.count_trashed;
        thread.count_draft = self.count_draft;
        thread.count_starred = self.count_starred;
        thread.count_sender = self.count_sender;
        thread.count_messages = self.count_messages;
        thread.messaged_at = self.messaged_at;
        if let Some(snippet) = self.snippet {
            thread.snippet = snippet;
        }
        thread.sender_names = self.sender_names;
    }
}

/// The newest message outside the trash, drafts included.
pub fn latest_visible(messages: &[Message]) -> Option<&Message> {
    messages
        .iter()
        .filter(|m| !m.is_trashed)
        .max_by_key(|m| sent_or_created(m))
}

/// Senders of the oldest and the newest visible message, deduplicated.
pub fn sender_ids(messages: &[Message]) -> Vec<ContactId> {
    let visible = messages.iter().filter(|m| !m.is_trashed && !m.is_draft);
    let oldest = visible.clone().min_by_key(|m| sent_or_created(m));
    let newest = visible.max_by_key(|m| sent_or_created(m));
    let mut ids = Vec::with_capacity(2);
    for m in [oldest, newest].into_iter().flatten() {
        if !ids.contains(&m.sender_id) {
            ids.push(m.sender_id);
        }
    }
    ids
}

fn sent_or_created(m: &Message) -> DateTime<Utc> {
    m.sent_at.unwrap_or(m.created_at)
}
