//! Thread resolution for incoming messages.
//!
//! Only explicit threading headers can merge a message into an existing
//! thread. Subjects break ties between candidates but never create a match
//! on their own.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::model::entity::{Mailbox, Message, Thread};
use crate::model::message::ParsedMessage;
use crate::parser::header;
use crate::store::Store;

/// Reply/forward prefixes stripped by [`canonical_subject`].
const PREFIXES: &[&str] = &["fwd", "rep", "fw", "re", "tr"];

/// A thread plus the stored message that matched a threading header.
#[derive(Debug, Clone)]
pub struct ThreadMatch {
    pub thread: Thread,
    pub parent: Message,
}

pub struct ThreadResolver {
    store: Arc<dyn Store>,
}

impl ThreadResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The existing thread of `mailbox` this message belongs to, if any.
    pub fn resolve(&self, parsed: &ParsedMessage, mailbox: &Mailbox) -> Result<Option<Thread>> {
        Ok(self.resolve_match(parsed, mailbox)?.map(|m| m.thread))
    }

    /// Like [`resolve`](Self::resolve), also returning the matched parent.
    pub fn resolve_match(
        &self,
        parsed: &ParsedMessage,
        mailbox: &Mailbox,
    ) -> Result<Option<ThreadMatch>> {
        let mut candidates = header::message_id_tokens(&parsed.threading_headers());
        candidates.sort();
        candidates.dedup();
        if candidates.is_empty() {
            return Ok(None);
        }

        // Newest sent first
        let found = self
            .store
            .find_messages_by_mime_ids(mailbox.id, &candidates)?;
        if found.is_empty() {
            debug!(
                candidates = candidates.len(),
                "No stored message matches the threading headers"
            );
            return Ok(None);
        }

        let incoming = canonical_subject(&parsed.subject).to_lowercase();
        let parent = found
            .iter()
            .find(|m| canonical_subject(&m.subject).to_lowercase() == incoming)
            .unwrap_or(&found[0])
            .clone();

        let thread = self.store.get_thread(parent.thread_id)?;
        debug!(thread = %thread.id, parent = %parent.id, "Resolved existing thread");
        Ok(Some(ThreadMatch { thread, parent }))
    }
}

/// Strip every leading reply/forward prefix from a subject.
///
/// A prefix is one of `re`, `fwd`, `fw`, `rep`, `tr` (any case), optionally
/// followed by a counter like `[2]`, then a colon or whitespace. A bare
/// word with nothing after it is kept. `"Re: RE Fwd: X"` → `"X"`.
pub fn canonical_subject(subject: &str) -> &str {
    let mut s = subject.trim();
    while let Some(rest) = strip_prefix(s) {
        s = rest.trim_start();
    }
    s
}

fn strip_prefix(s: &str) -> Option<&str> {
    let prefix = PREFIXES.iter().find(|p| {
        s.get(..p.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(p))
    })?;
    let mut rest = &s[prefix.len()..];
    // Counter, as in "Re[2]:"
    if let Some(inner) = rest.strip_prefix('[') {
        let end = inner.find(']')?;
        if !inner[..end].chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        rest = &inner[end + 1..];
    }
    if let Some(after_colon) = rest.trim_start().strip_prefix(':') {
        return Some(after_colon);
    }
    let after_space = rest.trim_start();
    let spaced = rest.starts_with(char::is_whitespace);
    (spaced && !after_space.is_empty()).then_some(after_space)
}
