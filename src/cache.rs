//! LRU cache of parsed messages, keyed by stored message id.
//!
//! Thread statistics re-read the latest message of a thread on every
//! delivery; caching the parse keeps busy threads from being re-decoded.
//! A cache lives for one job only (a delivery, an MBOX or IMAP import run)
//! and is dropped with it. Raw MIME may be rewritten between jobs, so
//! entries are never carried over.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use tracing::debug;

use crate::error::{MailError, Result};
use crate::model::entity::MessageId;
use crate::model::message::ParsedMessage;
use crate::parser::mime;

/// Default number of parsed messages kept.
pub const DEFAULT_CACHE_SIZE: usize = 64;

pub struct ParseCache {
    cache: Mutex<LruCache<MessageId, Arc<ParsedMessage>>>,
}

impl ParseCache {
    /// A cache holding up to `size` parsed messages (at least one).
    pub fn new(size: usize) -> Self {
        let size = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(size)),
        }
    }

    /// Return the cached parse of `id`, parsing `raw` on a miss.
    pub fn get_or_parse(
        &self,
        id: MessageId,
        raw: &[u8],
        default_date: DateTime<Utc>,
    ) -> Result<Arc<ParsedMessage>> {
        if let Some(hit) = self.lock()?.get(&id) {
            return Ok(Arc::clone(hit));
        }
        debug!(message = %id, "Parse cache miss");
        let parsed = Arc::new(mime::parse_message_with_date(raw, default_date)?);
        self.lock()?.put(id, Arc::clone(&parsed));
        Ok(parsed)
    }

    /// Prime the cache with a parse the caller already has.
    pub fn insert(&self, id: MessageId, parsed: ParsedMessage) -> Result<()> {
        self.lock()?.put(id, Arc::new(parsed));
        Ok(())
    }

    /// Drop a stale entry after the message's raw MIME changed.
    pub fn invalidate(&self, id: MessageId) -> Result<()> {
        self.lock()?.pop(&id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<MessageId, Arc<ParsedMessage>>>> {
        self.cache
            .lock()
            .map_err(|_| MailError::Storage("parse cache mutex poisoned".into()))
    }
}

impl Default for ParseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}
