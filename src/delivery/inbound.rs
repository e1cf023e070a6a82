//! Inbound delivery: persist a parsed message into a mailbox.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cache::ParseCache;
use crate::config::DeliveryConfig;
use crate::delivery::contact;
use crate::delivery::stats::{self, ThreadStats};
use crate::delivery::thread::ThreadResolver;
use crate::error::{MailError, Result};
use crate::model::address::split_address;
use crate::model::entity::{
    Attachment, AttachmentId, Blob, BlobId, Mailbox, Message, MessageId, MessageRecipient,
    RecipientType, Thread, ThreadId,
};
use crate::model::message::{Disposition, ParsedMessage};
use crate::parser::mime;
use crate::store::Store;

/// Subject given to threads whose first message has none.
pub const NO_SUBJECT: &str = "(no subject)";
/// Snippet used when a message has neither body nor subject.
pub const NO_PREVIEW: &str = "(no preview)";

/// What the deliverer is allowed to do, injected at construction.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    /// Create unknown mailboxes on first delivery.
    pub accept_all_emails: bool,
    /// Unknown mailboxes in this domain are created even without
    /// `accept_all_emails`.
    pub test_domain: Option<String>,
    pub snippet_length: usize,
    /// Skip imported messages whose Message-ID is already in the mailbox.
    pub dedup_imports: bool,
    pub parse_cache_size: usize,
}

impl DeliveryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            accept_all_emails: config.accept_all_emails,
            test_domain: config
                .test_domain
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_lowercase),
            snippet_length: config.snippet_length,
            dedup_imports: config.dedup_imports,
            parse_cache_size: config.parse_cache_size,
        }
    }

    fn may_create(&self, domain: &str) -> bool {
        self.accept_all_emails
            || self
                .test_domain
                .as_deref()
                .is_some_and(|d| d.eq_ignore_ascii_case(domain))
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

/// Where a delivered message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    /// The message was already in the mailbox and was not stored again.
    pub duplicate: bool,
}

pub struct InboundDeliverer {
    store: Arc<dyn Store>,
    policy: DeliveryPolicy,
    resolver: ThreadResolver,
}

impl InboundDeliverer {
    pub fn new(store: Arc<dyn Store>, policy: DeliveryPolicy) -> Self {
        Self {
            resolver: ThreadResolver::new(store.clone()),
            store,
            policy,
        }
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    /// A fresh parse cache for one job (a single delivery, an import run).
    pub fn job_cache(&self) -> ParseCache {
        ParseCache::new(self.policy.parse_cache_size)
    }

    /// Deliver `parsed` to `recipient`.
    ///
    /// Returns whether the message was stored (or, on import, already
    /// present). Failures are logged, never raised.
    pub fn deliver(
        &self,
        recipient: &str,
        parsed: &ParsedMessage,
        raw: &[u8],
        is_import: bool,
    ) -> bool {
        match self.deliver_with_receipt(recipient, parsed, raw, is_import) {
            Ok(_) => true,
            Err(e) => {
                warn!(recipient, error = %e, "Inbound delivery failed");
                false
            }
        }
    }

    /// [`deliver`](Self::deliver), reporting where the message went.
    pub fn deliver_with_receipt(
        &self,
        recipient: &str,
        parsed: &ParsedMessage,
        raw: &[u8],
        is_import: bool,
    ) -> Result<DeliveryReceipt> {
        self.deliver_in_job(&self.job_cache(), recipient, parsed, raw, is_import)
    }

    /// Deliver as part of a job whose messages share `cache`.
    ///
    /// The cache must not outlive the job: stored raw MIME may change
    /// afterwards.
    pub fn deliver_in_job(
        &self,
        cache: &ParseCache,
        recipient: &str,
        parsed: &ParsedMessage,
        raw: &[u8],
        is_import: bool,
    ) -> Result<DeliveryReceipt> {
        let (local_part, domain) = split_address(recipient)
            .ok_or_else(|| MailError::Validation(format!("no domain in '{recipient}'")))?;
        let mailbox = self.mailbox_for(local_part, domain)?;

        if is_import && self.policy.dedup_imports {
            if let Some(existing) = self.find_duplicate(&mailbox, parsed)? {
                debug!(
                    mailbox = %mailbox.address(),
                    mime_id = parsed.message_id.as_deref().unwrap_or(""),
                    "Skipping already imported message"
                );
                return Ok(DeliveryReceipt {
                    message_id: existing.id,
                    thread_id: existing.thread_id,
                    duplicate: true,
                });
            }
        }

        let matched = self.resolver.resolve_match(parsed, &mailbox)?;
        // Sender before thread: a failed lookup must not leave an empty thread
        let sender = contact::sender_contact(self.store.as_ref(), &mailbox, &parsed.from)?;
        let (thread, parent_id, created) = match matched {
            Some(m) => (m.thread, Some(m.parent.id), false),
            None => (self.new_thread(&mailbox, parsed)?, None, true),
        };

        let mut message = Message::new(thread.id, sender.id, parsed.subject.clone());
        message.parent_id = parent_id;
        message.mime_id = parsed.message_id.clone();
        message.raw_mime = Some(raw.to_vec());
        message.is_unread = true;
        message.sent_at = Some(if parsed.has_date {
            parsed.date
        } else {
            Utc::now()
        });
        let message = match self.store.insert_message(message) {
            Ok(message) => message,
            Err(e) => {
                if created {
                    if let Err(cleanup) = self.store.delete_thread(thread.id) {
                        warn!(thread = %thread.id, error = %cleanup, "Could not remove empty thread");
                    }
                }
                return Err(e);
            }
        };
        cache.insert(message.id, parsed.clone())?;

        self.store_recipients(&mailbox, &message, parsed);
        self.store_attachments(&mailbox, &message, parsed);

        if let Err(e) = self.refresh_thread(cache, thread.id) {
            warn!(thread = %thread.id, error = %e, "Could not refresh thread counters");
        }

        info!(
            mailbox = %mailbox.address(),
            thread = %thread.id,
            message = %message.id,
            import = is_import,
            "Delivered message"
        );
        Ok(DeliveryReceipt {
            message_id: message.id,
            thread_id: thread.id,
            duplicate: false,
        })
    }

    /// Recompute a thread's counters, snippet and senders from its current
    /// messages under the store's row lock.
    pub fn update_thread_stats(&self, thread_id: ThreadId) -> Result<Thread> {
        self.refresh_thread(&self.job_cache(), thread_id)
    }

    fn refresh_thread(&self, cache: &ParseCache, thread_id: ThreadId) -> Result<Thread> {
        // Names are read before taking the row lock; the store is not
        // re-entered while it is held.
        let messages = self.store.thread_messages(thread_id)?;
        let mut names = HashMap::new();
        for m in &messages {
            if names.contains_key(&m.sender_id) {
                continue;
            }
            if let Ok(c) = self.store.get_contact(m.sender_id) {
                let name = if c.name.is_empty() { c.email } else { c.name };
                names.insert(m.sender_id, name);
            }
        }

        let snippet_length = self.policy.snippet_length;
        let mut update = |thread: &mut Thread, messages: &[Message]| {
            let mut snapshot = ThreadStats::compute(messages);
            snapshot.snippet = stats::latest_visible(messages).and_then(|m| {
                let raw = m.raw_mime.as_deref()?;
                let default_date = m.sent_at.unwrap_or(m.created_at);
                match cache.get_or_parse(m.id, raw, default_date) {
                    Ok(parsed) => Some(mime::snippet(&parsed, snippet_length, NO_PREVIEW)),
                    Err(e) => {
                        debug!(message = %m.id, error = %e, "No snippet for message");
                        None
                    }
                }
            });
            snapshot.sender_names = stats::sender_ids(messages)
                .iter()
                .filter_map(|id| names.get(id).cloned())
                .collect();
            snapshot.apply(thread);
        };
        self.store.recompute_thread(thread_id, &mut update)
    }

    fn mailbox_for(&self, local_part: &str, domain: &str) -> Result<Mailbox> {
        if let Some(mailbox) = self.store.find_mailbox(local_part, domain)? {
            return Ok(mailbox);
        }
        if !self.policy.may_create(domain) {
            return Err(MailError::not_found(
                "Mailbox",
                format!("{local_part}@{domain}"),
            ));
        }
        info!(local_part, domain, "Creating mailbox on first delivery");
        self.store.create_mailbox(local_part, domain)
    }

    fn find_duplicate(&self, mailbox: &Mailbox, parsed: &ParsedMessage) -> Result<Option<Message>> {
        let Some(mime_id) = parsed.message_id.clone() else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_messages_by_mime_ids(mailbox.id, &[mime_id])?
            .into_iter()
            .next())
    }

    fn new_thread(&self, mailbox: &Mailbox, parsed: &ParsedMessage) -> Result<Thread> {
        let subject = if parsed.subject.trim().is_empty() {
            NO_SUBJECT.to_string()
        } else {
            parsed.subject.trim().to_string()
        };
        let snippet = mime::snippet(parsed, self.policy.snippet_length, NO_PREVIEW);
        self.store
            .create_thread(Thread::new(mailbox.id, subject, snippet))
    }

    fn store_recipients(&self, mailbox: &Mailbox, message: &Message, parsed: &ParsedMessage) {
        let lists = [&parsed.to, &parsed.cc, &parsed.bcc];
        for (kind, addrs) in RecipientType::ALL.into_iter().zip(lists) {
            for addr in addrs {
                let contact_id =
                    match contact::recipient_contact(self.store.as_ref(), mailbox, addr) {
                        Ok(id) => id,
                        Err(e) => {
                            warn!(message = %message.id, error = %e, "Skipping recipient");
                            continue;
                        }
                    };
                let row = MessageRecipient::new(
                    message.id,
                    contact_id,
                    addr.normalized(),
                    addr.display_name.clone(),
                    kind,
                );
                if let Err(e) = self.store.insert_recipient(row) {
                    warn!(message = %message.id, error = %e, "Could not store recipient");
                }
            }
        }
    }

    fn store_attachments(&self, mailbox: &Mailbox, message: &Message, parsed: &ParsedMessage) {
        for att in &parsed.attachments {
            let blob = Blob {
                id: BlobId::new(),
                mailbox_id: mailbox.id,
                sha256: att.sha256.clone(),
                size: att.size,
                content_type: att.content_type.clone(),
                content: att.content.clone(),
                created_at: Utc::now(),
            };
            let stored = self.store.upsert_blob(blob).and_then(|blob| {
                self.store.create_attachment(Attachment {
                    id: AttachmentId::new(),
                    mailbox_id: mailbox.id,
                    blob_id: blob.id,
                    name: att.name.clone(),
                    cid: att.cid.clone(),
                    inline: att.disposition == Disposition::Inline,
                    message_ids: vec![message.id],
                })
            });
            if let Err(e) = stored {
                warn!(message = %message.id, name = %att.name, error = %e, "Could not store attachment");
            }
        }
    }
}
