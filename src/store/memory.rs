//! In-process [`Store`] used by the CLI dry runs and the tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::{MailError, Result};
use crate::model::entity::{
    Attachment, AttachmentId, Blob, BlobId, Contact, ContactId, DeliveryStatus, DomainId,
    MailDomain, Mailbox, MailboxId, Message, MessageId, MessageRecipient, RecipientId, Thread,
    ThreadId,
};
use crate::store::{Store, ThreadUpdate};

#[derive(Default)]
struct Tables {
    domains: HashMap<DomainId, MailDomain>,
    mailboxes: HashMap<MailboxId, Mailbox>,
    threads: HashMap<ThreadId, Thread>,
    contacts: HashMap<ContactId, Contact>,
    messages: HashMap<MessageId, Message>,
    /// Message ids per thread, in insertion order.
    thread_index: HashMap<ThreadId, Vec<MessageId>>,
    recipients: HashMap<RecipientId, MessageRecipient>,
    /// Recipient ids per message, in insertion order.
    recipient_index: HashMap<MessageId, Vec<RecipientId>>,
    blobs: HashMap<BlobId, Blob>,
    attachments: HashMap<AttachmentId, Attachment>,
    /// Attachment ids in insertion order.
    attachment_order: Vec<AttachmentId>,
}

/// A [`Store`] backed by hash maps behind one mutex.
///
/// Holding the mutex is the row lock for every thread at once.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every mailbox, oldest first.
    pub fn mailboxes(&self) -> Result<Vec<Mailbox>> {
        let t = self.lock()?;
        let mut out: Vec<Mailbox> = t.mailboxes.values().cloned().collect();
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }

    /// Contacts of a mailbox, sorted by email.
    pub fn contacts(&self, mailbox: MailboxId) -> Result<Vec<Contact>> {
        let t = self.lock()?;
        let mut out: Vec<Contact> = t
            .contacts
            .values()
            .filter(|c| c.mailbox_id == mailbox)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(out)
    }

    pub fn message_count(&self) -> Result<usize> {
        Ok(self.lock()?.messages.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| MailError::Storage("store mutex poisoned".into()))
    }
}

impl Tables {
    fn find_domain(&self, name: &str) -> Option<&MailDomain> {
        let name = name.to_lowercase();
        self.domains.values().find(|d| d.name == name)
    }

    fn find_mailbox(&self, local_part: &str, domain: &str) -> Option<&Mailbox> {
        let local_part = local_part.to_lowercase();
        let domain = domain.to_lowercase();
        self.mailboxes
            .values()
            .find(|m| m.local_part == local_part && m.domain == domain)
    }

    fn create_domain(&mut self, name: &str) -> MailDomain {
        if let Some(existing) = self.find_domain(name) {
            return existing.clone();
        }
        let domain = MailDomain {
            id: DomainId::new(),
            name: name.to_lowercase(),
        };
        self.domains.insert(domain.id, domain.clone());
        domain
    }
}

impl Store for MemoryStore {
    fn find_domain(&self, name: &str) -> Result<Option<MailDomain>> {
        Ok(self.lock()?.find_domain(name).cloned())
    }

    fn create_domain(&self, name: &str) -> Result<MailDomain> {
        Ok(self.lock()?.create_domain(name))
    }

    fn find_mailbox(&self, local_part: &str, domain: &str) -> Result<Option<Mailbox>> {
        Ok(self.lock()?.find_mailbox(local_part, domain).cloned())
    }

    fn create_mailbox(&self, local_part: &str, domain: &str) -> Result<Mailbox> {
        let mut t = self.lock()?;
        if let Some(existing) = t.find_mailbox(local_part, domain) {
            return Ok(existing.clone());
        }
        let d = t.create_domain(domain);
        let mailbox = Mailbox {
            id: MailboxId::new(),
            local_part: local_part.to_lowercase(),
            domain_id: d.id,
            domain: d.name,
            created_at: Utc::now(),
        };
        t.mailboxes.insert(mailbox.id, mailbox.clone());
        Ok(mailbox)
    }

    fn get_mailbox(&self, id: MailboxId) -> Result<Mailbox> {
        self.lock()?
            .mailboxes
            .get(&id)
            .cloned()
            .ok_or_else(|| MailError::not_found("Mailbox", id))
    }

    fn create_thread(&self, thread: Thread) -> Result<Thread> {
        let mut t = self.lock()?;
        if !t.mailboxes.contains_key(&thread.mailbox_id) {
            return Err(MailError::not_found("Mailbox", thread.mailbox_id));
        }
        t.thread_index.entry(thread.id).or_default();
        t.threads.insert(thread.id, thread.clone());
        Ok(thread)
    }

    fn get_thread(&self, id: ThreadId) -> Result<Thread> {
        self.lock()?
            .threads
            .get(&id)
            .cloned()
            .ok_or_else(|| MailError::not_found("Thread", id))
    }

    fn delete_thread(&self, id: ThreadId) -> Result<()> {
        let mut t = self.lock()?;
        if !t.threads.contains_key(&id) {
            return Err(MailError::not_found("Thread", id));
        }
        if t.thread_index.get(&id).is_some_and(|ids| !ids.is_empty()) {
            return Err(MailError::Storage(format!("thread {id} still has messages")));
        }
        t.threads.remove(&id);
        t.thread_index.remove(&id);
        Ok(())
    }

    fn threads(&self, mailbox: MailboxId) -> Result<Vec<Thread>> {
        let t = self.lock()?;
        let mut out: Vec<Thread> = t
            .threads
            .values()
            .filter(|th| th.mailbox_id == mailbox)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.messaged_at
                .cmp(&a.messaged_at)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(out)
    }

    fn add_thread_label(&self, id: ThreadId, label: &str) -> Result<()> {
        let mut t = self.lock()?;
        let thread = t
            .threads
            .get_mut(&id)
            .ok_or_else(|| MailError::not_found("Thread", id))?;
        if !thread.labels.iter().any(|l| l == label) {
            thread.labels.push(label.to_string());
        }
        Ok(())
    }

    fn recompute_thread(&self, id: ThreadId, update: ThreadUpdate<'_>) -> Result<Thread> {
        let mut t = self.lock()?;
        let messages: Vec<Message> = t
            .thread_index
            .get(&id)
            .map(|ids| ids.iter().filter_map(|m| t.messages.get(m).cloned()).collect())
            .unwrap_or_default();
        let thread = t
            .threads
            .get_mut(&id)
            .ok_or_else(|| MailError::not_found("Thread", id))?;
        update(thread, &messages);
        Ok(thread.clone())
    }

    fn upsert_contact(&self, mailbox: MailboxId, email: &str, name: &str) -> Result<Contact> {
        let email = email.trim().to_lowercase();
        let mut t = self.lock()?;
        if let Some(existing) = t
            .contacts
            .values_mut()
            .find(|c| c.mailbox_id == mailbox && c.email == email)
        {
            if existing.name.is_empty() && !name.is_empty() {
                existing.name = name.to_string();
            }
            return Ok(existing.clone());
        }
        let contact = Contact {
            id: ContactId::new(),
            mailbox_id: mailbox,
            email,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        t.contacts.insert(contact.id, contact.clone());
        Ok(contact)
    }

    fn get_contact(&self, id: ContactId) -> Result<Contact> {
        self.lock()?
            .contacts
            .get(&id)
            .cloned()
            .ok_or_else(|| MailError::not_found("Contact", id))
    }

    fn insert_message(&self, message: Message) -> Result<Message> {
        let mut t = self.lock()?;
        if !t.threads.contains_key(&message.thread_id) {
            return Err(MailError::not_found("Thread", message.thread_id));
        }
        t.thread_index
            .entry(message.thread_id)
            .or_default()
            .push(message.id);
        t.messages.insert(message.id, message.clone());
        Ok(message)
    }

    fn update_message(&self, message: &Message) -> Result<()> {
        let mut t = self.lock()?;
        let slot = t
            .messages
            .get_mut(&message.id)
            .ok_or_else(|| MailError::not_found("Message", message.id))?;
        if slot.thread_id != message.thread_id {
            return Err(MailError::Storage(format!(
                "message {} cannot move between threads",
                message.id
            )));
        }
        *slot = message.clone();
        Ok(())
    }

    fn get_message(&self, id: MessageId) -> Result<Message> {
        self.lock()?
            .messages
            .get(&id)
            .cloned()
            .ok_or_else(|| MailError::not_found("Message", id))
    }

    fn thread_messages(&self, thread: ThreadId) -> Result<Vec<Message>> {
        let t = self.lock()?;
        Ok(t.thread_index
            .get(&thread)
            .map(|ids| ids.iter().filter_map(|m| t.messages.get(m).cloned()).collect())
            .unwrap_or_default())
    }

    fn find_messages_by_mime_ids(
        &self,
        mailbox: MailboxId,
        mime_ids: &[String],
    ) -> Result<Vec<Message>> {
        if mime_ids.is_empty() {
            return Ok(Vec::new());
        }
        let t = self.lock()?;
        let mut out: Vec<Message> = t
            .messages
            .values()
            .filter(|m| {
                m.mime_id
                    .as_ref()
                    .is_some_and(|id| mime_ids.iter().any(|c| c == id))
            })
            .filter(|m| {
                t.threads
                    .get(&m.thread_id)
                    .is_some_and(|th| th.mailbox_id == mailbox)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.sent_at
                .cmp(&a.sent_at)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(out)
    }

    fn insert_recipient(&self, recipient: MessageRecipient) -> Result<MessageRecipient> {
        let mut t = self.lock()?;
        if !t.messages.contains_key(&recipient.message_id) {
            return Err(MailError::not_found("Message", recipient.message_id));
        }
        t.recipient_index
            .entry(recipient.message_id)
            .or_default()
            .push(recipient.id);
        t.recipients.insert(recipient.id, recipient.clone());
        Ok(recipient)
    }

    fn update_recipient(&self, recipient: &MessageRecipient) -> Result<()> {
        let mut t = self.lock()?;
        let slot = t
            .recipients
            .get_mut(&recipient.id)
            .ok_or_else(|| MailError::not_found("Recipient", recipient.id))?;
        *slot = recipient.clone();
        Ok(())
    }

    fn recipients(&self, message: MessageId) -> Result<Vec<MessageRecipient>> {
        let t = self.lock()?;
        Ok(t.recipient_index
            .get(&message)
            .map(|ids| ids.iter().filter_map(|r| t.recipients.get(r).cloned()).collect())
            .unwrap_or_default())
    }

    fn pending_recipients(&self, now: DateTime<Utc>) -> Result<Vec<MessageRecipient>> {
        let t = self.lock()?;
        let mut out: Vec<MessageRecipient> = t
            .recipients
            .values()
            .filter(|r| r.delivery_status == DeliveryStatus::Retry && r.is_due(now))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.retry_at);
        Ok(out)
    }

    fn upsert_blob(&self, blob: Blob) -> Result<Blob> {
        let mut t = self.lock()?;
        if let Some(existing) = t.blobs.values().find(|b| {
            b.mailbox_id == blob.mailbox_id
                && b.sha256 == blob.sha256
                && b.size == blob.size
                && b.content_type == blob.content_type
        }) {
            return Ok(existing.clone());
        }
        t.blobs.insert(blob.id, blob.clone());
        Ok(blob)
    }

    fn get_blob(&self, id: BlobId) -> Result<Blob> {
        self.lock()?
            .blobs
            .get(&id)
            .cloned()
            .ok_or_else(|| MailError::not_found("Blob", id))
    }

    fn create_attachment(&self, attachment: Attachment) -> Result<Attachment> {
        let mut t = self.lock()?;
        if !t.blobs.contains_key(&attachment.blob_id) {
            return Err(MailError::not_found("Blob", attachment.blob_id));
        }
        if let Some(existing) = t.attachments.values_mut().find(|a| {
            a.mailbox_id == attachment.mailbox_id
                && a.blob_id == attachment.blob_id
                && a.name == attachment.name
                && a.cid == attachment.cid
        }) {
            for id in &attachment.message_ids {
                if !existing.message_ids.contains(id) {
                    existing.message_ids.push(*id);
                }
            }
            return Ok(existing.clone());
        }
        t.attachment_order.push(attachment.id);
        t.attachments.insert(attachment.id, attachment.clone());
        Ok(attachment)
    }

    fn message_attachments(&self, message: MessageId) -> Result<Vec<Attachment>> {
        let t = self.lock()?;
        Ok(t.attachment_order
            .iter()
            .filter_map(|id| t.attachments.get(id))
            .filter(|a| a.message_ids.contains(&message))
            .cloned()
            .collect())
    }
}
