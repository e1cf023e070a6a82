//! Persistence boundary.
//!
//! The engine never owns storage. Every component receives an
//! `Arc<dyn Store>` and reads and writes entities through it, so a database
//! backend and the in-memory [`MemoryStore`] are interchangeable.

pub mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::entity::{
    Attachment, Blob, BlobId, Contact, ContactId, MailDomain, Mailbox, MailboxId, Message,
    MessageId, MessageRecipient, Thread, ThreadId,
};

/// Callback used by [`Store::recompute_thread`].
pub type ThreadUpdate<'a> = &'a mut dyn FnMut(&mut Thread, &[Message]);

/// Storage operations the engine needs.
pub trait Store: Send + Sync {
    fn find_domain(&self, name: &str) -> Result<Option<MailDomain>>;

    /// Create a domain, or return the existing one with the same name.
    fn create_domain(&self, name: &str) -> Result<MailDomain>;

    /// Look a mailbox up by local part and domain, case-insensitively.
    fn find_mailbox(&self, local_part: &str, domain: &str) -> Result<Option<Mailbox>>;

    /// Create a mailbox (and its domain when missing). Idempotent.
    fn create_mailbox(&self, local_part: &str, domain: &str) -> Result<Mailbox>;

    fn get_mailbox(&self, id: MailboxId) -> Result<Mailbox>;

    fn create_thread(&self, thread: Thread) -> Result<Thread>;

    fn get_thread(&self, id: ThreadId) -> Result<Thread>;

    /// Remove a thread that has no messages. Fails if it has any.
    fn delete_thread(&self, id: ThreadId) -> Result<()>;

    /// Threads of a mailbox, most recently active first.
    fn threads(&self, mailbox: MailboxId) -> Result<Vec<Thread>>;

    /// Attach a label to a thread. Adding an existing label is a no-op.
    fn add_thread_label(&self, id: ThreadId, label: &str) -> Result<()>;

    /// Run `update` on a thread and its messages while holding the thread's
    /// row lock, then persist and return the thread.
    ///
    /// Concurrent deliveries into the same thread serialize here, so counters
    /// always reflect every committed message.
    fn recompute_thread(&self, id: ThreadId, update: ThreadUpdate<'_>) -> Result<Thread>;

    /// Find a contact by lowercase email in a mailbox, creating it when
    /// missing. An existing empty name is filled in from `name`.
    fn upsert_contact(&self, mailbox: MailboxId, email: &str, name: &str) -> Result<Contact>;

    fn get_contact(&self, id: ContactId) -> Result<Contact>;

    fn insert_message(&self, message: Message) -> Result<Message>;

    fn update_message(&self, message: &Message) -> Result<()>;

    fn get_message(&self, id: MessageId) -> Result<Message>;

    /// Messages of a thread in insertion order.
    fn thread_messages(&self, thread: ThreadId) -> Result<Vec<Message>>;

    /// Messages whose `mime_id` is one of `mime_ids` and whose thread belongs
    /// to `mailbox`, newest `sent_at` first.
    fn find_messages_by_mime_ids(
        &self,
        mailbox: MailboxId,
        mime_ids: &[String],
    ) -> Result<Vec<Message>>;

    fn insert_recipient(&self, recipient: MessageRecipient) -> Result<MessageRecipient>;

    fn update_recipient(&self, recipient: &MessageRecipient) -> Result<()>;

    /// Recipients of a message in insertion order.
    fn recipients(&self, message: MessageId) -> Result<Vec<MessageRecipient>>;

    /// Recipients in `Retry` whose `retry_at` has passed.
    fn pending_recipients(&self, now: DateTime<Utc>) -> Result<Vec<MessageRecipient>>;

    /// Store a blob, or return the existing one with the same digest, size
    /// and content type in the mailbox.
    fn upsert_blob(&self, blob: Blob) -> Result<Blob>;

    fn get_blob(&self, id: BlobId) -> Result<Blob>;

    /// Link an attachment to its messages. An attachment with the same blob,
    /// name and content id in the mailbox is reused and gains the new
    /// message ids.
    fn create_attachment(&self, attachment: Attachment) -> Result<Attachment>;

    fn message_attachments(&self, message: MessageId) -> Result<Vec<Attachment>>;
}
