//! Persisted entities: mailboxes, threads, messages, contacts, recipients,
//! blobs and attachments.
//!
//! These are plain records. Persistence belongs to a [`crate::store::Store`]
//! implementation; the engine only reads and writes them through it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// A fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

entity_id!(DomainId);
entity_id!(MailboxId);
entity_id!(ThreadId);
entity_id!(MessageId);
entity_id!(ContactId);
entity_id!(RecipientId);
entity_id!(BlobId);
entity_id!(AttachmentId);

/// A mail domain served by this system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailDomain {
    pub id: DomainId,
    /// Lowercase domain name.
    pub name: String,
}

/// A mailbox, identified by `(local_part, domain)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: MailboxId,
    pub local_part: String,
    pub domain_id: DomainId,
    /// Domain name, denormalized from [`MailDomain`].
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

impl Mailbox {
    /// `local_part@domain`.
    pub fn address(&self) -> String {
        format!("{}@{}", self.local_part, self.domain)
    }
}

/// A conversation inside one mailbox.
///
/// Every counter and summary field is a projection of the thread's current
/// message set and is only ever written by a full recomputation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub mailbox_id: MailboxId,
    pub subject: String,
    pub snippet: String,
    /// Timestamp of the latest non-trashed message.
    pub messaged_at: Option<DateTime<Utc>>,
    /// Oldest and newest sender names (one entry when they coincide).
    pub sender_names: Vec<String>,
    pub count_unread: usize,
    pub count_trashed: usize,
    pub count_draft: usize,
    pub count_starred: usize,
    pub count_sender: usize,
    pub count_messages: usize,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    /// A new, empty thread. `count_unread` starts at one since it is created
    /// for an incoming message.
    pub fn new(mailbox_id: MailboxId, subject: impl Into<String>, snippet: impl Into<String>) -> Self {
        Self {
            id: ThreadId::new(),
            mailbox_id,
            subject: subject.into(),
            snippet: snippet.into(),
            messaged_at: None,
            sender_names: Vec::new(),
            count_unread: 1,
            count_trashed: 0,
            count_draft: 0,
            count_starred: 0,
            count_sender: 0,
            count_messages: 0,
            labels: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn has_unread(&self) -> bool {
        self.count_unread > 0
    }
}

/// A mailbox-scoped address-book entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub mailbox_id: MailboxId,
    /// Lowercase email address.
    pub email: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A message stored in a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: ContactId,
    /// The message this one replies to, when known to this system.
    pub parent_id: Option<MessageId>,
    /// Message-ID without angle brackets.
    pub mime_id: Option<String>,
    /// Cached `Subject:` header.
    pub subject: String,
    /// On-the-wire representation; authoritative once set.
    #[serde(skip)]
    pub raw_mime: Option<Vec<u8>>,
    pub is_draft: bool,
    pub is_sender: bool,
    pub is_starred: bool,
    pub is_trashed: bool,
    pub is_unread: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub trashed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A message skeleton with every flag cleared.
    pub fn new(thread_id: ThreadId, sender_id: ContactId, subject: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            thread_id,
            sender_id,
            parent_id: None,
            mime_id: None,
            subject: subject.into(),
            raw_mime: None,
            is_draft: false,
            is_sender: false,
            is_starred: false,
            is_trashed: false,
            is_unread: false,
            sent_at: None,
            read_at: None,
            trashed_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Recipient header a [`MessageRecipient`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientType {
    To,
    Cc,
    Bcc,
}

impl RecipientType {
    pub const ALL: [RecipientType; 3] = [Self::To, Self::Cc, Self::Bcc];
}

/// Per-recipient delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    None,
    Retry,
    Sent,
    Internal,
    Failed,
}

impl DeliveryStatus {
    /// No further delivery attempts happen from these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Internal | Self::Failed)
    }
}

/// Join of a message and one of its recipients.
///
/// `contact_id` is `None` when the recipient is the owning mailbox itself;
/// a mailbox never keeps a contact for its own address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecipient {
    pub id: RecipientId,
    pub message_id: MessageId,
    pub contact_id: Option<ContactId>,
    /// Lowercase email address.
    pub email: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RecipientType,
    pub delivery_status: DeliveryStatus,
    /// Last error text.
    pub delivery_message: Option<String>,
    pub retry_count: u32,
    pub retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl MessageRecipient {
    pub fn new(
        message_id: MessageId,
        contact_id: Option<ContactId>,
        email: impl Into<String>,
        name: impl Into<String>,
        kind: RecipientType,
    ) -> Self {
        Self {
            id: RecipientId::new(),
            message_id,
            contact_id,
            email: email.into(),
            name: name.into(),
            kind,
            delivery_status: DeliveryStatus::None,
            delivery_message: None,
            retry_count: 0,
            retry_at: None,
            delivered_at: None,
        }
    }

    /// Whether a dispatch at `now` should attempt this recipient.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.delivery_status,
            DeliveryStatus::None | DeliveryStatus::Retry
        ) && self.retry_at.map_or(true, |at| at <= now)
    }
}

/// Content-addressed payload, immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub id: BlobId,
    pub mailbox_id: MailboxId,
    /// Hex-encoded SHA-256 of `content`.
    pub sha256: String,
    pub size: usize,
    pub content_type: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Named link between a blob and the messages carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub mailbox_id: MailboxId,
    pub blob_id: BlobId,
    pub name: String,
    pub cid: Option<String>,
    pub inline: bool,
    pub message_ids: Vec<MessageId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_terminal_states() {
        assert!(DeliveryStatus::Sent.is_terminal());
        assert!(DeliveryStatus::Internal.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::None.is_terminal());
        assert!(!DeliveryStatus::Retry.is_terminal());
    }

    #[test]
    fn test_recipient_due() {
        let now = Utc::now();
        let mut rcpt = MessageRecipient::new(
            MessageId::new(),
            None,
            "a@b.com",
            "",
            RecipientType::To,
        );
        assert!(rcpt.is_due(now));

        rcpt.delivery_status = DeliveryStatus::Retry;
        rcpt.retry_at = Some(now + Duration::minutes(15));
        assert!(!rcpt.is_due(now));
        assert!(rcpt.is_due(now + Duration::minutes(16)));

        rcpt.delivery_status = DeliveryStatus::Failed;
        rcpt.retry_at = None;
        assert!(!rcpt.is_due(now));
    }

    #[test]
    fn test_mailbox_address() {
        let mailbox = Mailbox {
            id: MailboxId::new(),
            local_part: "bob".into(),
            domain_id: DomainId::new(),
            domain: "y.com".into(),
            created_at: Utc::now(),
        };
        assert_eq!(mailbox.address(), "bob@y.com");
    }
}
