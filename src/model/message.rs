//! Parsed and structured message representations.
//!
//! [`ParsedMessage`] is what the codec produces from raw bytes;
//! [`StructuredMessage`] is what it consumes to produce raw bytes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::address::EmailAddress;

/// A header value; repeated headers are promoted to a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multiple(Vec<String>),
}

impl HeaderValue {
    /// The first (or only) value.
    pub fn first(&self) -> &str {
        match self {
            Self::Single(v) => v,
            Self::Multiple(vs) => vs.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// All values in header order.
    pub fn all(&self) -> Vec<&str> {
        match self {
            Self::Single(v) => vec![v.as_str()],
            Self::Multiple(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            Self::Single(first) => {
                let first = std::mem::take(first);
                *self = Self::Multiple(vec![first, value]);
            }
            Self::Multiple(vs) => vs.push(value),
        }
    }
}

/// Lowercase header name → decoded value(s).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMap(BTreeMap<String, HeaderValue>);

impl HeaderMap {
    /// Insert a value, promoting to a list if the name is already present.
    pub fn append(&mut self, name: &str, value: String) {
        let key = name.to_lowercase();
        match self.0.get_mut(&key) {
            Some(existing) => existing.push(value),
            None => {
                self.0.insert(key, HeaderValue::Single(value));
            }
        }
    }

    /// Look up a header by (case-insensitive) name.
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0.get(&name.to_lowercase())
    }

    /// First value of a header.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).map(HeaderValue::first)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A `text/plain` or `text/html` body leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPart {
    /// Position of the part in the MIME tree (depth-first index).
    pub part_id: String,
    /// `text/plain` or `text/html`.
    #[serde(rename = "type")]
    pub content_type: String,
    /// Decoded text content.
    pub content: String,
}

/// How an attachment is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Embedded in the HTML body via `cid:`.
    Inline,
    /// Regular file attachment.
    Attachment,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Attachment => "attachment",
        }
    }
}

/// A non-body leaf part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedAttachment {
    /// MIME type, e.g. `image/png`.
    #[serde(rename = "type")]
    pub content_type: String,
    /// File name, `"unnamed"` when the part carries none.
    pub name: String,
    /// Decoded size in bytes.
    pub size: usize,
    pub disposition: Disposition,
    /// Content-ID without angle brackets.
    pub cid: Option<String>,
    /// Decoded content.
    #[serde(skip)]
    pub content: Vec<u8>,
    /// Hex-encoded SHA-256 of `content`.
    pub sha256: String,
}

/// Structured view of a raw RFC 5322 message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub subject: String,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    /// `Date:` header, or the caller-supplied default when missing/unparsable.
    pub date: DateTime<Utc>,
    /// Whether `date` came from the message itself.
    pub has_date: bool,
    /// Message-ID without angle brackets.
    pub message_id: Option<String>,
    /// In-Reply-To without angle brackets.
    pub in_reply_to: Option<String>,
    /// Raw References header value.
    pub references: Option<String>,
    pub headers: HeaderMap,
    pub text_body: Vec<BodyPart>,
    pub html_body: Vec<BodyPart>,
    pub attachments: Vec<ParsedAttachment>,
}

impl ParsedMessage {
    /// Content of the first `text/plain` body part.
    pub fn first_text(&self) -> Option<&str> {
        self.text_body.first().map(|p| p.content.as_str())
    }

    /// Content of the first `text/html` body part.
    pub fn first_html(&self) -> Option<&str> {
        self.html_body.first().map(|p| p.content.as_str())
    }

    /// The raw `In-Reply-To` and `References` header text, concatenated.
    pub fn threading_headers(&self) -> String {
        let mut out = String::new();
        if let Some(v) = self.headers.first("in-reply-to") {
            out.push_str(v);
        }
        if let Some(v) = &self.references {
            out.push(' ');
            out.push_str(v);
        }
        out
    }
}

/// An attachment to be written by the composer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftAttachment {
    pub content_type: String,
    pub name: String,
    pub content: Vec<u8>,
    /// Content-ID without angle brackets (for inline images).
    pub cid: Option<String>,
    pub disposition: Disposition,
}

impl DraftAttachment {
    /// Inline parts are the ones the HTML body references via `cid:`.
    pub fn is_inline(&self) -> bool {
        self.disposition == Disposition::Inline && self.cid.is_some()
    }
}

/// A message ready to be serialized by the composer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredMessage {
    pub subject: String,
    pub from: Option<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    /// RFC 5322 date string; missing or unparsable means "now".
    pub date: Option<String>,
    /// Message-ID without angle brackets.
    pub message_id: Option<String>,
    /// In-Reply-To without angle brackets.
    pub in_reply_to: Option<String>,
    /// Raw References value the caller already has.
    pub references: Option<String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<DraftAttachment>,
    /// Extra headers, written unless they collide with a standard one.
    pub headers: Vec<(String, String)>,
}
