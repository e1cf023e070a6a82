//! Serialize a [`StructuredMessage`] into RFC 5322 / MIME bytes.
//!
//! Topology, by priority:
//! - text only → `text/plain`
//! - HTML only → `text/html`
//! - text + HTML → `multipart/alternative`
//! - HTML + inline parts → `multipart/related` around the above
//! - any regular attachment → `multipart/mixed` around the above plus
//!   one sibling part per attachment

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::error::{MailError, Result};
use crate::model::address::EmailAddress;
use crate::model::message::{DraftAttachment, StructuredMessage};
use crate::parser::header;

/// Headers the composer writes itself; custom headers with these names are dropped.
const RESERVED_HEADERS: &[&str] = &[
    "from",
    "to",
    "cc",
    "bcc",
    "subject",
    "date",
    "message-id",
    "in-reply-to",
    "references",
    "mime-version",
    "content-type",
    "content-transfer-encoding",
    "content-disposition",
];

/// Longest line allowed in a 7bit body before switching to base64.
const MAX_7BIT_LINE: usize = 998;

/// A node of the MIME tree being written.
enum Node<'a> {
    Text {
        subtype: &'static str,
        content: &'a str,
    },
    File(&'a DraftAttachment),
    Multi {
        subtype: &'static str,
        children: Vec<Node<'a>>,
    },
}

/// Compose a draft into raw message bytes.
///
/// When `in_reply_to` (without angle brackets) is given, `In-Reply-To` is set
/// and the id is appended to the draft's own `References`.
pub fn compose_message(draft: &StructuredMessage, in_reply_to: Option<&str>) -> Result<Vec<u8>> {
    let from = draft
        .from
        .as_ref()
        .filter(|f| !f.address.trim().is_empty())
        .ok_or_else(|| MailError::Compose("missing sender address".into()))?;

    let mut out = Vec::with_capacity(1024);

    append_header(&mut out, "From", &from.to_header());
    append_address_header(&mut out, "To", &draft.to);
    append_address_header(&mut out, "Cc", &draft.cc);
    append_address_header(&mut out, "Bcc", &draft.bcc);
    append_header(&mut out, "Subject", &encode_if_needed(&draft.subject));

    let date = draft
        .date
        .as_deref()
        .and_then(header::parse_date)
        .unwrap_or_else(Utc::now);
    append_header(&mut out, "Date", &header::format_date(&date));

    let message_id = draft
        .message_id
        .clone()
        .unwrap_or_else(|| generate_message_id(from));
    append_header(&mut out, "Message-ID", &format!("<{message_id}>"));

    let in_reply_to = in_reply_to
        .or(draft.in_reply_to.as_deref())
        .and_then(header::strip_angle_brackets);
    if let Some(parent) = in_reply_to {
        append_header(&mut out, "In-Reply-To", &format!("<{parent}>"));
        let mut refs = draft.references.clone().unwrap_or_default();
        if !header::message_id_tokens(&refs).contains(&parent) {
            if !refs.trim().is_empty() {
                refs.push(' ');
            }
            refs.push_str(&format!("<{parent}>"));
        }
        append_header(&mut out, "References", refs.trim());
    } else if let Some(refs) = draft.references.as_deref().filter(|r| !r.trim().is_empty()) {
        append_header(&mut out, "References", refs.trim());
    }

    append_header(&mut out, "MIME-Version", "1.0");

    for (name, value) in &draft.headers {
        let lower = name.trim().to_lowercase();
        if !is_field_name(&lower) {
            warn!(header = %name.escape_debug(), "Dropping header with an invalid name");
            continue;
        }
        if RESERVED_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        append_header(&mut out, name.trim(), &encode_if_needed(value));
    }

    write_node(&mut out, &build_tree(draft));
    Ok(out)
}

/// A fresh Message-ID (without brackets) in the sender's domain.
pub fn generate_message_id(from: &EmailAddress) -> String {
    let domain = from.split().map(|(_, d)| d).unwrap_or("localhost");
    format!("{}@{}", Uuid::new_v4().simple(), domain.to_lowercase())
}

fn build_tree(draft: &StructuredMessage) -> Node<'_> {
    let text = draft
        .text_body
        .as_deref()
        .filter(|t| !t.is_empty())
        .map(|content| Node::Text {
            subtype: "plain",
            content,
        });
    let html = draft
        .html_body
        .as_deref()
        .filter(|h| !h.is_empty())
        .map(|content| Node::Text {
            subtype: "html",
            content,
        });
    let has_html = html.is_some();

    let mut content = match (text, html) {
        (Some(t), Some(h)) => Node::Multi {
            subtype: "alternative",
            children: vec![t, h],
        },
        (Some(t), None) => t,
        (None, Some(h)) => h,
        (None, None) => Node::Text {
            subtype: "plain",
            content: "",
        },
    };

    let (inline, regular): (Vec<&DraftAttachment>, Vec<&DraftAttachment>) = draft
        .attachments
        .iter()
        .partition(|a| has_html && a.is_inline());

    if !inline.is_empty() {
        let mut children = vec![content];
        children.extend(inline.into_iter().map(Node::File));
        content = Node::Multi {
            subtype: "related",
            children,
        };
    }

    if !regular.is_empty() {
        let mut children = vec![content];
        children.extend(regular.into_iter().map(Node::File));
        content = Node::Multi {
            subtype: "mixed",
            children,
        };
    }

    content
}

fn write_node(out: &mut Vec<u8>, node: &Node<'_>) {
    match node {
        Node::Text { subtype, content } => {
            append_header(out, "Content-Type", &format!("text/{subtype}; charset=utf-8"));
            if needs_base64(content) {
                append_header(out, "Content-Transfer-Encoding", "base64");
                out.extend_from_slice(b"\r\n");
                append_base64(out, content.as_bytes());
            } else {
                append_header(out, "Content-Transfer-Encoding", "7bit");
                out.extend_from_slice(b"\r\n");
                append_crlf_text(out, content);
            }
        }
        Node::File(att) => {
            let name = quote_param(&att.name);
            append_header(
                out,
                "Content-Type",
                &format!("{}; name={}", att.content_type, name),
            );
            let disposition = if att.is_inline() { "inline" } else { "attachment" };
            append_header(
                out,
                "Content-Disposition",
                &format!("{disposition}; filename={name}"),
            );
            if let Some(cid) = &att.cid {
                append_header(out, "Content-ID", &format!("<{cid}>"));
            }
            append_header(out, "Content-Transfer-Encoding", "base64");
            out.extend_from_slice(b"\r\n");
            append_base64(out, &att.content);
        }
        Node::Multi { subtype, children } => {
            let boundary = format!("=_{}", Uuid::new_v4().simple());
            append_header(
                out,
                "Content-Type",
                &format!("multipart/{subtype}; boundary=\"{boundary}\""),
            );
            out.extend_from_slice(b"\r\n");
            for child in children {
                out.extend_from_slice(b"--");
                out.extend_from_slice(boundary.as_bytes());
                out.extend_from_slice(b"\r\n");
                write_node(out, child);
            }
            out.extend_from_slice(b"--");
            out.extend_from_slice(boundary.as_bytes());
            out.extend_from_slice(b"--\r\n");
        }
    }
}

/// RFC 5322 field name: printable ASCII other than `:`, at least one.
fn is_field_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic() && b != b':')
}

fn append_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    // Embedded line breaks, bare CR included, become folds
    let lines = value.split(['\r', '\n']).map(str::trim).filter(|l| !l.is_empty());
    for (i, line) in lines.enumerate() {
        if i > 0 {
            out.extend_from_slice(b"\r\n ");
        }
        out.extend_from_slice(line.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
}

fn append_address_header(out: &mut Vec<u8>, name: &str, addrs: &[EmailAddress]) {
    if addrs.is_empty() {
        return;
    }
    let values: Vec<String> = addrs.iter().map(EmailAddress::to_header).collect();
    append_header(out, name, &values.join(", "));
}

fn append_base64(out: &mut Vec<u8>, data: &[u8]) {
    let encoded = STANDARD.encode(data);
    for chunk in encoded.as_bytes().chunks(76) {
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
}

/// Write text with every line terminated by CRLF.
fn append_crlf_text(out: &mut Vec<u8>, text: &str) {
    for line in text.lines() {
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

fn needs_base64(text: &str) -> bool {
    !text.is_ascii() || text.lines().any(|l| l.len() > MAX_7BIT_LINE)
}

/// Quote a MIME parameter value, encoding non-ASCII text.
fn quote_param(value: &str) -> String {
    let value = if value.trim().is_empty() { "unnamed" } else { value };
    let escaped = encode_if_needed(value)
        .replace('\\', "\\\\")
        .replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn encode_if_needed(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        encode_word(value)
    }
}

/// RFC 2047 `B` encoding in UTF-8, split into words that stay under the
/// 75-character limit.
pub fn encode_word(value: &str) -> String {
    const MAX_CHUNK_BYTES: usize = 45;
    let mut words = Vec::new();
    let mut chunk = String::new();
    for ch in value.chars() {
        if chunk.len() + ch.len_utf8() > MAX_CHUNK_BYTES {
            words.push(format!("=?utf-8?B?{}?=", STANDARD.encode(chunk.as_bytes())));
            chunk.clear();
        }
        chunk.push(ch);
    }
    if !chunk.is_empty() {
        words.push(format!("=?utf-8?B?{}?=", STANDARD.encode(chunk.as_bytes())));
    }
    words.join("\r\n ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::Disposition;
    use crate::parser::{header::decode_encoded_words, mime::parse_message};

    fn draft() -> StructuredMessage {
        StructuredMessage {
            subject: "Status".into(),
            from: Some(EmailAddress::new("Alice", "alice@x.com")),
            to: vec![EmailAddress::new("", "bob@y.com")],
            ..Default::default()
        }
    }

    fn attachment(name: &str, cid: Option<&str>, disposition: Disposition) -> DraftAttachment {
        DraftAttachment {
            content_type: "image/png".into(),
            name: name.into(),
            content: vec![0x89, b'P', b'N', b'G'],
            cid: cid.map(String::from),
            disposition,
        }
    }

    fn top_content_type(raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw).to_string();
        let headers = header::unfold_headers(&String::from_utf8_lossy(header::header_block(raw)));
        header::get_header(&headers, "content-type")
            .map(str::to_string)
            .unwrap_or(text)
    }

    #[test]
    fn test_missing_from_fails() {
        let mut d = draft();
        d.from = None;
        assert!(matches!(compose_message(&d, None), Err(MailError::Compose(_))));
        d.from = Some(EmailAddress::new("Name", " "));
        assert!(matches!(compose_message(&d, None), Err(MailError::Compose(_))));
    }

    #[test]
    fn test_topology_selection() {
        let mut d = draft();
        d.text_body = Some("hi".into());
        assert!(top_content_type(&compose_message(&d, None).unwrap()).starts_with("text/plain"));

        d.text_body = None;
        d.html_body = Some("<p>hi</p>".into());
        assert!(top_content_type(&compose_message(&d, None).unwrap()).starts_with("text/html"));

        d.text_body = Some("hi".into());
        assert!(top_content_type(&compose_message(&d, None).unwrap())
            .starts_with("multipart/alternative"));

        d.attachments = vec![attachment("logo.png", Some("logo"), Disposition::Inline)];
        assert!(top_content_type(&compose_message(&d, None).unwrap())
            .starts_with("multipart/related"));

        d.attachments
            .push(attachment("file.png", None, Disposition::Attachment));
        assert!(top_content_type(&compose_message(&d, None).unwrap())
            .starts_with("multipart/mixed"));
    }

    #[test]
    fn test_inline_without_html_becomes_regular() {
        let mut d = draft();
        d.text_body = Some("hi".into());
        d.attachments = vec![attachment("logo.png", Some("logo"), Disposition::Inline)];
        let raw = compose_message(&d, None).unwrap();
        assert!(top_content_type(&raw).starts_with("multipart/mixed"));
    }

    #[test]
    fn test_roundtrip_text_and_html() {
        let mut d = draft();
        d.cc = vec![EmailAddress::new("Doe, Carol", "carol@z.com")];
        d.text_body = Some("Plain body".into());
        d.html_body = Some("<p>Html body</p>".into());
        let raw = compose_message(&d, None).unwrap();
        let parsed = parse_message(&raw).unwrap();
        assert_eq!(parsed.subject, "Status");
        assert_eq!(parsed.from.address, "alice@x.com");
        assert_eq!(parsed.to[0].address, "bob@y.com");
        assert_eq!(parsed.cc[0].display_name, "Doe, Carol");
        assert_eq!(parsed.first_text().map(str::trim), Some("Plain body"));
        assert_eq!(parsed.first_html().map(str::trim), Some("<p>Html body</p>"));
        assert!(parsed.message_id.as_deref().unwrap_or("").ends_with("@x.com"));
    }

    #[test]
    fn test_roundtrip_non_ascii() {
        let mut d = draft();
        d.subject = "Café con leña, ¿qué tal? ".repeat(4).trim().to_string();
        d.from = Some(EmailAddress::new("José García", "jose@x.com"));
        d.text_body = Some("Ünïcödé body".into());
        let raw = compose_message(&d, None).unwrap();
        assert!(raw.is_ascii());
        let parsed = parse_message(&raw).unwrap();
        assert_eq!(parsed.subject, d.subject);
        assert_eq!(parsed.from.display_name, "José García");
        assert_eq!(parsed.first_text().map(str::trim), Some("Ünïcödé body"));
    }

    #[test]
    fn test_reply_headers_append_references() {
        let mut d = draft();
        d.text_body = Some("ok".into());
        d.references = Some("<root@x.com>".into());
        let raw = compose_message(&d, Some("parent@x.com")).unwrap();
        let parsed = parse_message(&raw).unwrap();
        assert_eq!(parsed.in_reply_to.as_deref(), Some("parent@x.com"));
        assert_eq!(
            parsed.references.as_deref(),
            Some("<root@x.com> <parent@x.com>")
        );
    }

    #[test]
    fn test_custom_headers_do_not_override_standard() {
        let mut d = draft();
        d.text_body = Some("ok".into());
        d.headers = vec![
            ("Subject".into(), "Injected".into()),
            ("X-Mailer".into(), "mailengine".into()),
        ];
        let parsed = parse_message(&compose_message(&d, None).unwrap()).unwrap();
        assert_eq!(parsed.subject, "Status");
        assert_eq!(parsed.headers.first("x-mailer"), Some("mailengine"));
    }

    #[test]
    fn test_custom_header_names_cannot_inject() {
        let mut d = draft();
        d.text_body = Some("ok".into());
        d.headers = vec![
            ("X-Evil\r\nBcc".into(), "victim@example.net".into()),
            ("X-Bad: Name".into(), "v".into()),
            ("X Space".into(), "v".into()),
            ("X-Note".into(), "line one\rBcc: victim@example.net".into()),
        ];
        let raw = compose_message(&d, None).unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(!text.contains("\r\nBcc"));
        assert!(!text.contains("X-Bad"));
        assert!(!text.contains("X Space"));
        assert!(text.contains("X-Note: line one\r\n Bcc: victim@example.net\r\n"));

        let parsed = parse_message(&raw).unwrap();
        assert!(parsed.bcc.is_empty());
        assert_eq!(parsed.subject, "Status");
    }

    #[test]
    fn test_explicit_date_and_message_id() {
        let mut d = draft();
        d.date = Some("Thu, 04 Jan 2024 10:00:00 +0000".into());
        d.message_id = Some("fixed@x.com".into());
        let parsed = parse_message(&compose_message(&d, None).unwrap()).unwrap();
        assert_eq!(parsed.message_id.as_deref(), Some("fixed@x.com"));
        assert_eq!(parsed.date.format("%Y-%m-%d").to_string(), "2024-01-04");

        d.date = Some("garbage".into());
        let parsed = parse_message(&compose_message(&d, None).unwrap()).unwrap();
        assert!(parsed.has_date);
    }

    #[test]
    fn test_attachment_roundtrip() {
        let mut d = draft();
        d.html_body = Some("<img src=\"cid:logo\">".into());
        d.attachments = vec![
            attachment("logo.png", Some("logo"), Disposition::Inline),
            attachment("report.png", None, Disposition::Attachment),
        ];
        let parsed = parse_message(&compose_message(&d, None).unwrap()).unwrap();
        assert_eq!(parsed.html_body.len(), 1);
        assert_eq!(parsed.attachments.len(), 2);
        assert_eq!(parsed.attachments[0].disposition, Disposition::Inline);
        assert_eq!(parsed.attachments[0].cid.as_deref(), Some("logo"));
        assert_eq!(parsed.attachments[1].name, "report.png");
        assert_eq!(parsed.attachments[1].content, vec![0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn test_encode_word_splits_long_values() {
        let long = "ñ".repeat(60);
        let encoded = encode_word(&long);
        assert!(encoded.split("\r\n ").all(|w| w.len() <= 75));
        let unfolded = encoded.replace("\r\n", "");
        assert_eq!(decode_encoded_words(&unfolded), long);
    }
}
