//! MIME message parsing: header projection, body/attachment classification,
//! HTML-to-text conversion and snippets.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{MailError, Result};
use crate::model::address::EmailAddress;
use crate::model::message::{BodyPart, Disposition, ParsedAttachment, ParsedMessage};
use crate::parser::header;

/// File name used for attachments that carry none.
pub const UNNAMED: &str = "unnamed";

/// Parse a raw RFC 5322 message, using "now" for a missing `Date:`.
pub fn parse_message(raw: &[u8]) -> Result<ParsedMessage> {
    parse_message_with_date(raw, Utc::now())
}

/// Parse a raw RFC 5322 message.
///
/// `default_date` is used when the `Date:` header is missing or unparsable.
/// Fails only when the input is empty or cannot be read as a MIME message at
/// all; odd structure degrades to whatever could be recovered.
pub fn parse_message_with_date(raw: &[u8], default_date: DateTime<Utc>) -> Result<ParsedMessage> {
    if raw.is_empty() {
        return Err(MailError::Parse("empty input".into()));
    }
    let message_bytes = skip_from_line(raw);

    let text = header::decode_header_bytes(header::header_block(message_bytes));
    let headers = header::unfold_headers(&text);
    if headers.is_empty() {
        return Err(MailError::Parse("no headers found".into()));
    }

    let msg = MessageParser::default()
        .parse(message_bytes)
        .ok_or_else(|| MailError::Parse("not a MIME message".into()))?;

    let addresses = |name: &str| {
        header::get_header_joined(&headers, name)
            .map(|v| EmailAddress::parse_list(&header::decode_encoded_words(&v)))
            .unwrap_or_default()
    };

    let from = header::get_header(&headers, "from")
        .map(|v| EmailAddress::parse(&header::decode_encoded_words(v)))
        .unwrap_or_default();

    let subject = header::get_header(&headers, "subject")
        .map(header::decode_encoded_words)
        .unwrap_or_default();

    let parsed_date = header::get_header(&headers, "date").and_then(header::parse_date);

    let references = header::get_header_joined(&headers, "references")
        .map(|r| r.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|r| !r.is_empty());

    let mut parsed = ParsedMessage {
        subject,
        from,
        to: addresses("to"),
        cc: addresses("cc"),
        bcc: addresses("bcc"),
        date: parsed_date.unwrap_or(default_date),
        has_date: parsed_date.is_some(),
        message_id: header::get_header(&headers, "message-id")
            .and_then(header::strip_angle_brackets),
        in_reply_to: header::get_header(&headers, "in-reply-to")
            .and_then(|v| header::message_id_tokens(v).into_iter().next().or_else(|| header::strip_angle_brackets(v))),
        references,
        headers: header::header_map(&headers),
        text_body: Vec::new(),
        html_body: Vec::new(),
        attachments: Vec::new(),
    };

    classify_parts(&msg, &mut parsed);

    debug!(
        message_id = parsed.message_id.as_deref().unwrap_or(""),
        text_parts = parsed.text_body.len(),
        html_parts = parsed.html_body.len(),
        attachments = parsed.attachments.len(),
        "Parsed message"
    );

    Ok(parsed)
}

/// Sort every leaf part into text body, HTML body or attachments.
fn classify_parts(msg: &mail_parser::Message<'_>, out: &mut ParsedMessage) {
    for (idx, part) in msg.parts.iter().enumerate() {
        if matches!(part.body, PartType::Multipart(_)) {
            continue;
        }

        let declared_type = part.content_type().map(|ct| match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub).to_lowercase(),
            None => ct.ctype().to_lowercase(),
        });
        let content_type = declared_type.unwrap_or_else(|| match part.body {
            PartType::Text(_) => "text/plain".to_string(),
            PartType::Html(_) => "text/html".to_string(),
            PartType::Message(_) => "message/rfc822".to_string(),
            _ => "application/octet-stream".to_string(),
        });

        let disposition = part
            .content_disposition()
            .map(|d| d.ctype().to_lowercase());
        let filename = part.attachment_name().map(str::to_string);
        let cid = part.content_id().and_then(header::strip_angle_brackets);

        // (a) explicit disposition or filename: always an attachment
        if disposition.is_some() || filename.is_some() {
            let is_inline = disposition.as_deref() == Some("inline") && cid.is_some();
            let content_type = if disposition.as_deref() == Some("attachment")
                && content_type == "text/plain"
            {
                "application/octet-stream".to_string()
            } else {
                content_type
            };
            out.attachments.push(make_attachment(
                content_type,
                filename,
                if is_inline {
                    Disposition::Inline
                } else {
                    Disposition::Attachment
                },
                cid,
                part.contents(),
            ));
            continue;
        }

        // (b) bare text/plain or text/html: body part
        if content_type == "text/plain" || content_type == "text/html" {
            let content = match &part.body {
                PartType::Text(t) | PartType::Html(t) => t.to_string(),
                _ => String::from_utf8_lossy(part.contents()).into_owned(),
            };
            let body = BodyPart {
                part_id: idx.to_string(),
                content_type: content_type.clone(),
                content,
            };
            if content_type == "text/plain" {
                out.text_body.push(body);
            } else {
                out.html_body.push(body);
            }
            continue;
        }

        // (c) any other leaf
        out.attachments.push(make_attachment(
            content_type,
            None,
            Disposition::Attachment,
            cid,
            part.contents(),
        ));
    }
}

fn make_attachment(
    content_type: String,
    name: Option<String>,
    disposition: Disposition,
    cid: Option<String>,
    content: &[u8],
) -> ParsedAttachment {
    ParsedAttachment {
        content_type,
        name: name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| UNNAMED.to_string()),
        size: content.len(),
        disposition,
        cid,
        sha256: sha256_hex(content),
        content: content.to_vec(),
    }
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Skip the `From ` separator line at the start of MBOX messages.
fn skip_from_line(data: &[u8]) -> &[u8] {
    let data = data.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(data);

    if data.starts_with(b"From ") {
        if let Some(pos) = data.iter().position(|&b| b == b'\n') {
            return &data[pos + 1..];
        }
    }
    data
}

/// Build a one-line preview of a message.
///
/// Uses the first text part, else the first HTML part with tags stripped,
/// else the subject, else `placeholder`. Whitespace is collapsed and the
/// result is cut to `max_chars` characters.
pub fn snippet(parsed: &ParsedMessage, max_chars: usize, placeholder: &str) -> String {
    let from_text = parsed.first_text().map(collapse_whitespace);
    let from_html = || parsed.first_html().map(|h| collapse_whitespace(&html_to_text(h)));

    let text = from_text
        .filter(|t| !t.is_empty())
        .or_else(|| from_html().filter(|t| !t.is_empty()))
        .or_else(|| Some(collapse_whitespace(&parsed.subject)).filter(|s| !s.is_empty()))
        .unwrap_or_else(|| placeholder.to_string());

    truncate_chars(&text, max_chars)
}

/// Replace every run of whitespace with a single space and trim.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((pos, _)) => s[..pos].to_string(),
        None => s.to_string(),
    }
}

/// Convert HTML to plain text.
///
/// - Preserves line breaks from `<br>`, `<p>`, `<div>`
/// - Removes scripts and styles
/// - Decodes common HTML entities
pub fn html_to_text(html: &str) -> String {
    let mut text = remove_tag_block(html, "script");
    text = remove_tag_block(&text, "style");
    text = remove_tag_block(&text, "head");

    let mut result = String::with_capacity(text.len());
    let mut tag = String::new();
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name = tag
                    .trim_start_matches('/')
                    .split(|c: char| c.is_whitespace() || c == '/')
                    .next()
                    .unwrap_or("")
                    .to_lowercase();
                if matches!(
                    name.as_str(),
                    "br" | "p" | "div" | "tr" | "li" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
                ) {
                    result.push('\n');
                }
            }
            _ if in_tag => tag.push(ch),
            _ => result.push(ch),
        }
    }

    let result = result
        .replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&");

    // Collapse multiple blank lines into at most one
    let mut prev_was_blank = false;
    let mut cleaned = String::with_capacity(result.len());
    for line in result.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !prev_was_blank {
                cleaned.push('\n');
                prev_was_blank = true;
            }
        } else {
            cleaned.push_str(trimmed);
            cleaned.push('\n');
            prev_was_blank = false;
        }
    }

    cleaned.trim().to_string()
}

/// Remove an entire tag block (e.g. `<script>…</script>`), case-insensitively.
fn remove_tag_block(html: &str, tag: &str) -> String {
    let lower = html.to_lowercase();
    // Lowercasing can change byte lengths for some scripts; bail out then
    if lower.len() != html.len() {
        return html.to_string();
    }
    let open = format!("<{tag}");
    let close = format!("</{tag}>");

    let mut result = String::with_capacity(html.len());
    let mut pos = 0;
    while let Some(start) = lower[pos..].find(&open) {
        let start = pos + start;
        result.push_str(&html[pos..start]);
        match lower[start..].find(&close) {
            Some(end) => pos = start + end + close.len(),
            None => {
                pos = html.len();
                break;
            }
        }
    }
    result.push_str(&html[pos..]);
    result
}
