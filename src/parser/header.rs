//! RFC 5322 header parsing: folding, encoded-words (RFC 2047), message-id
//! tokens and date parsing.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

use crate::model::message::HeaderMap;

/// Decode raw header bytes to a string.
///
/// Tries UTF-8 first, then falls back to Windows-1252 (a superset of
/// ISO-8859-1 that accepts every byte).
pub fn decode_header_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);

    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Slice of `data` holding the header block (up to the first blank line).
pub fn header_block(data: &[u8]) -> &[u8] {
    let mut i = 0;
    while i < data.len() {
        if data[i..].starts_with(b"\r\n\r\n") || data[i..].starts_with(b"\n\n") {
            return &data[..i];
        }
        i += 1;
    }
    data
}

/// Unfold headers: join continuation lines (starting with space or tab) with the previous header.
///
/// Returns a list of `(lowercase_name, raw_value)` pairs in header order.
pub fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim().to_lowercase();
            if name.is_empty() || name.contains(' ') {
                continue;
            }
            let value = line[colon_pos + 1..].trim().to_string();
            result.push((name, value));
        }
    }

    result
}

/// Build the decoded, lowercase header map from unfolded headers.
pub fn header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::default();
    for (name, value) in headers {
        map.append(name, decode_encoded_words(value));
    }
    map
}

/// Get the first raw value for a header name (lowercase).
pub fn get_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Get every raw value for a header name, joined with `", "`.
pub fn get_header_joined(headers: &[(String, String)], name: &str) -> Option<String> {
    let values: Vec<&str> = headers
        .iter()
        .filter(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

/// Expand RFC 2047 encoded-words in a header value.
///
/// Linear whitespace separating two encoded-words is not part of the text
/// and is dropped. Tokens that fail to decode are kept verbatim.
pub fn decode_encoded_words(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = String::new();
    let mut after_word = false;
    let mut rest = input;

    while !rest.is_empty() {
        if rest.starts_with("=?") {
            if let Some((word, len)) = EncodedWord::scan(rest) {
                if !after_word {
                    out.push_str(&pending_space);
                }
                pending_space.clear();
                out.push_str(&word.decode());
                after_word = true;
                rest = &rest[len..];
                continue;
            }
        }

        let ch = rest.chars().next().unwrap_or(' ');
        rest = &rest[ch.len_utf8()..];
        if ch.is_whitespace() {
            pending_space.push(ch);
        } else {
            out.push_str(&pending_space);
            pending_space.clear();
            out.push(ch);
            after_word = false;
        }
    }
    out.push_str(&pending_space);
    out
}

/// One `=?charset?enc?text?=` token.
struct EncodedWord<'a> {
    charset: &'a str,
    base64: bool,
    text: &'a str,
}

impl<'a> EncodedWord<'a> {
    /// Recognise a token at the start of `s`, returning it and its length.
    fn scan(s: &'a str) -> Option<(Self, usize)> {
        let body = s.strip_prefix("=?")?;
        let mut fields = body.splitn(3, '?');
        let charset = fields.next()?;
        let encoding = fields.next()?;
        let tail = fields.next()?;
        let end = tail.find("?=")?;
        let text = &tail[..end];
        if charset.is_empty() || text.contains(char::is_whitespace) {
            return None;
        }
        let base64 = match encoding {
            "B" | "b" => true,
            "Q" | "q" => false,
            _ => return None,
        };
        let len = 2 + charset.len() + 1 + encoding.len() + 1 + end + 2;
        // RFC 2231 language suffix: charset*lang
        let charset = charset.split('*').next().unwrap_or(charset);
        Some((Self { charset, base64, text }, len))
    }

    fn decode(&self) -> String {
        let bytes = if self.base64 {
            match STANDARD_NO_PAD.decode(self.text.trim_end_matches('=')) {
                Ok(bytes) => bytes,
                Err(_) => return format!("=?{}?B?{}?=", self.charset, self.text),
            }
        } else {
            unquote(self.text)
        };
        decode_charset(self.charset, &bytes)
    }
}

/// Undo the Q encoding: `_` is a space and `=XX` a hex byte. Malformed
/// escapes pass through unchanged.
fn unquote(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut bytes = text.bytes().peekable();
    while let Some(b) = bytes.next() {
        match b {
            b'_' => out.push(b' '),
            b'=' => {
                let hi = bytes.peek().copied().and_then(hex_digit);
                match hi {
                    Some(hi) => {
                        let first = bytes.next().unwrap_or(b'0');
                        match bytes.peek().copied().and_then(hex_digit) {
                            Some(lo) => {
                                bytes.next();
                                out.push((hi << 4) | lo);
                            }
                            None => out.extend_from_slice(&[b'=', first]),
                        }
                    }
                    None => out.push(b'='),
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Decode bytes using a declared charset.
///
/// Fallback chain: declared charset → UTF-8 → Latin-1. Undecodable bytes
/// are replaced rather than rejected.
pub fn decode_charset(charset: &str, bytes: &[u8]) -> String {
    let label = charset.trim().to_lowercase();
    if label == "utf-8" || label == "utf8" {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    if let Some(encoding) = encoding_rs::Encoding::for_label(label.as_bytes()) {
        let (decoded, _, _) = encoding.decode(bytes);
        return decoded.into_owned();
    }
    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_string();
    }
    warn!(charset = charset, "Unknown charset, falling back to Latin-1");
    let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
    decoded.into_owned()
}

/// Strip surrounding whitespace and angle brackets from a Message-ID value.
///
/// `" <abc@host> "` → `"abc@host"`. Returns `None` for an empty value.
pub fn strip_angle_brackets(s: &str) -> Option<String> {
    let trimmed = s.trim();
    let inner = match (trimmed.find('<'), trimmed.find('>')) {
        (Some(start), Some(end)) if end > start => &trimmed[start + 1..end],
        _ => trimmed,
    };
    let inner = inner.trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

/// Extract every `<…>` token from a header value, without the brackets.
pub fn message_id_tokens(s: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut remaining = s;
    while let Some(start) = remaining.find('<') {
        let Some(end) = remaining[start..].find('>') else {
            break;
        };
        let token = remaining[start + 1..start + end].trim();
        if !token.is_empty() {
            result.push(token.to_string());
        }
        remaining = &remaining[start + end + 1..];
    }
    result
}

/// Format a timestamp the way a `Date:` header expects.
pub fn format_date(dt: &DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S +0000").to_string()
}

/// Parse a `Date:` header or an IMAP `INTERNALDATE`.
///
/// Strict RFC 2822 and RFC 3339 come first. After that the value is
/// cleaned up (trailing comment, weekday, zone names) and matched against
/// a few loose layouts, and mail-parser gets the last word.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    let cleaned = loosen_date(value);
    let parsed = LOOSE_DATE_LAYOUTS.iter().find_map(|layout| {
        DateTime::parse_from_str(&cleaned, layout)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(&cleaned, layout).map(|n| Utc.from_utc_datetime(&n))
            })
            .ok()
    });

    let parsed = parsed.or_else(|| date_via_mail_parser(value));
    if parsed.is_none() {
        warn!(date = value, "Unparseable date");
    }
    parsed
}

const LOOSE_DATE_LAYOUTS: [&str; 6] = [
    "%d %b %Y %H:%M:%S %z",
    "%d %b %Y %H:%M %z",
    "%d %b %Y %H:%M:%S",
    "%d-%b-%Y %H:%M:%S %z",
    "%d-%b-%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// North American and European zone names seen in the wild.
const ZONE_NAMES: [(&str, &str); 11] = [
    ("UT", "+0000"),
    ("GMT", "+0000"),
    ("UTC", "+0000"),
    ("EST", "-0500"),
    ("EDT", "-0400"),
    ("CST", "-0600"),
    ("CDT", "-0500"),
    ("PST", "-0800"),
    ("PDT", "-0700"),
    ("CET", "+0100"),
    ("CEST", "+0200"),
];

/// Drop a `(comment)` and leading weekday, and turn a trailing zone name
/// into a numeric offset.
fn loosen_date(value: &str) -> String {
    let value = value.split('(').next().unwrap_or(value).trim();
    let value = match value.split_once(',') {
        Some((weekday, rest)) if weekday.chars().all(|c| c.is_ascii_alphabetic()) => rest.trim(),
        _ => value,
    };
    let mut words: Vec<&str> = value.split_whitespace().collect();
    if let Some(last) = words.last_mut() {
        if let Some((_, offset)) = ZONE_NAMES.iter().find(|(name, _)| last.eq_ignore_ascii_case(name)) {
            *last = *offset;
        }
    }
    words.join(" ")
}

fn date_via_mail_parser(value: &str) -> Option<DateTime<Utc>> {
    let probe = format!("Date: {value}\r\n\r\n");
    let message = mail_parser::MessageParser::default().parse(probe.as_bytes())?;
    let stamp = message.date()?.to_timestamp();
    Utc.timestamp_opt(stamp, 0).single()
}
