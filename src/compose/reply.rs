//! Reply shells built from a parsed original.

use crate::model::message::{ParsedMessage, StructuredMessage};
use crate::parser::header;
use crate::parser::mime::html_to_text;

/// Build a reply to `original`.
///
/// The sender of the reply is left unset; callers fill `from` before
/// composing.
pub fn create_reply(
    original: &ParsedMessage,
    reply_text: &str,
    reply_html: Option<&str>,
    include_quote: bool,
) -> StructuredMessage {
    let to = if original.from.address.trim().is_empty() {
        Vec::new()
    } else {
        vec![original.from.clone()]
    };

    let mut text_body = reply_text.to_string();
    let mut html_body = reply_html.map(str::to_string);

    if include_quote {
        let attribution = format!(
            "On {}, {} wrote:",
            header::format_date(&original.date),
            original.from.name_or_address()
        );

        let quoted_text = original
            .first_text()
            .map(str::to_string)
            .or_else(|| original.first_html().map(html_to_text))
            .unwrap_or_default();
        text_body.push_str("\n\n");
        text_body.push_str(&attribution);
        text_body.push('\n');
        for line in quoted_text.lines() {
            text_body.push_str("> ");
            text_body.push_str(line);
            text_body.push('\n');
        }

        if let Some(html) = html_body.as_mut() {
            let quoted_html = original
                .first_html()
                .map(str::to_string)
                .unwrap_or_else(|| escape_html(&quoted_text).replace('\n', "<br>\n"));
            html.push_str(&format!(
                "\n<div>{}</div>\n<blockquote>\n{}\n</blockquote>\n",
                escape_html(&attribution),
                quoted_html
            ));
        }
    }

    let references = match (&original.references, &original.message_id) {
        (Some(refs), Some(id)) => Some(format!("{} <{}>", refs.trim(), id)),
        (None, Some(id)) => Some(format!("<{id}>")),
        (refs, None) => refs.clone(),
    };

    StructuredMessage {
        subject: reply_subject(&original.subject),
        to,
        cc: original.cc.clone(),
        in_reply_to: original.message_id.clone(),
        references,
        text_body: Some(text_body),
        html_body,
        ..Default::default()
    }
}

/// Prefix `Re: ` unless the subject already starts with it.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    let already = trimmed
        .get(..3)
        .is_some_and(|p| p.eq_ignore_ascii_case("re:"));
    if already {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::compose_message;
    use crate::model::address::EmailAddress;
    use crate::parser::parse_message;

    const ORIGINAL: &str = "From: Alice <alice@x.com>\r\n\
To: bob@y.com\r\n\
Cc: Carol <carol@z.com>\r\n\
Bcc: secret@z.com\r\n\
Subject: Plans\r\n\
Date: Thu, 04 Jan 2024 10:00:00 +0000\r\n\
Message-ID: <m2@x.com>\r\n\
References: <m1@x.com>\r\n\
\r\n\
line one\r\n\
line two\r\n";

    fn original() -> ParsedMessage {
        parse_message(ORIGINAL.as_bytes()).unwrap()
    }

    #[test]
    fn test_reply_subject_is_idempotent() {
        assert_eq!(reply_subject("Plans"), "Re: Plans");
        assert_eq!(reply_subject("Re: Plans"), "Re: Plans");
        assert_eq!(reply_subject("RE:Plans"), "RE:Plans");
        assert_eq!(reply_subject(""), "Re: ");
    }

    #[test]
    fn test_reply_addressing() {
        let reply = create_reply(&original(), "Sounds good", None, true);
        assert_eq!(reply.subject, "Re: Plans");
        assert_eq!(reply.to, vec![EmailAddress::new("Alice", "alice@x.com")]);
        assert_eq!(reply.cc, vec![EmailAddress::new("Carol", "carol@z.com")]);
        assert!(reply.bcc.is_empty());
        assert_eq!(reply.in_reply_to.as_deref(), Some("m2@x.com"));
        assert_eq!(reply.references.as_deref(), Some("<m1@x.com> <m2@x.com>"));
    }

    #[test]
    fn test_reply_quotes_text() {
        let reply = create_reply(&original(), "Sounds good", None, true);
        let text = reply.text_body.unwrap();
        assert!(text.starts_with("Sounds good\n\nOn Thu, 04 Jan 2024 10:00:00 +0000, Alice wrote:\n"));
        assert!(text.contains("> line one\n> line two\n"));
        assert!(reply.html_body.is_none());
    }

    #[test]
    fn test_reply_quotes_html_in_blockquote() {
        let reply = create_reply(&original(), "ok", Some("<p>ok</p>"), true);
        let html = reply.html_body.unwrap();
        assert!(html.starts_with("<p>ok</p>"));
        assert!(html.contains("<blockquote>"));
        assert!(html.contains("line one"));
    }

    #[test]
    fn test_reply_without_quote() {
        let reply = create_reply(&original(), "ok", None, false);
        assert_eq!(reply.text_body.as_deref(), Some("ok"));
    }

    #[test]
    fn test_reply_composes_with_threading_headers() {
        let mut reply = create_reply(&original(), "ok", None, true);
        reply.from = Some(EmailAddress::new("Bob", "bob@y.com"));
        let raw = compose_message(&reply, reply.in_reply_to.clone().as_deref()).unwrap();
        let parsed = parse_message(&raw).unwrap();
        assert_eq!(parsed.in_reply_to.as_deref(), Some("m2@x.com"));
        // The parent id is not appended twice
        assert_eq!(parsed.references.as_deref(), Some("<m1@x.com> <m2@x.com>"));
        assert_eq!(parsed.subject, "Re: Plans");
    }
}
