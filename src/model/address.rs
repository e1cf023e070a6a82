//! Mailbox addresses as they appear in `From`, `To` and `Cc` headers.

/// Characters that force a display name to be quoted in a header.
const NAME_SPECIALS: &[char] = &[',', '.', ';', ':', '@', '<', '>', '(', ')', '[', ']', '"', '\\'];

/// A display name and a bare `local@domain` address.
///
/// Parsing never fails: anything without angle brackets is taken as a bare
/// address, and callers decide validity with [`EmailAddress::is_valid`].
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EmailAddress {
    pub display_name: String,
    pub address: String,
}

impl EmailAddress {
    pub fn new(display_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            address: address.into(),
        }
    }

    /// Parse one `name <addr>`, `<addr>` or `addr` mailbox.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let bracketed = raw
            .rfind('<')
            .and_then(|open| raw[open..].find('>').map(|close| (open, open + close)));
        match bracketed {
            Some((open, close)) => Self {
                display_name: unquote_name(&raw[..open]),
                address: raw[open + 1..close].trim().to_string(),
            },
            None => Self {
                display_name: String::new(),
                address: raw.to_string(),
            },
        }
    }

    /// Parse an address list, skipping empty entries.
    ///
    /// Commas inside quoted names or angle brackets do not split.
    pub fn parse_list(raw: &str) -> Vec<Self> {
        split_mailboxes(raw)
            .into_iter()
            .map(Self::parse)
            .filter(|addr| !addr.address.is_empty())
            .collect()
    }

    /// Lowercased address, the form used for lookups and uniqueness.
    pub fn normalized(&self) -> String {
        self.address.trim().to_lowercase()
    }

    /// Local part and domain, if the address has both.
    pub fn split(&self) -> Option<(&str, &str)> {
        split_address(&self.address)
    }

    /// Basic syntactic validation: one `@`, non-empty local part, a dotted
    /// domain, no whitespace or angle brackets.
    pub fn is_valid(&self) -> bool {
        is_valid_email(&self.address)
    }

    /// Name to show for this address: the display name, or the address.
    pub fn name_or_address(&self) -> &str {
        if self.display_name.is_empty() {
            &self.address
        } else {
            &self.display_name
        }
    }

    /// Format for a MIME header.
    ///
    /// Names containing any of ``,.;:@<>()[]"\`` are quoted; non-ASCII names
    /// are written as an RFC 2047 encoded word.
    pub fn to_header(&self) -> String {
        if self.display_name.is_empty() {
            return self.address.clone();
        }
        let name = if !self.display_name.is_ascii() {
            crate::compose::builder::encode_word(&self.display_name)
        } else if self.display_name.contains(NAME_SPECIALS) {
            format!(
                "\"{}\"",
                self.display_name.replace('\\', "\\\\").replace('"', "\\\"")
            )
        } else {
            self.display_name.clone()
        };
        format!("{} <{}>", name, self.address)
    }
}

/// Split `local@domain` at the last `@`.
pub fn split_address(address: &str) -> Option<(&str, &str)> {
    let (local, domain) = address.trim().rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some((local, domain))
}

/// Basic email syntax check.
pub fn is_valid_email(address: &str) -> bool {
    let Some((local, domain)) = split_address(address) else {
        return false;
    };
    if local.contains('@') {
        return false;
    }
    let forbidden = |c: char| c.is_whitespace() || matches!(c, '<' | '>' | ',' | ';' | '"');
    if local.contains(forbidden) || domain.contains(forbidden) {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

/// Split a header value at top-level commas.
fn split_mailboxes(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    let mut depth = 0usize;
    for (i, ch) in raw.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

/// Display name without its surrounding quotes and quoted-pair escapes.
fn unquote_name(name: &str) -> String {
    let name = name.trim();
    match name.strip_prefix('"').and_then(|n| n.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else {
                    out.push(c);
                }
            }
            out.trim().to_string()
        }
        None => name.to_string(),
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.display_name.is_empty() {
            f.write_str(&self.address)
        } else {
            write!(f, "{} <{}>", self.display_name, self.address)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mailbox_forms() {
        let cases = [
            ("carol@example.org", "", "carol@example.org"),
            ("<carol@example.org>", "", "carol@example.org"),
            ("Carol Ng <carol@example.org>", "Carol Ng", "carol@example.org"),
            ("\"Ng, Carol\" <carol@example.org>", "Ng, Carol", "carol@example.org"),
            ("  ", "", ""),
        ];
        for (raw, name, address) in cases {
            assert_eq!(EmailAddress::parse(raw), EmailAddress::new(name, address), "{raw}");
        }
    }

    #[test]
    fn test_parse_list_respects_quotes() {
        let list = EmailAddress::parse_list(
            "\"Ng, Carol\" <carol@example.org>, , \"say \\\"hi, there\\\"\" <d@e.fr>,dave@example.net",
        );
        let addresses: Vec<&str> = list.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(addresses, vec!["carol@example.org", "d@e.fr", "dave@example.net"]);
        assert_eq!(list[1].display_name, "say \"hi, there\"");
    }

    #[test]
    fn test_validation() {
        assert!(is_valid_email("a@x.com"));
        assert!(is_valid_email("first.last+tag@sub.example.org"));
        assert!(!is_valid_email("bad-email"));
        assert!(!is_valid_email("@x.com"));
        assert!(!is_valid_email("a@localhost"));
        assert!(!is_valid_email("a b@x.com"));
        assert!(!is_valid_email("a@@x.com"));
    }

    #[test]
    fn test_to_header_quotes_specials() {
        let addr = EmailAddress::new("Doe, John", "john@example.com");
        assert_eq!(addr.to_header(), "\"Doe, John\" <john@example.com>");

        let plain = EmailAddress::new("John Doe", "john@example.com");
        assert_eq!(plain.to_header(), "John Doe <john@example.com>");

        let dotted = EmailAddress::new("J. Doe", "john@example.com");
        assert_eq!(dotted.to_header(), "\"J. Doe\" <john@example.com>");
    }

    #[test]
    fn test_quoted_name_roundtrip() {
        let addr = EmailAddress::new("Say \"hi\"", "a@b.com");
        let parsed = EmailAddress::parse(&addr.to_header());
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_split() {
        let addr = EmailAddress::parse("Bob <Bob@Example.com>");
        assert_eq!(addr.split(), Some(("Bob", "Example.com")));
        assert_eq!(addr.normalized(), "bob@example.com");
        assert_eq!(split_address("nodomain"), None);
    }
}
