//! Message signing collaborator.

use std::sync::Arc;

use crate::config::DkimConfig;
use crate::model::address::split_address;

/// Produces a signature header for an outgoing message.
pub trait Signer: Send + Sync {
    /// The header line(s) to prepend, or `None` when signing is not
    /// configured for the sender's domain.
    fn sign(&self, raw: &[u8], sender_email: &str) -> Option<Vec<u8>>;
}

/// Never signs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSigner;

impl Signer for NoopSigner {
    fn sign(&self, _raw: &[u8], _sender_email: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Passes messages to `inner` only for the sender domains listed in the
/// `[dkim]` section.
pub struct DomainSigner {
    domains: Vec<String>,
    inner: Arc<dyn Signer>,
}

impl DomainSigner {
    pub fn from_config(config: &DkimConfig, inner: Arc<dyn Signer>) -> Self {
        Self {
            domains: config
                .domains
                .iter()
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            inner,
        }
    }
}

impl Signer for DomainSigner {
    fn sign(&self, raw: &[u8], sender_email: &str) -> Option<Vec<u8>> {
        let (_, domain) = split_address(sender_email)?;
        let domain = domain.to_lowercase();
        if !self.domains.contains(&domain) {
            return None;
        }
        self.inner.sign(raw, sender_email)
    }
}

/// Prepend a signature header, making sure it ends with CRLF.
pub fn prepend_signature(raw: &[u8], signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(signature.len() + raw.len() + 2);
    out.extend_from_slice(signature);
    if !signature.ends_with(b"\r\n") {
        if signature.ends_with(b"\n") {
            out.pop();
        }
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(raw);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_signer() {
        assert!(NoopSigner.sign(b"raw", "a@x.com").is_none());
    }

    struct Fixed;

    impl Signer for Fixed {
        fn sign(&self, _raw: &[u8], _sender_email: &str) -> Option<Vec<u8>> {
            Some(b"DKIM-Signature: v=1".to_vec())
        }
    }

    #[test]
    fn test_domain_signer_only_signs_configured_domains() {
        let config = DkimConfig {
            domains: vec![" Example.COM ".into(), String::new()],
        };
        let signer = DomainSigner::from_config(&config, Arc::new(Fixed));
        assert!(signer.sign(b"raw", "alice@example.com").is_some());
        assert!(signer.sign(b"raw", "alice@EXAMPLE.com").is_some());
        assert!(signer.sign(b"raw", "alice@other.org").is_none());
        assert!(signer.sign(b"raw", "no-domain").is_none());
    }

    #[test]
    fn test_prepend_signature_terminates_line() {
        let raw = b"From: a@x.com\r\n\r\nbody";
        for sig in [&b"DKIM-Signature: v=1"[..], b"DKIM-Signature: v=1\n", b"DKIM-Signature: v=1\r\n"] {
            let out = prepend_signature(raw, sig);
            assert!(out.starts_with(b"DKIM-Signature: v=1\r\nFrom: a@x.com"));
        }
    }
}
