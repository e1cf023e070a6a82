//! Engine configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MAILENGINE_CONFIG` (environment variable)
//! 2. `~/.config/mailengine/config.toml` (Linux/macOS)
//!    `%APPDATA%\mailengine\config.toml` (Windows)
//! 3. Built-in defaults
//!
//! The engine components never read this directly. The binary loads it once
//! and hands the relevant pieces ([`DeliveryConfig`], [`SmtpConfig`], ...) to
//! the constructors.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Inbound delivery policy.
    pub delivery: DeliveryConfig,
    /// Outbound SMTP relay.
    pub smtp: SmtpConfig,
    /// Remote IMAP account used by `imap-import`.
    pub imap: ImapConfig,
    /// Message signing.
    pub dkim: DkimConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Inbound delivery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Auto-create any unknown mailbox on delivery.
    pub accept_all_emails: bool,
    /// Domain for which unknown mailboxes are auto-created even when
    /// `accept_all_emails` is off.
    pub test_domain: Option<String>,
    /// Maximum snippet length in characters.
    pub snippet_length: usize,
    /// Capacity of the per-job parse cache.
    pub parse_cache_size: usize,
    /// Skip imported messages whose Message-ID already exists in the mailbox.
    pub dedup_imports: bool,
}

/// Outbound SMTP relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Relay host. Outbound external delivery is disabled when unset.
    pub host: Option<String>,
    /// Relay port.
    pub port: u16,
    /// Optional SMTP AUTH user name.
    pub username: Option<String>,
    /// Optional SMTP AUTH password.
    pub password: Option<String>,
    /// Use STARTTLS instead of implicit TLS.
    pub starttls: bool,
    /// Attempts per transactional send before giving up on the group.
    pub transport_attempts: u32,
    /// Initial backoff between attempts, doubled after each failure.
    pub transport_backoff_ms: u64,
}

/// Remote IMAP account settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    /// Server host name.
    pub host: Option<String>,
    /// Server port.
    pub port: u16,
    /// Login user name.
    pub username: String,
    /// Login password.
    pub password: String,
}

/// Message signing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DkimConfig {
    /// Sender domains whose outgoing mail is handed to the signer.
    pub domains: Vec<String>,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            accept_all_emails: false,
            test_domain: None,
            snippet_length: 140,
            parse_cache_size: 64,
            dedup_imports: true,
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 587,
            username: None,
            password: None,
            starttls: true,
            transport_attempts: 5,
            transport_backoff_ms: 1000,
        }
    }
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 993,
            username: String::new(),
            password: String::new(),
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────

/// Load the configuration file, or the defaults when there is none.
///
/// A file that cannot be read or parsed is logged and ignored.
pub fn load_config() -> Config {
    config_file_path()
        .filter(|path| path.exists())
        .and_then(|path| read_config(&path))
        .unwrap_or_default()
}

/// Read one TOML config file.
pub fn read_config(path: &Path) -> Option<Config> {
    let parsed = std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|text| toml::from_str::<Config>(&text).map_err(|e| e.to_string()));
    match parsed {
        Ok(config) => {
            tracing::info!(path = %path.display(), "Loaded config");
            Some(config)
        }
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "Ignoring unusable config file");
            None
        }
    }
}

/// `$MAILENGINE_CONFIG`, else `mailengine/config.toml` under the platform
/// config directory.
pub fn config_file_path() -> Option<PathBuf> {
    match std::env::var_os("MAILENGINE_CONFIG") {
        Some(path) => Some(PathBuf::from(path)),
        None => dirs::config_dir().map(|d| d.join("mailengine").join("config.toml")),
    }
}

/// Where the log file goes.
pub fn cache_dir(config: &Config) -> PathBuf {
    config.general.cache_dir.clone().unwrap_or_else(|| {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mailengine")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.general.log_level, "warn");
        assert!(!cfg.delivery.accept_all_emails);
        assert_eq!(cfg.delivery.snippet_length, 140);
        assert_eq!(cfg.smtp.transport_attempts, 5);
        assert_eq!(cfg.smtp.transport_backoff_ms, 1000);
        assert!(cfg.dkim.domains.is_empty());
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let mut cfg = Config::default();
        cfg.delivery.test_domain = Some("example.test".to_string());
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.delivery.test_domain.as_deref(), Some("example.test"));
        assert_eq!(parsed.smtp.port, cfg.smtp.port);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[delivery]
accept_all_emails = true

[smtp]
host = "relay.example.com"
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert!(cfg.delivery.accept_all_emails);
        assert_eq!(cfg.smtp.host.as_deref(), Some("relay.example.com"));
        // Other fields use defaults
        assert_eq!(cfg.smtp.port, 587);
        assert!(cfg.delivery.dedup_imports);
    }

    #[test]
    fn test_read_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("config.toml");
        std::fs::write(&good, "[dkim]\ndomains = [\"example.com\"]\n").unwrap();
        let cfg = read_config(&good).unwrap();
        assert_eq!(cfg.dkim.domains, vec!["example.com"]);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[smtp\nport = ").unwrap();
        assert!(read_config(&bad).is_none());
        assert!(read_config(&dir.path().join("missing.toml")).is_none());
    }
}
