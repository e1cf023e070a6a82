//! IMAP folder import.

use std::net::TcpStream;

use native_tls::{TlsConnector, TlsStream};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::ParseCache;
use crate::config::ImapConfig;
use crate::delivery::InboundDeliverer;
use crate::error::{MailError, Result};
use crate::parser::parse_message;
use crate::store::Store;

/// The IMAP operations an import needs.
pub trait ImapConnection {
    /// Names of every selectable folder.
    fn list(&mut self) -> Result<Vec<String>>;
    fn select(&mut self, folder: &str) -> Result<()>;
    /// Sequence numbers of every message in the selected folder.
    fn search(&mut self) -> Result<Vec<u32>>;
    /// Raw RFC 822 bytes of one message.
    fn fetch(&mut self, seq: u32) -> Result<Vec<u8>>;
    fn logout(&mut self) -> Result<()>;
}

/// What to import and how.
#[derive(Debug, Clone)]
pub struct ImapImportOptions {
    /// Folder name, or `ALL` / `*` for every selectable folder.
    pub folder: String,
    /// Keep only the most recent N messages of each folder.
    pub max_messages: Option<usize>,
    /// Label delivered threads with the source folder name.
    pub label: bool,
}

impl Default for ImapImportOptions {
    fn default() -> Self {
        Self {
            folder: "INBOX".to_string(),
            max_messages: None,
            label: false,
        }
    }
}

/// Counts for one folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FolderReport {
    pub folder: String,
    pub found: usize,
    pub delivered: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Why the folder could not be read at all.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImapImportReport {
    pub folders: Vec<FolderReport>,
}

impl ImapImportReport {
    pub fn delivered(&self) -> usize {
        self.folders.iter().map(|f| f.delivered).sum()
    }

    pub fn failed_folders(&self) -> usize {
        self.folders.iter().filter(|f| f.error.is_some()).count()
    }
}

/// Import one folder (or all of them) into `recipient`'s mailbox.
///
/// A folder that cannot be selected or searched is reported and skipped.
/// Only a failure to list folders aborts the import.
pub fn import_folder(
    conn: &mut dyn ImapConnection,
    deliverer: &InboundDeliverer,
    store: &dyn Store,
    recipient: &str,
    options: &ImapImportOptions,
) -> Result<ImapImportReport> {
    let available = match conn.list() {
        Ok(folders) => folders,
        Err(e) => {
            logout(conn);
            return Err(e);
        }
    };
    let requested = options.folder.trim();
    let folders: Vec<String> = if requested.eq_ignore_ascii_case("all") || requested == "*" {
        available
    } else {
        // INBOX is case-insensitive, every other name is matched exactly
        let is_inbox = requested.eq_ignore_ascii_case("inbox");
        let found = available
            .into_iter()
            .find(|f| f == requested || (is_inbox && f.eq_ignore_ascii_case("inbox")));
        vec![found.unwrap_or_else(|| requested.to_string())]
    };

    let mut report = ImapImportReport::default();
    let cache = deliverer.job_cache();
    for folder in folders {
        let folder_report = import_one(conn, deliverer, &cache, store, recipient, &folder, options);
        if let Some(e) = &folder_report.error {
            warn!(folder = %folder, error = %e, "IMAP folder skipped");
        }
        report.folders.push(folder_report);
    }

    logout(conn);
    info!(
        recipient,
        folders = report.folders.len(),
        delivered = report.delivered(),
        failed_folders = report.failed_folders(),
        "IMAP import finished"
    );
    Ok(report)
}

fn logout(conn: &mut dyn ImapConnection) {
    if let Err(e) = conn.logout() {
        debug!(error = %e, "IMAP logout failed");
    }
}

fn import_one(
    conn: &mut dyn ImapConnection,
    deliverer: &InboundDeliverer,
    cache: &ParseCache,
    store: &dyn Store,
    recipient: &str,
    folder: &str,
    options: &ImapImportOptions,
) -> FolderReport {
    let mut report = FolderReport {
        folder: folder.to_string(),
        ..FolderReport::default()
    };

    let mut seqs = match conn.select(folder).and_then(|()| conn.search()) {
        Ok(seqs) => seqs,
        Err(e) => {
            report.error = Some(e.to_string());
            return report;
        }
    };
    seqs.sort_unstable();
    if let Some(max) = options.max_messages {
        if seqs.len() > max {
            seqs = seqs.split_off(seqs.len() - max);
        }
    }
    report.found = seqs.len();

    for seq in seqs {
        let raw = match conn.fetch(seq) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(folder, seq, error = %e, "IMAP fetch failed");
                report.failed += 1;
                continue;
            }
        };
        let receipt = parse_message(&raw)
            .and_then(|parsed| deliverer.deliver_in_job(cache, recipient, &parsed, &raw, true));
        match receipt {
            Ok(receipt) => {
                if receipt.duplicate {
                    report.duplicates += 1;
                } else {
                    report.delivered += 1;
                }
                if options.label {
                    if let Err(e) = store.add_thread_label(receipt.thread_id, folder) {
                        warn!(folder, error = %e, "Could not label thread");
                    }
                }
            }
            Err(e) => {
                warn!(folder, seq, error = %e, "IMAP message not imported");
                report.failed += 1;
            }
        }
    }
    report
}

/// A live IMAP session over TLS.
pub struct ImapSessionConnection {
    session: imap::Session<TlsStream<TcpStream>>,
}

impl ImapSessionConnection {
    pub fn connect(config: &ImapConfig) -> Result<Self> {
        let host = config
            .host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| MailError::Config("imap.host is not set".into()))?;
        let tls = TlsConnector::builder()
            .build()
            .map_err(|e| MailError::Transport(format!("TLS setup: {e}")))?;
        let client = imap::connect((host, config.port), host, &tls)
            .map_err(|e| MailError::Transport(format!("connect {host}: {e}")))?;
        let session = client
            .login(&config.username, &config.password)
            .map_err(|(e, _client)| MailError::Transport(format!("login: {e}")))?;
        info!(host, "IMAP session opened");
        Ok(Self { session })
    }
}

impl ImapConnection for ImapSessionConnection {
    fn list(&mut self) -> Result<Vec<String>> {
        let names = self
            .session
            .list(Some(""), Some("*"))
            .map_err(|e| MailError::Transport(format!("LIST: {e}")))?;
        Ok(names
            .iter()
            .filter(|n| {
                !n.attributes()
                    .iter()
                    .any(|a| matches!(a, imap::types::NameAttribute::NoSelect))
            })
            .map(|n| n.name().to_string())
            .collect())
    }

    fn select(&mut self, folder: &str) -> Result<()> {
        self.session
            .select(folder)
            .map(|_| ())
            .map_err(|e| MailError::Transport(format!("SELECT {folder}: {e}")))
    }

    fn search(&mut self) -> Result<Vec<u32>> {
        self.session
            .search("ALL")
            .map(|set| set.into_iter().collect())
            .map_err(|e| MailError::Transport(format!("SEARCH: {e}")))
    }

    fn fetch(&mut self, seq: u32) -> Result<Vec<u8>> {
        let fetches = self
            .session
            .fetch(seq.to_string(), "RFC822")
            .map_err(|e| MailError::Transport(format!("FETCH {seq}: {e}")))?;
        fetches
            .iter()
            .find_map(|f| f.body().map(<[u8]>::to_vec))
            .ok_or_else(|| MailError::not_found("IMAP message body", seq))
    }

    fn logout(&mut self) -> Result<()> {
        self.session
            .logout()
            .map_err(|e| MailError::Transport(format!("LOGOUT: {e}")))
    }
}
