//! Integration tests for MBOX file import, MBOX splitting and IMAP import.

use std::collections::BTreeMap;
use std::sync::Arc;

use assert_fs::prelude::*;
use predicates::prelude::*;

use mailengine::delivery::{DeliveryPolicy, InboundDeliverer};
use mailengine::error::{MailError, Result};
use mailengine::import::{import_folder, import_mbox_file, ImapConnection, ImapImportOptions};
use mailengine::parser::mbox::split_mbox_file;
use mailengine::store::{MemoryStore, Store};

const ARCHIVE: &str = "From alice@example.com Mon Jan 01 09:00:00 2024\n\
From: Alice <alice@example.com>\nTo: bob@example.com\nSubject: Lunch\n\
Message-ID: <lunch-1@example.com>\nDate: Mon, 01 Jan 2024 09:00:00 +0000\n\n\
Noon at the usual place?\n\n\
From carol@example.org Mon Jan 01 10:00:00 2024\n\
From: carol@example.org\nTo: bob@example.com\nSubject: Invoice\n\
Message-ID: <inv-7@example.org>\nDate: Mon, 01 Jan 2024 10:00:00 +0000\n\n\
>From the accounts team: invoice attached.\n\n\
From alice@example.com Mon Jan 01 11:00:00 2024\n\
From: Alice <alice@example.com>\nTo: bob@example.com\nSubject: Re: Lunch\n\
Message-ID: <lunch-2@example.com>\nIn-Reply-To: <lunch-1@example.com>\n\
Date: Mon, 01 Jan 2024 11:00:00 +0000\n\nMake it one.\n";

fn setup() -> (Arc<MemoryStore>, InboundDeliverer) {
    let store = Arc::new(MemoryStore::new());
    let policy = DeliveryPolicy {
        accept_all_emails: true,
        ..DeliveryPolicy::default()
    };
    let deliverer = InboundDeliverer::new(store.clone(), policy);
    (store, deliverer)
}

// ─── MBOX files ─────────────────────────────────────────────────────

#[test]
fn test_import_mbox_file_twice() {
    let temp = assert_fs::TempDir::new().unwrap();
    let file = temp.child("archive.mbox");
    file.write_str(ARCHIVE).unwrap();

    let (store, deliverer) = setup();
    let mut seen = Vec::new();
    let report =
        import_mbox_file(file.path(), "bob@example.com", &deliverer, &mut |r| seen.push(r.total))
            .unwrap();
    assert_eq!(report.total, 3);
    assert_eq!(report.delivered, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(seen, vec![1, 2, 3]);

    let mailbox = store.find_mailbox("bob", "example.com").unwrap().unwrap();
    let threads = store.threads(mailbox.id).unwrap();
    assert_eq!(threads.len(), 2);
    let lunch = threads.iter().find(|t| t.subject == "Lunch").unwrap();
    assert_eq!(lunch.count_messages, 2);
    assert_eq!(lunch.sender_names, vec!["Alice"]);

    // A rerun finds everything already there
    let rerun = import_mbox_file(file.path(), "bob@example.com", &deliverer, &mut |_| {}).unwrap();
    assert_eq!(rerun.duplicates, 3);
    assert_eq!(rerun.delivered, 0);
    assert_eq!(store.message_count().unwrap(), 3);
}

#[test]
fn test_import_empty_and_missing_files() {
    let temp = assert_fs::TempDir::new().unwrap();
    let empty = temp.child("empty.mbox");
    empty.touch().unwrap();

    let (_store, deliverer) = setup();
    let report = import_mbox_file(empty.path(), "bob@example.com", &deliverer, &mut |_| {}).unwrap();
    assert_eq!(report.total, 0);

    let err = import_mbox_file(
        temp.child("missing.mbox").path(),
        "bob@example.com",
        &deliverer,
        &mut |_| {},
    )
    .unwrap_err();
    assert!(matches!(err, MailError::Io { .. }));
}

#[test]
fn test_split_file_drops_separators() {
    let temp = assert_fs::TempDir::new().unwrap();
    let file = temp.child("archive.mbox");
    file.write_str(ARCHIVE).unwrap();

    let messages = split_mbox_file(file.path()).unwrap();
    assert_eq!(messages.len(), 3);

    let out = temp.child("invoice.eml");
    out.write_binary(&messages[1]).unwrap();
    out.assert(predicate::str::contains("Subject: Invoice"));
    out.assert(predicate::str::contains(">From the accounts team"));
    out.assert(predicate::str::starts_with("From carol").not());
}

// ─── IMAP ───────────────────────────────────────────────────────────

/// In-memory IMAP account. Folders listed in `broken` fail to select.
#[derive(Default)]
struct ScriptedImap {
    folders: BTreeMap<String, Vec<Vec<u8>>>,
    broken: Vec<String>,
    list_fails: bool,
    selected: Option<String>,
    log: Vec<String>,
}

impl ScriptedImap {
    fn folder(mut self, name: &str, messages: &[String]) -> Self {
        self.folders.insert(
            name.to_string(),
            messages.iter().map(|m| m.as_bytes().to_vec()).collect(),
        );
        self
    }
}

impl ImapConnection for ScriptedImap {
    fn list(&mut self) -> Result<Vec<String>> {
        self.log.push("LIST".into());
        if self.list_fails {
            return Err(MailError::Transport("BAD LIST".into()));
        }
        Ok(self.folders.keys().cloned().collect())
    }

    fn select(&mut self, folder: &str) -> Result<()> {
        self.log.push(format!("SELECT {folder}"));
        if self.broken.iter().any(|b| b == folder) || !self.folders.contains_key(folder) {
            return Err(MailError::Transport(format!("NO [NONEXISTENT] {folder}")));
        }
        self.selected = Some(folder.to_string());
        Ok(())
    }

    fn search(&mut self) -> Result<Vec<u32>> {
        let folder = self.selected.as_ref().unwrap();
        // Servers are free to answer in any order
        Ok((1..=self.folders[folder].len() as u32).rev().collect())
    }

    fn fetch(&mut self, seq: u32) -> Result<Vec<u8>> {
        self.log.push(format!("FETCH {seq}"));
        let folder = self.selected.as_ref().unwrap();
        Ok(self.folders[folder][seq as usize - 1].clone())
    }

    fn logout(&mut self) -> Result<()> {
        self.log.push("LOGOUT".into());
        Ok(())
    }
}

fn mail(id: &str, subject: &str) -> String {
    format!("From: alice@example.com\r\nSubject: {subject}\r\nMessage-ID: <{id}@example.com>\r\n\r\n{subject} body\r\n")
}

#[test]
fn test_imap_single_folder_with_limit() {
    let (store, deliverer) = setup();
    let mut imap = ScriptedImap::default().folder(
        "INBOX",
        &[mail("a", "One"), mail("b", "Two"), mail("c", "Three")],
    );
    let options = ImapImportOptions {
        folder: "inbox".into(),
        max_messages: Some(2),
        label: false,
    };

    let report = import_folder(&mut imap, &deliverer, store.as_ref(), "bob@example.com", &options)
        .unwrap();
    assert_eq!(report.folders.len(), 1);
    assert_eq!(report.folders[0].folder, "INBOX");
    assert_eq!(report.folders[0].found, 2);
    assert_eq!(report.delivered(), 2);

    // Only the two most recent sequence numbers, oldest first
    let fetched: Vec<&str> = imap
        .log
        .iter()
        .filter(|l| l.starts_with("FETCH"))
        .map(String::as_str)
        .collect();
    assert_eq!(fetched, vec!["FETCH 2", "FETCH 3"]);
    assert_eq!(imap.log.last().map(String::as_str), Some("LOGOUT"));
}

#[test]
fn test_imap_all_folders_with_labels_and_failures() {
    let (store, deliverer) = setup();
    let mut imap = ScriptedImap {
        broken: vec!["Junk".into()],
        ..Default::default()
    }
    .folder("INBOX", &[mail("a", "Hello"), mail("b", "Agenda")])
    .folder("Archive", &[mail("c", "Old news")])
    .folder("Junk", &[mail("d", "Spam")]);
    let options = ImapImportOptions {
        folder: "ALL".into(),
        max_messages: None,
        label: true,
    };

    let report = import_folder(&mut imap, &deliverer, store.as_ref(), "bob@example.com", &options)
        .unwrap();
    assert_eq!(report.folders.len(), 3);
    assert_eq!(report.delivered(), 3);
    assert_eq!(report.failed_folders(), 1);
    let junk = report.folders.iter().find(|f| f.folder == "Junk").unwrap();
    assert!(junk.error.as_deref().unwrap().contains("NONEXISTENT"));

    let mailbox = store.find_mailbox("bob", "example.com").unwrap().unwrap();
    let threads = store.threads(mailbox.id).unwrap();
    assert_eq!(threads.len(), 3);
    let old = threads.iter().find(|t| t.subject == "Old news").unwrap();
    assert_eq!(old.labels, vec!["Archive"]);
    let hello = threads.iter().find(|t| t.subject == "Hello").unwrap();
    assert_eq!(hello.labels, vec!["INBOX"]);

    // Running again only finds duplicates
    let mut again = ScriptedImap::default().folder("INBOX", &[mail("a", "Hello")]);
    let rerun = import_folder(
        &mut again,
        &deliverer,
        store.as_ref(),
        "bob@example.com",
        &ImapImportOptions::default(),
    )
    .unwrap();
    assert_eq!(rerun.folders[0].duplicates, 1);
    assert_eq!(store.message_count().unwrap(), 3);
}

#[test]
fn test_imap_missing_folder_is_reported() {
    let (store, deliverer) = setup();
    let mut imap = ScriptedImap::default().folder("INBOX", &[mail("a", "Hello")]);
    let options = ImapImportOptions {
        folder: "Sent".into(),
        ..Default::default()
    };
    let report = import_folder(&mut imap, &deliverer, store.as_ref(), "bob@example.com", &options)
        .unwrap();
    assert_eq!(report.folders[0].folder, "Sent");
    assert!(report.folders[0].error.is_some());
    assert_eq!(store.message_count().unwrap(), 0);
}

#[test]
fn test_imap_list_failure_still_logs_out() {
    let (store, deliverer) = setup();
    let mut imap = ScriptedImap {
        list_fails: true,
        ..Default::default()
    }
    .folder("INBOX", &[mail("a", "Hello")]);

    let err = import_folder(
        &mut imap,
        &deliverer,
        store.as_ref(),
        "bob@example.com",
        &ImapImportOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, MailError::Transport(_)));
    assert_eq!(imap.log, vec!["LIST", "LOGOUT"]);
}
