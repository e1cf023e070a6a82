//! MBOX import jobs.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use serde::Serialize;
use tracing::{info, warn};

use crate::delivery::InboundDeliverer;
use crate::error::{MailError, Result};
use crate::parser::mbox::MboxSplitter;
use crate::parser::parse_message;

/// Counts for one MBOX import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MboxImportReport {
    pub total: usize,
    pub delivered: usize,
    /// Already present in the mailbox and skipped.
    pub duplicates: usize,
    pub failed: usize,
}

/// Deliver every message of an MBOX blob to `recipient`, in file order.
pub fn import_mbox(blob: &[u8], recipient: &str, deliverer: &InboundDeliverer) -> MboxImportReport {
    import_mbox_with_progress(blob, recipient, deliverer, &mut |_| {})
}

/// [`import_mbox`], calling `progress` after each message.
///
/// A failed message is counted and skipped; the job always runs to the end.
pub fn import_mbox_with_progress(
    blob: &[u8],
    recipient: &str,
    deliverer: &InboundDeliverer,
    progress: &mut dyn FnMut(&MboxImportReport),
) -> MboxImportReport {
    let mut report = MboxImportReport::default();
    let cache = deliverer.job_cache();
    for (idx, raw) in MboxSplitter::new(blob).enumerate() {
        report.total += 1;
        let parsed = match parse_message(raw) {
            Ok(p) => p,
            Err(e) => {
                warn!(index = idx, error = %e, "Skipping unparsable message");
                report.failed += 1;
                progress(&report);
                continue;
            }
        };
        match deliverer.deliver_in_job(&cache, recipient, &parsed, raw, true) {
            Ok(receipt) if receipt.duplicate => report.duplicates += 1,
            Ok(_) => report.delivered += 1,
            Err(e) => {
                warn!(index = idx, recipient, error = %e, "Import delivery failed");
                report.failed += 1;
            }
        }
        progress(&report);
    }
    info!(
        recipient,
        total = report.total,
        delivered = report.delivered,
        duplicates = report.duplicates,
        failed = report.failed,
        "MBOX import finished"
    );
    report
}

/// Import an MBOX file, memory-mapped.
pub fn import_mbox_file(
    path: impl AsRef<Path>,
    recipient: &str,
    deliverer: &InboundDeliverer,
    progress: &mut dyn FnMut(&MboxImportReport),
) -> Result<MboxImportReport> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| MailError::io(path, e))?;
    if file.metadata().map_err(|e| MailError::io(path, e))?.len() == 0 {
        return Ok(MboxImportReport::default());
    }
    // SAFETY: read-only map, dropped before returning.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| MailError::io(path, e))?;
    Ok(import_mbox_with_progress(&mmap, recipient, deliverer, progress))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryPolicy;
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;

    const MBOX: &str = "From a@x.com Thu Jan 04 10:00:00 2024\n\
From: a@x.com\nSubject: Plan\nMessage-ID: <p1@x.com>\n\nfirst\n\n\
From b@y.com Thu Jan 04 11:00:00 2024\n\
From: b@y.com\nSubject: Re: Plan\nMessage-ID: <p2@y.com>\nIn-Reply-To: <p1@x.com>\n\nsecond\n\n\
From c@z.com Thu Jan 04 12:00:00 2024\n\
From: c@z.com\nSubject: Other\nMessage-ID: <p3@z.com>\n\nthird\n";

    fn setup() -> (Arc<MemoryStore>, InboundDeliverer) {
        let store = Arc::new(MemoryStore::new());
        store.create_mailbox("bob", "example.com").unwrap();
        let deliverer = InboundDeliverer::new(store.clone(), DeliveryPolicy::default());
        (store, deliverer)
    }

    #[test]
    fn test_import_threads_replies() {
        let (store, d) = setup();
        let mut calls = 0;
        let report =
            import_mbox_with_progress(MBOX.as_bytes(), "bob@example.com", &d, &mut |_| calls += 1);
        assert_eq!(
            report,
            MboxImportReport {
                total: 3,
                delivered: 3,
                duplicates: 0,
                failed: 0
            }
        );
        assert_eq!(calls, 3);
        let mailbox = store.find_mailbox("bob", "example.com").unwrap().unwrap();
        assert_eq!(store.threads(mailbox.id).unwrap().len(), 2);
    }

    #[test]
    fn test_rerun_skips_duplicates() {
        let (_store, d) = setup();
        import_mbox(MBOX.as_bytes(), "bob@example.com", &d);
        let again = import_mbox(MBOX.as_bytes(), "bob@example.com", &d);
        assert_eq!(again.duplicates, 3);
        assert_eq!(again.delivered, 0);
    }

    #[test]
    fn test_unknown_recipient_counts_failures() {
        let (_store, d) = setup();
        let report = import_mbox(MBOX.as_bytes(), "nobody@nowhere.test", &d);
        assert_eq!(report.total, 3);
        assert_eq!(report.failed, 3);
    }
}
