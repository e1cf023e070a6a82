//! Bulk import jobs feeding the inbound deliverer.

pub mod imap;
pub mod mbox;

pub use self::imap::{
    import_folder, FolderReport, ImapConnection, ImapImportOptions, ImapImportReport,
    ImapSessionConnection,
};
pub use self::mbox::{import_mbox, import_mbox_file, MboxImportReport};
