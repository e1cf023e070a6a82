//! Message parsing: header decoding, MIME body decomposition and MBOX splitting.

pub mod header;
pub mod mbox;
pub mod mime;

pub use mime::{parse_message, parse_message_with_date};
