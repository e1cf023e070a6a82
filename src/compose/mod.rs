//! Message composition: drafts to MIME bytes, and replies.

pub mod builder;
pub mod reply;

pub use builder::{compose_message, encode_word};
pub use reply::create_reply;
