//! `mailengine`: mail delivery and threading engine.
//!
//! This crate provides the core library for parsing and composing MIME
//! messages, resolving conversations into threads, delivering inbound mail
//! into mailboxes, dispatching outbound mail with per-recipient retries, and
//! importing existing archives from MBOX files or IMAP accounts.

pub mod cache;
pub mod compose;
pub mod config;
pub mod delivery;
pub mod error;
pub mod import;
pub mod model;
pub mod outbound;
pub mod parser;
pub mod store;
pub mod task;
