//! Core data model: addresses, parsed/structured messages, and persisted entities.

pub mod address;
pub mod entity;
pub mod message;
