//! Inbound side: thread resolution, contacts, counters and delivery.

pub mod contact;
pub mod inbound;
pub mod stats;
pub mod thread;

pub use inbound::{DeliveryPolicy, DeliveryReceipt, InboundDeliverer};
pub use stats::ThreadStats;
pub use thread::{canonical_subject, ThreadResolver};
