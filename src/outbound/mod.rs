//! Outbound side: preparation, signing, transport and the retry schedule.

pub mod dispatcher;
pub mod retry;
pub mod signer;
pub mod transport;

pub use dispatcher::{DispatchPolicy, OutboundDispatcher};
pub use retry::DeliveryOutcome;
pub use signer::{DomainSigner, NoopSigner, Signer};
pub use transport::{RelayTransport, SendReport, SmtpTransport, TransportRetry};
