//! SMTP transport collaborator and the lettre-backed relay.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Transport};
use tracing::{debug, warn};

use crate::config::SmtpConfig;
use crate::error::{MailError, Result};

/// Per-address result of one send: `Err` carries the rejection text.
pub type SendReport = HashMap<String, std::result::Result<(), String>>;

/// Hands composed messages to the outside world.
pub trait SmtpTransport: Send + Sync {
    /// Send `raw` to every address in `envelope_to` in one transaction.
    ///
    /// Per-recipient rejections are reported in the map. `Err` is reserved
    /// for connection and authentication failures.
    fn send(&self, envelope_from: &str, envelope_to: &[String], raw: &[u8]) -> Result<SendReport>;
}

/// Bounded immediate retry for transport-level failures.
#[derive(Debug, Clone, Copy)]
pub struct TransportRetry {
    pub attempts: u32,
    /// Delay after the first failure; doubles after each further one.
    pub backoff: Duration,
}

impl Default for TransportRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Call `transport`, retrying transport errors with exponential backoff.
pub fn send_with_retry(
    transport: &dyn SmtpTransport,
    retry: &TransportRetry,
    envelope_from: &str,
    envelope_to: &[String],
    raw: &[u8],
) -> Result<SendReport> {
    let attempts = retry.attempts.max(1);
    let mut delay = retry.backoff;
    let mut attempt = 1;
    loop {
        match transport.send(envelope_from, envelope_to, raw) {
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(attempt, attempts, error = %e, "SMTP transport failed, retrying");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Delivers through an SMTP relay with lettre.
pub struct RelayTransport {
    inner: lettre::SmtpTransport,
}

impl RelayTransport {
    pub fn from_config(config: &SmtpConfig) -> Result<Self> {
        let host = config
            .host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| MailError::Config("smtp.host is not set".into()))?;

        let builder = if config.starttls {
            lettre::SmtpTransport::starttls_relay(host)
        } else {
            lettre::SmtpTransport::relay(host)
        }
        .map_err(|e| MailError::Config(format!("SMTP relay '{host}': {e}")))?
        .port(config.port);

        let builder = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => {
                builder.credentials(Credentials::new(user.clone(), pass.clone()))
            }
            _ => builder,
        };

        Ok(Self {
            inner: builder.build(),
        })
    }

    fn send_to(
        &self,
        from: &Address,
        to: Vec<Address>,
        raw: &[u8],
    ) -> Result<std::result::Result<(), lettre::transport::smtp::Error>> {
        let envelope = Envelope::new(Some(from.clone()), to)
            .map_err(|e| MailError::Validation(format!("envelope: {e}")))?;
        Ok(self.inner.send_raw(&envelope, raw).map(|_| ()))
    }
}

impl SmtpTransport for RelayTransport {
    fn send(&self, envelope_from: &str, envelope_to: &[String], raw: &[u8]) -> Result<SendReport> {
        let from: Address = envelope_from
            .parse()
            .map_err(|e| MailError::Validation(format!("{envelope_from}: {e}")))?;

        let mut report = SendReport::new();
        let mut valid = Vec::new();
        for addr in envelope_to {
            match addr.parse::<Address>() {
                Ok(a) => valid.push((addr.clone(), a)),
                Err(e) => {
                    report.insert(addr.clone(), Err(format!("invalid address: {e}")));
                }
            }
        }
        if valid.is_empty() {
            return Ok(report);
        }

        let all: Vec<Address> = valid.iter().map(|(_, a)| a.clone()).collect();
        match self.send_to(&from, all, raw)? {
            Ok(()) => {
                for (addr, _) in valid {
                    report.insert(addr, Ok(()));
                }
                return Ok(report);
            }
            Err(e) if !is_rejection(&e) => {
                return Err(MailError::Transport(e.to_string()));
            }
            Err(e) if valid.len() == 1 => {
                report.insert(valid[0].0.clone(), Err(e.to_string()));
                return Ok(report);
            }
            Err(e) => {
                debug!(error = %e, "Group rejected, isolating recipients");
            }
        }

        // The server refused part of the group; find out who
        for (addr, parsed) in valid {
            match self.send_to(&from, vec![parsed], raw)? {
                Ok(()) => {
                    report.insert(addr, Ok(()));
                }
                Err(e) if is_rejection(&e) => {
                    report.insert(addr, Err(e.to_string()));
                }
                Err(e) => return Err(MailError::Transport(e.to_string())),
            }
        }
        Ok(report)
    }
}

/// SMTP reply errors are about the message or a recipient; anything else
/// (connection, TLS, client) is about the transport.
fn is_rejection(e: &lettre::transport::smtp::Error) -> bool {
    e.is_permanent() || e.is_transient()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Fails with a transport error `failures` times, then accepts.
    struct Flaky {
        failures: Mutex<u32>,
        calls: Mutex<u32>,
    }

    impl SmtpTransport for Flaky {
        fn send(&self, _from: &str, to: &[String], _raw: &[u8]) -> Result<SendReport> {
            *self.calls.lock().unwrap() += 1;
            let mut left = self.failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(MailError::Transport("connection refused".into()));
            }
            Ok(to.iter().map(|a| (a.clone(), Ok(()))).collect())
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            failures: Mutex::new(failures),
            calls: Mutex::new(0),
        }
    }

    fn no_wait(attempts: u32) -> TransportRetry {
        TransportRetry {
            attempts,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn test_retry_recovers() {
        let t = flaky(2);
        let to = vec!["x@y.com".to_string()];
        let report = send_with_retry(&t, &no_wait(5), "a@x.com", &to, b"raw").unwrap();
        assert_eq!(report.get("x@y.com"), Some(&Ok(())));
        assert_eq!(*t.calls.lock().unwrap(), 3);
    }

    #[test]
    fn test_retry_gives_up() {
        let t = flaky(10);
        let to = vec!["x@y.com".to_string()];
        let err = send_with_retry(&t, &no_wait(5), "a@x.com", &to, b"raw").unwrap_err();
        assert!(matches!(err, MailError::Transport(_)));
        assert_eq!(*t.calls.lock().unwrap(), 5);
    }

    #[test]
    fn test_non_transport_errors_are_not_retried() {
        struct Broken;
        impl SmtpTransport for Broken {
            fn send(&self, _: &str, _: &[String], _: &[u8]) -> Result<SendReport> {
                Err(MailError::Validation("bad sender".into()))
            }
        }
        let err = send_with_retry(&Broken, &no_wait(5), "a", &[], b"").unwrap_err();
        assert!(matches!(err, MailError::Validation(_)));
    }

    #[test]
    fn test_relay_requires_host() {
        let config = SmtpConfig::default();
        assert!(matches!(
            RelayTransport::from_config(&config),
            Err(MailError::Config(_))
        ));
    }
}
