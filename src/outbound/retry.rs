//! Per-recipient delivery state machine.
//!
//! `none`/`retry` move to `sent`, `internal`, `retry` or `failed`; the last
//! three of those never change again.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::model::entity::{DeliveryStatus, MessageRecipient};

/// Backoff between delivery attempts, in minutes.
pub const RETRY_SCHEDULE_MINUTES: [i64; 12] =
    [15, 30, 45, 60, 120, 240, 480, 720, 1080, 1440, 2160, 2880];

/// Result of one delivery attempt for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Sent,
    Internal,
    Retry {
        retry_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        error: String,
    },
}

/// Delay before the next attempt when `retry_count` attempts were already
/// rescheduled, or `None` once the schedule is used up.
///
/// A failure while `retry_count` already sits on the last schedule index is
/// final.
pub fn retry_delay(retry_count: u32) -> Option<Duration> {
    let idx = retry_count as usize;
    if idx + 1 >= RETRY_SCHEDULE_MINUTES.len() {
        return None;
    }
    Some(Duration::minutes(RETRY_SCHEDULE_MINUTES[idx]))
}

/// The far end accepted the message.
pub fn record_sent(recipient: &mut MessageRecipient, now: DateTime<Utc>) -> DeliveryOutcome {
    recipient.delivery_status = DeliveryStatus::Sent;
    recipient.delivered_at = Some(now);
    recipient.retry_at = None;
    recipient.delivery_message = None;
    DeliveryOutcome::Sent
}

/// A mailbox of this system accepted the message.
pub fn record_internal(recipient: &mut MessageRecipient, now: DateTime<Utc>) -> DeliveryOutcome {
    recipient.delivery_status = DeliveryStatus::Internal;
    recipient.delivered_at = Some(now);
    recipient.retry_at = None;
    recipient.delivery_message = None;
    DeliveryOutcome::Internal
}

/// The attempt failed: schedule the next one or give up.
pub fn record_failure(
    recipient: &mut MessageRecipient,
    error: &str,
    now: DateTime<Utc>,
) -> DeliveryOutcome {
    recipient.delivery_message = Some(error.to_string());
    match retry_delay(recipient.retry_count) {
        Some(delay) => {
            let retry_at = now + delay;
            recipient.delivery_status = DeliveryStatus::Retry;
            recipient.retry_at = Some(retry_at);
            recipient.retry_count += 1;
            DeliveryOutcome::Retry {
                retry_at,
                error: error.to_string(),
            }
        }
        None => {
            recipient.delivery_status = DeliveryStatus::Failed;
            recipient.retry_at = None;
            DeliveryOutcome::Failed {
                error: error.to_string(),
            }
        }
    }
}
