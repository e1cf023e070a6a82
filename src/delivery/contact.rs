//! Contact resolution for senders and recipients.

use tracing::warn;

use crate::error::{MailError, Result};
use crate::model::address::{is_valid_email, EmailAddress};
use crate::model::entity::{Contact, ContactId, Mailbox};
use crate::store::Store;

/// Lowercase email of `addr`, or a validation error.
pub fn validate(addr: &EmailAddress) -> Result<String> {
    let email = addr.normalized();
    if is_valid_email(&email) {
        Ok(email)
    } else {
        Err(MailError::Validation(addr.address.clone()))
    }
}

/// Resolve the sender contact of an inbound message.
///
/// A missing sender becomes `unknown-sender@<domain>` and a malformed one
/// `invalid-sender@<domain>`, scoped to the receiving mailbox's domain.
pub fn sender_contact(store: &dyn Store, mailbox: &Mailbox, from: &EmailAddress) -> Result<Contact> {
    if from.address.trim().is_empty() {
        warn!(mailbox = %mailbox.address(), "Message has no sender, using fallback");
        let email = format!("unknown-sender@{}", mailbox.domain);
        return store.upsert_contact(mailbox.id, &email, "");
    }
    match validate(from) {
        Ok(email) => store.upsert_contact(mailbox.id, &email, &from.display_name),
        Err(e) => {
            warn!(mailbox = %mailbox.address(), error = %e, "Invalid sender, using fallback");
            let email = format!("invalid-sender@{}", mailbox.domain);
            store.upsert_contact(mailbox.id, &email, &from.display_name)
        }
    }
}

/// Resolve the contact for one recipient address.
///
/// The mailbox's own address never becomes a contact, so `Ok(None)` is
/// returned for it.
pub fn recipient_contact(
    store: &dyn Store,
    mailbox: &Mailbox,
    addr: &EmailAddress,
) -> Result<Option<ContactId>> {
    let email = validate(addr)?;
    if email == mailbox.address() {
        return Ok(None);
    }
    Ok(Some(store.upsert_contact(mailbox.id, &email, &addr.display_name)?.id))
}
