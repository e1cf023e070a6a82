//! Outbound pipeline: compose and sign a stored draft, then deliver it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::compose::builder::{compose_message, generate_message_id};
use crate::config::SmtpConfig;
use crate::delivery::InboundDeliverer;
use crate::error::{MailError, Result};
use crate::model::address::{split_address, EmailAddress};
use crate::model::entity::{MessageId, MessageRecipient, RecipientType};
use crate::model::message::{Disposition, DraftAttachment, StructuredMessage};
use crate::outbound::retry::{self, DeliveryOutcome};
use crate::outbound::signer::{prepend_signature, Signer};
use crate::outbound::transport::{send_with_retry, SmtpTransport, TransportRetry};
use crate::parser::parse_message;
use crate::store::Store;

/// Dispatch settings, injected at construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchPolicy {
    pub transport_retry: TransportRetry,
}

impl DispatchPolicy {
    pub fn from_config(config: &SmtpConfig) -> Self {
        Self {
            transport_retry: TransportRetry {
                attempts: config.transport_attempts,
                backoff: Duration::from_millis(config.transport_backoff_ms),
            },
        }
    }
}

pub struct OutboundDispatcher {
    store: Arc<dyn Store>,
    inbound: Arc<InboundDeliverer>,
    transport: Arc<dyn SmtpTransport>,
    signer: Arc<dyn Signer>,
    policy: DispatchPolicy,
}

impl OutboundDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        inbound: Arc<InboundDeliverer>,
        transport: Arc<dyn SmtpTransport>,
        signer: Arc<dyn Signer>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            store,
            inbound,
            transport,
            signer,
            policy,
        }
    }

    /// Compose a stored draft into its final MIME form.
    ///
    /// Returns false (after logging) when the draft cannot be composed.
    pub fn prepare(&self, message_id: MessageId, text: Option<&str>, html: Option<&str>) -> bool {
        match self.prepare_inner(message_id, text, html) {
            Ok(()) => true,
            Err(e) => {
                warn!(message = %message_id, error = %e, "Could not prepare outbound message");
                false
            }
        }
    }

    fn prepare_inner(
        &self,
        message_id: MessageId,
        text: Option<&str>,
        html: Option<&str>,
    ) -> Result<()> {
        let mut message = self.store.get_message(message_id)?;
        let thread = self.store.get_thread(message.thread_id)?;
        let mailbox = self.store.get_mailbox(thread.mailbox_id)?;
        let sender_name = self
            .store
            .get_contact(message.sender_id)
            .map(|c| c.name)
            .unwrap_or_default();
        let from = EmailAddress::new(sender_name, mailbox.address());

        let mut draft = StructuredMessage {
            subject: message.subject.clone(),
            text_body: text.map(str::to_string),
            html_body: html.map(str::to_string),
            ..Default::default()
        };
        // Bcc recipients stay in the envelope only
        for r in self.store.recipients(message_id)? {
            let addr = EmailAddress::new(r.name, r.email);
            match r.kind {
                RecipientType::To => draft.to.push(addr),
                RecipientType::Cc => draft.cc.push(addr),
                RecipientType::Bcc => {}
            }
        }
        for att in self.store.message_attachments(message_id)? {
            let blob = self.store.get_blob(att.blob_id)?;
            draft.attachments.push(DraftAttachment {
                content_type: blob.content_type,
                name: att.name,
                content: blob.content,
                cid: att.cid,
                disposition: if att.inline {
                    Disposition::Inline
                } else {
                    Disposition::Attachment
                },
            });
        }
        if let Some(parent_id) = message.parent_id {
            let parent = self.store.get_message(parent_id)?;
            draft.in_reply_to = parent.mime_id.clone();
            draft.references = parent
                .raw_mime
                .as_deref()
                .and_then(|raw| parse_message(raw).ok())
                .and_then(|p| p.references);
        }

        let mime_id = generate_message_id(&from);
        draft.message_id = Some(mime_id.clone());
        draft.from = Some(from);

        let raw = compose_message(&draft, None)?;
        let raw = match self.signer.sign(&raw, &mailbox.address()) {
            Some(signature) => prepend_signature(&raw, &signature),
            None => raw,
        };

        message.mime_id = Some(mime_id);
        message.raw_mime = Some(raw);
        message.is_draft = false;
        message.is_sender = true;
        message.is_unread = false;
        message.sent_at = Some(Utc::now());
        self.store.update_message(&message)?;
        self.inbound.update_thread_stats(thread.id)?;

        info!(message = %message_id, "Prepared outbound message");
        Ok(())
    }

    /// Deliver a prepared message to every recipient that is due.
    ///
    /// Recipients with a mailbox on this system are delivered directly; the
    /// rest go to the SMTP transport, one transaction per recipient domain.
    /// The map is keyed by recipient email.
    pub fn dispatch(&self, message_id: MessageId) -> Result<HashMap<String, DeliveryOutcome>> {
        let message = self.store.get_message(message_id)?;
        let raw = message
            .raw_mime
            .as_deref()
            .filter(|_| !message.is_draft)
            .ok_or_else(|| MailError::Compose(format!("message {message_id} is not prepared")))?;
        let thread = self.store.get_thread(message.thread_id)?;
        let sender = self.store.get_mailbox(thread.mailbox_id)?.address();

        let now = Utc::now();
        let mut local = Vec::new();
        let mut external: BTreeMap<String, Vec<MessageRecipient>> = BTreeMap::new();
        for r in self.store.recipients(message_id)? {
            if !r.is_due(now) {
                continue;
            }
            match split_address(&r.email) {
                Some((lp, domain)) if self.store.find_mailbox(lp, domain)?.is_some() => {
                    local.push(r)
                }
                Some((_, domain)) => external
                    .entry(domain.to_lowercase())
                    .or_default()
                    .push(r),
                None => external.entry(String::new()).or_default().push(r),
            }
        }

        let mut outcomes = HashMap::new();

        if !local.is_empty() {
            let parsed = parse_message(raw)?;
            for mut r in local {
                let outcome = if self.inbound.deliver(&r.email, &parsed, raw, false) {
                    retry::record_internal(&mut r, now)
                } else {
                    retry::record_failure(&mut r, "local delivery failed", now)
                };
                self.finish(r, outcome, &mut outcomes)?;
            }
        }

        for (domain, group) in external {
            let to: Vec<String> = group.iter().map(|r| r.email.clone()).collect();
            debug!(domain = %domain, recipients = to.len(), "Sending group");
            let sent = send_with_retry(
                self.transport.as_ref(),
                &self.policy.transport_retry,
                &sender,
                &to,
                raw,
            );
            for mut r in group {
                let outcome = match &sent {
                    Ok(report) => match report.get(&r.email) {
                        Some(Ok(())) => retry::record_sent(&mut r, now),
                        Some(Err(reason)) => retry::record_failure(&mut r, reason, now),
                        None => retry::record_failure(&mut r, "no response from transport", now),
                    },
                    Err(e) => retry::record_failure(&mut r, &e.to_string(), now),
                };
                self.finish(r, outcome, &mut outcomes)?;
            }
        }

        info!(message = %message_id, recipients = outcomes.len(), "Dispatched message");
        Ok(outcomes)
    }

    fn finish(
        &self,
        recipient: MessageRecipient,
        outcome: DeliveryOutcome,
        outcomes: &mut HashMap<String, DeliveryOutcome>,
    ) -> Result<()> {
        if let DeliveryOutcome::Retry { error, .. } | DeliveryOutcome::Failed { error } = &outcome {
            warn!(
                recipient = %recipient.email,
                retry_count = recipient.retry_count,
                error = %error,
                "Delivery attempt failed"
            );
        }
        self.store.update_recipient(&recipient)?;
        outcomes.insert(recipient.email, outcome);
        Ok(())
    }
}
