//! Units of work for a background queue.
//!
//! The engine only exposes synchronous operations. A queue worker
//! deserializes a [`Task`] and hands it to [`run_task`]; [`InlineQueue`]
//! does exactly that on the calling thread.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::delivery::{DeliveryPolicy, InboundDeliverer};
use crate::error::{MailError, Result};
use crate::import::mbox::{import_mbox_file, MboxImportReport};
use crate::model::entity::MessageId;
use crate::outbound::{
    DeliveryOutcome, DispatchPolicy, DomainSigner, OutboundDispatcher, Signer, SmtpTransport,
};
use crate::parser::parse_message;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    DeliverInbound {
        recipient: String,
        raw: Vec<u8>,
        #[serde(default)]
        is_import: bool,
    },
    PrepareOutbound {
        message_id: MessageId,
        text: Option<String>,
        html: Option<String>,
    },
    Dispatch {
        message_id: MessageId,
    },
    /// Dispatch every message with a recipient whose retry time has come.
    RetryDue,
    ImportMbox {
        recipient: String,
        path: PathBuf,
    },
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeliverInbound { .. } => "deliver_inbound",
            Self::PrepareOutbound { .. } => "prepare_outbound",
            Self::Dispatch { .. } => "dispatch",
            Self::RetryDue => "retry_due",
            Self::ImportMbox { .. } => "import_mbox",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(pub Uuid);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TaskOutput {
    Delivered(bool),
    Prepared(bool),
    Dispatched(HashMap<String, DeliveryOutcome>),
    Imported(MboxImportReport),
}

/// Somewhere tasks can be sent.
pub trait TaskQueue {
    fn enqueue(&self, task: Task) -> Result<TaskHandle>;
}

/// The wired-up components a task runs against.
pub struct Engine {
    pub store: Arc<dyn Store>,
    pub deliverer: Arc<InboundDeliverer>,
    pub dispatcher: OutboundDispatcher,
}

impl Engine {
    /// Wire the engine. `signer` is only consulted for the `[dkim]` domains.
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        transport: Arc<dyn SmtpTransport>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        let deliverer = Arc::new(InboundDeliverer::new(
            store.clone(),
            DeliveryPolicy::from_config(&config.delivery),
        ));
        let dispatcher = OutboundDispatcher::new(
            store.clone(),
            deliverer.clone(),
            transport,
            Arc::new(DomainSigner::from_config(&config.dkim, signer)),
            DispatchPolicy::from_config(&config.smtp),
        );
        Self {
            store,
            deliverer,
            dispatcher,
        }
    }
}

/// Execute one task.
pub fn run_task(engine: &Engine, task: Task) -> Result<TaskOutput> {
    debug!(task = task.kind(), "Running task");
    match task {
        Task::DeliverInbound {
            recipient,
            raw,
            is_import,
        } => {
            let parsed = parse_message(&raw)?;
            Ok(TaskOutput::Delivered(
                engine.deliverer.deliver(&recipient, &parsed, &raw, is_import),
            ))
        }
        Task::PrepareOutbound {
            message_id,
            text,
            html,
        } => Ok(TaskOutput::Prepared(engine.dispatcher.prepare(
            message_id,
            text.as_deref(),
            html.as_deref(),
        ))),
        Task::Dispatch { message_id } => {
            Ok(TaskOutput::Dispatched(engine.dispatcher.dispatch(message_id)?))
        }
        Task::RetryDue => {
            let due: BTreeSet<MessageId> = engine
                .store
                .pending_recipients(Utc::now())?
                .into_iter()
                .map(|r| r.message_id)
                .collect();
            let mut outcomes = HashMap::new();
            for message_id in due {
                match engine.dispatcher.dispatch(message_id) {
                    Ok(map) => outcomes.extend(map),
                    Err(e) => warn!(message = %message_id, error = %e, "Retry dispatch failed"),
                }
            }
            Ok(TaskOutput::Dispatched(outcomes))
        }
        Task::ImportMbox { recipient, path } => Ok(TaskOutput::Imported(import_mbox_file(
            &path,
            &recipient,
            &engine.deliverer,
            &mut |_| {},
        )?)),
    }
}

/// Runs every task immediately on the caller's thread.
pub struct InlineQueue {
    engine: Engine,
    results: Mutex<HashMap<TaskHandle, TaskOutput>>,
}

impl InlineQueue {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            results: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Remove and return the output of a finished task.
    pub fn take(&self, handle: TaskHandle) -> Option<TaskOutput> {
        self.results.lock().ok()?.remove(&handle)
    }
}

impl TaskQueue for InlineQueue {
    fn enqueue(&self, task: Task) -> Result<TaskHandle> {
        let handle = TaskHandle(Uuid::new_v4());
        let output = run_task(&self.engine, task)?;
        self.results
            .lock()
            .map_err(|_| MailError::Storage("task result mutex poisoned".into()))?
            .insert(handle, output);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::{NoopSigner, SendReport};
    use crate::store::MemoryStore;

    struct AcceptAll;

    impl SmtpTransport for AcceptAll {
        fn send(&self, _: &str, to: &[String], _: &[u8]) -> Result<SendReport> {
            Ok(to.iter().map(|a| (a.clone(), Ok(()))).collect())
        }
    }

    fn queue() -> InlineQueue {
        let mut config = Config::default();
        config.delivery.accept_all_emails = true;
        let engine = Engine::new(
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(AcceptAll),
            Arc::new(NoopSigner),
        );
        InlineQueue::new(engine)
    }

    #[test]
    fn test_inline_deliver() {
        let q = queue();
        let handle = q
            .enqueue(Task::DeliverInbound {
                recipient: "bob@example.com".into(),
                raw: b"From: a@x.com\r\nSubject: queued\r\n\r\nhello\r\n".to_vec(),
                is_import: false,
            })
            .unwrap();
        assert_eq!(q.take(handle), Some(TaskOutput::Delivered(true)));
        assert_eq!(q.take(handle), None);
    }

    #[test]
    fn test_unparsable_task_fails() {
        let q = queue();
        let err = q
            .enqueue(Task::DeliverInbound {
                recipient: "bob@example.com".into(),
                raw: Vec::new(),
                is_import: false,
            })
            .unwrap_err();
        assert!(matches!(err, MailError::Parse(_)));
    }

    #[test]
    fn test_retry_due_with_nothing_pending() {
        let q = queue();
        let handle = q.enqueue(Task::RetryDue).unwrap();
        assert_eq!(q.take(handle), Some(TaskOutput::Dispatched(HashMap::new())));
    }

    #[test]
    fn test_task_serializes_with_tag() {
        let json = serde_json::to_string(&Task::Dispatch {
            message_id: MessageId::new(),
        })
        .unwrap();
        assert!(json.contains("\"task\":\"dispatch\""));
        let value = serde_json::to_value(Task::RetryDue).unwrap();
        assert_eq!(value["task"], Task::RetryDue.kind());
        let back: Task = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Task::Dispatch { .. }));
    }
}
