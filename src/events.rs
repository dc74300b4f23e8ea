//! Observer channel between the pipeline and whatever renders it.
//!
//! Each subscriber gets its own unbounded receiver and drains it on its own
//! execution context, so no callback ever runs on a pipeline worker.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::types::{ConnectionStatus, DroppedAnswer, RecoveryReport, SaveStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PipelineEvent {
    SaveStatusChanged(SaveStatus),
    ConnectionStatusChanged(ConnectionStatus),
    TimeExpired(String),
    AnswerDropped(DroppedAnswer),
    RecoveryFinished(RecoveryReport),
}

/// Cloneable handle to one shared subscription list.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<PipelineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PipelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, pruning closed ones.
    pub fn emit(&self, event: PipelineEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<PipelineEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
