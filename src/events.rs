//! Append-only protocol event stream consumed by display sinks.

use crate::{model::NegotiationState, NegotiationId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    pub sequence: u64,
    pub negotiation_id: NegotiationId,
    pub timestamp: DateTime<Utc>,
    pub state_before: NegotiationState,
    pub state_after: NegotiationState,
    pub message: String,
}

/// Shared, ordered event log. Cloning yields another handle to the same log.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Inner>,
}

struct Inner {
    records: Mutex<Vec<ProtocolEvent>>,
    sender: broadcast::Sender<ProtocolEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(Vec::new()),
                sender,
            }),
        }
    }

    pub fn record(
        &self,
        negotiation_id: NegotiationId,
        state_before: NegotiationState,
        state_after: NegotiationState,
        message: impl Into<String>,
    ) -> ProtocolEvent {
        let mut records = self.inner.records.lock();
        let event = ProtocolEvent {
            sequence: records.len() as u64 + 1,
            negotiation_id,
            timestamp: Utc::now(),
            state_before,
            state_after,
            message: message.into(),
        };
        records.push(event.clone());
        // Publishing under the lock keeps subscribers in sequence order.
        let _ = self.inner.sender.send(event.clone());
        event
    }

    /// Live feed of events recorded after subscription. Late subscribers
    /// replay history with `since`.
    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.inner.sender.subscribe()
    }

    pub fn snapshot(&self) -> Vec<ProtocolEvent> {
        self.inner.records.lock().clone()
    }

    pub fn since(&self, sequence: u64) -> Vec<ProtocolEvent> {
        let records = self.inner.records.lock();
        let start = (sequence as usize).min(records.len());
        records[start..].to_vec()
    }

    pub fn for_negotiation(&self, negotiation_id: NegotiationId) -> Vec<ProtocolEvent> {
        self.inner
            .records
            .lock()
            .iter()
            .filter(|e| e.negotiation_id == negotiation_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
