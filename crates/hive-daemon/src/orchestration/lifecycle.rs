//! Lifecycle event bridge.
//!
//! The run executor publishes [`AgentEvent`]s on a [`LifecycleBus`]. The
//! registry subscribes once and handles events sequentially, so events for a
//! given run are processed in arrival order.
//!
//! Every subscriber owns an unbounded queue. A slow subscriber never loses
//! events; a terminal event that is dropped would leave its run live forever.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Stream an event belongs to. Only `lifecycle` drives the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStream {
    Lifecycle,
    Assistant,
    Tool,
    #[serde(other)]
    Other,
}

/// Lifecycle phase reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Start,
    End,
    Error,
    #[serde(other)]
    Other,
}

/// Payload of a `lifecycle` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleData {
    pub phase: LifecyclePhase,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub error: Option<String>,
}

impl LifecycleData {
    pub const fn phase(phase: LifecyclePhase) -> Self {
        Self {
            phase,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }
}

/// An event emitted by the run executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub run_id: String,
    pub stream: EventStream,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl AgentEvent {
    /// Build a `lifecycle` event.
    pub fn lifecycle(run_id: impl Into<String>, data: &LifecycleData) -> Self {
        Self {
            run_id: run_id.into(),
            stream: EventStream::Lifecycle,
            data: serde_json::to_value(data).unwrap_or_default(),
        }
    }

    /// Typed lifecycle payload, `None` for other streams or malformed data.
    pub fn lifecycle_data(&self) -> Option<LifecycleData> {
        if self.stream != EventStream::Lifecycle {
            return None;
        }
        match serde_json::from_value(self.data.clone()) {
            Ok(data) => Some(data),
            Err(e) => {
                debug!(run_id = %self.run_id, error = %e, "Malformed lifecycle payload");
                None
            }
        }
    }
}

/// Fan-out bus for agent events.
#[derive(Debug, Clone)]
pub struct LifecycleBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<AgentEvent>>>>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Publish an event. Returns how many subscribers received it.
    ///
    /// Subscribers whose receiver was dropped are pruned here.
    pub fn emit(&self, event: AgentEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub(crate) const fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Stop delivering events to the subscriber.
    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
