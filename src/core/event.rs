//! Lifecycle events for a run.
//!
//! The orchestrator emits every event through one [`EventBus`]; subscribers
//! receive them on unbounded channels in emission order. Sequence numbers
//! are stamped under the same lock that fans the event out, so every
//! subscriber observes the same total order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::plan::PlanId;
use crate::core::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    PlanStart,
    PlanComplete,
    LayerStart,
    LayerComplete,
    TaskStart,
    TaskComplete,
    TaskFail,
    TaskRetry,
    TaskSkip,
    TaskBlocked,
    ProgressUpdate,
    TaskOutput,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::PlanStart => "plan-start",
            EventKind::PlanComplete => "plan-complete",
            EventKind::LayerStart => "layer-start",
            EventKind::LayerComplete => "layer-complete",
            EventKind::TaskStart => "task-start",
            EventKind::TaskComplete => "task-complete",
            EventKind::TaskFail => "task-fail",
            EventKind::TaskRetry => "task-retry",
            EventKind::TaskSkip => "task-skip",
            EventKind::TaskBlocked => "task-blocked",
            EventKind::ProgressUpdate => "progress-update",
            EventKind::TaskOutput => "task-output",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub kind: EventKind,
    pub plan_id: PlanId,
    pub task_id: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
    /// Position in the run's event stream, starting at 0.
    pub sequence: u64,
    pub payload: serde_json::Value,
}

#[derive(Default)]
struct BusInner {
    next_sequence: u64,
    subscribers: Vec<mpsc::UnboundedSender<ExecutionEvent>>,
}

/// Ordered fan-out of [`ExecutionEvent`]s.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. It receives every event emitted afterwards.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ExecutionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers.push(tx);
        }
        rx
    }

    pub fn emit(
        &self,
        kind: EventKind,
        plan_id: PlanId,
        task_id: Option<&TaskId>,
        payload: serde_json::Value,
    ) {
        let Ok(mut inner) = self.inner.lock() else {
            warn!(%kind, "event bus poisoned, dropping event");
            return;
        };
        let event = ExecutionEvent {
            kind,
            plan_id,
            task_id: task_id.cloned(),
            timestamp: Utc::now(),
            sequence: inner.next_sequence,
            payload,
        };
        inner.next_sequence += 1;
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drop every subscriber. Receivers still get what was already sent,
    /// then see the channel close.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers.clear();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().map(|i| i.subscribers.len()).unwrap_or(0)
    }

    /// Spawn a task that forwards every event to tracing. It ends once
    /// the bus is closed and the backlog is drained.
    pub fn spawn_log_subscriber(&self) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                log_event(&event);
            }
        })
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn log_event(event: &ExecutionEvent) {
    let task = event
        .task_id
        .as_ref()
        .map(|t| t.to_string())
        .unwrap_or_default();
    match event.kind {
        EventKind::TaskFail | EventKind::TaskBlocked => warn!(
            seq = event.sequence,
            kind = %event.kind,
            task = %task,
            payload = %event.payload,
            "event"
        ),
        EventKind::ProgressUpdate | EventKind::TaskOutput => debug!(
            seq = event.sequence,
            kind = %event.kind,
            task = %task,
            payload = %event.payload,
            "event"
        ),
        _ => info!(
            seq = event.sequence,
            kind = %event.kind,
            task = %task,
            payload = %event.payload,
            "event"
        ),
    }
}
