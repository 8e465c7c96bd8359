//! Scheduler events, delivered in the order transitions are committed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::graph::NodeStatus;

use super::RunStatus;

#[derive(Clone, Debug, Serialize)]
pub enum SchedulerEvent {
    /// A node was admitted and its executor started.
    NodeStarted {
        step: String,
        timestamp: DateTime<Utc>,
    },

    /// A node reached a terminal status for this admission.
    NodeFinished {
        step: String,
        status: NodeStatus,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A failed node was scheduled for re-admission.
    NodeRetrying {
        step: String,
        attempt: u64,
        timestamp: DateTime<Utc>,
    },

    /// A succeeded node was scheduled to repeat.
    NodeRepeating {
        step: String,
        done_count: u64,
        timestamp: DateTime<Utc>,
    },

    /// A lifecycle handler started.
    HandlerStarted {
        handler: String,
        timestamp: DateTime<Utc>,
    },

    /// A lifecycle handler finished.
    HandlerFinished {
        handler: String,
        status: NodeStatus,
        timestamp: DateTime<Utc>,
    },

    /// The run reached its final status.
    WorkflowFinished {
        status: RunStatus,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

pub type EventSender = mpsc::UnboundedSender<SchedulerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SchedulerEvent>;

pub fn create_event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Optional event sink; emission is a no-op when no listener is attached.
#[derive(Clone, Default)]
pub(crate) struct Events(pub Option<EventSender>);

impl Events {
    pub fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_channel() {
        let (tx, mut rx) = create_event_channel();
        tx.send(SchedulerEvent::NodeStarted {
            step: "a".into(),
            timestamp: Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            SchedulerEvent::NodeStarted { step, .. } => assert_eq!(step, "a"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_events_noop_without_listener() {
        let events = Events(None);
        events.emit(SchedulerEvent::WorkflowFinished {
            status: RunStatus::Success,
            error: None,
            timestamp: Utc::now(),
        });
    }
}
