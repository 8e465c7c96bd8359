use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::dag::Step;
use crate::executor::Executor;

/// Status of a node. Transitions move monotonically along the lattice
/// None → Running → {Success | Error | Cancel | Skipped}, with Error → None
/// on a scheduled retry and Success → None on repeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    None,
    Running,
    Error,
    Cancel,
    Success,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Error | NodeStatus::Cancel | NodeStatus::Skipped
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::None => "not started",
            NodeStatus::Running => "running",
            NodeStatus::Error => "failed",
            NodeStatus::Cancel => "canceled",
            NodeStatus::Success => "finished",
            NodeStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Mutable per-run state of a node.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of retry re-admissions performed so far.
    pub retry_count: u64,
    /// Number of completed repeat cycles.
    pub done_count: u64,
}

/// One step's run-time state. Created with the execution graph, destroyed
/// with it. The scheduler is the only writer of [`NodeState`]; the current
/// executor handle is shared so a stop can signal a running child.
pub struct Node {
    step: Step,
    state: RwLock<NodeState>,
    executor: Mutex<Option<Arc<dyn Executor>>>,
}

impl Node {
    pub fn new(step: Step) -> Self {
        Node {
            step,
            state: RwLock::new(NodeState::default()),
            executor: Mutex::new(None),
        }
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn name(&self) -> &str {
        &self.step.name
    }

    pub fn state(&self) -> NodeState {
        self.state.read().clone()
    }

    pub fn status(&self) -> NodeStatus {
        self.state.read().status
    }

    pub fn set_status(&self, status: NodeStatus) {
        self.state.write().status = status;
    }

    pub fn mark_running(&self) {
        let mut state = self.state.write();
        state.status = NodeStatus::Running;
        state.started_at = Some(Utc::now());
    }

    pub fn mark_finished(&self, status: NodeStatus) {
        let mut state = self.state.write();
        state.status = status;
        state.finished_at = Some(Utc::now());
    }

    pub fn mark_error(&self, message: impl Into<String>) {
        let mut state = self.state.write();
        state.status = NodeStatus::Error;
        state.error = Some(message.into());
        state.finished_at = Some(Utc::now());
    }

    /// Reset for a retry re-admission: Error → None, counting the attempt.
    pub fn reset_for_retry(&self) {
        let mut state = self.state.write();
        state.status = NodeStatus::None;
        state.retry_count += 1;
    }

    /// Reset for a repeat cycle: Success → None, counting the completion.
    pub fn reset_for_repeat(&self) {
        let mut state = self.state.write();
        state.status = NodeStatus::None;
        state.done_count += 1;
    }

    /// Clear all per-run state.
    pub fn reset(&self) {
        *self.state.write() = NodeState::default();
        *self.executor.lock() = None;
    }

    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        *self.executor.lock() = Some(executor);
    }

    pub fn clear_executor(&self) {
        *self.executor.lock() = None;
    }

    /// Current executor handle, if the node is running one.
    pub fn executor(&self) -> Option<Arc<dyn Executor>> {
        self.executor.lock().clone()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("step", &self.step.name)
            .field("state", &self.state())
            .finish()
    }
}
