//! Run-time wrapper over a built DAG: nodes with mutable state, adjacency,
//! and per-run flags.

pub mod execution_graph;
pub mod node;

pub use execution_graph::ExecutionGraph;
pub use node::{Node, NodeState, NodeStatus};
