use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};

use crate::dag::Dag;
use crate::error::WorkflowError;

use super::node::{Node, NodeStatus};

/// The run-time graph: one [`Node`] per step, edges derived from `depends`,
/// plus per-run flags. Construction validates acyclicity.
pub struct ExecutionGraph {
    nodes: Vec<Arc<Node>>,
    index_by_name: HashMap<String, usize>,
    graph: StableDiGraph<usize, ()>,
    petgraph_index: Vec<NodeIndex>,
    remote_synced: AtomicBool,
    canceled: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for ExecutionGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGraph")
            .field("nodes", &self.nodes.iter().map(|n| n.name()).collect::<Vec<_>>())
            .field("remote_synced", &self.remote_synced.load(Ordering::Relaxed))
            .field("canceled", &self.canceled.load(Ordering::Relaxed))
            .field("last_error", &self.last_error.lock())
            .finish()
    }
}

impl ExecutionGraph {
    /// Build the graph from a DAG, failing on unresolvable dependencies or a
    /// dependency cycle (Kahn's algorithm).
    pub fn new(dag: &Dag) -> Result<Self, WorkflowError> {
        let nodes: Vec<Arc<Node>> = dag
            .steps
            .iter()
            .map(|step| Arc::new(Node::new(step.clone())))
            .collect();

        let mut index_by_name = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            index_by_name.insert(node.name().to_string(), i);
        }

        let mut graph = StableDiGraph::new();
        let petgraph_index: Vec<NodeIndex> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();

        for (i, node) in nodes.iter().enumerate() {
            for dep in &node.step().depends {
                let dep_index = *index_by_name
                    .get(dep)
                    .ok_or_else(|| WorkflowError::StepNotFound(dep.clone()))?;
                graph.add_edge(petgraph_index[dep_index], petgraph_index[i], ());
            }
        }

        let built = ExecutionGraph {
            nodes,
            index_by_name,
            graph,
            petgraph_index,
            remote_synced: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            last_error: Mutex::new(None),
        };
        built.check_acyclic()?;
        Ok(built)
    }

    /// Kahn's algorithm: if the peel-off visits fewer nodes than exist, a
    /// back edge remains.
    fn check_acyclic(&self) -> Result<(), WorkflowError> {
        let mut in_degree: Vec<usize> = self
            .petgraph_index
            .iter()
            .map(|idx| {
                self.graph
                    .neighbors_directed(*idx, petgraph::Direction::Incoming)
                    .count()
            })
            .collect();

        let mut queue: std::collections::VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut visited = 0usize;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for succ in self
                .graph
                .neighbors_directed(self.petgraph_index[i], petgraph::Direction::Outgoing)
            {
                let j = self.graph[succ];
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    queue.push_back(j);
                }
            }
        }

        if visited != self.nodes.len() {
            return Err(WorkflowError::Cycle);
        }
        Ok(())
    }

    /// Nodes in step declaration order.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &Arc<Node> {
        &self.nodes[index]
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Arc<Node>> {
        self.index_by_name.get(name).map(|i| &self.nodes[*i])
    }

    /// Indices of this node's predecessors.
    pub fn predecessors(&self, index: usize) -> Vec<usize> {
        self.graph
            .neighbors_directed(self.petgraph_index[index], petgraph::Direction::Incoming)
            .map(|idx| self.graph[idx])
            .collect()
    }

    /// Whether every predecessor reached a state that lets `index` start:
    /// Success, or Error/Skipped with the predecessor's continue-on flag set.
    fn deps_satisfied(&self, index: usize) -> bool {
        self.predecessors(index).into_iter().all(|p| {
            let pred = &self.nodes[p];
            match pred.status() {
                NodeStatus::Success => true,
                NodeStatus::Error => pred.step().continue_on.failure,
                NodeStatus::Skipped => pred.step().continue_on.skipped,
                _ => false,
            }
        })
    }

    /// Whether `index` can never start: some predecessor terminated in a
    /// state its continue-on flags do not allow past. Predecessors listed in
    /// `excluded` (waiting out a retry or repeat interval) are not final yet
    /// and do not count as blocking.
    pub fn is_blocked_excluding(&self, index: usize, excluded: &HashSet<usize>) -> bool {
        self.predecessors(index).into_iter().any(|p| {
            if excluded.contains(&p) {
                return false;
            }
            let pred = &self.nodes[p];
            match pred.status() {
                NodeStatus::Error => !pred.step().continue_on.failure,
                NodeStatus::Skipped => !pred.step().continue_on.skipped,
                NodeStatus::Cancel => true,
                _ => false,
            }
        })
    }

    /// [`Self::is_blocked_excluding`] with nothing excluded.
    pub fn is_blocked(&self, index: usize) -> bool {
        self.is_blocked_excluding(index, &HashSet::new())
    }

    /// Indices of nodes ready for admission, in declaration order.
    pub fn runnable(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|i| self.nodes[*i].status() == NodeStatus::None && self.deps_satisfied(*i))
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.nodes.iter().all(|n| n.status().is_terminal())
    }

    pub fn is_remote_synced(&self) -> bool {
        self.remote_synced.load(Ordering::Acquire)
    }

    /// One-shot gate for capsule cloning. Returns false if already set.
    pub fn set_remote_synced(&self) -> bool {
        !self.remote_synced.swap(true, Ordering::AcqRel)
    }

    pub fn set_canceled(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn set_last_error(&self, message: impl Into<String>) {
        let mut slot = self.last_error.lock();
        if slot.is_none() {
            *slot = Some(message.into());
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Clear per-run state so a long-running daemon can reuse the graph.
    /// Also resets the remote-sync gate.
    pub fn reset_for_run(&self) {
        for node in &self.nodes {
            node.reset();
        }
        self.remote_synced.store(false, Ordering::Release);
        self.canceled.store(false, Ordering::Release);
        *self.last_error.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{ContinueOn, Step};

    fn step(name: &str, depends: &[&str]) -> Step {
        Step {
            name: name.into(),
            depends: depends.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn dag(steps: Vec<Step>) -> Dag {
        Dag {
            steps,
            ..Default::default()
        }
    }

    #[test]
    fn test_linear_graph() {
        let g = ExecutionGraph::new(&dag(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
        ]))
        .unwrap();

        assert_eq!(g.runnable(), vec![0]);

        g.node(0).mark_finished(NodeStatus::Success);
        assert_eq!(g.runnable(), vec![1]);

        g.node(1).mark_finished(NodeStatus::Success);
        g.node(2).mark_finished(NodeStatus::Success);
        assert!(g.is_finished());
    }

    #[test]
    fn test_cycle_rejected() {
        let err = ExecutionGraph::new(&dag(vec![step("a", &["b"]), step("b", &["a"])]));
        assert!(matches!(err, Err(WorkflowError::Cycle)));
    }

    #[test]
    fn test_self_cycle_rejected() {
        let err = ExecutionGraph::new(&dag(vec![step("a", &["a"])]));
        assert!(matches!(err, Err(WorkflowError::Cycle)));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = ExecutionGraph::new(&dag(vec![step("a", &["ghost"])]));
        assert!(matches!(err, Err(WorkflowError::StepNotFound(_))));
    }

    #[test]
    fn test_failed_dep_blocks_without_continue_on() {
        let g = ExecutionGraph::new(&dag(vec![step("a", &[]), step("b", &["a"])])).unwrap();
        g.node(0).mark_error("exit 1");

        assert!(g.runnable().is_empty());
        assert!(g.is_blocked(1));
    }

    #[test]
    fn test_failed_dep_allows_with_continue_on() {
        let mut a = step("a", &[]);
        a.continue_on = ContinueOn {
            failure: true,
            skipped: false,
        };
        let g = ExecutionGraph::new(&dag(vec![a, step("b", &["a"])])).unwrap();
        g.node(0).mark_error("exit 1");

        assert_eq!(g.runnable(), vec![1]);
        assert!(!g.is_blocked(1));
    }

    #[test]
    fn test_blocked_excluding_pending_predecessor() {
        let g = ExecutionGraph::new(&dag(vec![step("a", &[]), step("b", &["a"])])).unwrap();
        g.node(0).mark_error("exit 1");

        // A failed predecessor blocks, unless it is waiting to be re-admitted.
        assert!(g.is_blocked(1));
        let awaiting: HashSet<usize> = [0].into_iter().collect();
        assert!(!g.is_blocked_excluding(1, &awaiting));
    }

    #[test]
    fn test_skipped_dep_continue_on() {
        let mut a = step("a", &[]);
        a.continue_on = ContinueOn {
            failure: false,
            skipped: true,
        };
        let g = ExecutionGraph::new(&dag(vec![a, step("b", &["a"])])).unwrap();
        g.node(0).mark_finished(NodeStatus::Skipped);

        assert_eq!(g.runnable(), vec![1]);
    }

    #[test]
    fn test_parallel_roots_in_declaration_order() {
        let g = ExecutionGraph::new(&dag(vec![
            step("z", &[]),
            step("a", &[]),
            step("m", &[]),
        ]))
        .unwrap();
        // Tie-break follows declaration order, not name order.
        assert_eq!(g.runnable(), vec![0, 1, 2]);
    }

    #[test]
    fn test_remote_synced_one_shot() {
        let g = ExecutionGraph::new(&dag(vec![step("a", &[])])).unwrap();
        assert!(!g.is_remote_synced());
        assert!(g.set_remote_synced());
        assert!(g.is_remote_synced());
        assert!(!g.set_remote_synced());
    }

    #[test]
    fn test_reset_for_run() {
        let g = ExecutionGraph::new(&dag(vec![step("a", &[])])).unwrap();
        g.node(0).mark_error("x");
        g.set_last_error("x");
        g.set_remote_synced();
        g.set_canceled();

        g.reset_for_run();
        assert_eq!(g.node(0).status(), NodeStatus::None);
        assert!(!g.is_remote_synced());
        assert!(!g.is_canceled());
        assert!(g.last_error().is_none());
    }

    #[test]
    fn test_diamond_dependencies() {
        let g = ExecutionGraph::new(&dag(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ]))
        .unwrap();

        g.node(0).mark_finished(NodeStatus::Success);
        assert_eq!(g.runnable(), vec![1, 2]);

        g.node(1).mark_finished(NodeStatus::Success);
        assert_eq!(g.runnable(), vec![2]);

        g.node(2).mark_finished(NodeStatus::Success);
        assert_eq!(g.runnable(), vec![3]);
    }
}
