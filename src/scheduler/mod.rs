//! The topological driver: admits runnable nodes under the concurrency cap,
//! applies retry/repeat policies, propagates skips, and runs the stop
//! sequence and lifecycle handlers.
//!
//! One coordinator task owns graph mutation and admission; each admitted
//! node gets a worker task owning that executor's lifecycle. The coordinator
//! multiplexes over worker completions, retry/repeat timers, cancellation,
//! and the workflow timeout.

pub mod events;
pub mod sync;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::Signal;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dag::env::{apply_params, load_first_dotenv};
use crate::dag::eval::{eval_condition, eval_string, expand_vars};
use crate::dag::{Condition, Dag, HandlerType, RetryPolicy, RetryValue, Step};
use crate::error::WorkflowError;
use crate::executor::{
    CaptureBuffer, ExecContext, ExecutorRegistry, OutputSink, TeeWriter,
    DEFAULT_CAPSULE_INTERPRETERS,
};
use crate::graph::{ExecutionGraph, Node, NodeStatus};
use crate::history::HistoryStore;

pub use events::{create_event_channel, EventReceiver, EventSender, SchedulerEvent};
pub use sync::{check_initial_errors, CapsuleSync};

use events::Events;

/// Final status of one run: the worst node status under
/// Success < Skipped < Cancel < Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Skipped,
    Cancel,
    Error,
}

const DEFAULT_SIGNAL_ON_STOP: Signal = Signal::SIGTERM;

/// Drives one [`ExecutionGraph`] to completion.
pub struct Scheduler {
    registry: Arc<ExecutorRegistry>,
    history: Option<Arc<dyn HistoryStore>>,
    capsule_sync: Arc<CapsuleSync>,
    log_dir: PathBuf,
    checkout_dir: PathBuf,
    default_shell: String,
    capsule_interpreters: Arc<Vec<String>>,
}

impl Scheduler {
    pub fn new(registry: Arc<ExecutorRegistry>) -> Self {
        Scheduler {
            registry,
            history: None,
            capsule_sync: Arc::new(CapsuleSync::new()),
            log_dir: std::env::temp_dir().join("dagrun").join("logs"),
            checkout_dir: std::env::temp_dir().join("dagrun").join("capsules"),
            default_shell: "sh".to_string(),
            capsule_interpreters: Arc::new(
                DEFAULT_CAPSULE_INTERPRETERS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_capsule_sync(mut self, sync: CapsuleSync) -> Self {
        self.capsule_sync = Arc::new(sync);
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_checkout_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkout_dir = dir.into();
        self
    }

    pub fn with_default_shell(mut self, shell: impl Into<String>) -> Self {
        self.default_shell = shell.into();
        self
    }

    pub fn with_capsule_interpreters(mut self, interpreters: Vec<String>) -> Self {
        self.capsule_interpreters = Arc::new(interpreters);
        self
    }

    /// Run the graph to completion. Per-node transitions are reported through
    /// `events` in commit order.
    pub async fn run(
        &self,
        dag: Arc<Dag>,
        graph: Arc<ExecutionGraph>,
        events: Option<EventSender>,
        cancel: CancellationToken,
    ) -> RunStatus {
        let events = Events(events);

        if !dag.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(dag.delay) => {}
                _ = cancel.cancelled() => {
                    for node in graph.nodes() {
                        node.mark_finished(NodeStatus::Cancel);
                    }
                    self.finish(&dag, &graph, &events, RunStatus::Cancel).await;
                    return RunStatus::Cancel;
                }
            }
        }

        // Skip the whole run when the last successful execution is recent
        // enough.
        if dag.skip_if_successful && self.recently_successful(&dag) {
            tracing::info!(workflow = %dag.name, "last successful run still within retention, skipping");
            skip_all_pending(&graph, &events);
            events.emit(SchedulerEvent::WorkflowFinished {
                status: RunStatus::Skipped,
                error: None,
                timestamp: Utc::now(),
            });
            return RunStatus::Skipped;
        }

        let base_env = match self.build_run_env(&dag) {
            Ok(env) => env,
            Err(e) => {
                let message = e.to_string();
                graph.set_last_error(message.clone());
                tracing::error!(workflow = %dag.name, error = %message, "failed to build run environment");
                skip_all_pending(&graph, &events);
                self.finish(&dag, &graph, &events, RunStatus::Error).await;
                return RunStatus::Error;
            }
        };

        // Workflow-level preconditions: any miss skips the run.
        if !self.dag_preconditions_met(&dag, &base_env).await {
            skip_all_pending(&graph, &events);
            events.emit(SchedulerEvent::WorkflowFinished {
                status: RunStatus::Skipped,
                error: None,
                timestamp: Utc::now(),
            });
            return RunStatus::Skipped;
        }

        // Remote capsules are fetched before any node starts; clone failures
        // cascade into a pre-run error.
        self.capsule_sync.sync_capsules(&graph).await;
        if check_initial_errors(&graph).is_some() {
            self.finish(&dag, &graph, &events, RunStatus::Error).await;
            return RunStatus::Error;
        }

        let status = self
            .drive(dag.clone(), graph.clone(), &events, base_env, cancel)
            .await;
        self.finish(&dag, &graph, &events, status).await;
        status
    }

    fn recently_successful(&self, dag: &Dag) -> bool {
        let Some(history) = &self.history else {
            return false;
        };
        if dag.hist_retention_days <= 0 {
            return false;
        }
        match history.last_successful(&dag.location) {
            Some(record) => {
                (Utc::now() - record.started_at).num_days() < dag.hist_retention_days as i64
            }
            None => false,
        }
    }

    async fn dag_preconditions_met(&self, dag: &Dag, env: &HashMap<String, String>) -> bool {
        if dag.preconditions.is_empty() {
            return true;
        }
        let conditions = dag.preconditions.clone();
        let env = env.clone();
        let met = tokio::task::spawn_blocking(move || preconditions_met(&conditions, &env))
            .await
            .unwrap_or(false);
        if !met {
            tracing::info!(workflow = %dag.name, "workflow precondition not met, skipping run");
        }
        met
    }

    /// The run environment: process env, then dotenv contents, then DAG env,
    /// then params. Later layers win.
    fn build_run_env(&self, dag: &Dag) -> Result<HashMap<String, String>, WorkflowError> {
        let mut env: HashMap<String, String> = std::env::vars().collect();

        if let Some(vars) = load_first_dotenv(&dag.location, &dag.dotenv)
            .map_err(|e| WorkflowError::resolution("dotenv", e))?
        {
            env.extend(vars);
        }

        for entry in &dag.env {
            if let Some((key, value)) = entry.split_once('=') {
                env.insert(key.to_string(), value.to_string());
            }
        }

        apply_params(&dag.params, &mut env);
        Ok(env)
    }

    /// The admission loop proper.
    async fn drive(
        &self,
        dag: Arc<Dag>,
        graph: Arc<ExecutionGraph>,
        events: &Events,
        base_env: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> RunStatus {
        let (tx, mut rx) = mpsc::unbounded_channel::<CoordMsg>();
        let shared = Arc::new(WorkerShared {
            dag: dag.clone(),
            graph: graph.clone(),
            registry: self.registry.clone(),
            base_env,
            outputs: Arc::new(RwLock::new(HashMap::new())),
            events: events.clone(),
            tx: tx.clone(),
            cancel: cancel.clone(),
            log_dir: self.resolve_log_dir(&dag),
            checkout_dir: self.checkout_dir.clone(),
            default_shell: self.default_shell.clone(),
            capsule_interpreters: self.capsule_interpreters.clone(),
        });

        let mut inflight: HashSet<usize> = HashSet::new();
        // Nodes waiting out a retry or repeat interval.
        let mut awaiting: HashSet<usize> = HashSet::new();
        let mut canceling = false;
        let mut timed_out = false;

        let has_timeout = dag.timeout.is_some();
        let timeout_sleep =
            tokio::time::sleep(dag.timeout.unwrap_or(Duration::from_secs(86_400 * 365)));
        tokio::pin!(timeout_sleep);

        let max_active = dag.max_active_runs;

        loop {
            propagate_skips(&graph, &inflight, &awaiting, events);

            if !canceling {
                for index in graph.runnable() {
                    if max_active > 0 && inflight.len() >= max_active as usize {
                        break;
                    }
                    if inflight.contains(&index) {
                        continue;
                    }
                    inflight.insert(index);
                    let shared = shared.clone();
                    tokio::spawn(async move { run_node(shared, index).await });
                }
            }

            // Pending retry/repeat timers are abandoned once a stop begins.
            if inflight.is_empty() && (awaiting.is_empty() || canceling) {
                if graph.is_finished() || canceling {
                    break;
                }
                if graph.runnable().is_empty() {
                    // Nothing running, nothing scheduled, graph not finished:
                    // should be unreachable once skips have propagated.
                    graph.set_last_error("scheduler wedged: no runnable nodes");
                    for node in graph.nodes() {
                        if !node.status().is_terminal() {
                            node.mark_error("never became runnable");
                        }
                    }
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !canceling => {
                    canceling = true;
                    graph.set_canceled();
                    self.initiate_stop(&dag, &graph, &tx).await;
                }
                _ = &mut timeout_sleep, if has_timeout && !timed_out && !canceling => {
                    timed_out = true;
                    canceling = true;
                    graph.set_canceled();
                    graph.set_last_error(WorkflowError::Timeout.to_string());
                    tracing::warn!(workflow = %dag.name, "workflow timeout, stopping");
                    self.initiate_stop(&dag, &graph, &tx).await;
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        CoordMsg::Done { index, outcome } => {
                            inflight.remove(&index);
                            handle_done(
                                &graph, index, outcome, canceling, &mut awaiting, &tx, events,
                            );
                        }
                        CoordMsg::Readmit { index, repeat } => {
                            awaiting.remove(&index);
                            if !canceling {
                                let node = graph.node(index);
                                if repeat {
                                    node.reset_for_repeat();
                                } else {
                                    node.reset_for_retry();
                                }
                            }
                        }
                        CoordMsg::Escalate => {
                            escalate_kill(&graph).await;
                        }
                    }
                }
            }
        }

        // Nodes blocked by canceled or failed predecessors are skipped;
        // whatever is still pending after that was stopped mid-flight.
        propagate_skips(&graph, &HashSet::new(), &HashSet::new(), events);
        for node in graph.nodes() {
            if !node.status().is_terminal() {
                node.mark_finished(NodeStatus::Cancel);
                events.emit(SchedulerEvent::NodeFinished {
                    step: node.name().to_string(),
                    status: NodeStatus::Cancel,
                    error: None,
                    timestamp: Utc::now(),
                });
            }
        }

        final_status(&graph)
    }

    /// Graceful stop: deliver each running node's signal-on-stop to its
    /// process group, and escalate to SIGKILL after the cleanup window.
    async fn initiate_stop(
        &self,
        dag: &Dag,
        graph: &Arc<ExecutionGraph>,
        tx: &mpsc::UnboundedSender<CoordMsg>,
    ) {
        for node in graph.nodes() {
            if node.status() != NodeStatus::Running {
                continue;
            }
            let Some(executor) = node.executor() else {
                continue;
            };
            let signal = node
                .step()
                .signal_on_stop
                .as_deref()
                .and_then(|name| name.parse::<Signal>().ok())
                .unwrap_or(DEFAULT_SIGNAL_ON_STOP);
            tracing::info!(step = %node.name(), signal = %signal, "stopping step");
            if let Err(e) = executor.kill(signal).await {
                tracing::warn!(step = %node.name(), error = %e, "failed to signal step");
            }
        }

        let tx = tx.clone();
        let cleanup = dag.max_cleanup_time;
        tokio::spawn(async move {
            tokio::time::sleep(cleanup).await;
            let _ = tx.send(CoordMsg::Escalate);
        });
    }

    fn resolve_log_dir(&self, dag: &Dag) -> PathBuf {
        let base = if dag.log_dir.is_empty() {
            self.log_dir.clone()
        } else {
            PathBuf::from(&dag.log_dir)
        };
        base.join(sanitize_name(&dag.name))
    }

    /// Run lifecycle handlers and emit the final event.
    async fn finish(
        &self,
        dag: &Arc<Dag>,
        graph: &Arc<ExecutionGraph>,
        events: &Events,
        status: RunStatus,
    ) {
        let any_error = graph
            .nodes()
            .iter()
            .any(|n| n.status() == NodeStatus::Error);
        let any_cancel = graph
            .nodes()
            .iter()
            .any(|n| n.status() == NodeStatus::Cancel);
        let all_success = graph
            .nodes()
            .iter()
            .all(|n| n.status() == NodeStatus::Success);

        for (kind, step) in dag.handlers() {
            let applies = match kind {
                HandlerType::Success => all_success,
                HandlerType::Failure => any_error,
                HandlerType::Cancel => any_cancel,
                HandlerType::Exit => true,
            };
            if applies {
                self.run_handler(dag, graph, events, status, kind, step).await;
            }
        }

        events.emit(SchedulerEvent::WorkflowFinished {
            status,
            error: graph.last_error(),
            timestamp: Utc::now(),
        });
    }

    /// Handlers run once, after the graph terminates; their failures are
    /// reported but never change the run's final status.
    async fn run_handler(
        &self,
        dag: &Arc<Dag>,
        graph: &Arc<ExecutionGraph>,
        events: &Events,
        status: RunStatus,
        kind: HandlerType,
        step: &Step,
    ) {
        events.emit(SchedulerEvent::HandlerStarted {
            handler: kind.as_str().to_string(),
            timestamp: Utc::now(),
        });

        let mut env = match self.build_run_env(dag) {
            Ok(env) => env,
            Err(e) => {
                tracing::error!(handler = kind.as_str(), error = %e, "handler environment failed");
                return;
            }
        };
        env.insert(
            "DAGRUN_STATUS".to_string(),
            format!("{status:?}").to_lowercase(),
        );
        env.insert("DAGRUN_DAG_NAME".to_string(), dag.name.clone());
        if let Some(message) = graph.last_error() {
            env.insert("DAGRUN_ERROR".to_string(), message);
        }

        let handler_status = self
            .execute_handler_step(dag, step, env)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(handler = kind.as_str(), error = %e, "handler failed");
                NodeStatus::Error
            });

        events.emit(SchedulerEvent::HandlerFinished {
            handler: kind.as_str().to_string(),
            status: handler_status,
            timestamp: Utc::now(),
        });
    }

    async fn execute_handler_step(
        &self,
        dag: &Arc<Dag>,
        step: &Step,
        mut env: HashMap<String, String>,
    ) -> Result<NodeStatus, WorkflowError> {
        if !step.preconditions.is_empty() {
            let conditions = step.preconditions.clone();
            let env_clone = env.clone();
            let met =
                tokio::task::spawn_blocking(move || preconditions_met(&conditions, &env_clone))
                    .await
                    .unwrap_or(false);
            if !met {
                return Ok(NodeStatus::Skipped);
            }
        }

        env.insert("DAGRUN_STEP_NAME".to_string(), step.name.clone());
        let ctx = ExecContext {
            dag: dag.clone(),
            env: env.into_iter().collect(),
            cancel: CancellationToken::new(),
            registry: self.registry.clone(),
            log_dir: self.resolve_log_dir(dag),
            checkout_dir: self.checkout_dir.clone(),
            default_shell: self.default_shell.clone(),
            capsule_interpreters: self.capsule_interpreters.clone(),
        };

        let log_sink = open_log_sink(&ctx.log_dir, &step.name, None, None)?;
        let mut executor = self.registry.create(&ctx, step)?;
        executor.set_stdout(log_sink.clone());
        executor.set_stderr(log_sink);
        let executor: Arc<dyn crate::executor::Executor> = Arc::from(executor);
        executor.run().await?;
        Ok(NodeStatus::Success)
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "workflow".to_string()
    } else {
        cleaned
    }
}

fn preconditions_met(conditions: &[Condition], env: &HashMap<String, String>) -> bool {
    for condition in conditions {
        match eval_condition(&condition.condition, &condition.expected, env) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                tracing::warn!(condition = %condition.condition, error = %e, "precondition evaluation failed");
                return false;
            }
        }
    }
    true
}

fn skip_all_pending(graph: &ExecutionGraph, events: &Events) {
    for node in graph.nodes() {
        if node.status() == NodeStatus::None {
            node.mark_finished(NodeStatus::Skipped);
            events.emit(SchedulerEvent::NodeFinished {
                step: node.name().to_string(),
                status: NodeStatus::Skipped,
                error: None,
                timestamp: Utc::now(),
            });
        }
    }
}

/// Skip nodes whose predecessors terminated in a state their continue-on
/// flags do not allow past, unless the blocking predecessor is waiting out a
/// retry interval. Iterates to a fixpoint so skip chains settle in one pass.
fn propagate_skips(
    graph: &ExecutionGraph,
    inflight: &HashSet<usize>,
    awaiting: &HashSet<usize>,
    events: &Events,
) {
    loop {
        let mut changed = false;
        for index in 0..graph.nodes().len() {
            let node = graph.node(index);
            if node.status() != NodeStatus::None || inflight.contains(&index) {
                continue;
            }
            if graph.is_blocked_excluding(index, awaiting) {
                node.mark_finished(NodeStatus::Skipped);
                events.emit(SchedulerEvent::NodeFinished {
                    step: node.name().to_string(),
                    status: NodeStatus::Skipped,
                    error: None,
                    timestamp: Utc::now(),
                });
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn final_status(graph: &ExecutionGraph) -> RunStatus {
    let mut status = RunStatus::Success;
    for node in graph.nodes() {
        let node_status = match node.status() {
            NodeStatus::Success => RunStatus::Success,
            NodeStatus::Skipped => RunStatus::Skipped,
            NodeStatus::Cancel => RunStatus::Cancel,
            NodeStatus::Error | NodeStatus::None | NodeStatus::Running => RunStatus::Error,
        };
        status = status.max(node_status);
    }
    status
}

async fn escalate_kill(graph: &ExecutionGraph) {
    for node in graph.nodes() {
        if node.status() != NodeStatus::Running {
            continue;
        }
        if let Some(executor) = node.executor() {
            tracing::warn!(step = %node.name(), "escalating to SIGKILL");
            let _ = executor.kill(Signal::SIGKILL).await;
        }
    }
}

enum CoordMsg {
    Done { index: usize, outcome: Outcome },
    Readmit { index: usize, repeat: bool },
    Escalate,
}

enum Outcome {
    Skipped,
    Success { repeat: Option<Duration> },
    Failed { error: String, retry: Option<Duration> },
}

struct WorkerShared {
    dag: Arc<Dag>,
    graph: Arc<ExecutionGraph>,
    registry: Arc<ExecutorRegistry>,
    base_env: HashMap<String, String>,
    outputs: Arc<RwLock<HashMap<String, String>>>,
    events: Events,
    tx: mpsc::UnboundedSender<CoordMsg>,
    cancel: CancellationToken,
    log_dir: PathBuf,
    checkout_dir: PathBuf,
    default_shell: String,
    capsule_interpreters: Arc<Vec<String>>,
}

fn handle_done(
    graph: &ExecutionGraph,
    index: usize,
    outcome: Outcome,
    canceling: bool,
    awaiting: &mut HashSet<usize>,
    tx: &mpsc::UnboundedSender<CoordMsg>,
    events: &Events,
) {
    let node = graph.node(index);
    match outcome {
        Outcome::Skipped => {
            node.mark_finished(NodeStatus::Skipped);
            events.emit(SchedulerEvent::NodeFinished {
                step: node.name().to_string(),
                status: NodeStatus::Skipped,
                error: None,
                timestamp: Utc::now(),
            });
        }
        Outcome::Success { repeat } => {
            node.mark_finished(NodeStatus::Success);
            events.emit(SchedulerEvent::NodeFinished {
                step: node.name().to_string(),
                status: NodeStatus::Success,
                error: None,
                timestamp: Utc::now(),
            });
            if let Some(interval) = repeat {
                if !canceling {
                    let done_count = node.state().done_count + 1;
                    events.emit(SchedulerEvent::NodeRepeating {
                        step: node.name().to_string(),
                        done_count,
                        timestamp: Utc::now(),
                    });
                    awaiting.insert(index);
                    schedule_readmit(tx.clone(), index, true, interval);
                }
            }
        }
        Outcome::Failed { error, retry } => {
            if canceling {
                node.mark_finished(NodeStatus::Cancel);
                events.emit(SchedulerEvent::NodeFinished {
                    step: node.name().to_string(),
                    status: NodeStatus::Cancel,
                    error: Some(error),
                    timestamp: Utc::now(),
                });
                return;
            }
            match retry {
                Some(interval) => {
                    node.mark_error(error.as_str());
                    let attempt = node.state().retry_count + 1;
                    tracing::info!(
                        step = %node.name(),
                        attempt,
                        interval_secs = interval.as_secs(),
                        "step failed, retry scheduled"
                    );
                    events.emit(SchedulerEvent::NodeRetrying {
                        step: node.name().to_string(),
                        attempt,
                        timestamp: Utc::now(),
                    });
                    awaiting.insert(index);
                    schedule_readmit(tx.clone(), index, false, interval);
                }
                None => {
                    node.mark_error(error.as_str());
                    graph.set_last_error(error.as_str());
                    events.emit(SchedulerEvent::NodeFinished {
                        step: node.name().to_string(),
                        status: NodeStatus::Error,
                        error: Some(error),
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    }
}

fn schedule_readmit(
    tx: mpsc::UnboundedSender<CoordMsg>,
    index: usize,
    repeat: bool,
    interval: Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(interval).await;
        let _ = tx.send(CoordMsg::Readmit { index, repeat });
    });
}

/// Evaluate a possibly deferred retry policy against the run environment.
fn resolve_retry_policy(
    policy: &RetryPolicy,
    env: &HashMap<String, String>,
) -> Result<(u64, Duration), WorkflowError> {
    let limit = resolve_retry_value(&policy.limit, env, "retryPolicy.limit")?;
    let interval = resolve_retry_value(&policy.interval, env, "retryPolicy.intervalSec")?;
    Ok((limit, Duration::from_secs(interval)))
}

fn resolve_retry_value(
    value: &RetryValue,
    env: &HashMap<String, String>,
    field: &str,
) -> Result<u64, WorkflowError> {
    match value {
        RetryValue::Fixed(n) => Ok(*n),
        RetryValue::Deferred(expr) => {
            let evaluated = eval_string(expr, env)?;
            evaluated.trim().parse::<u64>().map_err(|_| {
                WorkflowError::resolution(
                    field,
                    format!("`{expr}` evaluated to `{evaluated}`, expected a non-negative integer"),
                )
            })
        }
    }
}

fn open_log_sink(
    log_dir: &Path,
    step_name: &str,
    capture: Option<CaptureBuffer>,
    redirect: Option<std::fs::File>,
) -> Result<OutputSink, WorkflowError> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(format!("{}.log", sanitize_name(step_name)));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let mut sinks: Vec<Box<dyn std::io::Write + Send>> = vec![Box::new(file)];
    if let Some(capture) = capture {
        sinks.push(Box::new(capture));
    }
    if let Some(redirect) = redirect {
        sinks.push(Box::new(redirect));
    }
    Ok(TeeWriter::new(sinks).into_sink())
}

fn open_redirect(
    dag_location: &Path,
    path: &str,
    env: &HashMap<String, String>,
) -> Result<std::fs::File, WorkflowError> {
    let expanded = expand_vars(path, env);
    let mut resolved = PathBuf::from(&expanded);
    if resolved.is_relative() {
        if let Some(parent) = dag_location.parent() {
            resolved = parent.join(resolved);
        }
    }
    if let Some(parent) = resolved.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(resolved)?)
}

/// One worker: evaluates preconditions, creates the executor, runs it, and
/// reports the outcome. The coordinator owns all terminal state transitions.
async fn run_node(shared: Arc<WorkerShared>, index: usize) {
    let node = shared.graph.node(index).clone();
    let outcome = execute_node(&shared, &node).await;
    let _ = shared.tx.send(CoordMsg::Done { index, outcome });
}

async fn execute_node(shared: &WorkerShared, node: &Arc<Node>) -> Outcome {
    let step = node.step().clone();

    // Step environment: run env, then outputs of finished steps, then the
    // step context.
    let mut env = shared.base_env.clone();
    env.extend(shared.outputs.read().clone());
    env.insert("DAGRUN_DAG_NAME".to_string(), shared.dag.name.clone());
    env.insert("DAGRUN_STEP_NAME".to_string(), step.name.clone());

    // Preconditions and deferred policy values may shell out; keep that off
    // the async workers.
    let policy = {
        let conditions = step.preconditions.clone();
        let retry_policy = step.retry_policy.clone();
        let env = env.clone();
        tokio::task::spawn_blocking(move || {
            if !preconditions_met(&conditions, &env) {
                return Ok(None);
            }
            resolve_retry_policy(&retry_policy, &env).map(Some)
        })
        .await
    };
    let (retry_limit, retry_interval) = match policy {
        Ok(Ok(Some(resolved))) => resolved,
        Ok(Ok(None)) => return Outcome::Skipped,
        Ok(Err(e)) => {
            return Outcome::Failed {
                error: e.to_string(),
                retry: None,
            }
        }
        Err(e) => {
            return Outcome::Failed {
                error: format!("precondition task failed: {e}"),
                retry: None,
            }
        }
    };

    let capture = if step.output.is_empty() {
        None
    } else {
        Some(CaptureBuffer::new())
    };

    let stdout_redirect = if step.stdout.is_empty() {
        None
    } else {
        match open_redirect(&shared.dag.location, &step.stdout, &env) {
            Ok(file) => Some(file),
            Err(e) => {
                return Outcome::Failed {
                    error: format!("stdout redirection: {e}"),
                    retry: None,
                }
            }
        }
    };
    let stderr_redirect = if step.stderr.is_empty() {
        None
    } else {
        match open_redirect(&shared.dag.location, &step.stderr, &env) {
            Ok(file) => Some(file),
            Err(e) => {
                return Outcome::Failed {
                    error: format!("stderr redirection: {e}"),
                    retry: None,
                }
            }
        }
    };

    let stdout_sink = match open_log_sink(
        &shared.log_dir,
        &step.name,
        capture.clone(),
        stdout_redirect,
    ) {
        Ok(sink) => sink,
        Err(e) => {
            return Outcome::Failed {
                error: format!("log sink: {e}"),
                retry: None,
            }
        }
    };
    let stderr_sink = match open_log_sink(
        &shared.log_dir,
        &format!("{}.err", step.name),
        None,
        stderr_redirect,
    ) {
        Ok(sink) => sink,
        Err(e) => {
            return Outcome::Failed {
                error: format!("log sink: {e}"),
                retry: None,
            }
        }
    };

    let ctx = ExecContext {
        dag: shared.dag.clone(),
        env: env.into_iter().collect(),
        cancel: shared.cancel.clone(),
        registry: shared.registry.clone(),
        log_dir: shared.log_dir.clone(),
        checkout_dir: shared.checkout_dir.clone(),
        default_shell: shared.default_shell.clone(),
        capsule_interpreters: shared.capsule_interpreters.clone(),
    };

    let mut executor = match shared.registry.create(&ctx, &step) {
        Ok(executor) => executor,
        Err(e) => {
            return Outcome::Failed {
                error: e.to_string(),
                retry: None,
            }
        }
    };
    executor.set_stdout(stdout_sink);
    executor.set_stderr(stderr_sink);
    let executor: Arc<dyn crate::executor::Executor> = Arc::from(executor);

    node.mark_running();
    node.set_executor(executor.clone());
    shared.events.emit(SchedulerEvent::NodeStarted {
        step: step.name.clone(),
        timestamp: Utc::now(),
    });
    tracing::debug!(step = %step.name, "step started");

    let result = executor.run().await;
    node.clear_executor();

    match result {
        Ok(()) => {
            if let Some(capture) = capture {
                let value = capture.contents().trim_end().to_string();
                shared.outputs.write().insert(step.output.clone(), value);
            }
            let repeat = if step.repeat_policy.repeat {
                Some(step.repeat_policy.interval)
            } else {
                None
            };
            Outcome::Success { repeat }
        }
        Err(e) => {
            let retries_remaining = node.state().retry_count < retry_limit;
            let retry = if e.is_retryable() && retries_remaining {
                Some(retry_interval)
            } else {
                None
            };
            Outcome::Failed {
                error: e.to_string(),
                retry,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::builder::{build, BuildContext};
    use crate::dsl::parse_definition;

    fn scheduler() -> Scheduler {
        let dir = tempfile::tempdir().unwrap().keep();
        Scheduler::new(Arc::new(ExecutorRegistry::with_builtins())).with_log_dir(dir)
    }

    async fn run_yaml(yaml: &str) -> (RunStatus, Arc<ExecutionGraph>) {
        run_yaml_with(yaml, CancellationToken::new()).await
    }

    async fn run_yaml_with(
        yaml: &str,
        cancel: CancellationToken,
    ) -> (RunStatus, Arc<ExecutionGraph>) {
        let def = parse_definition(yaml).unwrap();
        let dag = Arc::new(build(&BuildContext::new("/tmp/test.yaml"), &def).unwrap());
        let graph = Arc::new(ExecutionGraph::new(&dag).unwrap());
        let status = scheduler().run(dag, graph.clone(), None, cancel).await;
        (status, graph)
    }

    #[tokio::test]
    async fn test_single_step_success() {
        let (status, graph) = run_yaml("steps:\n  - name: a\n    command: \"true\"\n").await;
        assert_eq!(status, RunStatus::Success);
        assert_eq!(graph.node(0).status(), NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_failing_step() {
        let (status, graph) = run_yaml("steps:\n  - name: a\n    command: \"false\"\n").await;
        assert_eq!(status, RunStatus::Error);
        assert_eq!(graph.node(0).status(), NodeStatus::Error);
        assert!(graph.last_error().is_some());
    }

    #[tokio::test]
    async fn test_dependent_skipped_after_failure() {
        let (status, graph) = run_yaml(
            r#"
steps:
  - name: a
    command: "false"
  - name: b
    command: "true"
    depends: [a]
"#,
        )
        .await;
        assert_eq!(status, RunStatus::Error);
        assert_eq!(graph.node(0).status(), NodeStatus::Error);
        assert_eq!(graph.node(1).status(), NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn test_continue_on_failure() {
        let (status, graph) = run_yaml(
            r#"
steps:
  - name: a
    command: "false"
    continueOn:
      failure: true
  - name: b
    command: "true"
    depends: [a]
"#,
        )
        .await;
        // The run still reports the failure, but b ran.
        assert_eq!(status, RunStatus::Error);
        assert_eq!(graph.node(1).status(), NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_step_precondition_skip() {
        let (status, graph) = run_yaml(
            r#"
steps:
  - name: a
    command: "true"
    preconditions:
      - condition: "`echo yes`"
        expected: "no"
"#,
        )
        .await;
        assert_eq!(graph.node(0).status(), NodeStatus::Skipped);
        assert_eq!(status, RunStatus::Skipped);
    }

    #[tokio::test]
    async fn test_dag_precondition_skips_run() {
        let (status, graph) = run_yaml(
            r#"
preconditions:
  - condition: "`echo 1`"
    expected: "2"
steps:
  - name: a
    command: "true"
"#,
        )
        .await;
        assert_eq!(status, RunStatus::Skipped);
        assert_eq!(graph.node(0).status(), NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn test_output_capture_flows_to_dependent() {
        let dir = tempfile::tempdir().unwrap();
        let out_file = dir.path().join("result.txt");
        let yaml = format!(
            r#"
steps:
  - name: produce
    command: echo fourty-two
    output: ANSWER
  - name: consume
    command: echo "got $ANSWER"
    depends: [produce]
    stdout: {}
"#,
            out_file.display()
        );
        let (status, _) = run_yaml(&yaml).await;
        assert_eq!(status, RunStatus::Success);
        let contents = std::fs::read_to_string(&out_file).unwrap();
        assert_eq!(contents.trim(), "got fourty-two");
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("attempts");
        // Fails twice, succeeds on the third attempt.
        let script = dir.path().join("flaky.sh");
        std::fs::write(
            &script,
            format!(
                "echo x >> {marker}\ntest $(wc -l < {marker}) -ge 3\n",
                marker = marker.display()
            ),
        )
        .unwrap();
        let yaml = format!(
            r#"
steps:
  - name: flaky
    command: sh {script}
    retryPolicy:
      limit: 3
      intervalSec: 0
"#,
            script = script.display()
        );
        let (status, graph) = run_yaml(&yaml).await;
        assert_eq!(status, RunStatus::Success);
        assert_eq!(graph.node(0).state().retry_count, 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let (status, graph) = run_yaml(
            r#"
steps:
  - name: a
    command: "false"
    retryPolicy:
      limit: 2
      intervalSec: 0
"#,
        )
        .await;
        assert_eq!(status, RunStatus::Error);
        let state = graph.node(0).state();
        assert_eq!(state.status, NodeStatus::Error);
        assert_eq!(state.retry_count, 2);
    }

    #[tokio::test]
    async fn test_deferred_retry_limit() {
        let (status, graph) = run_yaml(
            r#"
env:
  LIMIT: "1"
steps:
  - name: a
    command: "false"
    retryPolicy:
      limit: "$LIMIT"
      intervalSec: 0
"#,
        )
        .await;
        assert_eq!(status, RunStatus::Error);
        assert_eq!(graph.node(0).state().retry_count, 1);
    }

    #[tokio::test]
    async fn test_deferred_retry_limit_invalid() {
        let (status, graph) = run_yaml(
            r#"
env:
  LIMIT: banana
steps:
  - name: a
    command: "true"
    retryPolicy:
      limit: "$LIMIT"
"#,
        )
        .await;
        assert_eq!(status, RunStatus::Error);
        let state = graph.node(0).state();
        assert_eq!(state.status, NodeStatus::Error);
        assert!(state.error.unwrap().contains("non-negative integer"));
    }

    #[tokio::test]
    async fn test_cancellation_cascade() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let (status, graph) = run_yaml_with(
            r#"
maxCleanUpTimeSec: 5
steps:
  - name: a
    command: sleep 10
  - name: b
    command: "true"
    depends: [a]
"#,
            cancel,
        )
        .await;
        assert_eq!(status, RunStatus::Cancel);
        assert_eq!(graph.node(0).status(), NodeStatus::Cancel);
        assert_eq!(graph.node(1).status(), NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn test_timeout_stops_run() {
        let (status, graph) = run_yaml(
            r#"
timeoutSec: 1
maxCleanUpTimeSec: 5
steps:
  - name: a
    command: sleep 30
"#,
        )
        .await;
        assert_eq!(status, RunStatus::Cancel);
        assert_eq!(graph.node(0).status(), NodeStatus::Cancel);
        assert_eq!(
            graph.last_error().as_deref(),
            Some("workflow timeout")
        );
    }

    #[tokio::test]
    async fn test_max_active_runs_caps_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("probe.sh");
        let log = dir.path().join("log");
        std::fs::write(
            &script,
            format!(
                "echo start >> {log}\nsleep 0.3\necho end >> {log}\n",
                log = log.display()
            ),
        )
        .unwrap();

        let yaml = format!(
            r#"
maxActiveRuns: 1
steps:
  - name: a
    command: sh {script}
  - name: b
    command: sh {script}
  - name: c
    command: sh {script}
"#,
            script = script.display()
        );
        let (status, _) = run_yaml(&yaml).await;
        assert_eq!(status, RunStatus::Success);

        // With a cap of one, starts and ends must strictly alternate.
        let contents = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 6);
        for pair in lines.chunks(2) {
            assert_eq!(pair, ["start", "end"]);
        }
    }

    #[tokio::test]
    async fn test_repeat_until_canceled() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });

        let (status, graph) = run_yaml_with(
            r#"
maxCleanUpTimeSec: 2
steps:
  - name: tick
    command: "true"
    repeatPolicy:
      repeat: true
      intervalSec: 0
"#,
            cancel,
        )
        .await;

        // The step repeats until the stop; where exactly the cancel lands
        // determines the terminal status.
        assert!(graph.node(0).state().done_count >= 1);
        assert!(matches!(status, RunStatus::Success | RunStatus::Cancel));
    }

    #[tokio::test]
    async fn test_handlers_run() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("handler");
        let yaml = format!(
            r#"
handlerOn:
  failure:
    command: sh -c "echo failed > {marker}"
  exit:
    command: sh -c "echo done >> {marker}"
steps:
  - name: a
    command: "false"
"#,
            marker = marker.display()
        );
        let (status, _) = run_yaml(&yaml).await;
        assert_eq!(status, RunStatus::Error);
        let contents = std::fs::read_to_string(&marker).unwrap();
        assert!(contents.contains("failed"));
        assert!(contents.contains("done"));
    }

    #[tokio::test]
    async fn test_on_cancel_handler_runs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("canceled");
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            canceller.cancel();
        });

        let yaml = format!(
            r#"
maxCleanUpTimeSec: 5
handlerOn:
  cancel:
    command: sh -c "echo canceled > {marker}"
steps:
  - name: a
    command: sleep 10
"#,
            marker = marker.display()
        );
        let (status, _) = run_yaml_with(&yaml, cancel).await;
        assert_eq!(status, RunStatus::Cancel);
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "canceled");
    }

    #[tokio::test]
    async fn test_final_status_fold_order() {
        assert!(RunStatus::Success < RunStatus::Skipped);
        assert!(RunStatus::Skipped < RunStatus::Cancel);
        assert!(RunStatus::Cancel < RunStatus::Error);
    }

    #[tokio::test]
    async fn test_edge_ordering_linear() {
        let (status, graph) = run_yaml(
            r#"
steps:
  - name: a
    command: "true"
  - name: b
    command: "true"
    depends: [a]
  - name: c
    command: "true"
    depends: [b]
"#,
        )
        .await;
        assert_eq!(status, RunStatus::Success);
        let a = graph.node(0).state();
        let b = graph.node(1).state();
        let c = graph.node(2).state();
        assert!(a.finished_at.unwrap() <= b.started_at.unwrap());
        assert!(b.finished_at.unwrap() <= c.started_at.unwrap());
    }
}
