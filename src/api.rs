//! The core surface consumed by front-ends: run, retry, and dry-run a
//! workflow file, plus the exit-code mapping.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dag::{load_file, BuildContext, Dag};
use crate::error::WorkflowError;
use crate::executor::ExecutorRegistry;
use crate::graph::ExecutionGraph;
use crate::history::{HistoryStore, RunRecord};
use crate::scheduler::{CapsuleSync, EventSender, RunStatus, Scheduler};

/// Options for a run. All fields have working defaults.
#[derive(Default)]
pub struct RunOptions {
    /// Params override in string form (`--params="p3 p4"`).
    pub params: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub checkout_dir: Option<PathBuf>,
    pub base_config: Option<PathBuf>,
    pub registry: Option<Arc<ExecutorRegistry>>,
    pub history: Option<Arc<dyn HistoryStore>>,
    pub capsule_sync: Option<CapsuleSync>,
    pub events: Option<EventSender>,
    pub cancel: Option<CancellationToken>,
}

/// The admission plan a run would follow, without executing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunReport {
    pub workflow: String,
    /// Step names in admission order (topological, declaration-order
    /// tie-break).
    pub steps: Vec<String>,
}

/// Exit code for a final status: zero for success or skipped, one otherwise.
pub fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Success | RunStatus::Skipped => 0,
        RunStatus::Cancel | RunStatus::Error => 1,
    }
}

fn build_dag(spec: &Path, opts: &RunOptions) -> Result<Arc<Dag>, WorkflowError> {
    let mut ctx = BuildContext::new(spec);
    ctx.base_config = opts.base_config.clone();
    ctx.params = opts.params.clone();
    if let Some(dir) = &opts.checkout_dir {
        ctx.checkout_dir = dir.clone();
    }
    let dag = load_file(&ctx)?;
    Ok(Arc::new(dag))
}

fn build_scheduler(opts: &RunOptions) -> Scheduler {
    let registry = opts
        .registry
        .clone()
        .unwrap_or_else(|| Arc::new(ExecutorRegistry::with_builtins()));
    let mut scheduler = Scheduler::new(registry);
    if let Some(dir) = &opts.log_dir {
        scheduler = scheduler.with_log_dir(dir.clone());
    }
    if let Some(dir) = &opts.checkout_dir {
        scheduler = scheduler.with_checkout_dir(dir.clone());
    }
    if let Some(history) = &opts.history {
        scheduler = scheduler.with_history(history.clone());
    }
    scheduler
}

/// Load, build, and run a workflow file to completion.
pub async fn run(spec: &Path, mut opts: RunOptions) -> Result<RunStatus, WorkflowError> {
    let capsule_sync = opts.capsule_sync.take();
    let dag = build_dag(spec, &opts)?;
    let graph = Arc::new(ExecutionGraph::new(&dag)?);

    let mut scheduler = build_scheduler(&opts);
    if let Some(sync) = capsule_sync {
        scheduler = scheduler.with_capsule_sync(sync);
    }

    let cancel = opts.cancel.clone().unwrap_or_default();
    let request_id = Uuid::new_v4().to_string();
    let started_at = Utc::now();

    tracing::info!(workflow = %dag.name, request_id = %request_id, "starting workflow");
    let status = scheduler
        .run(dag.clone(), graph.clone(), opts.events.clone(), cancel)
        .await;
    tracing::info!(workflow = %dag.name, request_id = %request_id, status = ?status, "workflow finished");

    if let Some(history) = &opts.history {
        history.append(RunRecord {
            request_id,
            file: spec.to_path_buf(),
            params: opts
                .params
                .clone()
                .unwrap_or_else(|| dag.default_params.clone()),
            status,
            started_at,
            finished_at: Some(Utc::now()),
        });
    }

    Ok(status)
}

/// Re-run a finished execution with its original params, found by request id.
pub async fn retry(
    spec: &Path,
    request_id: &str,
    history: Arc<dyn HistoryStore>,
    mut opts: RunOptions,
) -> Result<RunStatus, WorkflowError> {
    let record = history
        .find_by_request_id(spec, request_id)
        .ok_or_else(|| {
            WorkflowError::InvalidInput(format!("no run with request id {request_id}"))
        })?;

    tracing::info!(request_id, params = %record.params, "retrying workflow with original params");
    opts.params = if record.params.is_empty() {
        None
    } else {
        Some(record.params)
    };
    opts.history = Some(history);
    run(spec, opts).await
}

/// Compute the admission plan without executing anything.
pub fn dry_run(spec: &Path, opts: &RunOptions) -> Result<DryRunReport, WorkflowError> {
    let dag = build_dag(spec, opts)?;
    // Validates acyclicity the same way a real run would.
    ExecutionGraph::new(&dag)?;

    // Admission waves: everything runnable in one wave is emitted before any
    // node the wave unblocks, each wave in declaration order.
    let mut emitted: Vec<String> = Vec::with_capacity(dag.steps.len());
    let mut done = vec![false; dag.steps.len()];
    while emitted.len() < dag.steps.len() {
        let wave: Vec<usize> = dag
            .steps
            .iter()
            .enumerate()
            .filter(|(i, step)| {
                !done[*i]
                    && step.depends.iter().all(|dep| {
                        dag.steps
                            .iter()
                            .position(|s| s.name == *dep)
                            .map(|j| done[j])
                            .unwrap_or(false)
                    })
            })
            .map(|(i, _)| i)
            .collect();
        if wave.is_empty() {
            return Err(WorkflowError::Cycle);
        }
        for i in wave {
            done[i] = true;
            emitted.push(dag.steps[i].name.clone());
        }
    }

    Ok(DryRunReport {
        workflow: dag.name.clone(),
        steps: emitted,
    })
}
