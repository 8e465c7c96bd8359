//! Runs another workflow in-process as a single step of this one.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio_util::sync::CancellationToken;

use crate::dag::{load_file, BuildContext, Step};
use crate::error::WorkflowError;
use crate::graph::ExecutionGraph;
use crate::scheduler::{RunStatus, Scheduler};

use super::{ExecContext, Executor, ExecutorRegistry, OutputSink};

pub struct SubWorkflowExecutor {
    workflow_file: PathBuf,
    params: String,
    registry: Arc<ExecutorRegistry>,
    log_dir: PathBuf,
    checkout_dir: PathBuf,
    default_shell: String,
    capsule_interpreters: Arc<Vec<String>>,
    /// Child token: killing this step cancels the nested run, which then
    /// applies its own signal discipline to its children.
    cancel: CancellationToken,
    stdout: Option<OutputSink>,
    stderr: Option<OutputSink>,
}

impl std::fmt::Debug for SubWorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubWorkflowExecutor")
            .field("workflow_file", &self.workflow_file)
            .field("params", &self.params)
            .field("log_dir", &self.log_dir)
            .field("checkout_dir", &self.checkout_dir)
            .field("default_shell", &self.default_shell)
            .field("capsule_interpreters", &self.capsule_interpreters)
            .finish()
    }
}

impl SubWorkflowExecutor {
    pub fn new(ctx: &ExecContext, step: &Step) -> Result<Self, WorkflowError> {
        let sub = step.sub_workflow.as_ref().ok_or_else(|| {
            WorkflowError::Internal("sub-workflow executor on a step without a run target".into())
        })?;

        let workflow_file = resolve_workflow_file(&ctx.dag.location, &sub.name)?;
        Ok(SubWorkflowExecutor {
            workflow_file,
            params: sub.params.clone(),
            registry: ctx.registry.clone(),
            log_dir: ctx.log_dir.clone(),
            checkout_dir: ctx.checkout_dir.clone(),
            default_shell: ctx.default_shell.clone(),
            capsule_interpreters: ctx.capsule_interpreters.clone(),
            cancel: ctx.cancel.child_token(),
            stdout: None,
            stderr: None,
        })
    }
}

/// Resolve a sub-workflow name relative to the parent workflow's directory,
/// trying the name as given and with the usual YAML extensions.
fn resolve_workflow_file(parent: &std::path::Path, name: &str) -> Result<PathBuf, WorkflowError> {
    let base = parent.parent().unwrap_or_else(|| std::path::Path::new("."));
    let candidates = [
        PathBuf::from(name),
        base.join(name),
        base.join(format!("{name}.yaml")),
        base.join(format!("{name}.yml")),
    ];
    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }
    Err(WorkflowError::resolution(
        "sub-workflow",
        format!("workflow `{name}` not found near {}", parent.display()),
    ))
}

#[async_trait]
impl Executor for SubWorkflowExecutor {
    fn set_stdout(&mut self, sink: OutputSink) {
        self.stdout = Some(sink);
    }

    fn set_stderr(&mut self, sink: OutputSink) {
        self.stderr = Some(sink);
    }

    async fn run(&self) -> Result<(), WorkflowError> {
        let mut ctx = BuildContext::new(&self.workflow_file)
            .with_checkout_dir(&self.checkout_dir);
        if !self.params.is_empty() {
            ctx = ctx.with_params(self.params.clone());
        }

        let dag = Arc::new(load_file(&ctx)?);
        let graph = Arc::new(ExecutionGraph::new(&dag)?);

        tracing::info!(workflow = %dag.name, file = %self.workflow_file.display(), "starting sub-workflow");

        let scheduler = Scheduler::new(self.registry.clone())
            .with_log_dir(self.log_dir.clone())
            .with_checkout_dir(self.checkout_dir.clone())
            .with_default_shell(self.default_shell.clone())
            .with_capsule_interpreters(self.capsule_interpreters.as_ref().clone());
        let status = scheduler
            .run(dag.clone(), graph.clone(), None, self.cancel.clone())
            .await;

        if let Some(sink) = &self.stdout {
            let _ = writeln!(sink.lock(), "sub-workflow {} finished: {:?}", dag.name, status);
        }

        match status {
            RunStatus::Success | RunStatus::Skipped => Ok(()),
            RunStatus::Cancel => Err(WorkflowError::Canceled),
            RunStatus::Error => {
                if let (Some(sink), Some(message)) = (&self.stderr, graph.last_error()) {
                    let _ = writeln!(sink.lock(), "sub-workflow {}: {}", dag.name, message);
                }
                // Surfaces as an ordinary step failure so the parent's retry
                // policy applies.
                Err(WorkflowError::ExitCode { code: 1 })
            }
        }
    }

    async fn kill(&self, _signal: Signal) -> Result<(), WorkflowError> {
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("parent.yaml");
        std::fs::write(dir.path().join("child.yaml"), "steps:\n  - name: a\n    command: true\n")
            .unwrap();

        let resolved = resolve_workflow_file(&parent, "child").unwrap();
        assert_eq!(resolved, dir.path().join("child.yaml"));

        let resolved = resolve_workflow_file(&parent, "child.yaml").unwrap();
        assert_eq!(resolved, dir.path().join("child.yaml"));

        assert!(resolve_workflow_file(&parent, "ghost").is_err());
    }
}
