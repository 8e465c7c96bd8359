//! The executor seam: the strategy that actually runs one step.
//!
//! Executors are created per node admission through an [`ExecutorRegistry`]
//! built at program start and passed into the scheduler; there is no
//! process-wide mutable registry.

pub mod capsule;
pub mod command;
pub mod sub_workflow;

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::dag::{Dag, Step};
use crate::error::WorkflowError;

pub use capsule::CapsuleExecutor;
pub use command::CommandExecutor;
pub use nix::sys::signal::Signal;
pub use sub_workflow::SubWorkflowExecutor;

/// Where executor output goes. Sinks are plain [`Write`]rs behind a lock so
/// the scheduler can tee one stream into several destinations.
pub type OutputSink = Arc<Mutex<dyn Write + Send>>;

/// Interpreters a capsule manifest may name in `runs.using`.
pub const DEFAULT_CAPSULE_INTERPRETERS: &[&str] = &["node", "deno", "bun"];

/// Runs a single step. `run` blocks until the work completes, fails, or is
/// killed; `kill` delivers a signal to the whole child process group and is
/// idempotent and safe after termination.
#[async_trait]
pub trait Executor: Send + Sync + std::fmt::Debug {
    fn set_stdout(&mut self, sink: OutputSink);
    fn set_stderr(&mut self, sink: OutputSink);
    async fn run(&self) -> Result<(), WorkflowError>;
    async fn kill(&self, signal: Signal) -> Result<(), WorkflowError>;
}

/// Everything an executor factory needs besides the step itself.
#[derive(Clone)]
pub struct ExecContext {
    pub dag: Arc<Dag>,
    /// Fully resolved child environment for the step.
    pub env: Vec<(String, String)>,
    pub cancel: CancellationToken,
    pub registry: Arc<ExecutorRegistry>,
    pub log_dir: PathBuf,
    pub checkout_dir: PathBuf,
    pub default_shell: String,
    pub capsule_interpreters: Arc<Vec<String>>,
}

impl ExecContext {
    pub fn env_map(&self) -> HashMap<String, String> {
        self.env.iter().cloned().collect()
    }
}

type ExecutorFactory =
    Box<dyn Fn(&ExecContext, &Step) -> Result<Box<dyn Executor>, WorkflowError> + Send + Sync>;

/// Maps executor type names to factories. Write-once at startup, then shared
/// read-only behind an `Arc`.
pub struct ExecutorRegistry {
    factories: HashMap<String, ExecutorFactory>,
}

impl ExecutorRegistry {
    pub fn empty() -> Self {
        ExecutorRegistry {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in executors: the command executor (also the
    /// default for steps with no executor type), sub-workflows, and capsules.
    pub fn with_builtins() -> Self {
        let mut registry = ExecutorRegistry::empty();
        registry.register("command", |ctx, step| {
            Ok(Box::new(CommandExecutor::from_step(ctx, step)?))
        });
        registry.register(crate::dag::step_builder::EXECUTOR_TYPE_SUB_WORKFLOW, |ctx, step| {
            Ok(Box::new(SubWorkflowExecutor::new(ctx, step)?))
        });
        registry.register(crate::dag::step_builder::EXECUTOR_TYPE_CAPSULE, |ctx, step| {
            Ok(Box::new(CapsuleExecutor::new(ctx, step)?))
        });
        registry
    }

    pub fn register(
        &mut self,
        type_name: &str,
        factory: impl Fn(&ExecContext, &Step) -> Result<Box<dyn Executor>, WorkflowError>
            + Send
            + Sync
            + 'static,
    ) {
        self.factories.insert(type_name.to_string(), Box::new(factory));
    }

    /// Create an executor for a step. An empty type selects the command
    /// executor.
    pub fn create(
        &self,
        ctx: &ExecContext,
        step: &Step,
    ) -> Result<Box<dyn Executor>, WorkflowError> {
        let type_name = if step.executor_config.type_name.is_empty() {
            "command"
        } else {
            step.executor_config.type_name.as_str()
        };
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| WorkflowError::UnknownExecutor(type_name.to_string()))?;
        factory(ctx, step)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Writes every chunk to each inner sink.
pub struct TeeWriter {
    sinks: Vec<Box<dyn Write + Send>>,
}

impl TeeWriter {
    pub fn new(sinks: Vec<Box<dyn Write + Send>>) -> Self {
        TeeWriter { sinks }
    }

    pub fn into_sink(self) -> OutputSink {
        Arc::new(Mutex::new(self))
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for sink in &mut self.sinks {
            sink.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

/// A sink that accumulates bytes in memory, read back after the run to
/// populate a step's `output` variable.
#[derive(Clone, Default)]
pub struct CaptureBuffer {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
