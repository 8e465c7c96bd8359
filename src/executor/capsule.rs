//! Executes a remote capsule: a repository checked out by the scheduler's
//! sync pass, driven through an embedded wrapper script.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde_json::{Map, Value};

use crate::dag::capsule::CapsuleFileDef;
use crate::dag::Step;
use crate::error::WorkflowError;

use super::command::CommandExecutor;
use super::{ExecContext, Executor, OutputSink};

/// The wrapper that validates inputs and hands control to the capsule's
/// entry point. Shipped with the engine, written to a temp path per run;
/// concurrent writers are safe because the contents are byte-identical.
const WRAPPER_SOURCE: &str = include_str!("encapsulated_execution.js");
const WRAPPER_FILE_NAME: &str = "dagrun_encapsulated_execution.js";

pub struct CapsuleExecutor {
    inner: CommandExecutor,
}

impl std::fmt::Debug for CapsuleExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsuleExecutor")
            .field("inner", &self.inner)
            .finish()
    }
}

impl CapsuleExecutor {
    pub fn new(ctx: &ExecContext, step: &Step) -> Result<Self, WorkflowError> {
        let capsule = step.capsule.as_ref().ok_or_else(|| {
            WorkflowError::Internal("capsule executor on a step without a capsule".into())
        })?;
        let reference = capsule.reference();

        let manifest_path = capsule.manifest_path();
        let raw = std::fs::read_to_string(&manifest_path).map_err(|e| {
            WorkflowError::remote(
                &reference,
                format!("cannot read {}: {e}", manifest_path.display()),
            )
        })?;
        let def: CapsuleFileDef = serde_yaml::from_str(&raw)
            .map_err(|e| WorkflowError::remote(&reference, format!("invalid capsule.yaml: {e}")))?;

        // Only allowlisted interpreters may drive a capsule.
        if !ctx.capsule_interpreters.iter().any(|i| *i == def.runs.using) {
            return Err(WorkflowError::resolution(
                "capsule interpreter",
                format!("`{}` is not in the allowlist", def.runs.using),
            ));
        }

        let wrapper = write_wrapper()?;
        let user_script = capsule.dir().join(&def.runs.execution_point);
        let def_json = serde_json::to_string(&def)
            .map_err(|e| WorkflowError::Internal(format!("capsule def to JSON: {e}")))?;
        let params_json = pairs_to_json(&step.args);

        let args = vec![
            wrapper.display().to_string(),
            user_script.display().to_string(),
            def_json,
            params_json,
        ];
        let inner = CommandExecutor::direct(ctx, step, def.runs.using.clone(), args)?;
        Ok(CapsuleExecutor { inner })
    }
}

/// Write the embedded wrapper to the per-process temp path.
fn write_wrapper() -> Result<PathBuf, WorkflowError> {
    let path = std::env::temp_dir().join(WRAPPER_FILE_NAME);
    let mut file = std::fs::File::create(&path)?;
    file.write_all(WRAPPER_SOURCE.as_bytes())?;
    Ok(path)
}

/// Serialize `KEY=VALUE` tokens into a JSON object; tokens without `=` are
/// ignored.
fn pairs_to_json(args: &[String]) -> String {
    let mut map = Map::new();
    for arg in args {
        if let Some((key, value)) = arg.split_once('=') {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(map).to_string()
}

#[async_trait]
impl Executor for CapsuleExecutor {
    fn set_stdout(&mut self, sink: OutputSink) {
        self.inner.set_stdout(sink);
    }

    fn set_stderr(&mut self, sink: OutputSink) {
        self.inner.set_stderr(sink);
    }

    async fn run(&self) -> Result<(), WorkflowError> {
        self.inner.run().await
    }

    async fn kill(&self, signal: Signal) -> Result<(), WorkflowError> {
        self.inner.kill(signal).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::capsule::Capsule;
    use crate::executor::{ExecutorRegistry, DEFAULT_CAPSULE_INTERPRETERS};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ExecContext {
        ExecContext {
            dag: Arc::new(crate::dag::Dag::default()),
            env: std::env::vars().collect(),
            cancel: CancellationToken::new(),
            registry: Arc::new(ExecutorRegistry::with_builtins()),
            log_dir: std::env::temp_dir(),
            checkout_dir: std::env::temp_dir(),
            default_shell: "sh".to_string(),
            capsule_interpreters: Arc::new(
                DEFAULT_CAPSULE_INTERPRETERS.iter().map(|s| s.to_string()).collect(),
            ),
        }
    }

    fn capsule_step(checkout: &std::path::Path) -> Step {
        Step {
            name: "remote".into(),
            command: "run".into(),
            args: vec!["target=prod".into()],
            capsule: Some(Capsule {
                owner: "acme".into(),
                name: "checks".into(),
                git_ref: "v1".into(),
                checkout_dir: checkout.to_path_buf(),
                params: "target=prod".into(),
            }),
            ..Default::default()
        }
    }

    fn write_manifest(checkout: &std::path::Path, using: &str) {
        let dir = checkout.join("acme/checks/v1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("capsule.yaml"),
            format!("runs:\n  using: {using}\n  executionPoint: index.js\n"),
        )
        .unwrap();
    }

    #[test]
    fn test_pairs_to_json() {
        let json = pairs_to_json(&["a=1".into(), "plain".into(), "b=x=y".into()]);
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, serde_json::json!({"a": "1", "b": "x=y"}));
    }

    #[test]
    fn test_missing_checkout_is_remote_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = CapsuleExecutor::new(&ctx(), &capsule_step(tmp.path())).unwrap_err();
        assert!(matches!(err, WorkflowError::Remote { .. }));
    }

    #[test]
    fn test_disallowed_interpreter_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "python3");
        let err = CapsuleExecutor::new(&ctx(), &capsule_step(tmp.path())).unwrap_err();
        assert!(matches!(err, WorkflowError::Resolution { .. }));
    }

    #[test]
    fn test_allowed_interpreter_builds() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "node");
        assert!(CapsuleExecutor::new(&ctx(), &capsule_step(tmp.path())).is_ok());
    }

    #[test]
    fn test_wrapper_written() {
        let path = write_wrapper().unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("collectInputs"));
    }
}
