//! The default executor: runs a step's command line (or inline script)
//! through a shell, in its own process group.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::dag::eval::{expand_positionals, expand_vars};
use crate::dag::Step;
use crate::error::WorkflowError;

use super::{ExecContext, Executor, OutputSink};

/// How the child is invoked.
#[derive(Debug)]
enum Invocation {
    /// `shell -c <command_line>`.
    Shell { shell: String, command_line: String },
    /// `shell <script_file>`, with the body written to a temp file at run.
    Script { shell: String, body: String },
    /// Direct argv execution, no shell. Used by the capsule executor.
    Direct { program: String, args: Vec<String> },
}

pub struct CommandExecutor {
    invocation: Invocation,
    env: Vec<(String, String)>,
    dir: Option<PathBuf>,
    stdout: Option<OutputSink>,
    stderr: Option<OutputSink>,
    /// Process group id of the running child; 0 when not started or exited.
    pgid: AtomicI32,
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("invocation", &self.invocation)
            .field("env", &self.env)
            .field("dir", &self.dir)
            .field("pgid", &self.pgid)
            .finish()
    }
}

impl CommandExecutor {
    /// Build the executor for a regular command or script step.
    pub fn from_step(ctx: &ExecContext, step: &Step) -> Result<Self, WorkflowError> {
        let env_map = ctx.env_map();
        let shell = if step.shell.is_empty() {
            ctx.default_shell.clone()
        } else {
            step.shell.clone()
        };

        let invocation = if !step.script.is_empty() {
            Invocation::Script {
                shell,
                body: step.script.clone(),
            }
        } else {
            // Positional parameters have no meaning to the shell as
            // environment variables, so they are substituted textually here;
            // named variables are left for the shell to resolve.
            let command_line = expand_positionals(&step.cmd_with_args(), &env_map);
            Invocation::Shell {
                shell,
                command_line,
            }
        };

        Ok(CommandExecutor {
            invocation,
            env: ctx.env.clone(),
            dir: resolve_dir(&step.dir, &env_map)?,
            stdout: None,
            stderr: None,
            pgid: AtomicI32::new(0),
        })
    }

    /// Build a direct-argv executor (no shell interpretation).
    pub fn direct(
        ctx: &ExecContext,
        step: &Step,
        program: String,
        args: Vec<String>,
    ) -> Result<Self, WorkflowError> {
        Ok(CommandExecutor {
            invocation: Invocation::Direct { program, args },
            env: ctx.env.clone(),
            dir: resolve_dir(&step.dir, &ctx.env_map())?,
            stdout: None,
            stderr: None,
            pgid: AtomicI32::new(0),
        })
    }
}

fn resolve_dir(
    dir: &str,
    env: &std::collections::HashMap<String, String>,
) -> Result<Option<PathBuf>, WorkflowError> {
    if dir.is_empty() {
        return Ok(None);
    }
    let expanded = PathBuf::from(expand_vars(dir, env));
    if !expanded.is_dir() {
        return Err(WorkflowError::resolution(
            "working directory",
            format!("{} does not exist", expanded.display()),
        ));
    }
    Ok(Some(expanded))
}

/// Drain a child stream into a sink (or the void) until EOF.
async fn pump(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    sink: Option<OutputSink>,
) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(sink) = &sink {
                    let mut sink = sink.lock();
                    let _ = sink.write_all(&buf[..n]);
                }
            }
        }
    }
    if let Some(sink) = &sink {
        let _ = sink.lock().flush();
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn set_stdout(&mut self, sink: OutputSink) {
        self.stdout = Some(sink);
    }

    fn set_stderr(&mut self, sink: OutputSink) {
        self.stderr = Some(sink);
    }

    async fn run(&self) -> Result<(), WorkflowError> {
        // The script temp file must outlive the child.
        let mut script_file = None;

        let mut cmd = match &self.invocation {
            Invocation::Shell {
                shell,
                command_line,
            } => {
                let mut cmd = Command::new(shell);
                cmd.arg("-c").arg(command_line);
                cmd
            }
            Invocation::Script { shell, body } => {
                let mut file = tempfile::NamedTempFile::new()?;
                file.write_all(body.as_bytes())?;
                file.flush()?;
                let mut cmd = Command::new(shell);
                cmd.arg(file.path());
                script_file = Some(file);
                cmd
            }
            Invocation::Direct { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };

        cmd.env_clear()
            .envs(self.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            WorkflowError::resolution("command", format!("failed to spawn: {e}"))
        })?;
        if let Some(pid) = child.id() {
            self.pgid.store(pid as i32, Ordering::SeqCst);
        }

        let out_pump = child
            .stdout
            .take()
            .map(|stream| tokio::spawn(pump(stream, self.stdout.clone())));
        let err_pump = child
            .stderr
            .take()
            .map(|stream| tokio::spawn(pump(stream, self.stderr.clone())));

        let status = child.wait().await;
        if let Some(handle) = out_pump {
            let _ = handle.await;
        }
        if let Some(handle) = err_pump {
            let _ = handle.await;
        }
        self.pgid.store(0, Ordering::SeqCst);
        drop(script_file);

        let status = status?;
        if status.success() {
            return Ok(());
        }
        match status.code() {
            Some(code) => Err(WorkflowError::ExitCode { code }),
            None => Err(WorkflowError::Terminated),
        }
    }

    async fn kill(&self, signal: Signal) -> Result<(), WorkflowError> {
        let pgid = self.pgid.load(Ordering::SeqCst);
        if pgid == 0 {
            return Ok(());
        }
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(WorkflowError::Internal(format!(
                "killpg({pgid}, {signal}): {e}"
            ))),
        }
    }
}
