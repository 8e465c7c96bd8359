use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use super::capsule::Capsule;
use super::types::Condition;

/// Executor selection for a step: a type name plus an opaque, string-keyed
/// configuration map the executor itself interprets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorConfig {
    /// Empty means the default command executor.
    pub type_name: String,
    pub config: HashMap<String, Value>,
}

/// Reference to another workflow run in-process as part of this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubWorkflow {
    pub name: String,
    pub params: String,
}

/// Whether dependents may start when this step did not succeed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContinueOn {
    pub skipped: bool,
    pub failure: bool,
}

/// A retry or repeat quantity: fixed at build time, or a string expression
/// evaluated against the run environment at step start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryValue {
    Fixed(u64),
    Deferred(String),
}

impl Default for RetryValue {
    fn default() -> Self {
        RetryValue::Fixed(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of re-admissions after failure.
    pub limit: RetryValue,
    /// Wait between attempts, in seconds when deferred.
    pub interval: RetryValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepeatPolicy {
    pub repeat: bool,
    pub interval: Duration,
}

/// One unit of work in a workflow. Immutable after build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Step {
    pub name: String,
    pub description: String,
    /// Shell used to interpret the command line; empty means the default.
    pub shell: String,
    pub command: String,
    /// Canonical argument list. The human-readable command line is computed
    /// by [`Step::cmd_with_args`] on demand and never stored.
    pub args: Vec<String>,
    /// Inline script body, written to a temporary file and fed to the shell.
    pub script: String,
    /// Optional stdout redirection path.
    pub stdout: String,
    /// Optional stderr redirection path.
    pub stderr: String,
    /// Name of the variable capturing this step's stdout.
    pub output: String,
    pub dir: String,
    pub depends: Vec<String>,
    pub executor_config: ExecutorConfig,
    pub sub_workflow: Option<SubWorkflow>,
    pub capsule: Option<Capsule>,
    pub continue_on: ContinueOn,
    pub retry_policy: RetryPolicy,
    pub repeat_policy: RepeatPolicy,
    /// POSIX signal name delivered on stop; validated at build time.
    pub signal_on_stop: Option<String>,
    pub preconditions: Vec<Condition>,
    pub mail_on_error: bool,
}

impl Step {
    /// The displayable command line, quoting arguments that need it.
    pub fn cmd_with_args(&self) -> String {
        if self.args.is_empty() {
            return self.command.clone();
        }
        let mut out = self.command.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&quote_arg(arg));
        }
        out
    }
}

/// Quote an argument for a POSIX shell, preserving `$` expansion. Tokens
/// without whitespace or quote characters pass through untouched so shell
/// operators split into their own tokens keep their meaning.
pub(crate) fn quote_arg(arg: &str) -> String {
    let needs_quoting = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\''));
    if !needs_quoting {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_with_args_plain() {
        let step = Step {
            command: "echo".into(),
            args: vec!["hello".into(), "world".into()],
            ..Default::default()
        };
        assert_eq!(step.cmd_with_args(), "echo hello world");
    }

    #[test]
    fn test_cmd_with_args_quotes_spaces() {
        let step = Step {
            command: "echo".into(),
            args: vec!["params is $1".into()],
            ..Default::default()
        };
        assert_eq!(step.cmd_with_args(), r#"echo "params is $1""#);
    }

    #[test]
    fn test_cmd_with_args_no_args() {
        let step = Step {
            command: "true".into(),
            ..Default::default()
        };
        assert_eq!(step.cmd_with_args(), "true");
    }

    #[test]
    fn test_quote_arg_escapes() {
        assert_eq!(quote_arg(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quote_arg("plain"), "plain");
        assert_eq!(quote_arg(""), r#""""#);
    }

    #[test]
    fn test_retry_value_default() {
        assert_eq!(RetryValue::default(), RetryValue::Fixed(0));
    }
}
