use std::path::PathBuf;
use std::time::Duration;

use super::step::Step;

/// Default number of days the skip-if-successful gate looks back.
pub const DEFAULT_HIST_RETENTION_DAYS: i32 = 30;

/// Default grace period between signal-on-stop and SIGKILL escalation.
pub const DEFAULT_MAX_CLEANUP_TIME: Duration = Duration::from_secs(60);

/// A validated cron schedule. Only the expression is stored; it is guaranteed
/// to have parsed at build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub expression: String,
}

/// A precondition: `condition` is evaluated at run time and compared against
/// `expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub condition: String,
    pub expected: String,
}

/// Lifecycle handler steps, each optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOn {
    pub exit: Option<Step>,
    pub success: Option<Step>,
    pub failure: Option<Step>,
    pub cancel: Option<Step>,
}

/// The four lifecycle handler kinds with their canonical step names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    Exit,
    Success,
    Failure,
    Cancel,
}

impl HandlerType {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerType::Exit => "onExit",
            HandlerType::Success => "onSuccess",
            HandlerType::Failure => "onFailure",
            HandlerType::Cancel => "onCancel",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailOn {
    pub failure: bool,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailConfig {
    pub from: String,
    pub to: String,
    pub prefix: String,
    pub attach_logs: bool,
}

/// The built workflow: steps with dependencies plus run policies.
/// Immutable once returned by the builder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dag {
    /// Path of the workflow file this DAG was built from.
    pub location: PathBuf,
    pub name: String,
    pub group: String,
    pub description: String,
    pub schedule: Vec<Schedule>,
    pub stop_schedule: Vec<Schedule>,
    pub restart_schedule: Vec<Schedule>,
    pub steps: Vec<Step>,
    pub handler_on: HandlerOn,
    pub timeout: Option<Duration>,
    pub delay: Duration,
    pub restart_wait: Duration,
    /// DAG-level environment as `KEY=VALUE`, in declaration order.
    pub env: Vec<String>,
    pub log_dir: String,
    /// Dotenv file paths, resolved relative to the workflow file at run time.
    pub dotenv: Vec<String>,
    /// Resolved parameter tokens (positional, possibly `KEY=VALUE`).
    pub params: Vec<String>,
    /// The params string as written in the workflow file, kept for display
    /// and retry.
    pub default_params: String,
    pub preconditions: Vec<Condition>,
    pub mail_on: Option<MailOn>,
    pub smtp: Option<SmtpConfig>,
    pub error_mail: Option<MailConfig>,
    pub info_mail: Option<MailConfig>,
    /// Cap on concurrently running steps; zero or negative means unbounded.
    pub max_active_runs: i32,
    pub max_cleanup_time: Duration,
    pub hist_retention_days: i32,
    pub skip_if_successful: bool,
    pub tags: Vec<String>,
}

impl Dag {
    pub fn step_by_name(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        let needle = tag.trim().to_lowercase();
        self.tags.iter().any(|t| *t == needle)
    }

    /// All handler steps that are present, paired with their kind.
    pub fn handlers(&self) -> Vec<(HandlerType, &Step)> {
        let mut out = Vec::new();
        if let Some(s) = &self.handler_on.success {
            out.push((HandlerType::Success, s));
        }
        if let Some(s) = &self.handler_on.failure {
            out.push((HandlerType::Failure, s));
        }
        if let Some(s) = &self.handler_on.cancel {
            out.push((HandlerType::Cancel, s));
        }
        if let Some(s) = &self.handler_on.exit {
            out.push((HandlerType::Exit, s));
        }
        out
    }
}
