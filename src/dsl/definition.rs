use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// A field that accepts either a single string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    Single(String),
    List(Vec<String>),
}

impl StringOrList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::Single(s) => vec![s],
            StringOrList::List(list) => list,
        }
    }
}

/// A field that accepts an integer or a string expression deferred until run
/// start.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IntOrString {
    Int(i64),
    String(String),
}

/// `env:` accepts a mapping or a list of single-entry mappings. Mappings are
/// kept in document order so later entries may reference earlier ones.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvDef {
    Map(serde_yaml::Mapping),
    List(Vec<serde_yaml::Mapping>),
}

/// `params:` accepts a plain string or a list of scalars.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ParamsDef {
    Single(String),
    List(Vec<serde_yaml::Value>),
}

/// `schedule:` accepts a cron string, a list of cron strings (all "start"),
/// or a map with `start` / `stop` / `restart` keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScheduleDef {
    Single(String),
    Multiple(Vec<String>),
    Detailed(ScheduleDetailDef),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleDetailDef {
    #[serde(default)]
    pub start: Option<StringOrList>,
    #[serde(default)]
    pub stop: Option<StringOrList>,
    #[serde(default)]
    pub restart: Option<StringOrList>,
}

/// `executor:` accepts a bare type name or a `{type, config}` map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExecutorDef {
    Type(String),
    Detailed(ExecutorDetailDef),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorDetailDef {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionDef {
    pub condition: String,
    #[serde(default)]
    pub expected: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContinueOnDef {
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub failure: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryPolicyDef {
    pub limit: IntOrString,
    #[serde(default)]
    pub interval_sec: Option<IntOrString>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RepeatPolicyDef {
    #[serde(default)]
    pub repeat: bool,
    #[serde(default)]
    pub interval_sec: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailOnDef {
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpDef {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MailConfigDef {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub attach_logs: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerOnDef {
    #[serde(default)]
    pub exit: Option<StepDef>,
    #[serde(default)]
    pub success: Option<StepDef>,
    #[serde(default)]
    pub failure: Option<StepDef>,
    #[serde(default)]
    pub cancel: Option<StepDef>,
}

/// Raw step definition as written in the workflow file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StepDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub shell: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub mail_on_error: bool,
    #[serde(default)]
    pub preconditions: Vec<ConditionDef>,
    #[serde(default)]
    pub executor: Option<ExecutorDef>,
    /// Name of a sub-workflow to run in place of a command.
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub params: Option<ParamsDef>,
    /// Remote capsule reference in `owner/repo@ref` form.
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(default)]
    pub continue_on: Option<ContinueOnDef>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicyDef>,
    #[serde(default)]
    pub repeat_policy: Option<RepeatPolicyDef>,
    #[serde(default)]
    pub signal_on_stop: Option<String>,
}

/// Raw top-level workflow definition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Definition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schedule: Option<ScheduleDef>,
    #[serde(default)]
    pub skip_if_successful: bool,
    #[serde(default)]
    pub env: Option<EnvDef>,
    #[serde(default)]
    pub log_dir: String,
    #[serde(default)]
    pub params: Option<ParamsDef>,
    #[serde(default)]
    pub dotenv: Option<StringOrList>,
    #[serde(default)]
    pub mail_on: Option<MailOnDef>,
    #[serde(default)]
    pub smtp: Option<SmtpDef>,
    #[serde(default)]
    pub error_mail: Option<MailConfigDef>,
    #[serde(default)]
    pub info_mail: Option<MailConfigDef>,
    #[serde(default)]
    pub handler_on: Option<HandlerOnDef>,
    #[serde(default)]
    pub max_history_retention_days: Option<i32>,
    #[serde(default)]
    pub max_clean_up_time_sec: Option<u64>,
    #[serde(default)]
    pub max_active_runs: Option<i32>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub delay_sec: Option<u64>,
    #[serde(default)]
    pub restart_wait_sec: Option<u64>,
    #[serde(default)]
    pub tags: Option<StringOrList>,
    #[serde(default)]
    pub preconditions: Vec<ConditionDef>,
    #[serde(default)]
    pub steps: Vec<StepDef>,
}
