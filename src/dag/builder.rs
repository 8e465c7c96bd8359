//! Builds a validated [`Dag`] from a raw [`Definition`].
//!
//! The builder drives a fixed, ordered registry of field builders. Entries
//! flagged `metadata` are the only ones run when a caller just needs
//! name/schedule/params without resolving files. Errors are accumulated into
//! an [`ErrorList`] rather than short-circuiting, so a single pass reports
//! every problem in the file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::dsl::definition::{Definition, EnvDef, ParamsDef, ScheduleDef, StringOrList};
use crate::dsl::parser::parse_definition;
use crate::error::{BuildError, BuildErrorKind, ErrorList};

use super::env::{load_first_dotenv, mapping_entries, scalar_to_string};
use super::eval::{eval_string, split_tokens};
use super::schedule::build_schedules;
use super::step_builder::build_step;
use super::types::{
    Condition, Dag, MailConfig, MailOn, SmtpConfig, DEFAULT_HIST_RETENTION_DAYS,
    DEFAULT_MAX_CLEANUP_TIME,
};

/// Context threaded through every field builder.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Path of the workflow file being built.
    pub file: PathBuf,
    /// Optional base configuration file providing shared defaults.
    pub base_config: Option<PathBuf>,
    /// Parameter override in string form.
    pub params: Option<String>,
    /// Parameter override in list form; takes precedence over `params`.
    pub params_list: Option<Vec<String>>,
    /// Build only metadata-flagged fields (cheap listings).
    pub only_metadata: bool,
    /// Skip evaluation of dynamic values (variable expansion, command
    /// substitution, dotenv probing).
    pub no_eval: bool,
    /// Root directory for remote capsule checkouts.
    pub checkout_dir: PathBuf,
}

impl BuildContext {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        BuildContext {
            file: file.into(),
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = Some(params.into());
        self
    }

    pub fn with_checkout_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkout_dir = dir.into();
        self
    }

    pub fn metadata_only(mut self) -> Self {
        self.only_metadata = true;
        self
    }

    pub fn without_eval(mut self) -> Self {
        self.no_eval = true;
        self
    }
}

type BuilderFn = fn(&BuildContext, &Definition, &mut Dag) -> Result<(), BuildError>;

struct BuilderEntry {
    name: &'static str,
    metadata: bool,
    build: BuilderFn,
}

/// The canonical field-builder order. Metadata entries run first and are the
/// only ones used for metadata-only builds.
static BUILDER_REGISTRY: &[BuilderEntry] = &[
    BuilderEntry { name: "env", metadata: true, build: build_envs },
    BuilderEntry { name: "schedule", metadata: true, build: build_schedule },
    BuilderEntry { name: "skipIfSuccessful", metadata: true, build: build_skip_if_successful },
    BuilderEntry { name: "params", metadata: true, build: build_params },
    BuilderEntry { name: "dotenv", metadata: false, build: build_dotenv },
    BuilderEntry { name: "mailOn", metadata: false, build: build_mail_on },
    BuilderEntry { name: "steps", metadata: false, build: build_steps },
    BuilderEntry { name: "logDir", metadata: false, build: build_log_dir },
    BuilderEntry { name: "handlers", metadata: false, build: build_handlers },
    BuilderEntry { name: "smtpConfig", metadata: false, build: build_smtp_config },
    BuilderEntry { name: "errMailConfig", metadata: false, build: build_err_mail_config },
    BuilderEntry { name: "infoMailConfig", metadata: false, build: build_info_mail_config },
    BuilderEntry { name: "maxHistoryRetentionDays", metadata: false, build: build_hist_retention },
    BuilderEntry { name: "maxCleanUpTime", metadata: false, build: build_max_cleanup_time },
    BuilderEntry { name: "preconditions", metadata: false, build: build_preconditions },
];

/// Build a DAG from the definition, accumulating every violation.
pub fn build(ctx: &BuildContext, def: &Definition) -> Result<Dag, ErrorList> {
    let mut dag = Dag {
        location: ctx.file.clone(),
        name: def.name.clone(),
        group: def.group.clone(),
        description: def.description.clone(),
        timeout: def.timeout_sec.filter(|s| *s > 0).map(Duration::from_secs),
        delay: Duration::from_secs(def.delay_sec.unwrap_or(0)),
        restart_wait: Duration::from_secs(def.restart_wait_sec.unwrap_or(0)),
        tags: parse_tags(def.tags.as_ref()),
        max_active_runs: def.max_active_runs.unwrap_or(0),
        max_cleanup_time: DEFAULT_MAX_CLEANUP_TIME,
        hist_retention_days: DEFAULT_HIST_RETENTION_DAYS,
        ..Default::default()
    };

    let mut errs = ErrorList::default();
    for entry in BUILDER_REGISTRY {
        if ctx.only_metadata && !entry.metadata {
            continue;
        }
        if let Err(err) = (entry.build)(ctx, def, &mut dag) {
            errs.push(err.wrap(entry.name));
        }
    }

    errs.into_result(dag)
}

/// Read, parse, and build a workflow file, merging the base configuration
/// when one is set.
pub fn load_file(ctx: &BuildContext) -> Result<Dag, ErrorList> {
    let content = std::fs::read_to_string(&ctx.file).map_err(|e| {
        ErrorList::from(BuildError::new(
            "file",
            BuildErrorKind::Message(format!("{}: {e}", ctx.file.display())),
        ))
    })?;
    let mut def = parse_definition(&content).map_err(ErrorList::from)?;

    if let Some(base_path) = &ctx.base_config {
        if base_path.exists() {
            let base_content = std::fs::read_to_string(base_path).map_err(|e| {
                ErrorList::from(BuildError::new(
                    "baseConfig",
                    BuildErrorKind::Message(format!("{}: {e}", base_path.display())),
                ))
            })?;
            let base = parse_definition(&base_content).map_err(ErrorList::from)?;
            def = merge_over_base(def, base);
        }
    }

    let mut dag = build(ctx, &def)?;
    if dag.name.is_empty() {
        dag.name = ctx
            .file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    Ok(dag)
}

/// Shared defaults from a base configuration file: the workflow's own fields
/// win, base env entries are prepended.
fn merge_over_base(mut def: Definition, base: Definition) -> Definition {
    if let Some(base_env) = base.env {
        let mut merged = match base_env {
            EnvDef::Map(m) => vec![m],
            EnvDef::List(l) => l,
        };
        if let Some(spec_env) = def.env.take() {
            match spec_env {
                EnvDef::Map(m) => merged.push(m),
                EnvDef::List(l) => merged.extend(l),
            }
        }
        def.env = Some(EnvDef::List(merged));
    }
    if def.log_dir.is_empty() {
        def.log_dir = base.log_dir;
    }
    def.smtp = def.smtp.or(base.smtp);
    def.error_mail = def.error_mail.or(base.error_mail);
    def.info_mail = def.info_mail.or(base.info_mail);
    def.mail_on = def.mail_on.or(base.mail_on);
    def.max_history_retention_days = def
        .max_history_retention_days
        .or(base.max_history_retention_days);
    def.max_clean_up_time_sec = def.max_clean_up_time_sec.or(base.max_clean_up_time_sec);
    def
}

/// Lowercase and trim tags from a comma-separated string or a list.
fn parse_tags(tags: Option<&StringOrList>) -> Vec<String> {
    let mut out = Vec::new();
    match tags {
        None => {}
        Some(StringOrList::Single(s)) => {
            for tag in s.split(',') {
                let tag = tag.trim().to_lowercase();
                if !tag.is_empty() {
                    out.push(tag);
                }
            }
        }
        Some(StringOrList::List(list)) => {
            for tag in list {
                let tag = tag.trim().to_lowercase();
                if !tag.is_empty() {
                    out.push(tag);
                }
            }
        }
    }
    out
}

fn env_map(dag: &Dag) -> HashMap<String, String> {
    dag.env
        .iter()
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn build_envs(ctx: &BuildContext, def: &Definition, dag: &mut Dag) -> Result<(), BuildError> {
    let mappings = match &def.env {
        None => return Ok(()),
        Some(EnvDef::Map(m)) => vec![m.clone()],
        Some(EnvDef::List(l)) => l.clone(),
    };

    let mut acc: HashMap<String, String> = HashMap::new();
    for (key, value) in mapping_entries(&mappings)? {
        let value = if ctx.no_eval {
            value
        } else {
            eval_string(&value, &acc)
                .map_err(|e| BuildError::new(&key, BuildErrorKind::Message(e.to_string())))?
        };
        dag.env.push(format!("{key}={value}"));
        acc.insert(key, value);
    }
    Ok(())
}

fn build_schedule(_ctx: &BuildContext, def: &Definition, dag: &mut Dag) -> Result<(), BuildError> {
    let (starts, stops, restarts) = match &def.schedule {
        None => return Ok(()),
        Some(ScheduleDef::Single(s)) => (vec![s.clone()], Vec::new(), Vec::new()),
        Some(ScheduleDef::Multiple(list)) => (list.clone(), Vec::new(), Vec::new()),
        Some(ScheduleDef::Detailed(detail)) => (
            detail.start.clone().map(StringOrList::into_vec).unwrap_or_default(),
            detail.stop.clone().map(StringOrList::into_vec).unwrap_or_default(),
            detail.restart.clone().map(StringOrList::into_vec).unwrap_or_default(),
        ),
    };

    dag.schedule = build_schedules(&starts)?;
    dag.stop_schedule = build_schedules(&stops)?;
    dag.restart_schedule = build_schedules(&restarts)?;
    Ok(())
}

fn build_skip_if_successful(
    _ctx: &BuildContext,
    def: &Definition,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    dag.skip_if_successful = def.skip_if_successful;
    Ok(())
}

fn build_params(ctx: &BuildContext, def: &Definition, dag: &mut Dag) -> Result<(), BuildError> {
    let (tokens, raw) = resolve_param_tokens(ctx, def.params.as_ref())?;
    dag.default_params = raw;

    let env = env_map(dag);
    let mut resolved = Vec::with_capacity(tokens.len());
    for token in tokens {
        let token = if ctx.no_eval {
            token
        } else {
            eval_string(&token, &env)
                .map_err(|e| BuildError::new("", BuildErrorKind::Message(e.to_string())))?
        };
        resolved.push(token);
    }
    dag.params = resolved;
    Ok(())
}

/// Parameter tokens for the run: the override from the context wins over the
/// spec's defaults. Returns the tokens and the raw string form.
fn resolve_param_tokens(
    ctx: &BuildContext,
    spec_params: Option<&ParamsDef>,
) -> Result<(Vec<String>, String), BuildError> {
    if let Some(list) = &ctx.params_list {
        return Ok((list.clone(), list.join(" ")));
    }
    if let Some(s) = &ctx.params {
        return Ok((split_tokens(s), s.clone()));
    }
    match spec_params {
        None => Ok((Vec::new(), String::new())),
        Some(ParamsDef::Single(s)) => Ok((split_tokens(s), s.clone())),
        Some(ParamsDef::List(values)) => {
            let mut tokens = Vec::with_capacity(values.len());
            for value in values {
                let token = scalar_to_string(value).ok_or_else(|| {
                    BuildError::new(
                        "",
                        BuildErrorKind::InvalidType {
                            expected: "scalar",
                            actual: format!("{value:?}"),
                        },
                    )
                })?;
                tokens.push(token);
            }
            let raw = tokens.join(" ");
            Ok((tokens, raw))
        }
    }
}

fn build_dotenv(ctx: &BuildContext, def: &Definition, dag: &mut Dag) -> Result<(), BuildError> {
    match &def.dotenv {
        None => return Ok(()),
        Some(StringOrList::Single(s)) => dag.dotenv.push(s.clone()),
        Some(StringOrList::List(list)) => dag.dotenv.extend(list.iter().cloned()),
    }

    if ctx.no_eval {
        return Ok(());
    }

    // Probe now so a broken file fails the build, not the run.
    load_first_dotenv(&dag.location, &dag.dotenv)?;
    Ok(())
}

fn build_mail_on(_ctx: &BuildContext, def: &Definition, dag: &mut Dag) -> Result<(), BuildError> {
    if let Some(mail_on) = &def.mail_on {
        dag.mail_on = Some(MailOn {
            failure: mail_on.failure,
            success: mail_on.success,
        });
    }
    Ok(())
}

fn build_steps(ctx: &BuildContext, def: &Definition, dag: &mut Dag) -> Result<(), BuildError> {
    let mut steps = Vec::with_capacity(def.steps.len());
    for (i, step_def) in def.steps.iter().enumerate() {
        let step = build_step(ctx, step_def).map_err(|e| e.wrap(&format!("[{i}]")))?;
        steps.push(step);
    }

    // Cross-step validation: unique names, resolvable dependencies.
    let mut seen = std::collections::HashSet::new();
    for step in &steps {
        if !seen.insert(step.name.clone()) {
            return Err(BuildError::new(
                "",
                BuildErrorKind::DuplicateName(step.name.clone()),
            ));
        }
    }
    for step in &steps {
        for dep in &step.depends {
            if !seen.contains(dep) {
                return Err(BuildError::new(
                    step.name.clone(),
                    BuildErrorKind::UnknownDependency(dep.clone()),
                ));
            }
        }
    }

    dag.steps = steps;
    Ok(())
}

fn build_log_dir(_ctx: &BuildContext, def: &Definition, dag: &mut Dag) -> Result<(), BuildError> {
    dag.log_dir = def.log_dir.clone();
    Ok(())
}

fn build_handlers(ctx: &BuildContext, def: &Definition, dag: &mut Dag) -> Result<(), BuildError> {
    let Some(handlers) = &def.handler_on else {
        return Ok(());
    };

    // Handler names are forced to the canonical strings.
    if let Some(step_def) = &handlers.exit {
        let mut step_def = step_def.clone();
        step_def.name = super::types::HandlerType::Exit.as_str().to_string();
        dag.handler_on.exit = Some(build_step(ctx, &step_def).map_err(|e| e.wrap("exit"))?);
    }
    if let Some(step_def) = &handlers.success {
        let mut step_def = step_def.clone();
        step_def.name = super::types::HandlerType::Success.as_str().to_string();
        dag.handler_on.success = Some(build_step(ctx, &step_def).map_err(|e| e.wrap("success"))?);
    }
    if let Some(step_def) = &handlers.failure {
        let mut step_def = step_def.clone();
        step_def.name = super::types::HandlerType::Failure.as_str().to_string();
        dag.handler_on.failure = Some(build_step(ctx, &step_def).map_err(|e| e.wrap("failure"))?);
    }
    if let Some(step_def) = &handlers.cancel {
        let mut step_def = step_def.clone();
        step_def.name = super::types::HandlerType::Cancel.as_str().to_string();
        dag.handler_on.cancel = Some(build_step(ctx, &step_def).map_err(|e| e.wrap("cancel"))?);
    }
    Ok(())
}

fn build_smtp_config(_ctx: &BuildContext, def: &Definition, dag: &mut Dag) -> Result<(), BuildError> {
    if let Some(smtp) = &def.smtp {
        dag.smtp = Some(SmtpConfig {
            host: smtp.host.clone(),
            port: smtp.port.clone(),
            username: smtp.username.clone(),
            password: smtp.password.clone(),
        });
    }
    Ok(())
}

fn build_err_mail_config(
    _ctx: &BuildContext,
    def: &Definition,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    if let Some(mail) = &def.error_mail {
        dag.error_mail = Some(MailConfig {
            from: mail.from.clone(),
            to: mail.to.clone(),
            prefix: mail.prefix.clone(),
            attach_logs: mail.attach_logs,
        });
    }
    Ok(())
}

fn build_info_mail_config(
    _ctx: &BuildContext,
    def: &Definition,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    if let Some(mail) = &def.info_mail {
        dag.info_mail = Some(MailConfig {
            from: mail.from.clone(),
            to: mail.to.clone(),
            prefix: mail.prefix.clone(),
            attach_logs: mail.attach_logs,
        });
    }
    Ok(())
}

fn build_hist_retention(
    _ctx: &BuildContext,
    def: &Definition,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    if let Some(days) = def.max_history_retention_days {
        dag.hist_retention_days = days;
    }
    Ok(())
}

fn build_max_cleanup_time(
    _ctx: &BuildContext,
    def: &Definition,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    if let Some(secs) = def.max_clean_up_time_sec {
        dag.max_cleanup_time = Duration::from_secs(secs);
    }
    Ok(())
}

fn build_preconditions(
    _ctx: &BuildContext,
    def: &Definition,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    dag.preconditions = def
        .preconditions
        .iter()
        .map(|c| Condition {
            condition: c.condition.clone(),
            expected: c.expected.clone(),
        })
        .collect();
    Ok(())
}
