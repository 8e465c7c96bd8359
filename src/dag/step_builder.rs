//! Builds a single [`Step`] from its raw definition.
//!
//! Step fields run through their own ordered registry, mirroring the
//! top-level field builders.

use nix::sys::signal::Signal;

use crate::dsl::definition::{ExecutorDef, IntOrString, ParamsDef, StepDef};
use crate::error::{BuildError, BuildErrorKind};

use super::builder::BuildContext;
use super::capsule::{parse_uses, Capsule};
use super::env::scalar_to_string;
use super::eval::{split_command, split_tokens};
use super::step::{RetryValue, Step, SubWorkflow};
use super::types::Condition;

/// Placeholder command for steps whose executor drives the work itself.
const COMMAND_RUN: &str = "run";

/// Executor type discriminators synthesized by the builder.
pub const EXECUTOR_TYPE_SUB_WORKFLOW: &str = "subworkflow";
pub const EXECUTOR_TYPE_CAPSULE: &str = "capsule";

type StepBuilderFn = fn(&BuildContext, &StepDef, &mut Step) -> Result<(), BuildError>;

struct StepBuilderEntry {
    name: &'static str,
    build: StepBuilderFn,
}

static STEP_BUILDER_REGISTRY: &[StepBuilderEntry] = &[
    StepBuilderEntry { name: "command", build: build_command },
    StepBuilderEntry { name: "executor", build: build_executor },
    StepBuilderEntry { name: "subworkflow", build: build_sub_workflow },
    StepBuilderEntry { name: "capsule", build: build_capsule },
    StepBuilderEntry { name: "continueOn", build: build_continue_on },
    StepBuilderEntry { name: "retryPolicy", build: build_retry_policy },
    StepBuilderEntry { name: "repeatPolicy", build: build_repeat_policy },
    StepBuilderEntry { name: "signalOnStop", build: build_signal_on_stop },
];

/// Build one step through the step-builder registry.
pub fn build_step(ctx: &BuildContext, def: &StepDef) -> Result<Step, BuildError> {
    assert_step_def(def)?;

    let mut step = Step {
        name: def.name.clone(),
        description: def.description.clone(),
        shell: def.shell.clone(),
        script: def.script.clone(),
        stdout: def.stdout.clone(),
        stderr: def.stderr.clone(),
        output: def.output.clone(),
        dir: def.dir.clone(),
        depends: def.depends.clone(),
        mail_on_error: def.mail_on_error,
        preconditions: def
            .preconditions
            .iter()
            .map(|c| Condition {
                condition: c.condition.clone(),
                expected: c.expected.clone(),
            })
            .collect(),
        ..Default::default()
    };

    for entry in STEP_BUILDER_REGISTRY {
        (entry.build)(ctx, def, &mut step).map_err(|e| e.wrap(entry.name))?;
    }

    Ok(step)
}

fn assert_step_def(def: &StepDef) -> Result<(), BuildError> {
    if def.name.is_empty() {
        return Err(BuildError::new("name", BuildErrorKind::MissingName));
    }
    if !def.command.is_empty() && !def.script.is_empty() {
        return Err(BuildError::new(
            "command",
            BuildErrorKind::Message("command and script are mutually exclusive".into()),
        ));
    }
    if def.run.is_some() && def.uses.is_some() {
        return Err(BuildError::new(
            "run",
            BuildErrorKind::Message("run and uses are mutually exclusive".into()),
        ));
    }
    if def.command.is_empty() && def.script.is_empty() && def.run.is_none() && def.uses.is_none() {
        return Err(BuildError::new(
            "command",
            BuildErrorKind::Message("step has no command, script, run, or uses".into()),
        ));
    }
    Ok(())
}

fn build_command(_ctx: &BuildContext, def: &StepDef, step: &mut Step) -> Result<(), BuildError> {
    if def.command.is_empty() {
        return Ok(());
    }
    let (command, args) = split_command(&def.command);
    step.command = command;
    step.args = args;
    Ok(())
}

fn build_executor(_ctx: &BuildContext, def: &StepDef, step: &mut Step) -> Result<(), BuildError> {
    match &def.executor {
        None => Ok(()),
        Some(ExecutorDef::Type(type_name)) => {
            step.executor_config.type_name = type_name.clone();
            Ok(())
        }
        Some(ExecutorDef::Detailed(detail)) => {
            step.executor_config.type_name = detail.type_name.clone();
            step.executor_config.config = detail.config.clone();
            Ok(())
        }
    }
}

/// Positional parameter tokens for a sub-workflow or capsule step.
fn step_param_tokens(params: Option<&ParamsDef>) -> Result<Vec<String>, BuildError> {
    match params {
        None => Ok(Vec::new()),
        Some(ParamsDef::Single(s)) => Ok(split_tokens(s)),
        Some(ParamsDef::List(values)) => values
            .iter()
            .map(|value| {
                scalar_to_string(value).ok_or_else(|| {
                    BuildError::new(
                        "params",
                        BuildErrorKind::InvalidType {
                            expected: "scalar",
                            actual: format!("{value:?}"),
                        },
                    )
                })
            })
            .collect(),
    }
}

fn build_sub_workflow(
    _ctx: &BuildContext,
    def: &StepDef,
    step: &mut Step,
) -> Result<(), BuildError> {
    let Some(name) = &def.run else {
        return Ok(());
    };

    let tokens = step_param_tokens(def.params.as_ref())?;
    let params_str = tokens.join(" ");
    step.sub_workflow = Some(SubWorkflow {
        name: name.clone(),
        params: params_str.clone(),
    });
    step.executor_config.type_name = EXECUTOR_TYPE_SUB_WORKFLOW.to_string();
    step.command = COMMAND_RUN.to_string();
    step.args = vec![name.clone(), params_str];
    Ok(())
}

fn build_capsule(ctx: &BuildContext, def: &StepDef, step: &mut Step) -> Result<(), BuildError> {
    let Some(uses) = &def.uses else {
        return Ok(());
    };

    let (owner, name, git_ref) = parse_uses(uses)?;
    let tokens = step_param_tokens(def.params.as_ref())?;
    let params_str = tokens.join(" ");

    step.capsule = Some(Capsule {
        owner,
        name,
        git_ref,
        checkout_dir: ctx.checkout_dir.clone(),
        params: params_str,
    });
    step.executor_config.type_name = EXECUTOR_TYPE_CAPSULE.to_string();
    step.command = COMMAND_RUN.to_string();
    // Capsule args stay in KEY=VALUE list form; the executor marshals them
    // into the JSON object handed to the wrapper.
    step.args = tokens;
    Ok(())
}

fn build_continue_on(_ctx: &BuildContext, def: &StepDef, step: &mut Step) -> Result<(), BuildError> {
    if let Some(continue_on) = &def.continue_on {
        step.continue_on.skipped = continue_on.skipped;
        step.continue_on.failure = continue_on.failure;
    }
    Ok(())
}

fn retry_value(value: &IntOrString, field: &str) -> Result<RetryValue, BuildError> {
    match value {
        IntOrString::Int(n) if *n >= 0 => Ok(RetryValue::Fixed(*n as u64)),
        IntOrString::Int(n) => Err(BuildError::new(
            field,
            BuildErrorKind::Message(format!("must be non-negative, got {n}")),
        )),
        IntOrString::String(s) => Ok(RetryValue::Deferred(s.clone())),
    }
}

fn build_retry_policy(_ctx: &BuildContext, def: &StepDef, step: &mut Step) -> Result<(), BuildError> {
    if let Some(policy) = &def.retry_policy {
        step.retry_policy.limit = retry_value(&policy.limit, "limit")?;
        if let Some(interval) = &policy.interval_sec {
            step.retry_policy.interval = retry_value(interval, "intervalSec")?;
        }
    }
    Ok(())
}

fn build_repeat_policy(
    _ctx: &BuildContext,
    def: &StepDef,
    step: &mut Step,
) -> Result<(), BuildError> {
    if let Some(policy) = &def.repeat_policy {
        step.repeat_policy.repeat = policy.repeat;
        step.repeat_policy.interval = std::time::Duration::from_secs(policy.interval_sec);
    }
    Ok(())
}

fn build_signal_on_stop(
    _ctx: &BuildContext,
    def: &StepDef,
    step: &mut Step,
) -> Result<(), BuildError> {
    if let Some(name) = &def.signal_on_stop {
        name.parse::<Signal>().map_err(|_| {
            BuildError::new("", BuildErrorKind::InvalidSignal(name.clone()))
        })?;
        step.signal_on_stop = Some(name.clone());
    }
    Ok(())
}
