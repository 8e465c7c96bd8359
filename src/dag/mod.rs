//! The built, validated workflow model and its builder.
//!
//! [`build`] is the only bridge from the permissive [`crate::dsl`] tree to
//! the strict types here. Everything in this module is immutable after build;
//! run-time state lives in [`crate::graph`].

pub mod builder;
pub mod capsule;
pub mod env;
pub mod eval;
pub mod schedule;
pub mod step;
pub mod step_builder;
pub mod types;

pub use builder::{build, load_file, BuildContext};
pub use capsule::{parse_uses, Capsule, CapsuleFileDef, CapsuleRuns};
pub use step::{
    ContinueOn, ExecutorConfig, RepeatPolicy, RetryPolicy, RetryValue, Step, SubWorkflow,
};
pub use types::{Condition, Dag, HandlerOn, HandlerType, MailConfig, MailOn, Schedule, SmtpConfig};
