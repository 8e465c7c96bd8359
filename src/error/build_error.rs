//! Build-time error types.
//!
//! Field builders report a [`BuildError`] naming the offending field; the
//! builder accumulates them into an [`ErrorList`] instead of stopping at the
//! first violation, so one pass over a workflow file reports every problem.

use std::fmt;

use thiserror::Error;

/// A single specification violation, wrapped with the field it occurred in.
#[derive(Debug, Error)]
#[error("{field}: {kind}")]
pub struct BuildError {
    /// Dotted path of the offending field, e.g. `steps[2].retryPolicy.limit`.
    pub field: String,
    #[source]
    pub kind: BuildErrorKind,
}

impl BuildError {
    pub fn new(field: impl Into<String>, kind: BuildErrorKind) -> Self {
        BuildError {
            field: field.into(),
            kind,
        }
    }

    /// Prefix the field path with an enclosing field name.
    pub fn wrap(mut self, prefix: &str) -> Self {
        if self.field.is_empty() {
            self.field = prefix.to_string();
        } else {
            self.field = format!("{}.{}", prefix, self.field);
        }
        self
    }
}

/// The kinds of violation a field builder can report.
#[derive(Debug, Error)]
pub enum BuildErrorKind {
    #[error("invalid type (expected {expected}, got `{actual}`)")]
    InvalidType {
        expected: &'static str,
        actual: String,
    },
    #[error("failed to parse workflow definition: {0}")]
    Parse(String),
    #[error("step name is required")]
    MissingName,
    #[error("duplicate step name: {0}")]
    DuplicateName(String),
    #[error("depends on undefined step: {0}")]
    UnknownDependency(String),
    #[error("invalid cron expression `{expression}`: {message}")]
    InvalidCron { expression: String, message: String },
    #[error("invalid signal name: {0}")]
    InvalidSignal(String),
    #[error("invalid remote workflow reference `{0}`, expected 'owner/repo@ref'")]
    MalformedUses(String),
    #[error("unknown key: {0}")]
    UnknownKey(String),
    #[error("failed to load dotenv file {path}: {message}")]
    Dotenv { path: String, message: String },
    #[error("{0}")]
    Message(String),
}

/// Accumulated build errors. The builder returns the DAG only when empty.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<BuildError>);

impl ErrorList {
    pub fn push(&mut self, err: BuildError) {
        self.0.push(err);
    }

    pub fn extend(&mut self, other: ErrorList) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn errors(&self) -> &[BuildError] {
        &self.0
    }

    /// Collapse into a result: `value` when no error was recorded.
    pub fn into_result<T>(self, value: T) -> Result<T, ErrorList> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl From<BuildError> for ErrorList {
    fn from(err: BuildError) -> Self {
        ErrorList(vec![err])
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}
