//! Parses raw YAML text into a [`Definition`].

use super::definition::Definition;
use crate::error::{BuildError, BuildErrorKind};

/// Parse workflow YAML into the permissive definition tree.
///
/// Shape errors surfaced here are of the same validation kind as builder
/// errors so callers can aggregate both into one report.
pub fn parse_definition(content: &str) -> Result<Definition, BuildError> {
    serde_yaml::from_str(content)
        .map_err(|e| BuildError::new("", BuildErrorKind::Parse(e.to_string())))
}
