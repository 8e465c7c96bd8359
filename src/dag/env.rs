//! Environment handling: DAG `env:` entries, params, and dotenv files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, BuildErrorKind};

/// Stringify a scalar YAML value for use as an environment value.
pub fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Flatten an env mapping (or list of single-entry mappings) into ordered
/// `(KEY, VALUE)` pairs.
pub fn mapping_entries(
    mappings: &[serde_yaml::Mapping],
) -> Result<Vec<(String, String)>, BuildError> {
    let mut out = Vec::new();
    for mapping in mappings {
        for (key, value) in mapping {
            let key = key.as_str().ok_or_else(|| {
                BuildError::new(
                    "env",
                    BuildErrorKind::InvalidType {
                        expected: "string key",
                        actual: format!("{key:?}"),
                    },
                )
            })?;
            let value = scalar_to_string(value).ok_or_else(|| {
                BuildError::new(
                    "env",
                    BuildErrorKind::InvalidType {
                        expected: "scalar value",
                        actual: format!("{value:?}"),
                    },
                )
            })?;
            out.push((key.to_string(), value));
        }
    }
    Ok(out)
}

/// Parse dotenv-style content into ordered key/value pairs.
///
/// Supports comments, blank lines, an optional `export ` prefix, and single
/// or double quoted values.
pub fn parse_dotenv(content: &str) -> Result<Vec<(String, String)>, String> {
    let mut vars = Vec::new();

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| format!("line {}: expected KEY=VALUE, got `{raw}`", lineno + 1))?;

        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("line {}: invalid key `{key}`", lineno + 1));
        }

        vars.push((key.to_string(), unquote(value.trim())));
    }

    Ok(vars)
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

/// Resolve a dotenv path relative to the workflow file's directory.
pub fn resolve_dotenv_path(dag_location: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match dag_location.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

/// Load the first dotenv file that exists among `files`. Returns `Ok(None)`
/// when none is present; a located file that fails to parse is an error.
pub fn load_first_dotenv(
    dag_location: &Path,
    files: &[String],
) -> Result<Option<Vec<(String, String)>>, BuildError> {
    for file in files {
        let path = resolve_dotenv_path(dag_location, file);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => continue,
        };
        let vars = parse_dotenv(&content).map_err(|message| {
            BuildError::new(
                "dotenv",
                BuildErrorKind::Dotenv {
                    path: path.display().to_string(),
                    message,
                },
            )
        })?;
        // First successful load wins; remaining files are ignored.
        return Ok(Some(vars));
    }
    Ok(None)
}

/// Parse a params string into positional tokens, exporting both `$1..$N` and
/// any `KEY=VALUE` named entries into `env`.
pub fn apply_params(tokens: &[String], env: &mut HashMap<String, String>) {
    for (i, token) in tokens.iter().enumerate() {
        let value = match token.split_once('=') {
            Some((key, value)) if is_identifier(key) => {
                env.insert(key.to_string(), value.to_string());
                value.to_string()
            }
            _ => token.clone(),
        };
        env.insert((i + 1).to_string(), value);
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
