//! String evaluation helpers: `$VAR` expansion, backtick command
//! substitution, and shell-style token splitting.

use std::collections::HashMap;
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::WorkflowError;

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*|\d+)\}|\$([A-Za-z_][A-Za-z0-9_]*|\d+)").unwrap())
}

fn positional_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{(\d+)\}|\$(\d+)").unwrap())
}

fn lookup(name: &str, env: &HashMap<String, String>) -> String {
    env.get(name)
        .cloned()
        .or_else(|| std::env::var(name).ok())
        .unwrap_or_default()
}

/// Expand `$VAR` and `${VAR}` references against `env`, falling back to the
/// process environment. Unknown variables expand to the empty string.
pub fn expand_vars(input: &str, env: &HashMap<String, String>) -> String {
    var_pattern()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(name, env)
        })
        .into_owned()
}

/// Expand only positional references (`$1`, `${2}`, ...). Named variables are
/// left for the shell, which resolves them from the child environment;
/// positionals have no environment-variable meaning there and must be
/// substituted textually.
pub fn expand_positionals(input: &str, env: &HashMap<String, String>) -> String {
    positional_pattern()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            // Only defined parameters are substituted; anything else is left
            // for the shell untouched.
            env.get(name)
                .cloned()
                .unwrap_or_else(|| caps.get(0).unwrap().as_str().to_string())
        })
        .into_owned()
}

/// Evaluate a string: expand variables, then substitute each `` `cmd` ``
/// segment with the trimmed stdout of running `cmd` through `sh -c`.
pub fn eval_string(
    input: &str,
    env: &HashMap<String, String>,
) -> Result<String, WorkflowError> {
    let expanded = expand_vars(input, env);
    if !expanded.contains('`') {
        return Ok(expanded);
    }

    let mut out = String::with_capacity(expanded.len());
    let mut rest = expanded.as_str();
    while let Some(start) = rest.find('`') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('`').ok_or_else(|| {
            WorkflowError::resolution("expression", format!("unterminated backtick in `{input}`"))
        })?;
        out.push_str(&run_substitution(&after[..end], env)?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn run_substitution(
    command: &str,
    env: &HashMap<String, String>,
) -> Result<String, WorkflowError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .envs(env)
        .output()
        .map_err(|e| WorkflowError::resolution("expression", e))?;
    if !output.status.success() {
        return Err(WorkflowError::resolution(
            "expression",
            format!(
                "command `{}` exited with {}",
                command,
                output.status.code().unwrap_or(-1)
            ),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Evaluate a precondition: the condition string is evaluated and compared to
/// the expected value (both trimmed).
pub fn eval_condition(
    condition: &str,
    expected: &str,
    env: &HashMap<String, String>,
) -> Result<bool, WorkflowError> {
    let actual = eval_string(condition, env)?;
    Ok(actual.trim() == expected.trim())
}

/// Split a command line into tokens, honoring single and double quotes.
/// Quote characters delimit tokens and are not kept.
pub fn split_tokens(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else if c == '\\' && q == '"' && matches!(chars.peek(), Some(&'"') | Some(&'\\')) {
                    current.push(chars.next().unwrap());
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Split a command line into the command and its arguments.
pub fn split_command(line: &str) -> (String, Vec<String>) {
    let mut tokens = split_tokens(line);
    if tokens.is_empty() {
        return (String::new(), Vec::new());
    }
    let command = tokens.remove(0);
    (command, tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_expand_vars() {
        let e = env(&[("FOO", "bar"), ("1", "first")]);
        assert_eq!(expand_vars("x $FOO y", &e), "x bar y");
        assert_eq!(expand_vars("${FOO}/sub", &e), "bar/sub");
        assert_eq!(expand_vars("$1", &e), "first");
        assert_eq!(expand_vars("$MISSING_VAR_XYZ", &e), "");
    }

    #[test]
    fn test_expand_positionals_only() {
        let e = env(&[("1", "p1"), ("2", "p2"), ("FOO", "bar")]);
        assert_eq!(
            expand_positionals("params is $1 and ${2}, not $FOO", &e),
            "params is p1 and p2, not $FOO"
        );
    }

    #[test]
    fn test_expand_positionals_keeps_undefined() {
        let e = env(&[("1", "p1")]);
        assert_eq!(expand_positionals("$1 then $2", &e), "p1 then $2");
    }

    #[test]
    fn test_eval_string_backticks() {
        let e = env(&[]);
        assert_eq!(eval_string("`echo hi`", &e).unwrap(), "hi");
        assert_eq!(eval_string("x `echo 1` y", &e).unwrap(), "x 1 y");
        assert!(eval_string("`unterminated", &e).is_err());
    }

    #[test]
    fn test_eval_string_failing_command() {
        assert!(eval_string("`exit 3`", &env(&[])).is_err());
    }

    #[test]
    fn test_eval_condition() {
        let e = env(&[("STAGE", "prod")]);
        assert!(eval_condition("$STAGE", "prod", &e).unwrap());
        assert!(!eval_condition("$STAGE", "dev", &e).unwrap());
        assert!(eval_condition("`echo 42`", " 42 ", &e).unwrap());
    }

    #[test]
    fn test_split_tokens() {
        assert_eq!(
            split_tokens(r#"echo "a b" c"#),
            vec!["echo", "a b", "c"]
        );
        assert_eq!(split_tokens("echo 'x  y'"), vec!["echo", "x  y"]);
        assert_eq!(split_tokens("  "), Vec::<String>::new());
        assert_eq!(split_tokens(r#"a "" b"#), vec!["a", "", "b"]);
    }

    #[test]
    fn test_split_command() {
        let (cmd, args) = split_command(r#"echo "params is $1 and $2""#);
        assert_eq!(cmd, "echo");
        assert_eq!(args, vec!["params is $1 and $2"]);

        let (cmd, args) = split_command("");
        assert_eq!(cmd, "");
        assert!(args.is_empty());
    }
}
