//! Remote capsule references and the capsule manifest.
//!
//! A capsule is a workflow shipped as a git repository with a `capsule.yaml`
//! manifest at its root, referenced from a step as `owner/repo@ref`.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, BuildErrorKind};

/// A resolved remote capsule reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capsule {
    pub owner: String,
    pub name: String,
    pub git_ref: String,
    /// Root under which capsules are checked out.
    pub checkout_dir: PathBuf,
    /// Positional params string passed to the capsule.
    pub params: String,
}

impl Capsule {
    /// `owner/name`, as used in clone URLs and log lines.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// `owner/name@ref`.
    pub fn reference(&self) -> String {
        format!("{}/{}@{}", self.owner, self.name, self.git_ref)
    }

    /// Local checkout directory: `<checkout_dir>/<owner>/<name>/<ref>`.
    pub fn dir(&self) -> PathBuf {
        self.checkout_dir
            .join(&self.owner)
            .join(&self.name)
            .join(&self.git_ref)
    }

    /// Path of the manifest inside the checkout.
    pub fn manifest_path(&self) -> PathBuf {
        self.dir().join("capsule.yaml")
    }
}

/// Parse an `owner/repo@ref` reference: exactly one `@`, and exactly one `/`
/// in the left half.
pub fn parse_uses(uses: &str) -> Result<(String, String, String), BuildError> {
    let malformed = || BuildError::new("uses", BuildErrorKind::MalformedUses(uses.to_string()));

    let mut at_parts = uses.split('@');
    let (repo_part, ref_part) = match (at_parts.next(), at_parts.next(), at_parts.next()) {
        (Some(repo), Some(r), None) => (repo, r),
        _ => return Err(malformed()),
    };

    let mut slash_parts = repo_part.split('/');
    let (owner, name) = match (slash_parts.next(), slash_parts.next(), slash_parts.next()) {
        (Some(o), Some(n), None) => (o, n),
        _ => return Err(malformed()),
    };

    if owner.is_empty() || name.is_empty() || ref_part.is_empty() {
        return Err(malformed());
    }

    Ok((owner.to_string(), name.to_string(), ref_part.to_string()))
}

/// The `capsule.yaml` manifest. Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapsuleFileDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Declared inputs, validated by the wrapper before the user script runs.
    #[serde(default)]
    pub inputs: HashMap<String, CapsuleInput>,
    pub runs: CapsuleRuns,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapsuleInput {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CapsuleRuns {
    /// Interpreter binary driving the capsule.
    pub using: String,
    /// Entry-point file, relative to the capsule root.
    pub execution_point: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uses_valid() {
        let (owner, name, git_ref) = parse_uses("acme/checks@v1").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(name, "checks");
        assert_eq!(git_ref, "v1");
    }

    #[test]
    fn test_parse_uses_invalid() {
        for bad in [
            "acme/checks",
            "acme@v1",
            "acme/checks@v1@v2",
            "a/b/c@v1",
            "/x@v1",
            "x/@v1",
            "x/y@",
        ] {
            assert!(parse_uses(bad).is_err(), "expected failure for {bad}");
        }
    }

    #[test]
    fn test_capsule_dir_layout() {
        let capsule = Capsule {
            owner: "acme".into(),
            name: "checks".into(),
            git_ref: "v1".into(),
            checkout_dir: PathBuf::from("/var/capsules"),
            params: String::new(),
        };
        assert_eq!(capsule.dir(), PathBuf::from("/var/capsules/acme/checks/v1"));
        assert_eq!(
            capsule.manifest_path(),
            PathBuf::from("/var/capsules/acme/checks/v1/capsule.yaml")
        );
        assert_eq!(capsule.full_name(), "acme/checks");
        assert_eq!(capsule.reference(), "acme/checks@v1");
    }

    #[test]
    fn test_manifest_strict_decode() {
        let manifest: CapsuleFileDef = serde_yaml::from_str(
            r#"
name: lint
inputs:
  target:
    required: true
runs:
  using: node
  executionPoint: index.js
"#,
        )
        .unwrap();
        assert_eq!(manifest.runs.using, "node");
        assert_eq!(manifest.runs.execution_point, "index.js");
        assert!(manifest.inputs["target"].required);

        let err = serde_yaml::from_str::<CapsuleFileDef>(
            "runs:\n  using: node\n  executionPoint: x.js\nextra: 1\n",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_manifest_requires_runs() {
        assert!(serde_yaml::from_str::<CapsuleFileDef>("name: x\n").is_err());
    }
}
