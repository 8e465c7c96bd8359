//! Remote capsule synchronization: clone or update each referenced capsule
//! repository before any node starts, at most once per `(owner, name, ref)`
//! per run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;

use dashmap::DashMap;
use regex::Regex;
use tokio::process::Command;

use crate::dag::Capsule;
use crate::error::WorkflowError;
use crate::graph::{ExecutionGraph, NodeStatus};

fn input_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._/-]+$").unwrap())
}

/// Clones and updates capsule checkouts. The GitHub endpoints are fields so
/// tests can point at a stub server; defaults are the public ones.
pub struct CapsuleSync {
    client: reqwest::Client,
    /// Base for raw file probes, default `https://raw.githubusercontent.com`.
    pub raw_base: String,
    /// Base for the refs API, default `https://api.github.com`.
    pub api_base: String,
    /// Base for clone URLs, default `https://github.com`.
    pub clone_base: String,
    /// Per-checkout-directory locks: git operations against one capsule
    /// directory are serialized across concurrent runs.
    locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
}

impl Default for CapsuleSync {
    fn default() -> Self {
        Self::new()
    }
}

impl CapsuleSync {
    pub fn new() -> Self {
        CapsuleSync {
            client: reqwest::Client::new(),
            raw_base: "https://raw.githubusercontent.com".to_string(),
            api_base: "https://api.github.com".to_string(),
            clone_base: "https://github.com".to_string(),
            locks: DashMap::new(),
        }
    }

    /// Endpoint override for tests and mirrors.
    pub fn with_bases(
        mut self,
        raw_base: impl Into<String>,
        api_base: impl Into<String>,
        clone_base: impl Into<String>,
    ) -> Self {
        self.raw_base = raw_base.into();
        self.api_base = api_base.into();
        self.clone_base = clone_base.into();
        self
    }

    /// Synchronize every capsule referenced by the graph, once per run.
    ///
    /// A failure is attached to each node referencing the failed capsule;
    /// peers of other capsules still sync.
    pub async fn sync_capsules(&self, graph: &ExecutionGraph) {
        if !graph.set_remote_synced() {
            return;
        }

        // First-seen wins: one sync per distinct (owner, name, ref).
        let mut results: HashMap<String, Result<(), String>> = HashMap::new();
        for node in graph.nodes() {
            let Some(capsule) = &node.step().capsule else {
                continue;
            };
            let key = capsule.reference();
            if !results.contains_key(&key) {
                tracing::info!(capsule = %key, "fetching remote capsule");
                let outcome = self
                    .clone_check(capsule)
                    .await
                    .map_err(|e| e.to_string());
                if let Err(message) = &outcome {
                    tracing::error!(capsule = %key, error = %message, "capsule sync failed");
                }
                results.insert(key.clone(), outcome);
            }
            if let Err(message) = &results[&key] {
                node.mark_error(message.clone());
            }
        }
    }

    /// Ensure one capsule checkout exists and is current.
    pub async fn clone_check(&self, capsule: &Capsule) -> Result<(), WorkflowError> {
        validate_inputs([&capsule.owner, &capsule.name, &capsule.git_ref])?;

        let check_dir = capsule.dir();
        let lock = self
            .locks
            .entry(check_dir.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if !self.capsule_exists(capsule).await {
            return Err(WorkflowError::remote(
                capsule.reference(),
                "repository does not contain a capsule.yaml at its root",
            ));
        }

        if self.is_repo_up_to_date(&check_dir, capsule).await {
            tracing::info!(capsule = %capsule.reference(), "checkout already up to date");
            return Ok(());
        }

        self.clone_or_pull(capsule, &check_dir).await
    }

    /// HEAD the raw manifest URL; HTTP 200 means the capsule exists.
    pub async fn capsule_exists(&self, capsule: &Capsule) -> bool {
        let url = format!(
            "{}/{}/{}/{}/capsule.yaml",
            self.raw_base, capsule.owner, capsule.name, capsule.git_ref
        );
        match self.client.head(&url).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    /// Compare the upstream ref's commit against the local checkout's HEAD.
    /// Any failure along the way reads as "not up to date".
    pub async fn is_repo_up_to_date(&self, check_dir: &Path, capsule: &Capsule) -> bool {
        if !check_dir.exists() {
            return false;
        }

        let url = format!(
            "{}/repos/{}/git/refs/heads/{}",
            self.api_base,
            capsule.full_name(),
            capsule.git_ref
        );
        let resp = match self.client.get(&url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => resp,
            _ => return false,
        };
        let body: serde_json::Value = match resp.json().await {
            Ok(body) => body,
            Err(_) => return false,
        };
        let Some(remote_sha) = body
            .get("object")
            .and_then(|o| o.get("sha"))
            .and_then(|s| s.as_str())
        else {
            return false;
        };

        let output = Command::new("git")
            .args(["-C"])
            .arg(check_dir)
            .args(["rev-parse", "HEAD"])
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                let local_sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
                local_sha == remote_sha
            }
            _ => false,
        }
    }

    async fn clone_or_pull(&self, capsule: &Capsule, check_dir: &Path) -> Result<(), WorkflowError> {
        let reference = capsule.reference();

        if check_dir.exists() {
            let output = Command::new("git")
                .args(["-C"])
                .arg(check_dir)
                .args(["pull", "origin", &capsule.git_ref])
                .output()
                .await
                .map_err(|e| WorkflowError::remote(&reference, format!("git pull: {e}")))?;
            if !output.status.success() {
                return Err(WorkflowError::remote(
                    &reference,
                    format!("git pull: {}", String::from_utf8_lossy(&output.stderr).trim()),
                ));
            }
            return Ok(());
        }

        if let Some(parent) = check_dir.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WorkflowError::remote(&reference, format!("mkdir: {e}")))?;
        }

        let clone_url = format!("{}/{}.git", self.clone_base, capsule.full_name());
        let output = Command::new("git")
            .args(["clone", "--branch", &capsule.git_ref, &clone_url])
            .arg(check_dir)
            .output()
            .await
            .map_err(|e| WorkflowError::remote(&reference, format!("git clone: {e}")))?;
        if !output.status.success() {
            return Err(WorkflowError::remote(
                &reference,
                format!("git clone: {}", String::from_utf8_lossy(&output.stderr).trim()),
            ));
        }
        Ok(())
    }
}

/// Reject any capsule coordinate that could smuggle shell or path tricks
/// into the git invocation.
fn validate_inputs<'a>(inputs: impl IntoIterator<Item = &'a String>) -> Result<(), WorkflowError> {
    for input in inputs {
        if !input_pattern().is_match(input) {
            return Err(WorkflowError::InvalidInput(input.clone()));
        }
    }
    Ok(())
}

/// Cascade pre-run errors: when any node failed before scheduling (a capsule
/// that could not sync), every still-pending node is skipped and the first
/// error becomes the run's error.
pub fn check_initial_errors(graph: &ExecutionGraph) -> Option<String> {
    let first_error = graph.nodes().iter().find_map(|node| {
        let state = node.state();
        if state.status == NodeStatus::Error {
            Some(state.error.unwrap_or_else(|| "unknown error".to_string()))
        } else {
            None
        }
    })?;

    graph.set_last_error(first_error.clone());
    for node in graph.nodes() {
        if node.status() == NodeStatus::None {
            node.set_status(NodeStatus::Skipped);
        }
    }
    Some(first_error)
}
