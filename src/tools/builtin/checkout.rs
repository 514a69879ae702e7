//! Pull request checkout tool
//!
//! Clones `<clone_base_url>/<owner>/<repo>.git` into the workspace (once),
//! returns to the default branch, fetches `pull/<n>/head` into `pr-<n>` and
//! checks it out.

use crate::tools::{Tool, ToolDescription, ToolError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

static REPO_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$").expect("Invalid repo regex")
});

/// One git invocation in a checkout plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitStep {
    pub args: Vec<String>,
    /// Failure is tolerated and the plan continues
    pub optional: bool,
}

impl GitStep {
    fn required(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|a| a.to_string()).collect(),
            optional: false,
        }
    }

    fn optional(args: &[&str]) -> Self {
        Self {
            optional: true,
            ..Self::required(args)
        }
    }
}

pub struct CheckoutTool {
    workspace_dir: PathBuf,
    clone_base_url: String,
    git_binary: String,
}

impl Default for CheckoutTool {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckoutTool {
    pub fn new() -> Self {
        Self {
            workspace_dir: PathBuf::from("."),
            clone_base_url: "https://github.com".to_string(),
            git_binary: "git".to_string(),
        }
    }

    /// Reject anything that is not `owner/repo` (pure function)
    pub fn validate_repo(repo: &str) -> Result<(), ToolError> {
        if !REPO_PATTERN.is_match(repo) || repo.split('/').any(|part| part == ".." || part == ".") {
            return Err(ToolError::execution(format!(
                "Repository '{repo}' is not of the form owner/repo"
            )));
        }
        Ok(())
    }

    /// Local directory name for `repo` (pure function)
    pub fn local_dir_name(repo: &str) -> &str {
        repo.rsplit('/').next().unwrap_or(repo)
    }

    /// Git commands run inside the clone (pure function)
    ///
    /// The default-branch checkouts are alternatives; `branch -D` only
    /// matters when an earlier run left the PR branch behind.
    pub fn plan_checkout(pr_number: u64, branch_exists: bool) -> Vec<GitStep> {
        let branch = format!("pr-{pr_number}");
        let refspec = format!("pull/{pr_number}/head:{branch}");

        let mut steps = vec![
            GitStep::optional(&["checkout", "main"]),
            GitStep::optional(&["checkout", "master"]),
        ];
        if branch_exists {
            steps.push(GitStep::required(&["branch", "-D", &branch]));
        }
        steps.push(GitStep::required(&["fetch", "origin", &refspec]));
        steps.push(GitStep::required(&["checkout", &branch]));
        steps
    }

    /// Whether `git branch` output lists `branch` (pure function)
    pub fn branch_listed(branch_output: &str, branch: &str) -> bool {
        branch_output
            .lines()
            .map(|line| line.trim_start_matches('*').trim())
            .any(|name| name == branch)
    }

    async fn git(&self, dir: Option<&Path>, args: &[String]) -> Result<String, ToolError> {
        let mut command = Command::new(&self.git_binary);
        if let Some(dir) = dir {
            command.arg("-C").arg(dir);
        }
        command.args(args);

        debug!(args = ?args, "Running git");
        let output = command
            .output()
            .await
            .map_err(|e| ToolError::execution(format!("Failed to start git: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ToolError::execution(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl Tool for CheckoutTool {
    fn describe(&self) -> ToolDescription {
        ToolDescription {
            name: super::CHECKOUT_TOOL.to_string(),
            description: "Clone a GitHub repository and check out the branch of a pull request"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "repo": { "type": "string", "minLength": 3 },
                    "pr_number": { "type": "integer", "minimum": 1 }
                },
                "required": ["repo", "pr_number"],
                "additionalProperties": false
            }),
        }
    }

    async fn initialize(&mut self, config: Option<&Value>) -> Result<(), ToolError> {
        if let Some(config) = config {
            if let Some(dir) = config.get("workspace_dir").and_then(|v| v.as_str()) {
                self.workspace_dir = PathBuf::from(dir);
            }
            if let Some(url) = config.get("clone_base_url").and_then(|v| v.as_str()) {
                self.clone_base_url = url.trim_end_matches('/').to_string();
            }
            if let Some(git) = config.get("git_binary").and_then(|v| v.as_str()) {
                self.git_binary = git.to_string();
            }
        }
        Ok(())
    }

    async fn execute(&self, parameters: &Value) -> Result<Value, ToolError> {
        let repo = parameters["repo"]
            .as_str()
            .ok_or_else(|| ToolError::ValidationError("repo must be a string".to_string()))?;
        let pr_number = parameters["pr_number"]
            .as_u64()
            .ok_or_else(|| ToolError::ValidationError("pr_number must be a number".to_string()))?;
        Self::validate_repo(repo)?;

        tokio::fs::create_dir_all(&self.workspace_dir)
            .await
            .map_err(|e| ToolError::execution(format!("Cannot create workspace: {e}")))?;
        let workspace = tokio::fs::canonicalize(&self.workspace_dir)
            .await
            .map_err(|e| ToolError::execution(format!("Cannot resolve workspace: {e}")))?;
        let repo_path = workspace.join(Self::local_dir_name(repo));

        if !repo_path.exists() {
            let url = format!("{}/{repo}.git", self.clone_base_url);
            info!(url = %url, path = %repo_path.display(), "Cloning repository");
            self.git(
                None,
                &[
                    "clone".to_string(),
                    url,
                    repo_path.to_string_lossy().into_owned(),
                ],
            )
            .await?;
        }

        let branch = format!("pr-{pr_number}");
        let listing = self.git(Some(&repo_path), &["branch".to_string()]).await?;
        let plan = Self::plan_checkout(pr_number, Self::branch_listed(&listing, &branch));

        let mut default_branch_found = false;
        for step in plan {
            let is_default_checkout = step.args.len() == 2
                && step.args[0] == "checkout"
                && (step.args[1] == "main" || step.args[1] == "master");
            if is_default_checkout && default_branch_found {
                continue;
            }

            match self.git(Some(&repo_path), &step.args).await {
                Ok(_) => default_branch_found |= is_default_checkout,
                Err(e) if step.optional => debug!(error = %e, "Optional git step failed"),
                Err(e) => return Err(e),
            }
        }

        info!(path = %repo_path.display(), pr_number, "Pull request checked out");
        Ok(json!({ "path": repo_path.to_string_lossy() }))
    }
}
