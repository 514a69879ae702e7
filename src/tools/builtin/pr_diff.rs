//! Pull request diff tool
//!
//! Lists the files changed by a pull request through the GitHub REST API
//! (`GET /repos/{owner}/{repo}/pulls/{n}/files`) and returns filename/patch
//! pairs. Binary files have no patch and come back with an empty one.

use crate::tools::{Tool, ToolDescription, ToolError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

const PAGE_SIZE: usize = 100;
/// GitHub stops listing after 3000 files
const MAX_PAGES: usize = 30;

#[derive(Debug, Deserialize)]
struct PullRequestFile {
    filename: String,
    #[serde(default)]
    patch: Option<String>,
}

pub struct PullRequestDiffTool {
    client: Option<reqwest::Client>,
    api_base: String,
    token_env: String,
    timeout: Duration,
}

impl Default for PullRequestDiffTool {
    fn default() -> Self {
        Self::new()
    }
}

impl PullRequestDiffTool {
    pub fn new() -> Self {
        Self {
            client: None,
            api_base: "https://api.github.com".to_string(),
            token_env: "GITHUB_ACCESS_TOKEN".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Files endpoint for one page (pure function)
    pub fn files_url(api_base: &str, repo: &str, pr_number: u64, page: usize) -> String {
        format!(
            "{}/repos/{repo}/pulls/{pr_number}/files?per_page={PAGE_SIZE}&page={page}",
            api_base.trim_end_matches('/')
        )
    }

    /// Tool result from the collected files (pure function)
    fn format_files(files: Vec<PullRequestFile>) -> Value {
        let files: Vec<Value> = files
            .into_iter()
            .map(|f| json!({ "filename": f.filename, "patch": f.patch.unwrap_or_default() }))
            .collect();
        json!({ "files": files })
    }

    async fn fetch_page(
        &self,
        client: &reqwest::Client,
        url: &str,
        token: Option<&str>,
    ) -> Result<Vec<PullRequestFile>, ToolError> {
        let mut request = client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "agentrelay")
            .timeout(self.timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::execution(format!("GitHub request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::execution(format!(
                "GitHub returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ToolError::execution(format!("Unexpected GitHub response: {e}")))
    }
}

#[async_trait]
impl Tool for PullRequestDiffTool {
    fn describe(&self) -> ToolDescription {
        ToolDescription {
            name: super::PR_DIFF_TOOL.to_string(),
            description: "List the files changed by a pull request with their patches".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "repo": { "type": "string", "pattern": "^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$" },
                    "pr_number": { "type": "integer", "minimum": 1 }
                },
                "required": ["repo", "pr_number"],
                "additionalProperties": false
            }),
        }
    }

    async fn initialize(&mut self, config: Option<&Value>) -> Result<(), ToolError> {
        if let Some(config) = config {
            if let Some(base) = config.get("api_base").and_then(|v| v.as_str()) {
                self.api_base = base.to_string();
            }
            if let Some(env) = config.get("token_env").and_then(|v| v.as_str()) {
                self.token_env = env.to_string();
            }
            if let Some(secs) = config.get("timeout_secs").and_then(|v| v.as_u64()) {
                self.timeout = Duration::from_secs(secs);
            }
        }

        self.client = Some(
            reqwest::Client::builder()
                .build()
                .map_err(|e| ToolError::InitializationError(e.to_string()))?,
        );
        Ok(())
    }

    async fn execute(&self, parameters: &Value) -> Result<Value, ToolError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ToolError::execution("Tool not initialized"))?;
        let repo = parameters["repo"]
            .as_str()
            .ok_or_else(|| ToolError::ValidationError("repo must be a string".to_string()))?;
        let pr_number = parameters["pr_number"]
            .as_u64()
            .ok_or_else(|| ToolError::ValidationError("pr_number must be a number".to_string()))?;

        let token = std::env::var(&self.token_env).ok();
        if token.is_none() {
            debug!(env = %self.token_env, "No GitHub token set, using anonymous access");
        }

        let mut files = Vec::new();
        for page in 1..=MAX_PAGES {
            let url = Self::files_url(&self.api_base, repo, pr_number, page);
            let batch = self.fetch_page(client, &url, token.as_deref()).await?;
            let last = batch.len() < PAGE_SIZE;
            files.extend(batch);
            if last {
                break;
            }
        }

        info!(repo, pr_number, files = files.len(), "Pull request diff fetched");
        Ok(Self::format_files(files))
    }

    async fn shutdown(&mut self) -> Result<(), ToolError> {
        self.client = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn tool_for(server: &MockServer) -> PullRequestDiffTool {
        let mut tool = PullRequestDiffTool::new();
        tool.initialize(Some(&json!({
            "api_base": server.uri(),
            "token_env": "AGENTRELAY_TEST_UNSET_TOKEN"
        })))
        .await
        .unwrap();
        tool
    }

    #[test]
    fn test_files_url() {
        assert_eq!(
            PullRequestDiffTool::files_url("https://api.github.com/", "octocat/calculator", 42, 1),
            "https://api.github.com/repos/octocat/calculator/pulls/42/files?per_page=100&page=1"
        );
    }

    #[tokio::test]
    async fn test_fetches_filename_patch_pairs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octocat/calculator/pulls/42/files"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "filename": "calculator.py", "patch": "@@ -1 +1 @@\n+def multiply(a, b):" },
                { "filename": "logo.png", "status": "added" }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let tool = tool_for(&server).await;
        let result = tool
            .execute(&json!({"repo": "octocat/calculator", "pr_number": 42}))
            .await
            .unwrap();

        assert_eq!(result["files"][0]["filename"], "calculator.py");
        assert!(result["files"][0]["patch"]
            .as_str()
            .unwrap()
            .contains("multiply"));
        assert_eq!(result["files"][1]["patch"], "");
    }

    #[tokio::test]
    async fn test_not_found_is_execution_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("{\"message\":\"Not Found\"}"))
            .mount(&server)
            .await;

        let tool = tool_for(&server).await;
        let err = tool
            .execute(&json!({"repo": "octocat/missing", "pr_number": 1}))
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::ExecutionError(_)));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_uninitialized_tool_fails() {
        let tool = PullRequestDiffTool::new();
        let result = tool
            .execute(&json!({"repo": "octocat/calculator", "pr_number": 1}))
            .await;
        assert!(result.is_err());
    }
}
