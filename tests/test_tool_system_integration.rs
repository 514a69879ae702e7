use agentrelay::tools::builtin::{CHECKOUT_TOOL, PR_DIFF_TOOL, TEST_RUNNER_TOOL};
use agentrelay::tools::{ToolError, ToolSystem};
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn diff_tools(server: &MockServer, token_env: &str) -> ToolSystem {
    let mut tool_system = ToolSystem::new();
    tool_system
        .register_builtin(
            PR_DIFF_TOOL,
            Some(&json!({ "api_base": server.uri(), "token_env": token_env })),
        )
        .await
        .unwrap();
    tool_system
}

fn changed_files(count: usize, offset: usize) -> Value {
    Value::Array(
        (0..count)
            .map(|i| json!({ "filename": format!("src/module_{}.py", i + offset), "patch": "+x" }))
            .collect(),
    )
}

#[tokio::test]
async fn test_diff_listing_follows_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/octocat/calculator/pulls/42/files"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(changed_files(100, 0)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/octocat/calculator/pulls/42/files"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(changed_files(3, 100)))
        .expect(1)
        .mount(&server)
        .await;

    let tool_system = diff_tools(&server, "AGENTRELAY_TEST_UNSET_TOKEN").await;
    let result = tool_system
        .execute_tool(PR_DIFF_TOOL, &json!({ "repo": "octocat/calculator", "pr_number": 42 }))
        .await
        .unwrap();

    let files = result["files"].as_array().unwrap();
    assert_eq!(files.len(), 103);
    assert_eq!(files[102]["filename"], "src/module_102.py");
}

#[tokio::test]
async fn test_diff_listing_sends_token_from_env() {
    std::env::set_var("AGENTRELAY_TEST_GITHUB_TOKEN", "s3cr3t");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer s3cr3t"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let tool_system = diff_tools(&server, "AGENTRELAY_TEST_GITHUB_TOKEN").await;
    let result = tool_system
        .execute_tool(PR_DIFF_TOOL, &json!({ "repo": "octocat/calculator", "pr_number": 1 }))
        .await
        .unwrap();

    assert_eq!(result["files"], json!([]));
}

#[tokio::test]
async fn test_diff_listing_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let tool_system = diff_tools(&server, "AGENTRELAY_TEST_UNSET_TOKEN").await;
    let result = tool_system
        .execute_tool(PR_DIFF_TOOL, &json!({ "repo": "octocat/calculator", "pr_number": 1 }))
        .await;

    match result {
        Err(ToolError::ExecutionError(message)) => assert!(message.contains("502")),
        other => panic!("expected execution error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_builtin_schemas_reject_bad_arguments() {
    let mut tool_system = ToolSystem::new();
    for name in [CHECKOUT_TOOL, PR_DIFF_TOOL, TEST_RUNNER_TOOL] {
        tool_system.register_builtin(name, None).await.unwrap();
    }

    let bad_calls = [
        (CHECKOUT_TOOL, json!({ "repo": "octocat/calculator" })),
        (CHECKOUT_TOOL, json!({ "repo": "octocat/calculator", "pr_number": 0 })),
        (PR_DIFF_TOOL, json!({ "repo": "not a repo", "pr_number": 3 })),
        (TEST_RUNNER_TOOL, json!({ "project_root": "/tmp" })),
    ];

    for (tool, arguments) in bad_calls {
        let result = tool_system.execute_tool(tool, &arguments).await;
        assert!(
            matches!(result, Err(ToolError::ValidationError(_))),
            "{tool} accepted {arguments}"
        );
    }
}

#[tokio::test]
async fn test_runner_without_matching_tests_passes() {
    let project = TempDir::new().unwrap();
    std::fs::write(project.path().join("README.md"), "# calculator").unwrap();
    std::fs::write(project.path().join("test_parser.py"), "def test_parse(): pass").unwrap();

    let mut tool_system = ToolSystem::new();
    tool_system
        .register_builtin(TEST_RUNNER_TOOL, Some(&json!({ "pytest_command": "false" })))
        .await
        .unwrap();

    let root = project.path().canonicalize().unwrap();
    let result = tool_system
        .execute_tool(
            TEST_RUNNER_TOOL,
            &json!({
                "project_root": root.to_string_lossy(),
                "files": [{ "filename": "README.md", "patch": "+docs" }]
            }),
        )
        .await
        .unwrap();

    assert_eq!(result["outcome"], "passed");
    assert_eq!(result["files"], json!([]));
    assert_eq!(result["summary"], "No test files matched the changed files.");
}

#[tokio::test]
async fn test_shutdown_releases_tools() {
    let server = MockServer::start().await;
    let mut tool_system = diff_tools(&server, "AGENTRELAY_TEST_UNSET_TOKEN").await;
    tool_system.shutdown().await.unwrap();

    let result = tool_system
        .execute_tool(PR_DIFF_TOOL, &json!({ "repo": "octocat/calculator", "pr_number": 1 }))
        .await;
    assert!(matches!(result, Err(ToolError::ExecutionError(_))));
}
