//! Relevant-test runner tool
//!
//! Picks the pytest files that cover the changed files of a pull request and
//! runs each one from the project root with `PYTHONPATH` pointing at it.

use crate::tools::{Tool, ToolDescription, ToolError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// Output kept per test file
const MAX_OUTPUT_CHARS: usize = 4000;

pub struct TestRunnerTool {
    pytest_command: String,
    file_timeout: Duration,
}

impl Default for TestRunnerTool {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRunnerTool {
    pub fn new() -> Self {
        Self {
            pytest_command: "pytest".to_string(),
            file_timeout: Duration::from_secs(300),
        }
    }

    /// Visible files under `root`, relative and `/`-separated, sorted
    pub fn list_project_files(root: &Path) -> std::io::Result<Vec<String>> {
        fn walk(root: &Path, dir: &Path, files: &mut Vec<String>) -> std::io::Result<()> {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    walk(root, &path, files)?;
                } else if let Ok(relative) = path.strip_prefix(root) {
                    let parts: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    files.push(parts.join("/"));
                }
            }
            Ok(())
        }

        let mut files = Vec::new();
        walk(root, root, &mut files)?;
        files.sort();
        Ok(files)
    }

    /// Test files covering `changed` (pure function)
    ///
    /// `calculator.py` is covered by `test_calculator.py` and
    /// `calculator_test.py` anywhere in the project. Changed test files are
    /// selected themselves.
    pub fn select_test_files(changed: &[String], project_files: &[String]) -> Vec<String> {
        let mut wanted = BTreeSet::new();
        let mut selected = BTreeSet::new();

        for filename in changed {
            let base = file_name(filename);
            if !base.ends_with(".py") {
                continue;
            }
            if is_test_file(base) {
                wanted.insert(base.to_string());
                if project_files.contains(filename) {
                    selected.insert(filename.clone());
                }
                continue;
            }
            let stem = base.trim_end_matches(".py");
            wanted.insert(format!("test_{stem}.py"));
            wanted.insert(format!("{stem}_test.py"));
        }

        for file in project_files {
            if wanted.contains(file_name(file)) && is_test_file(file_name(file)) {
                selected.insert(file.clone());
            }
        }

        selected.into_iter().collect()
    }

    /// Aggregate per-file results into the tool output (pure function)
    pub fn format_report(results: Vec<Value>) -> Value {
        let passed = results
            .iter()
            .filter(|r| r["passed"].as_bool().unwrap_or(false))
            .count();
        let total = results.len();

        let (outcome, summary) = if total == 0 {
            ("passed", "No test files matched the changed files.".to_string())
        } else if passed == total {
            ("passed", format!("All tests passed ({passed} of {total} test files)."))
        } else {
            ("failed", format!("Some tests failed ({passed} of {total} test files passed)."))
        };

        json!({ "outcome": outcome, "summary": summary, "files": results })
    }

    async fn run_test_file(&self, root: &Path, test_file: &str) -> Result<Value, ToolError> {
        let mut command = Command::new(&self.pytest_command);
        command
            .arg(test_file)
            .current_dir(root)
            .env("PYTHONPATH", root)
            .kill_on_drop(true);

        info!(file = test_file, "Running pytest");
        let output = match tokio::time::timeout(self.file_timeout, command.output()).await {
            Ok(result) => result
                .map_err(|e| ToolError::execution(format!("Failed to start pytest: {e}")))?,
            Err(_) => {
                warn!(file = test_file, "pytest timed out");
                return Ok(json!({
                    "file": test_file,
                    "passed": false,
                    "output": format!("Timed out after {}s", self.file_timeout.as_secs()),
                }));
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        Ok(json!({
            "file": test_file,
            "passed": output.status.success(),
            "output": truncate(&text, MAX_OUTPUT_CHARS),
        }))
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_test_file(base: &str) -> bool {
    base.ends_with(".py") && (base.starts_with("test_") || base.ends_with("_test.py"))
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...[truncated]", &text[..idx]),
        None => text.to_string(),
    }
}

#[async_trait]
impl Tool for TestRunnerTool {
    fn describe(&self) -> ToolDescription {
        ToolDescription {
            name: super::TEST_RUNNER_TOOL.to_string(),
            description: "Run the pytest files relevant to a set of changed files".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "project_root": { "type": "string", "minLength": 1 },
                    "files": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "filename": { "type": "string" },
                                "patch": { "type": "string" }
                            },
                            "required": ["filename"]
                        }
                    }
                },
                "required": ["project_root", "files"],
                "additionalProperties": false
            }),
        }
    }

    async fn initialize(&mut self, config: Option<&Value>) -> Result<(), ToolError> {
        if let Some(config) = config {
            if let Some(cmd) = config.get("pytest_command").and_then(|v| v.as_str()) {
                self.pytest_command = cmd.to_string();
            }
            if let Some(secs) = config.get("file_timeout_secs").and_then(|v| v.as_u64()) {
                self.file_timeout = Duration::from_secs(secs);
            }
        }
        Ok(())
    }

    async fn execute(&self, parameters: &Value) -> Result<Value, ToolError> {
        let root = parameters["project_root"]
            .as_str()
            .map(PathBuf::from)
            .ok_or_else(|| ToolError::ValidationError("project_root must be a string".to_string()))?;
        if !root.is_absolute() || !root.is_dir() {
            return Err(ToolError::execution(format!(
                "Project root '{}' is not an absolute directory",
                root.display()
            )));
        }

        let changed: Vec<String> = parameters["files"]
            .as_array()
            .map(|files| {
                files
                    .iter()
                    .filter_map(|f| f["filename"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let listing_root = root.clone();
        let project_files =
            tokio::task::spawn_blocking(move || Self::list_project_files(&listing_root))
                .await
                .map_err(|e| ToolError::execution(format!("File listing task failed: {e}")))?
                .map_err(|e| ToolError::execution(format!("Cannot list project files: {e}")))?;

        let selected = Self::select_test_files(&changed, &project_files);
        info!(changed = changed.len(), selected = selected.len(), "Test files selected");

        let mut results = Vec::with_capacity(selected.len());
        for test_file in &selected {
            results.push(self.run_test_file(&root, test_file).await?);
        }

        Ok(Self::format_report(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_test_files_by_naming_convention() {
        let project = strings(&[
            "calculator.py",
            "tests/test_calculator.py",
            "tests/parser_test.py",
            "tests/test_unrelated.py",
            "parser.py",
        ]);

        let selected =
            TestRunnerTool::select_test_files(&strings(&["calculator.py", "parser.py"]), &project);
        assert_eq!(
            selected,
            vec!["tests/parser_test.py", "tests/test_calculator.py"]
        );
    }

    #[test]
    fn test_changed_test_file_is_selected() {
        let project = strings(&["tests/test_calculator.py", "README.md"]);
        let selected = TestRunnerTool::select_test_files(
            &strings(&["tests/test_calculator.py", "README.md"]),
            &project,
        );
        assert_eq!(selected, vec!["tests/test_calculator.py"]);
    }

    #[test]
    fn test_format_report() {
        let empty = TestRunnerTool::format_report(Vec::new());
        assert_eq!(empty["outcome"], "passed");

        let mixed = TestRunnerTool::format_report(vec![
            json!({"file": "tests/test_a.py", "passed": true, "output": ""}),
            json!({"file": "tests/test_b.py", "passed": false, "output": "1 failed"}),
        ]);
        assert_eq!(mixed["outcome"], "failed");
        assert!(mixed["summary"].as_str().unwrap().contains("1 of 2"));
    }

    #[test]
    fn test_list_project_files_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tests")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("calculator.py"), "").unwrap();
        std::fs::write(dir.path().join("tests/test_calculator.py"), "").unwrap();
        std::fs::write(dir.path().join(".env"), "").unwrap();
        std::fs::write(dir.path().join(".git/config"), "").unwrap();

        let files = TestRunnerTool::list_project_files(dir.path()).unwrap();
        assert_eq!(files, vec!["calculator.py", "tests/test_calculator.py"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_reports_per_file_status() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::write(root.join("calculator.py"), "").unwrap();
        std::fs::write(root.join("test_calculator.py"), "").unwrap();

        for (command, expected) in [("true", "passed"), ("false", "failed")] {
            let mut tool = TestRunnerTool::new();
            tool.initialize(Some(&json!({ "pytest_command": command })))
                .await
                .unwrap();

            let result = tool
                .execute(&json!({
                    "project_root": root.to_string_lossy(),
                    "files": [{ "filename": "calculator.py", "patch": "+x" }]
                }))
                .await
                .unwrap();

            assert_eq!(result["outcome"], expected);
            assert_eq!(result["files"][0]["file"], "test_calculator.py");
        }
    }

    #[tokio::test]
    async fn test_relative_root_rejected() {
        let tool = TestRunnerTool::new();
        let result = tool
            .execute(&json!({ "project_root": "relative/path", "files": [] }))
            .await;
        assert!(matches!(result, Err(ToolError::ExecutionError(_))));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("abcdef", 3), "abc...[truncated]");
    }
}
