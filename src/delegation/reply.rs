//! Stage reply schema and parsing
//!
//! Specialists answer with a tagged JSON document:
//!
//! ```json
//! {"status": "success", "artifact": {"kind": "checkout_path", "path": "/repos/calculator"}}
//! {"status": "error", "message": "git fetch failed"}
//! ```
//!
//! The document may be the whole message or sit inside a fenced code block.
//! A reply to an instruction that carried a reference repeats it as a
//! top-level `"ref"` field. Replies without JSON fall back to the labeled
//! text rules free-text agents use (`Local path:`, `File:` blocks,
//! `PASSED`/`FAILED`).

use super::instruction::split_reference;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tagged reply document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageReply {
    Success { artifact: Artifact },
    Error { message: String },
}

impl StageReply {
    pub fn success(artifact: Artifact) -> Self {
        Self::Success { artifact }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize for sending as message content
    pub fn to_content(&self) -> String {
        self.to_content_with_reference(None)
    }

    /// Serialize with the reference of the instruction being answered
    pub fn to_content_with_reference(&self, reference: Option<&str>) -> String {
        let document = serde_json::to_value(self).map(|mut value| {
            if let (Some(reference), Some(fields)) = (reference, value.as_object_mut()) {
                fields.insert("ref".to_string(), reference.into());
            }
            value
        });
        document
            .and_then(|value| serde_json::to_string(&value))
            .unwrap_or_else(|e| {
                format!(r#"{{"status":"error","message":"reply serialization failed: {e}"}}"#)
            })
    }
}

#[derive(Deserialize)]
struct ReferenceField {
    #[serde(rename = "ref")]
    reference: Option<String>,
}

/// Reference a reply carries, if any (pure function)
///
/// Read from the `"ref"` field of a JSON reply or from a trailing
/// `[ref: <key>]` line of a text reply.
pub fn reply_reference(content: &str) -> Option<String> {
    match extract_json(content) {
        Some(json) => serde_json::from_str::<ReferenceField>(json)
            .ok()
            .and_then(|field| field.reference),
        None => split_reference(content).1.map(str::to_string),
    }
}

/// Result extracted from a successful stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    /// Local checkout of the pull request branch
    CheckoutPath { path: String },
    /// Changed files with their patches
    DiffListing { files: Vec<FileDiff> },
    TestReport(TestReport),
}

impl Artifact {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::CheckoutPath { .. } => ArtifactKind::CheckoutPath,
            Artifact::DiffListing { .. } => ArtifactKind::DiffListing,
            Artifact::TestReport(_) => ArtifactKind::TestReport,
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::CheckoutPath { path } => write!(f, "Local path: {path}"),
            Artifact::DiffListing { files } => f.write_str(&render_diff_blocks(files)),
            Artifact::TestReport(report) => write!(f, "{report}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    CheckoutPath,
    DiffListing,
    TestReport,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArtifactKind::CheckoutPath => "checkout_path",
            ArtifactKind::DiffListing => "diff_listing",
            ArtifactKind::TestReport => "test_report",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub filename: String,
    #[serde(default)]
    pub patch: String,
}

impl FileDiff {
    pub fn new(filename: impl Into<String>, patch: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            patch: patch.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TestOutcome::Passed => "PASSED",
            TestOutcome::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub outcome: TestOutcome,
    pub summary: String,
    #[serde(default)]
    pub files: Vec<TestFileResult>,
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Result: {}", self.outcome)?;
        if !self.summary.is_empty() {
            write!(f, "\n{}", self.summary)?;
        }
        for file in &self.files {
            let status = if file.passed { "PASSED" } else { "FAILED" };
            write!(f, "\n- {}: {status}", file.file)?;
        }
        Ok(())
    }
}

/// Outcome of one test file run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFileResult {
    pub file: String,
    pub passed: bool,
    #[serde(default)]
    pub output: String,
}

/// Render `File: <name>` blocks, one per diff
pub fn render_diff_blocks(files: &[FileDiff]) -> String {
    files
        .iter()
        .map(|diff| format!("File: {}\n{}", diff.filename, diff.patch))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Parse `File: <name>` blocks back into diffs (pure function)
///
/// A block starts with `File:` at the beginning of a line; indented lines
/// belong to the current patch. Text before the first block is ignored.
/// Returns an empty vector when no block is present.
pub fn parse_diff_blocks(text: &str) -> Vec<FileDiff> {
    let mut files = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        if let Some(name) = line.strip_prefix("File:") {
            if let Some((filename, patch)) = current.take() {
                files.push(FileDiff::new(filename, patch.join("\n").trim().to_string()));
            }
            current = Some((name.trim().to_string(), Vec::new()));
        } else if let Some((_, patch)) = current.as_mut() {
            patch.push(line);
        }
    }

    if let Some((filename, patch)) = current {
        files.push(FileDiff::new(filename, patch.join("\n").trim().to_string()));
    }

    files.retain(|diff| !diff.filename.is_empty());
    files
}

/// How a reply was understood
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedReply {
    Artifact(Artifact),
    /// The specialist reported an explicit failure
    RemoteError(String),
    /// Reply did not have the expected shape
    Malformed(String),
}

static FENCED_JSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fence pattern is valid")
});

static LOCAL_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)Local path:\s*(\S.*?)\s*$").expect("path pattern is valid"));

/// Extract the artifact a stage expects from reply text (pure function)
pub fn parse_reply(content: &str, expected: ArtifactKind) -> ParsedReply {
    let (content, _) = split_reference(content);
    match extract_json(content) {
        Some(json) => parse_tagged(json, expected),
        None => parse_legacy(content, expected),
    }
}

fn extract_json(content: &str) -> Option<&str> {
    let trimmed = content.trim();
    if trimmed.starts_with('{') {
        return Some(trimmed);
    }
    FENCED_JSON
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn parse_tagged(json: &str, expected: ArtifactKind) -> ParsedReply {
    match serde_json::from_str::<StageReply>(json) {
        Ok(StageReply::Success { artifact }) if artifact.kind() == expected => {
            ParsedReply::Artifact(artifact)
        }
        Ok(StageReply::Success { artifact }) => ParsedReply::Malformed(format!(
            "expected a {expected} artifact, got {}",
            artifact.kind()
        )),
        Ok(StageReply::Error { message }) => ParsedReply::RemoteError(message),
        Err(e) => ParsedReply::Malformed(format!("reply is not a valid stage document: {e}")),
    }
}

fn parse_legacy(content: &str, expected: ArtifactKind) -> ParsedReply {
    let trimmed = content.trim();
    if trimmed.starts_with("Error") {
        return ParsedReply::RemoteError(trimmed.to_string());
    }

    match expected {
        ArtifactKind::CheckoutPath => LOCAL_PATH
            .captures(content)
            .and_then(|caps| caps.get(1))
            .map(|m| {
                ParsedReply::Artifact(Artifact::CheckoutPath {
                    path: m.as_str().to_string(),
                })
            })
            .unwrap_or_else(|| ParsedReply::Malformed("no 'Local path:' label".to_string())),
        ArtifactKind::DiffListing => {
            let files = parse_diff_blocks(content);
            if files.is_empty() {
                ParsedReply::Malformed("no 'File:' blocks".to_string())
            } else {
                ParsedReply::Artifact(Artifact::DiffListing { files })
            }
        }
        ArtifactKind::TestReport => {
            let outcome = if trimmed.contains("FAILED") {
                TestOutcome::Failed
            } else if trimmed.contains("PASSED") {
                TestOutcome::Passed
            } else {
                return ParsedReply::Malformed("no PASSED or FAILED marker".to_string());
            };
            ParsedReply::Artifact(Artifact::TestReport(TestReport {
                outcome,
                summary: trimmed.to_string(),
                files: Vec::new(),
            }))
        }
    }
}
