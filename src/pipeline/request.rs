//! Reading the human's answer
//!
//! The front line accepts a pull request reference (`owner/repo` plus a PR
//! number, or a GitHub pull request URL) and two commands: `list agents` and
//! `close thread`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    /// `owner/repo`
    pub repo: String,
    pub pr_number: u64,
}

impl PullRequestRef {
    pub fn new(repo: impl Into<String>, pr_number: u64) -> Self {
        Self {
            repo: repo.into(),
            pr_number,
        }
    }
}

impl fmt::Display for PullRequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PR #{} from '{}'", self.pr_number, self.repo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HumanCommand {
    ListAgents,
    CloseThread,
    Test(PullRequestRef),
    /// Empty or not understood
    Invalid,
}

static PULL_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"github\.com/([A-Za-z0-9-]+/[A-Za-z0-9_.-]+)/pull/(\d+)")
        .expect("pull URL pattern is valid")
});

static REPO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Za-z0-9][A-Za-z0-9-]*/[A-Za-z0-9_.-]*[A-Za-z0-9_-])")
        .expect("repo pattern is valid")
});

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d+)\b").expect("number pattern is valid"));

/// Interpret one answer (pure function)
pub fn parse_command(input: &str) -> HumanCommand {
    let text = input.trim();
    if text.is_empty() {
        return HumanCommand::Invalid;
    }

    let lowered = text.to_lowercase();
    if lowered.contains("list agents") || lowered == "agents" {
        return HumanCommand::ListAgents;
    }
    if lowered.contains("close thread") {
        return HumanCommand::CloseThread;
    }

    parse_pull_request(text).map_or(HumanCommand::Invalid, HumanCommand::Test)
}

/// Extract `owner/repo` and the PR number (pure function)
pub fn parse_pull_request(text: &str) -> Option<PullRequestRef> {
    if let Some(caps) = PULL_URL.captures(text) {
        return Some(PullRequestRef::new(&caps[1], caps[2].parse().ok()?));
    }

    let repo_match = REPO.find(text)?;
    let rest = format!("{} {}", &text[..repo_match.start()], &text[repo_match.end()..]);
    let pr_number = NUMBER.captures(&rest)?[1].parse().ok()?;

    Some(PullRequestRef::new(repo_match.as_str(), pr_number))
}
