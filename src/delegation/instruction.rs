//! Instruction texts exchanged between the orchestrator and specialists
//!
//! The orchestrator renders an [`Instruction`] into message content; the
//! specialist parses it back. Content that matches no template is not an
//! instruction.
//!
//! An instruction may end with a `[ref: <key>]` line. The specialist copies
//! the key into its reply so the orchestrator can tell which request a reply
//! answers.

use super::reply::{parse_diff_blocks, render_diff_blocks, FileDiff};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `Checkout PR #<n> from '<owner/repo>'`
    Checkout { repo: String, pr_number: u64 },
    /// `Analyze PR #<n> from '<owner/repo>'`
    AnalyzeDiff { repo: String, pr_number: u64 },
    /// Run the tests relevant to `files` inside `project_root`
    RunTests {
        project_root: String,
        files: Vec<FileDiff>,
    },
}

static CHECKOUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Checkout PR #(\d+) from '([^']+)'").expect("checkout pattern is valid")
});

static ANALYZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Analyze PR #(\d+) from '([^']+)'").expect("analyze pattern is valid")
});

static RUN_TESTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Please run relevant tests for the following code diffs under project root '([^']+)':")
        .expect("run tests pattern is valid")
});

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\n*\[ref: ([A-Za-z0-9:._-]+)\]\s*$").expect("reference pattern is valid")
});

/// Split a trailing `[ref: <key>]` line off message content (pure function)
pub fn split_reference(content: &str) -> (&str, Option<&str>) {
    match REFERENCE.captures(content) {
        Some(caps) => {
            let start = caps.get(0).map_or(content.len(), |m| m.start());
            (&content[..start], caps.get(1).map(|m| m.as_str()))
        }
        None => (content, None),
    }
}

impl Instruction {
    /// Parse message content (pure function)
    ///
    /// A trailing reference line is ignored.
    pub fn parse(content: &str) -> Option<Self> {
        let (content, _) = split_reference(content);
        if let Some(caps) = CHECKOUT.captures(content) {
            return Some(Self::Checkout {
                pr_number: caps[1].parse().ok()?,
                repo: caps[2].to_string(),
            });
        }

        if let Some(caps) = ANALYZE.captures(content) {
            return Some(Self::AnalyzeDiff {
                pr_number: caps[1].parse().ok()?,
                repo: caps[2].to_string(),
            });
        }

        if let Some(caps) = RUN_TESTS.captures(content) {
            let header_end = caps.get(0).map_or(0, |m| m.end());
            return Some(Self::RunTests {
                project_root: caps[1].to_string(),
                files: parse_diff_blocks(&content[header_end..]),
            });
        }

        None
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Render with a `[ref: <key>]` line the reply must echo
    pub fn render_with_reference(&self, reference: &str) -> String {
        format!("{self}\n\n[ref: {reference}]")
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Checkout { repo, pr_number } => {
                write!(f, "Checkout PR #{pr_number} from '{repo}'")
            }
            Instruction::AnalyzeDiff { repo, pr_number } => {
                write!(f, "Analyze PR #{pr_number} from '{repo}'")
            }
            Instruction::RunTests {
                project_root,
                files,
            } => write!(
                f,
                "Please run relevant tests for the following code diffs under project root '{project_root}':\n\n{}",
                render_diff_blocks(files)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_render_templates() {
        assert_eq!(
            Instruction::Checkout {
                repo: "octocat/calculator".to_string(),
                pr_number: 42
            }
            .render(),
            "Checkout PR #42 from 'octocat/calculator'"
        );
        assert_eq!(
            Instruction::AnalyzeDiff {
                repo: "octocat/calculator".to_string(),
                pr_number: 42
            }
            .render(),
            "Analyze PR #42 from 'octocat/calculator'"
        );

        let tests = Instruction::RunTests {
            project_root: "/repos/calculator".to_string(),
            files: vec![FileDiff::new("calculator.py", "+def multiply...")],
        }
        .render();
        assert!(tests.starts_with(
            "Please run relevant tests for the following code diffs under project root '/repos/calculator':"
        ));
        assert!(tests.contains("File: calculator.py\n+def multiply..."));
    }

    #[test]
    fn test_parse_run_tests_with_blocks() {
        let content = "Please run relevant tests for the following code diffs under project root '/repos/calc':\n\nFile: a.py\n+x\n\nFile: b.py\n+y";
        assert_eq!(
            Instruction::parse(content),
            Some(Instruction::RunTests {
                project_root: "/repos/calc".to_string(),
                files: vec![FileDiff::new("a.py", "+x"), FileDiff::new("b.py", "+y")],
            })
        );
    }

    #[test]
    fn test_reference_line_is_split_off() {
        let instruction = Instruction::RunTests {
            project_root: "/repos/calc".to_string(),
            files: vec![FileDiff::new("a.py", "+x")],
        };
        let content = instruction.render_with_reference("4f2a.checkout");

        assert_eq!(split_reference(&content), (instruction.render().as_str(), Some("4f2a.checkout")));
        assert_eq!(Instruction::parse(&content), Some(instruction));
        assert_eq!(split_reference("Local path: /x"), ("Local path: /x", None));
    }

    #[test]
    fn test_unrelated_content_is_not_an_instruction() {
        assert_eq!(Instruction::parse("hello there"), None);
        assert_eq!(Instruction::parse("Checkout PR #abc from 'x/y'"), None);
    }

    proptest! {
        #[test]
        fn pr_instructions_parse_back(
            owner in "[a-zA-Z0-9-]{1,20}",
            name in "[a-zA-Z0-9_.-]{1,20}",
            pr_number in 1u64..100_000,
        ) {
            let repo = format!("{owner}/{name}");
            for instruction in [
                Instruction::Checkout { repo: repo.clone(), pr_number },
                Instruction::AnalyzeDiff { repo: repo.clone(), pr_number },
            ] {
                prop_assert_eq!(Instruction::parse(&instruction.render()), Some(instruction));
            }
        }
    }
}
