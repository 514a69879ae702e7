//! Builtin tools, one per specialist role
//!
//! Each tool keeps its pure planning and formatting helpers apart from the
//! process and network I/O.

pub mod checkout;
pub mod pr_diff;
pub mod test_runner;

pub use checkout::CheckoutTool;
pub use pr_diff::PullRequestDiffTool;
pub use test_runner::TestRunnerTool;

pub const CHECKOUT_TOOL: &str = "checkout_pull_request";
pub const PR_DIFF_TOOL: &str = "pull_request_diff";
pub const TEST_RUNNER_TOOL: &str = "run_relevant_tests";
