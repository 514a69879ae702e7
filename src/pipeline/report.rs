//! Report rendering
//!
//! The report lists, in stage order, the artifact of every stage that
//! completed. Stages that never ran are left out. A failed run ends with one
//! line naming the stage and the reason.

use super::context::{PipelineContext, Stage};
use crate::delegation::FailureReason;
use crate::error::sanitize_error_message;
use std::fmt::Write;

/// Why a run stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub reason: FailureReason,
    pub detail: String,
}

impl StageFailure {
    /// User-facing explanation, sanitized
    pub fn explanation(&self) -> String {
        sanitize_error_message(&format!(
            "Pipeline stopped at {}: {}. {}",
            self.stage, self.reason, self.detail
        ))
    }
}

/// Render the report for a finished run (pure function)
pub fn render_report(context: &PipelineContext, failure: Option<&StageFailure>) -> String {
    let mut report = format!("Test results summary for {}:", context.request());

    for (stage, artifact) in context.completed() {
        // Writing to a String cannot fail
        let _ = write!(report, "\n\n{}:\n{artifact}", stage.title());
    }

    if let Some(failure) = failure {
        let _ = write!(report, "\n\n{}", failure.explanation());
    }

    report
}
