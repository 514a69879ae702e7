//! Checkout, diff review and test execution, in that order
//!
//! The [`PipelineOrchestrator`] runs one [`DelegationStep`] per stage. Each
//! success is stored in the request's [`PipelineContext`] and feeds the next
//! instruction; the first failure aborts the remaining stages. Either way the
//! run ends with a report and the orchestrator is ready for the next request.

use crate::delegation::{DelegationStep, Instruction, StagePolicy, StepResult};
use crate::error::{RelayError, RelayResult};
use crate::observability::metrics::metrics;
use crate::thread::ThreadChannel;
use std::time::{Duration, Instant};
use tracing::{info, warn, Instrument};

pub mod context;
pub mod frontline;
pub mod report;
pub mod request;

pub use context::{PipelineContext, PipelineState, Stage};
pub use frontline::FrontLine;
pub use report::{render_report, StageFailure};
pub use request::{parse_command, HumanCommand, PullRequestRef};

/// Who handles a stage and with which budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub agent_id: String,
    pub policy: StagePolicy,
}

impl StageSpec {
    pub fn new(agent_id: impl Into<String>, policy: StagePolicy) -> Self {
        Self {
            agent_id: agent_id.into(),
            policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub checkout: StageSpec,
    pub diff_review: StageSpec,
    pub test_execution: StageSpec,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            checkout: StageSpec::new("gitclone_agent", StagePolicy::default()),
            diff_review: StageSpec::new("codediff_review_agent", StagePolicy::default()),
            test_execution: StageSpec::new(
                "unit_test_runner_agent",
                StagePolicy::new(Duration::from_millis(60_000), 3, 3),
            ),
        }
    }
}

impl PipelineSettings {
    pub fn stage(&self, stage: Stage) -> &StageSpec {
        match stage {
            Stage::Checkout => &self.checkout,
            Stage::DiffReview => &self.diff_review,
            Stage::TestExecution => &self.test_execution,
        }
    }

    /// Specialist agent ids in stage order
    pub fn agent_ids(&self) -> Vec<String> {
        Stage::ALL
            .iter()
            .map(|stage| self.stage(*stage).agent_id.clone())
            .collect()
    }
}

/// Outcome of one request
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub context: PipelineContext,
    pub failure: Option<StageFailure>,
    pub report: String,
}

impl PipelineRun {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct PipelineOrchestrator {
    settings: PipelineSettings,
    state: PipelineState,
}

impl PipelineOrchestrator {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            state: PipelineState::AwaitingRequest,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn transition(&mut self, context: &mut PipelineContext, next: PipelineState) {
        info!(
            request_id = %context.request_id(),
            from = ?self.state,
            to = ?next,
            "Pipeline state change"
        );
        self.state = next;
        context.enter(next);
    }

    /// Run every stage for `request` on `thread`
    ///
    /// Stage failures end up in the returned report. Only transport failures
    /// and broken invariants are returned as errors.
    pub async fn run(
        &mut self,
        request: PullRequestRef,
        thread: &mut ThreadChannel,
    ) -> RelayResult<PipelineRun> {
        let started = Instant::now();
        let mut context = PipelineContext::new(request);
        metrics().request_received();
        info!(
            request_id = %context.request_id(),
            repo = %context.request().repo,
            pr_number = context.request().pr_number,
            "Pipeline run started"
        );

        let failure = match self.run_stages(&mut context, thread).await {
            Ok(failure) => failure,
            Err(e) => {
                // Transport loss mid-run: the next session starts over
                self.state = PipelineState::AwaitingRequest;
                metrics().request_failed(started.elapsed());
                return Err(e);
            }
        };

        self.transition(&mut context, PipelineState::Reporting);
        let report = render_report(&context, failure.as_ref());

        match &failure {
            None => metrics().request_completed(started.elapsed()),
            Some(f) => {
                warn!(
                    request_id = %context.request_id(),
                    stage = %f.stage,
                    reason = %f.reason,
                    "Pipeline run aborted"
                );
                metrics().request_failed(started.elapsed());
            }
        }

        self.transition(&mut context, PipelineState::AwaitingRequest);
        Ok(PipelineRun {
            context,
            failure,
            report,
        })
    }

    async fn run_stages(
        &mut self,
        context: &mut PipelineContext,
        thread: &mut ThreadChannel,
    ) -> RelayResult<Option<StageFailure>> {
        for stage in Stage::ALL {
            self.transition(context, PipelineState::Running(stage));

            let spec = self.settings.stage(stage).clone();
            let instruction = instruction_for(stage, context)?;
            let step = DelegationStep::new(
                stage.label(),
                spec.agent_id,
                instruction.render(),
                stage.expected_artifact(),
                spec.policy,
            )
            .with_reference(stage_reference(context, stage));

            let span = crate::stage_span!(stage = stage.label(), request_id = %context.request_id());
            match step.execute(thread).instrument(span).await? {
                StepResult::Success { artifact, .. } => {
                    context
                        .record(stage, artifact)
                        .map_err(|e| RelayError::internal_error(e.to_string()))?;
                }
                StepResult::Failure { reason, detail, .. } => {
                    return Ok(Some(StageFailure {
                        stage,
                        reason,
                        detail,
                    }));
                }
            }
        }

        Ok(None)
    }
}

/// Key tying a stage's replies to this request (pure function)
pub fn stage_reference(context: &PipelineContext, stage: Stage) -> String {
    format!("{}.{}", context.request_id().simple(), stage.label())
}

/// Instruction for `stage`, built from earlier results (pure function)
pub fn instruction_for(stage: Stage, context: &PipelineContext) -> RelayResult<Instruction> {
    let request = context.request();
    match stage {
        Stage::Checkout => Ok(Instruction::Checkout {
            repo: request.repo.clone(),
            pr_number: request.pr_number,
        }),
        Stage::DiffReview => Ok(Instruction::AnalyzeDiff {
            repo: request.repo.clone(),
            pr_number: request.pr_number,
        }),
        Stage::TestExecution => {
            let project_root = context.checkout_path().ok_or_else(|| {
                RelayError::internal_error("test execution started without a checkout path")
            })?;
            let files = context.diff_files().ok_or_else(|| {
                RelayError::internal_error("test execution started without a diff listing")
            })?;
            Ok(Instruction::RunTests {
                project_root: project_root.to_string(),
                files: files.to_vec(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::{Artifact, FileDiff};

    #[test]
    fn test_default_settings() {
        let settings = PipelineSettings::default();
        assert_eq!(
            settings.agent_ids(),
            vec![
                "gitclone_agent",
                "codediff_review_agent",
                "unit_test_runner_agent"
            ]
        );
        assert_eq!(settings.checkout.policy.timeout, Duration::from_secs(30));
        assert_eq!(settings.test_execution.policy.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_stage_references_differ_per_request() {
        let first = PipelineContext::new(PullRequestRef::new("octocat/calculator", 1));
        let second = PipelineContext::new(PullRequestRef::new("octocat/calculator", 1));

        let reference = stage_reference(&first, Stage::Checkout);
        assert!(reference.ends_with(".checkout"));
        assert_ne!(reference, stage_reference(&second, Stage::Checkout));
        assert_ne!(reference, stage_reference(&first, Stage::DiffReview));
    }

    #[test]
    fn test_test_instruction_carries_prior_artifacts() {
        let mut ctx = PipelineContext::new(PullRequestRef::new("octocat/calculator", 42));
        assert!(instruction_for(Stage::TestExecution, &ctx).is_err());

        ctx.record(
            Stage::Checkout,
            Artifact::CheckoutPath {
                path: "/repos/calculator".to_string(),
            },
        )
        .unwrap();
        ctx.record(
            Stage::DiffReview,
            Artifact::DiffListing {
                files: vec![FileDiff::new("calculator.py", "+def multiply...")],
            },
        )
        .unwrap();

        let text = instruction_for(Stage::TestExecution, &ctx).unwrap().render();
        assert!(text.contains("'/repos/calculator'"));
        assert!(text.contains("File: calculator.py\n+def multiply..."));
    }
}
