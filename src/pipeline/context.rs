//! Per-request pipeline state

use super::request::PullRequestRef;
use crate::delegation::{Artifact, ArtifactKind, FileDiff};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Pipeline stages, ordered as they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Checkout,
    DiffReview,
    TestExecution,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Checkout, Stage::DiffReview, Stage::TestExecution];

    /// Artifact the stage's reply must carry
    pub fn expected_artifact(&self) -> ArtifactKind {
        match self {
            Stage::Checkout => ArtifactKind::CheckoutPath,
            Stage::DiffReview => ArtifactKind::DiffListing,
            Stage::TestExecution => ArtifactKind::TestReport,
        }
    }

    /// Metric and log label
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Checkout => "checkout",
            Stage::DiffReview => "diff_review",
            Stage::TestExecution => "test_execution",
        }
    }

    /// Heading used in reports
    pub fn title(&self) -> &'static str {
        match self {
            Stage::Checkout => "Checkout",
            Stage::DiffReview => "Diff review",
            Stage::TestExecution => "Test execution",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Checkout => "Checkout",
            Stage::DiffReview => "DiffReview",
            Stage::TestExecution => "TestExecution",
        })
    }
}

/// Orchestrator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    AwaitingRequest,
    Running(Stage),
    Reporting,
}

#[derive(Debug, Error, PartialEq)]
pub enum ContextError {
    #[error("stage {0} already produced a result")]
    AlreadyRecorded(Stage),
}

/// Results gathered for one request
///
/// Each stage's entry is written at most once.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    request_id: Uuid,
    request: PullRequestRef,
    stage_results: BTreeMap<Stage, Artifact>,
    current_stage: PipelineState,
}

impl PipelineContext {
    pub fn new(request: PullRequestRef) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            request,
            stage_results: BTreeMap::new(),
            current_stage: PipelineState::AwaitingRequest,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn request(&self) -> &PullRequestRef {
        &self.request
    }

    pub fn current_stage(&self) -> PipelineState {
        self.current_stage
    }

    pub(crate) fn enter(&mut self, state: PipelineState) {
        self.current_stage = state;
    }

    /// Store a stage artifact; a second write for the same stage fails
    pub fn record(&mut self, stage: Stage, artifact: Artifact) -> Result<(), ContextError> {
        if self.stage_results.contains_key(&stage) {
            return Err(ContextError::AlreadyRecorded(stage));
        }
        self.stage_results.insert(stage, artifact);
        Ok(())
    }

    pub fn result(&self, stage: Stage) -> Option<&Artifact> {
        self.stage_results.get(&stage)
    }

    /// Completed stages in stage order
    pub fn completed(&self) -> impl Iterator<Item = (Stage, &Artifact)> {
        self.stage_results.iter().map(|(stage, artifact)| (*stage, artifact))
    }

    pub fn checkout_path(&self) -> Option<&str> {
        match self.result(Stage::Checkout) {
            Some(Artifact::CheckoutPath { path }) => Some(path),
            _ => None,
        }
    }

    pub fn diff_files(&self) -> Option<&[FileDiff]> {
        match self.result(Stage::DiffReview) {
            Some(Artifact::DiffListing { files }) => Some(files),
            _ => None,
        }
    }
}
