//! Run report
//!
//! Aggregates rule violations, drift records and per-stage metadata into the single document a
//! run produces.
use crate::drift::{DriftRecord, DriftStatus};
use crate::error::StructuralError;
use crate::live::{FetchFailure, LiveCollection};
use crate::rules::{Severity, Violation};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RunStatus {
    Passed,
    PassedWithWarnings,
    Failed,
}

impl RunStatus {
    /// Process exit code; automation must be able to tell warnings from failures
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Passed => 0,
            RunStatus::Failed => 1,
            RunStatus::PassedWithWarnings => 2,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunStatus::Passed => "Passed",
            RunStatus::PassedWithWarnings => "PassedWithWarnings",
            RunStatus::Failed => "Failed",
        })
    }
}

/// Exit code for errors of the tool itself (I/O, arguments, rule configuration)
pub const TOOL_ERROR_EXIT_CODE: i32 = 3;

/// Stages of a run, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStage {
    Loading,
    Resolving,
    GraphBuilt,
    RulesEvaluated,
    LiveCollected,
    DriftCompared,
    Reported,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageOutcome {
    Completed,
    Incomplete,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StageRecord {
    pub stage: RunStage,
    pub outcome: StageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The structural error that ended a run
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Failure {
    pub kind: String,
    pub message: String,
    /// Logical ids at fault; the full path for cycles
    pub offenders: Vec<String>,
}

impl From<&StructuralError> for Failure {
    fn from(error: &StructuralError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            offenders: error.offenders(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Report {
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Live collection hit the run deadline; drift covers only what was fetched in time
    pub incomplete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    pub violations: Vec<Violation>,
    pub drift: Vec<DriftRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fetch_errors: Vec<FetchFailure>,
    pub stages: Vec<StageRecord>,
}

impl Report {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    /// Highest severity among violations and drifted fields
    pub fn worst_severity(&self) -> Option<Severity> {
        let violations = self.violations.iter().map(|violation| violation.severity);
        let drift = self
            .drift
            .iter()
            .filter(|record| record.status == DriftStatus::Drift)
            .map(|record| record.severity);
        violations.chain(drift).max()
    }

    fn classify(&self) -> RunStatus {
        if self.failure.is_some() {
            return RunStatus::Failed;
        }
        if self.worst_severity().is_some_and(|severity| severity >= Severity::High) {
            return RunStatus::Failed;
        }

        let drifted = self
            .drift
            .iter()
            .any(|record| record.status == DriftStatus::Drift);
        if !self.violations.is_empty() || drifted || !self.fetch_errors.is_empty() || self.incomplete {
            RunStatus::PassedWithWarnings
        } else {
            RunStatus::Passed
        }
    }
}

/// Collects stage records while a run progresses
pub struct ReportBuilder {
    record_timings: bool,
    stages: Vec<StageRecord>,
    environment: Option<String>,
    incomplete: bool,
    fetch_errors: Vec<FetchFailure>,
}

impl ReportBuilder {
    pub fn new(record_timings: bool) -> Self {
        Self {
            record_timings,
            stages: vec![],
            environment: None,
            incomplete: false,
            fetch_errors: vec![],
        }
    }

    fn record(&mut self, stage: RunStage, outcome: StageOutcome, started: Option<Instant>, error: Option<String>) {
        let duration_ms = started
            .filter(|_| self.record_timings)
            .map(|started| started.elapsed().as_millis().try_into().unwrap_or(u64::MAX));
        tracing::debug!(?stage, ?outcome, "stage finished");
        self.stages.push(StageRecord {
            stage,
            outcome,
            duration_ms,
            error,
        });
    }

    pub fn completed(&mut self, stage: RunStage, started: Instant) {
        self.record(stage, StageOutcome::Completed, Some(started), None);
    }

    pub fn skipped(&mut self, stage: RunStage) {
        self.record(stage, StageOutcome::Skipped, None, None);
    }

    /// Live collection result; fetch errors become report entries
    pub fn collected(&mut self, collection: &LiveCollection, started: Instant) {
        let outcome = if collection.incomplete {
            StageOutcome::Incomplete
        } else {
            StageOutcome::Completed
        };
        self.record(RunStage::LiveCollected, outcome, Some(started), None);
        self.environment = Some(collection.environment.clone());
        self.incomplete = collection.incomplete;
        self.fetch_errors = collection.errors.values().cloned().collect();
    }

    /// Ends the run at `stage` with a structural error; nothing downstream is reported
    pub fn fail(mut self, stage: RunStage, started: Instant, error: &StructuralError) -> Report {
        tracing::error!(?stage, %error, "run failed");
        self.record(stage, StageOutcome::Failed, Some(started), Some(error.to_string()));
        self.record(RunStage::Failed, StageOutcome::Completed, None, None);

        Report {
            status: RunStatus::Failed,
            environment: self.environment,
            incomplete: false,
            failure: Some(error.into()),
            violations: vec![],
            drift: vec![],
            fetch_errors: vec![],
            stages: self.stages,
        }
    }

    pub fn finish(mut self, violations: Vec<Violation>, drift: Vec<DriftRecord>) -> Report {
        self.record(RunStage::Reported, StageOutcome::Completed, None, None);

        let mut report = Report {
            status: RunStatus::Passed,
            environment: self.environment,
            incomplete: self.incomplete,
            failure: None,
            violations,
            drift,
            fetch_errors: self.fetch_errors,
            stages: self.stages,
        };
        report.status = report.classify();
        tracing::info!(status = %report.status, "run finished");
        report
    }
}
