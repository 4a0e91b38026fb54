//! Data models for the analysis pipeline.
//!
//! This module contains the core data structures shared by the chunker,
//! the batch evaluator, the reduction loop and the run ledger.

use crate::analysis::estimator::CostEstimator;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one analysis run, assigned by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh random run id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a content unit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// A serialized dataset record (round 0).
    Record,
    /// The textual output of a previous round.
    Outcome,
    /// Marker standing in for a failed batch under the best-effort policy.
    Placeholder,
}

/// The atomic piece of text reduced by the pipeline.
///
/// The cost is computed once at construction from the text, so it always
/// agrees with the estimator that built the unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUnit {
    id: String,
    text: String,
    cost: usize,
    kind: UnitKind,
}

impl ContentUnit {
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        kind: UnitKind,
        estimator: &dyn CostEstimator,
    ) -> Self {
        let text = text.into();
        let cost = estimator.estimate(&text);
        Self {
            id: id.into(),
            text,
            cost,
            kind,
        }
    }

    /// Convenience constructor for round-0 records.
    pub fn record(id: impl Into<String>, text: impl Into<String>, estimator: &dyn CostEstimator) -> Self {
        Self::new(id, text, UnitKind::Record, estimator)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn cost(&self) -> usize {
        self.cost
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }
}

/// An ordered, non-empty group of units submitted in one backend call.
///
/// Batches are only built by the chunker and never change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    index: usize,
    units: Vec<ContentUnit>,
    cost: usize,
}

impl Batch {
    pub(crate) fn new(index: usize, units: Vec<ContentUnit>) -> Self {
        debug_assert!(!units.is_empty(), "batches are never empty");
        let cost = units.iter().map(ContentUnit::cost).sum();
        Self { index, units, cost }
    }

    /// Position of this batch within its round.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn units(&self) -> &[ContentUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Summed estimated cost of all units.
    pub fn cost(&self) -> usize {
        self.cost
    }

    pub fn unit_ids(&self) -> Vec<&str> {
        self.units.iter().map(ContentUnit::id).collect()
    }

    /// True when every unit is a raw dataset record.
    pub fn is_records(&self) -> bool {
        self.units.iter().all(|u| u.kind() == UnitKind::Record)
    }
}

/// Response to a permanently failed batch evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Any failed batch fails the whole run.
    #[default]
    Abort,
    /// Failed batches are replaced by a marked placeholder and the run continues.
    BestEffort,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Abort => write!(f, "abort"),
            FailurePolicy::BestEffort => write!(f, "best-effort"),
        }
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Completed => write!(f, "Completed"),
            RunStatus::Failed => write!(f, "Failed"),
        }
    }
}

impl RunStatus {
    /// Returns an emoji representation of the status.
    pub fn emoji(&self) -> &'static str {
        match self {
            RunStatus::Running => "⏳",
            RunStatus::Completed => "✅",
            RunStatus::Failed => "❌",
        }
    }
}

/// Why a single batch could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub reason: String,
    /// Whether the last error was transient (retries were exhausted).
    pub transient: bool,
    pub attempts: u32,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch {} failed after {} attempt(s): {}",
            self.batch_index, self.attempts, self.reason
        )
    }
}

/// Result of evaluating one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub batch_index: usize,
    pub result: Result<String, BatchFailure>,
    /// The result was served from the result cache.
    #[serde(default)]
    pub cached: bool,
}

impl EvaluationOutcome {
    pub fn success(batch_index: usize, text: String) -> Self {
        Self {
            batch_index,
            result: Ok(text),
            cached: false,
        }
    }

    pub fn failure(failure: BatchFailure) -> Self {
        Self {
            batch_index: failure.batch_index,
            result: Err(failure),
            cached: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Mutable state of one run, owned by the reduction loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub prompt: String,
    pub filter_name: String,
    pub round: usize,
    pub content: Vec<ContentUnit>,
    pub artifact: Option<String>,
    pub status: RunStatus,
}

impl RunState {
    pub fn new(run_id: RunId, prompt: String, filter_name: String, content: Vec<ContentUnit>) -> Self {
        Self {
            run_id,
            prompt,
            filter_name,
            round: 0,
            content,
            artifact: None,
            status: RunStatus::Running,
        }
    }
}

/// Per-round statistics kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: usize,
    pub units: usize,
    pub batches: usize,
    pub failed: usize,
    pub cached: usize,
}

/// Why a run stopped before producing an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// A batch failed under the abort policy.
    Aborted,
    /// Cancellation was requested between rounds.
    Cancelled,
    /// The round limit was reached before a single result remained.
    DidNotConverge,
}

/// Diagnostics for a run that ended in `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub round: usize,
    pub reason: String,
    pub failed_batches: Vec<BatchFailure>,
    /// Successful outcomes of the failing round, kept for diagnostics.
    pub partial_outcomes: Vec<EvaluationOutcome>,
}

/// What `run_analysis` hands back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    /// The single reduced artifact; present only when `Completed`.
    pub artifact: Option<String>,
    pub rounds: Vec<RoundSummary>,
    pub backend_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Non-fatal problems, such as ledger write failures.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl RunResult {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Total number of batches across all rounds.
    pub fn total_batches(&self) -> usize {
        self.rounds.iter().map(|r| r.batches).sum()
    }
}

/// Metadata about one analysis, shown at the top of the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub run_id: RunId,
    pub analysis_key: String,
    pub dataset: String,
    pub model_used: String,
    pub units: usize,
    pub analysis_date: chrono::DateTime<chrono::Utc>,
    pub duration_seconds: f64,
}

/// Complete analysis report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub result: RunResult,
}
