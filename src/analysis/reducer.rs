//! The reduction loop.
//!
//! Drives chunk → evaluate → recombine rounds until a single result
//! remains. Each round fans its batches out to the evaluator with bounded
//! concurrency and reassembles outcomes by batch index, so the next round's
//! content does not depend on which call finished first. Rounds are strictly
//! sequential and cancellation is honored only between rounds.

use crate::analysis::chunker::{chunk, ChunkingError};
use crate::analysis::estimator::CostEstimator;
use crate::analysis::evaluator::BatchEvaluator;
use crate::models::{
    Batch, BatchFailure, ContentUnit, EvaluationOutcome, FailureKind, FailurePolicy, RoundSummary,
    RunFailure, RunId, RunResult, RunState, RunStatus, UnitKind,
};
use crate::storage::ledger::{LedgerResult, RunLedger, RunRecord};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Leading text of every failed-batch placeholder.
pub const PLACEHOLDER_MARKER: &str = "[BATCH FAILED]";

/// Reduction loop settings.
#[derive(Debug, Clone)]
pub struct ReductionConfig {
    /// Maximum estimated cost of one batch.
    pub budget: usize,
    /// Maximum batches evaluated at the same time.
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
    /// Safety cap on evaluated rounds.
    pub max_rounds: usize,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            budget: 60_000,
            concurrency: 3,
            failure_policy: FailurePolicy::Abort,
            max_rounds: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReductionError {
    #[error("invalid budget: {0}")]
    InvalidBudget(#[from] ChunkingError),

    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("run {run_id} aborted at round {round}: {} batch(es) failed", .failed_batches.len())]
    Aborted {
        run_id: RunId,
        round: usize,
        failed_batches: Vec<BatchFailure>,
    },

    #[error("run {run_id} cancelled before round {round}")]
    Cancelled { run_id: RunId, round: usize },

    #[error("run {run_id} did not converge after {rounds} rounds")]
    DidNotConverge { run_id: RunId, rounds: usize },
}

/// Input for one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: RunId,
    /// Key grouping runs of the same prompt and filter.
    pub analysis_key: String,
    pub filter_name: String,
    /// Human-readable description of where the units came from.
    pub dataset: String,
    pub units: Vec<ContentUnit>,
}

pub struct Reducer {
    evaluator: BatchEvaluator,
    ledger: Arc<dyn RunLedger>,
    estimator: Arc<dyn CostEstimator>,
    config: ReductionConfig,
}

impl Reducer {
    pub fn new(
        evaluator: BatchEvaluator,
        ledger: Arc<dyn RunLedger>,
        estimator: Arc<dyn CostEstimator>,
        config: ReductionConfig,
    ) -> Self {
        Self {
            evaluator,
            ledger,
            estimator,
            config,
        }
    }

    /// Reduce `request.units` to a single artifact.
    ///
    /// Configuration problems are returned as `Err` before any backend call.
    /// Everything that happens once the run has started, including failure,
    /// is reported through the returned `RunResult`.
    pub async fn run_analysis(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunResult, ReductionError> {
        if self.config.budget == 0 {
            return Err(ChunkingError::InvalidBudget.into());
        }
        if self.config.concurrency == 0 {
            return Err(ReductionError::InvalidConcurrency);
        }
        if self.evaluator.prompt().trim().is_empty() {
            return Err(ReductionError::EmptyPrompt);
        }

        let calls_before = self.evaluator.calls();
        let mut state = RunState::new(
            request.run_id.clone(),
            self.evaluator.prompt().to_string(),
            request.filter_name.clone(),
            request.units,
        );
        let mut result = RunResult {
            run_id: request.run_id.clone(),
            status: RunStatus::Running,
            artifact: None,
            rounds: Vec::new(),
            backend_calls: 0,
            failure: None,
            warnings: Vec::new(),
        };

        info!(
            "Starting run {} over {} units (budget {}, concurrency {}, policy {})",
            state.run_id,
            state.content.len(),
            self.config.budget,
            self.config.concurrency,
            self.config.failure_policy
        );

        let now = Utc::now();
        let record = RunRecord {
            run_id: state.run_id.clone(),
            analysis_key: request.analysis_key,
            filter_name: request.filter_name,
            dataset: request.dataset,
            model: self.evaluator.model_name().to_string(),
            prompt: state.prompt.clone(),
            unit_count: state.content.len(),
            status: RunStatus::Running,
            round: 0,
            rounds: Vec::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        let write = self.ledger.record_start(&record).await;
        note_ledger(&mut result, "run start", write);
        let write = self.ledger.record_dataset(&state.run_id, &state.content).await;
        note_ledger(&mut result, "dataset snapshot", write);

        let outcome = self.drive(&mut state, &mut result, cancel).await;
        result.backend_calls = self.evaluator.calls() - calls_before;

        match outcome {
            Ok(artifact) => {
                state.status = RunStatus::Completed;
                state.artifact = Some(artifact.clone());
                let write = self.ledger.record_final(&state.run_id, &artifact).await;
                note_ledger(&mut result, "final artifact", write);
                info!(
                    "Run {} completed at round {} after {} backend call(s)",
                    state.run_id, state.round, result.backend_calls
                );
                result.status = RunStatus::Completed;
                result.artifact = Some(artifact);
            }
            Err(failure) => {
                state.status = RunStatus::Failed;
                warn!("Run {} failed at round {}: {}", state.run_id, failure.round, failure.reason);
                let write = self
                    .ledger
                    .record_failure(&state.run_id, failure.round, &failure.reason)
                    .await;
                note_ledger(&mut result, "run failure", write);
                result.status = RunStatus::Failed;
                result.failure = Some(failure);
            }
        }

        Ok(result)
    }

    /// Run rounds until one result remains or the run fails.
    async fn drive(
        &self,
        state: &mut RunState,
        result: &mut RunResult,
        cancel: &CancellationToken,
    ) -> Result<String, RunFailure> {
        if state.content.is_empty() {
            info!("Run {} has no content; nothing to evaluate", state.run_id);
            return Ok(String::new());
        }

        loop {
            // Raw records always pass through the backend at least once.
            if state.content.len() == 1 && state.content[0].kind() != UnitKind::Record {
                return Ok(state.content[0].text().to_string());
            }

            if state.round >= self.config.max_rounds {
                return Err(RunFailure {
                    kind: FailureKind::DidNotConverge,
                    round: state.round,
                    reason: format!(
                        "{} units remain after {} rounds",
                        state.content.len(),
                        state.round
                    ),
                    failed_batches: Vec::new(),
                    partial_outcomes: Vec::new(),
                });
            }

            if cancel.is_cancelled() {
                return Err(RunFailure {
                    kind: FailureKind::Cancelled,
                    round: state.round,
                    reason: "cancelled".to_string(),
                    failed_batches: Vec::new(),
                    partial_outcomes: Vec::new(),
                });
            }

            let batches = chunk(&state.content, self.config.budget).map_err(|e| RunFailure {
                kind: FailureKind::Aborted,
                round: state.round,
                reason: e.to_string(),
                failed_batches: Vec::new(),
                partial_outcomes: Vec::new(),
            })?;

            info!(
                "Round {}: {} units in {} batch(es)",
                state.round,
                state.content.len(),
                batches.len()
            );
            if state.round > 0 && batches.len() == state.content.len() {
                warn!(
                    "Round {} cannot combine any results within budget {}; relying on the backend to shorten them",
                    state.round, self.config.budget
                );
            }

            let outcomes = self.evaluate_round(&batches).await;
            let failed: Vec<BatchFailure> = outcomes
                .iter()
                .filter_map(|o| o.result.as_ref().err().cloned())
                .collect();

            result.rounds.push(RoundSummary {
                round: state.round,
                units: state.content.len(),
                batches: batches.len(),
                failed: failed.len(),
                cached: outcomes.iter().filter(|o| o.cached).count(),
            });

            let write = self
                .ledger
                .record_round(&state.run_id, state.round, &batches, &outcomes)
                .await;
            note_ledger(result, "round", write);

            // A round with nothing but placeholders has no data left to reduce.
            let all_failed = failed.len() == batches.len();
            if !failed.is_empty()
                && (self.config.failure_policy == FailurePolicy::Abort || all_failed)
            {
                let reason = if all_failed {
                    format!("all {} batch(es) failed", batches.len())
                } else {
                    format!("{} of {} batch(es) failed", failed.len(), batches.len())
                };
                return Err(RunFailure {
                    kind: FailureKind::Aborted,
                    round: state.round,
                    reason,
                    failed_batches: failed,
                    partial_outcomes: outcomes.into_iter().filter(|o| o.is_success()).collect(),
                });
            }

            let round = state.round;
            state.content = outcomes
                .into_iter()
                .zip(&batches)
                .map(|(outcome, batch)| match outcome.result {
                    Ok(text) => ContentUnit::new(
                        format!("r{}-b{}", round, outcome.batch_index),
                        text,
                        UnitKind::Outcome,
                        self.estimator.as_ref(),
                    ),
                    Err(failure) => {
                        warn!("Substituting placeholder for {}", failure);
                        ContentUnit::new(
                            format!("r{}-b{}", round, failure.batch_index),
                            placeholder_text(round, batch.len(), &failure),
                            UnitKind::Placeholder,
                            self.estimator.as_ref(),
                        )
                    }
                })
                .collect();
            state.round += 1;
        }
    }

    /// Evaluate every batch of a round and return outcomes in batch order.
    async fn evaluate_round(&self, batches: &[Batch]) -> Vec<EvaluationOutcome> {
        let mut slots: Vec<Option<EvaluationOutcome>> = (0..batches.len()).map(|_| None).collect();

        let mut pending = stream::iter(batches)
            .map(|batch| self.evaluator.evaluate(batch))
            .buffer_unordered(self.config.concurrency);

        while let Some(outcome) = pending.next().await {
            let index = outcome.batch_index;
            slots[index] = Some(outcome);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    EvaluationOutcome::failure(BatchFailure {
                        batch_index: index,
                        reason: "no outcome was produced".to_string(),
                        transient: false,
                        attempts: 0,
                    })
                })
            })
            .collect()
    }
}

/// Marked stand-in for a failed batch's contribution.
pub fn placeholder_text(round: usize, units: usize, failure: &BatchFailure) -> String {
    format!(
        "{} Batch {} of round {} could not be analyzed ({}). Its {} input item(s) are not represented in this result.",
        PLACEHOLDER_MARKER, failure.batch_index, round, failure.reason, units
    )
}

fn note_ledger(result: &mut RunResult, what: &str, write: LedgerResult<()>) {
    if let Err(e) = write {
        warn!("Ledger write failed ({}): {}", what, e);
        result.warnings.push(format!("ledger write failed ({}): {}", what, e));
    }
}

impl RunResult {
    /// The artifact of a completed run, or the error describing why there is none.
    pub fn into_artifact(self) -> Result<String, ReductionError> {
        match (self.status, self.failure) {
            (RunStatus::Completed, _) => Ok(self.artifact.unwrap_or_default()),
            (_, Some(failure)) => Err(match failure.kind {
                FailureKind::Aborted => ReductionError::Aborted {
                    run_id: self.run_id,
                    round: failure.round,
                    failed_batches: failure.failed_batches,
                },
                FailureKind::Cancelled => ReductionError::Cancelled {
                    run_id: self.run_id,
                    round: failure.round,
                },
                FailureKind::DidNotConverge => ReductionError::DidNotConverge {
                    run_id: self.run_id,
                    rounds: failure.round,
                },
            }),
            (_, None) => Err(ReductionError::Cancelled {
                run_id: self.run_id,
                round: self.rounds.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::backend::BackendError;
    use crate::agent::prompt::RequestTemplate;
    use crate::agent::retry::RetryConfig;
    use crate::agent::testing::ScriptedBackend;
    use crate::analysis::estimator::CharRatioEstimator;
    use crate::storage::ledger::MemoryLedger;
    use std::time::Duration;

    fn units(n: usize) -> Vec<ContentUnit> {
        let estimator = CharRatioEstimator::new(1.0);
        (0..n)
            .map(|i| ContentUnit::record(format!("agent:{i}"), "x", &estimator))
            .collect()
    }

    fn request(units: Vec<ContentUnit>) -> RunRequest {
        RunRequest {
            run_id: RunId::from("test-run"),
            analysis_key: "unfiltered:000000".to_string(),
            filter_name: "unfiltered".to_string(),
            dataset: "test".to_string(),
            units,
        }
    }

    /// Unit-cost estimator for outputs: every result text costs 1.
    struct UnitCost;

    impl CostEstimator for UnitCost {
        fn estimate(&self, text: &str) -> usize {
            usize::from(!text.is_empty())
        }
    }

    fn reducer(
        backend: Arc<ScriptedBackend>,
        ledger: Arc<MemoryLedger>,
        config: ReductionConfig,
    ) -> Reducer {
        let evaluator = BatchEvaluator::new(
            backend,
            RequestTemplate::new("Find the best agents."),
            RetryConfig::immediate(2),
        );
        Reducer::new(evaluator, ledger, Arc::new(UnitCost), config)
    }

    fn config(budget: usize, policy: FailurePolicy) -> ReductionConfig {
        ReductionConfig {
            budget,
            concurrency: 2,
            failure_policy: policy,
            max_rounds: 8,
        }
    }

    #[tokio::test]
    async fn test_twenty_three_units_budget_five() {
        let backend = Arc::new(ScriptedBackend::counting());
        let ledger = Arc::new(MemoryLedger::new());
        let reducer = reducer(backend.clone(), ledger.clone(), config(5, FailurePolicy::Abort));

        let result = reducer
            .run_analysis(request(units(23)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        let batches: Vec<usize> = result.rounds.iter().map(|r| r.batches).collect();
        assert_eq!(batches, vec![5, 1]);
        assert_eq!(result.backend_calls, 6);
        assert_eq!(backend.calls(), 6);
        assert_eq!(result.artifact.as_deref(), Some("summary of 5 items"));

        let state = ledger.state();
        assert_eq!(state.rounds.len(), 2);
        let round0 = &state.rounds[&("test-run".to_string(), 0)];
        let sizes: Vec<usize> = round0.batches.iter().map(|b| b.unit_ids.len()).collect();
        assert_eq!(sizes, vec![5, 5, 5, 5, 3]);
        assert_eq!(
            state.finals.get("test-run").map(String::as_str),
            Some("summary of 5 items")
        );
        assert_eq!(state.runs["test-run"].status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_empty_input_completes_without_calls() {
        let backend = Arc::new(ScriptedBackend::counting());
        let ledger = Arc::new(MemoryLedger::new());
        let reducer = reducer(backend.clone(), ledger, config(5, FailurePolicy::Abort));

        let result = reducer
            .run_analysis(request(Vec::new()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.artifact.as_deref(), Some(""));
        assert_eq!(backend.calls(), 0);
        assert!(result.rounds.is_empty());
    }

    #[tokio::test]
    async fn test_single_batch_evaluates_once() {
        let backend = Arc::new(ScriptedBackend::counting());
        let reducer = reducer(
            backend.clone(),
            Arc::new(MemoryLedger::new()),
            config(100, FailurePolicy::Abort),
        );

        let result = reducer
            .run_analysis(request(units(7)), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_completed());
        assert_eq!(backend.calls(), 1);
        assert_eq!(result.rounds.len(), 1);
        assert_eq!(result.artifact.as_deref(), Some("summary of 7 items"));
    }

    #[tokio::test]
    async fn test_single_record_is_still_evaluated() {
        let backend = Arc::new(ScriptedBackend::counting());
        let reducer = reducer(
            backend.clone(),
            Arc::new(MemoryLedger::new()),
            config(5, FailurePolicy::Abort),
        );

        let result = reducer
            .run_analysis(request(units(1)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backend.calls(), 1);
        assert_eq!(result.artifact.as_deref(), Some("summary of 1 items"));
    }

    #[tokio::test]
    async fn test_configuration_errors_make_no_calls() {
        let backend = Arc::new(ScriptedBackend::counting());
        let zero_budget = reducer(
            backend.clone(),
            Arc::new(MemoryLedger::new()),
            config(0, FailurePolicy::Abort),
        );
        let err = zero_budget
            .run_analysis(request(units(3)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReductionError::InvalidBudget(ChunkingError::InvalidBudget)));

        let evaluator = BatchEvaluator::new(
            backend.clone(),
            RequestTemplate::new("   "),
            RetryConfig::immediate(0),
        );
        let empty_prompt = Reducer::new(
            evaluator,
            Arc::new(MemoryLedger::new()),
            Arc::new(UnitCost),
            config(5, FailurePolicy::Abort),
        );
        let err = empty_prompt
            .run_analysis(request(units(3)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReductionError::EmptyPrompt));
        assert_eq!(backend.calls(), 0);
    }

    fn fail_third_batch() -> ScriptedBackend {
        ScriptedBackend::new(|request, _| {
            if request.contains("\"agent:10\"") {
                Err(BackendError::Permanent("HTTP 400: context too long".to_string()))
            } else {
                Ok(format!("summary of {} items", request.matches("<item ").count()))
            }
        })
    }

    #[tokio::test]
    async fn test_abort_policy_keeps_partial_outcomes() {
        let backend = Arc::new(fail_third_batch());
        let ledger = Arc::new(MemoryLedger::new());
        let reducer = reducer(backend.clone(), ledger.clone(), config(5, FailurePolicy::Abort));

        let result = reducer
            .run_analysis(request(units(23)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.artifact.is_none());
        let failure = result.failure.clone().unwrap();
        assert_eq!(failure.kind, FailureKind::Aborted);
        assert_eq!(failure.round, 0);
        assert_eq!(failure.failed_batches.len(), 1);
        assert_eq!(failure.failed_batches[0].batch_index, 2);
        let kept: Vec<usize> = failure.partial_outcomes.iter().map(|o| o.batch_index).collect();
        assert_eq!(kept, vec![0, 1, 3, 4]);
        assert_eq!(backend.calls(), 5);
        assert_eq!(ledger.state().runs["test-run"].status, RunStatus::Failed);

        match result.into_artifact() {
            Err(ReductionError::Aborted { round, failed_batches, .. }) => {
                assert_eq!(round, 0);
                assert_eq!(failed_batches.len(), 1);
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_best_effort_marks_failed_batch() {
        let backend = Arc::new(fail_third_batch());
        let reducer = reducer(
            backend.clone(),
            Arc::new(MemoryLedger::new()),
            config(5, FailurePolicy::BestEffort),
        );

        let result = reducer
            .run_analysis(request(units(23)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.rounds[0].failed, 1);

        let requests = backend.requests();
        let merge = requests.last().unwrap();
        assert!(merge.contains("kind=\"failed-batch\""));
        assert!(merge.contains(PLACEHOLDER_MARKER));
        assert_eq!(merge.matches(PLACEHOLDER_MARKER).count(), 1);
    }

    #[test]
    fn test_placeholder_is_distinguishable() {
        let text = placeholder_text(
            1,
            4,
            &BatchFailure {
                batch_index: 2,
                reason: "HTTP 401: unauthorized".to_string(),
                transient: false,
                attempts: 1,
            },
        );
        assert!(text.starts_with(PLACEHOLDER_MARKER));
        assert!(text.contains("4 input item(s)"));
        assert!(text.contains("HTTP 401"));
    }

    #[tokio::test]
    async fn test_outcomes_follow_batch_order_not_completion_order() {
        // Earlier batches answer slower, so completion order is reversed.
        let backend = Arc::new(
            ScriptedBackend::new(|request, _| {
                let first = request
                    .split("<item id=\"")
                    .nth(1)
                    .and_then(|rest| rest.split('"').next())
                    .unwrap_or("?")
                    .to_string();
                Ok(format!("from {first}"))
            })
            .with_delay(|request| {
                if request.contains("\"agent:0\"") {
                    Duration::from_millis(60)
                } else {
                    Duration::from_millis(5)
                }
            }),
        );
        let ledger = Arc::new(MemoryLedger::new());
        let reducer = reducer(
            backend,
            ledger.clone(),
            ReductionConfig {
                concurrency: 4,
                ..config(2, FailurePolicy::Abort)
            },
        );

        reducer
            .run_analysis(request(units(6)), &CancellationToken::new())
            .await
            .unwrap();

        let state = ledger.state();
        let round0 = &state.rounds[&("test-run".to_string(), 0)];
        let texts: Vec<String> = round0
            .outcomes
            .iter()
            .map(|o| o.result.clone().unwrap())
            .collect();
        assert_eq!(texts, vec!["from agent:0", "from agent:2", "from agent:4"]);
    }

    #[tokio::test]
    async fn test_identical_runs_are_deterministic() {
        let run = || async {
            let backend = Arc::new(ScriptedBackend::counting());
            let ledger = Arc::new(MemoryLedger::new());
            let reducer = reducer(backend, ledger.clone(), config(3, FailurePolicy::Abort));
            let result = reducer
                .run_analysis(request(units(17)), &CancellationToken::new())
                .await
                .unwrap();
            let partitions: Vec<Vec<Vec<String>>> = ledger
                .state()
                .rounds
                .values()
                .map(|r| r.batches.iter().map(|b| b.unit_ids.clone()).collect())
                .collect();
            (result.artifact, partitions)
        };
        assert_eq!(run().await, run().await);
    }

    #[tokio::test]
    async fn test_cancellation_between_rounds() {
        let backend = Arc::new(ScriptedBackend::counting());
        let reducer = reducer(
            backend.clone(),
            Arc::new(MemoryLedger::new()),
            config(5, FailurePolicy::Abort),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = reducer.run_analysis(request(units(10)), &cancel).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failure.as_ref().unwrap().kind, FailureKind::Cancelled);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_round_limit_stops_the_loop() {
        // Budget 1 with unit-cost outputs never combines two results.
        let backend = Arc::new(ScriptedBackend::counting());
        let reducer = reducer(
            backend.clone(),
            Arc::new(MemoryLedger::new()),
            ReductionConfig {
                max_rounds: 3,
                ..config(1, FailurePolicy::Abort)
            },
        );

        let result = reducer
            .run_analysis(request(units(4)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::DidNotConverge);
        assert_eq!(failure.round, 3);
        assert_eq!(backend.calls(), 12);
    }

    #[tokio::test]
    async fn test_terminates_for_many_inputs() {
        let backend = Arc::new(ScriptedBackend::counting());
        let reducer = reducer(
            backend,
            Arc::new(MemoryLedger::new()),
            config(4, FailurePolicy::Abort),
        );

        let result = reducer
            .run_analysis(request(units(500)), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_completed());
        let batches: Vec<usize> = result.rounds.iter().map(|r| r.batches).collect();
        assert_eq!(batches, vec![125, 32, 8, 2, 1]);
        for pair in result.rounds.windows(2) {
            assert!(pair[1].units < pair[0].units);
        }
    }

    #[tokio::test]
    async fn test_ledger_failures_are_warnings() {
        let backend = Arc::new(ScriptedBackend::counting());
        let reducer = reducer(
            backend,
            Arc::new(MemoryLedger::failing()),
            config(5, FailurePolicy::Abort),
        );

        let result = reducer
            .run_analysis(request(units(8)), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_completed());
        assert!(!result.warnings.is_empty());
        assert!(result.warnings.iter().all(|w| w.contains("ledger write failed")));
    }

    #[tokio::test]
    async fn test_cancellation_mid_round_finishes_the_round() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let backend = Arc::new(ScriptedBackend::new(move |request, call| {
            if call == 0 {
                trigger.cancel();
            }
            Ok(format!("summary of {} items", request.matches("<item ").count()))
        }));
        let ledger = Arc::new(MemoryLedger::new());
        let reducer = reducer(
            backend.clone(),
            ledger.clone(),
            ReductionConfig {
                concurrency: 1,
                ..config(2, FailurePolicy::Abort)
            },
        );

        let result = reducer.run_analysis(request(units(6)), &cancel).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let failure = result.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(failure.round, 1);
        // Every batch of round 0 was still evaluated, round 1 never started.
        assert_eq!(backend.calls(), 3);
        assert_eq!(result.rounds.len(), 1);
        assert_eq!(result.rounds[0].failed, 0);
        assert_eq!(ledger.state().rounds.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_bounds_in_flight_calls() {
        let backend = Arc::new(
            ScriptedBackend::counting().with_delay(|_| Duration::from_millis(15)),
        );
        let reducer = reducer(
            backend.clone(),
            Arc::new(MemoryLedger::new()),
            ReductionConfig {
                concurrency: 3,
                max_rounds: 1,
                ..config(1, FailurePolicy::Abort)
            },
        );

        // Budget 1 puts each of the 12 records in its own batch.
        reducer
            .run_analysis(request(units(12)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backend.calls(), 12);
        assert!(backend.peak_in_flight() <= 3);
        assert!(backend.peak_in_flight() > 1);
    }

    #[tokio::test]
    async fn test_best_effort_fails_when_every_batch_fails() {
        let backend = Arc::new(ScriptedBackend::new(|_, _| {
            Err(BackendError::Permanent("HTTP 401: unauthorized".to_string()))
        }));
        let ledger = Arc::new(MemoryLedger::new());
        let reducer = reducer(
            backend.clone(),
            ledger.clone(),
            config(5, FailurePolicy::BestEffort),
        );

        let result = reducer
            .run_analysis(request(units(23)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.artifact.is_none());
        let failure = result.failure.as_ref().unwrap();
        assert_eq!(failure.round, 0);
        assert_eq!(failure.failed_batches.len(), 5);
        assert!(failure.reason.starts_with("all 5"));
        assert!(failure.partial_outcomes.is_empty());
        assert_eq!(backend.calls(), 5);
        assert_eq!(ledger.state().runs["test-run"].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_dataset_snapshot_is_recorded() {
        let ledger = Arc::new(MemoryLedger::new());
        let reducer = reducer(
            Arc::new(ScriptedBackend::counting()),
            ledger.clone(),
            config(5, FailurePolicy::Abort),
        );
        let input = units(4);

        reducer
            .run_analysis(request(input.clone()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ledger.state().datasets["test-run"], input);
    }
}
