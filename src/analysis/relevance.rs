//! Relevance screening ahead of a reduction.
//!
//! Records are chunked under the same budget as the reduction and each batch
//! is asked once for the ids of items that do not serve the objective. The
//! screen only ever removes items the model named; a batch that fails or
//! answers with something unreadable keeps all of its items.

use crate::agent::prompt::RequestTemplate;
use crate::analysis::chunker::{chunk, ChunkingError};
use crate::analysis::evaluator::BatchEvaluator;
use crate::models::{Batch, ContentUnit};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

const SCREEN_PURPOSE: &str = "Your task is to filter the items below to only include the ones that are relevant to the objective.";

/// Output instructions for screening batches.
pub const DISCARD_OUTPUT_PROMPT: &str = "Go through the items one by one. Respond with nothing but a JSON array holding the ids of all items that are not relevant to the objective and should be discarded, for example [\"tweet:1\", \"tweet:7\"]. Respond with [] when every item is relevant.";

/// Request template asking which items of a batch to discard.
pub fn screening_template(objective: &str) -> RequestTemplate {
    RequestTemplate::new(format!(
        "{}\n\n<objective>\n{}\n</objective>",
        SCREEN_PURPOSE,
        objective.trim()
    ))
    .with_output_prompt(DISCARD_OUTPUT_PROMPT)
}

/// What the screen decided.
#[derive(Debug, Default)]
pub struct Screening {
    /// Unit ids to drop.
    pub discarded: HashSet<String>,
    pub batches: usize,
    /// Batches whose items were all kept because no usable answer came back.
    pub unanswered: usize,
}

pub struct RelevanceScreen {
    evaluator: BatchEvaluator,
    budget: usize,
    concurrency: usize,
}

impl RelevanceScreen {
    pub fn new(evaluator: BatchEvaluator, budget: usize, concurrency: usize) -> Self {
        Self {
            evaluator,
            budget,
            concurrency: concurrency.max(1),
        }
    }

    pub fn calls(&self) -> usize {
        self.evaluator.calls()
    }

    pub async fn screen(&self, units: &[ContentUnit]) -> Result<Screening, ChunkingError> {
        let batches = chunk(units, self.budget)?;
        let mut screening = Screening {
            batches: batches.len(),
            ..Screening::default()
        };

        let answers: Vec<(&Batch, Option<Vec<String>>)> = stream::iter(&batches)
            .map(|batch| async move {
                let outcome = self.evaluator.evaluate(batch).await;
                let ids = match outcome.result {
                    Ok(text) => {
                        let parsed = parse_discarded(&text);
                        if parsed.is_none() {
                            warn!("Screening batch {} gave no id list; keeping its items", batch.index());
                        }
                        parsed
                    }
                    Err(failure) => {
                        warn!("Screening {}; keeping its items", failure);
                        None
                    }
                };
                (batch, ids)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (batch, ids) in answers {
            let Some(ids) = ids else {
                screening.unanswered += 1;
                continue;
            };
            for id in ids {
                match resolve_unit_id(batch, &id) {
                    Some(unit_id) => {
                        screening.discarded.insert(unit_id.to_string());
                    }
                    None => debug!("Ignoring unknown id {:?} from screening batch {}", id, batch.index()),
                }
            }
        }

        Ok(screening)
    }
}

/// The JSON array in a screening answer, as strings.
pub fn parse_discarded(answer: &str) -> Option<Vec<String>> {
    let start = answer.find('[')?;
    let end = answer.rfind(']')?;
    if end < start {
        return None;
    }
    let values: Vec<Value> = serde_json::from_str(&answer[start..=end]).ok()?;
    Some(
        values
            .into_iter()
            .filter_map(|value| match value {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
    )
}

/// Match an id from an answer against the batch: either the full unit id or
/// the part after its `kind:` prefix.
fn resolve_unit_id<'a>(batch: &'a Batch, id: &str) -> Option<&'a str> {
    batch
        .unit_ids()
        .into_iter()
        .find(|unit_id| *unit_id == id || unit_id.split_once(':').is_some_and(|(_, raw)| raw == id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::backend::BackendError;
    use crate::agent::retry::RetryConfig;
    use crate::agent::testing::ScriptedBackend;
    use crate::analysis::estimator::CharRatioEstimator;
    use std::sync::Arc;

    fn tweets(n: usize) -> Vec<ContentUnit> {
        let estimator = CharRatioEstimator::new(1.0);
        (1..=n)
            .map(|i| ContentUnit::record(format!("tweet:{i}"), "text", &estimator))
            .collect()
    }

    fn screen(backend: Arc<ScriptedBackend>, budget: usize) -> RelevanceScreen {
        let evaluator = BatchEvaluator::new(
            backend,
            screening_template("Crypto market overview."),
            RetryConfig::immediate(0),
        );
        RelevanceScreen::new(evaluator, budget, 2)
    }

    #[test]
    fn test_parse_discarded() {
        assert_eq!(
            parse_discarded("[\"tweet:1\", 7]"),
            Some(vec!["tweet:1".to_string(), "7".to_string()])
        );
        assert_eq!(parse_discarded("Discard these:\n[]\nDone."), Some(Vec::new()));
        assert_eq!(parse_discarded("nothing to discard"), None);
        assert_eq!(parse_discarded("] oops ["), None);
    }

    #[test]
    fn test_template_asks_for_ids() {
        let batch = Batch::new(0, tweets(1));
        let request = screening_template("Crypto market overview.").render(&batch);
        assert!(request.contains("<objective>\nCrypto market overview.\n</objective>"));
        assert!(request.contains(DISCARD_OUTPUT_PROMPT));
    }

    #[tokio::test]
    async fn test_screen_collects_ids_per_batch() {
        // Budget 8 puts two 4-char tweets in each batch.
        let backend = Arc::new(ScriptedBackend::new(|request, _| {
            if request.contains("\"tweet:1\"") {
                Ok("[\"tweet:2\"]".to_string())
            } else if request.contains("\"tweet:3\"") {
                Ok("```json\n[3, \"tweet:99\"]\n```".to_string())
            } else {
                Ok("[]".to_string())
            }
        }));
        let screening = screen(backend.clone(), 8).screen(&tweets(6)).await.unwrap();

        assert_eq!(screening.batches, 3);
        assert_eq!(screening.unanswered, 0);
        let mut discarded: Vec<&str> = screening.discarded.iter().map(String::as_str).collect();
        discarded.sort();
        assert_eq!(discarded, vec!["tweet:2", "tweet:3"]);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_failed_batches_keep_their_items() {
        let backend = Arc::new(ScriptedBackend::new(|request, _| {
            if request.contains("\"tweet:1\"") {
                Err(BackendError::Permanent("HTTP 400".to_string()))
            } else {
                Ok("all of them look fine".to_string())
            }
        }));
        let screening = screen(backend, 8).screen(&tweets(4)).await.unwrap();

        assert!(screening.discarded.is_empty());
        assert_eq!(screening.unanswered, 2);
    }

    #[tokio::test]
    async fn test_screen_rejects_zero_budget() {
        let backend = Arc::new(ScriptedBackend::counting());
        assert!(screen(backend.clone(), 0).screen(&tweets(2)).await.is_err());
        assert_eq!(backend.calls(), 0);
    }
}
