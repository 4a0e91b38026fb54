//! Batch evaluation with retry and result caching.
//!
//! One batch becomes one backend request. Transient failures are retried
//! with backoff; permanent ones are returned immediately. The evaluator
//! never judges what the backend said, only that it said something.

use crate::agent::backend::{BackendError, ReasoningBackend};
use crate::agent::prompt::{clean_response, RequestTemplate};
use crate::agent::retry::RetryConfig;
use crate::models::{Batch, BatchFailure, EvaluationOutcome};
use crate::storage::ledger::ResultCache;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct BatchEvaluator {
    backend: Arc<dyn ReasoningBackend>,
    template: RequestTemplate,
    retry: RetryConfig,
    cache: Option<Arc<dyn ResultCache>>,
    read_cache: bool,
    calls: AtomicUsize,
}

impl BatchEvaluator {
    pub fn new(backend: Arc<dyn ReasoningBackend>, template: RequestTemplate, retry: RetryConfig) -> Self {
        Self {
            backend,
            template,
            retry,
            cache: None,
            read_cache: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Attach a result cache. With `read_cache == false` results are still
    /// written but never served from the cache.
    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>, read_cache: bool) -> Self {
        self.cache = Some(cache);
        self.read_cache = read_cache;
        self
    }

    pub fn prompt(&self) -> &str {
        self.template.prompt()
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Number of backend calls issued so far, retries included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn cache_key(&self, request: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.backend.model_name().as_bytes());
        hasher.update([0u8]);
        hasher.update(request.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Evaluate one batch against the active prompt.
    pub async fn evaluate(&self, batch: &Batch) -> EvaluationOutcome {
        let request = self.template.render(batch);
        let key = self.cache_key(&request);

        if self.read_cache {
            if let Some(ref cache) = self.cache {
                if let Some(hit) = cache.get(&key).await {
                    debug!("Batch {} served from cache", batch.index());
                    let mut outcome = EvaluationOutcome::success(batch.index(), hit);
                    outcome.cached = true;
                    return outcome;
                }
            }
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            self.calls.fetch_add(1, Ordering::SeqCst);
            debug!(
                "Evaluating batch {} ({} units, cost {}), attempt {}",
                batch.index(),
                batch.len(),
                batch.cost(),
                attempts
            );

            let error = match self.backend.complete(&request).await {
                Ok(raw) => {
                    let text = clean_response(&raw);
                    if !text.is_empty() {
                        if let Some(ref cache) = self.cache {
                            if let Err(e) = cache.put(&key, &text).await {
                                warn!("Failed to cache result of batch {}: {}", batch.index(), e);
                            }
                        }
                        return EvaluationOutcome::success(batch.index(), text);
                    }
                    BackendError::Transient("empty response".to_string())
                }
                Err(e) => e,
            };

            let retries_used = attempts - 1;
            if !error.is_transient() || retries_used >= self.retry.max_retries {
                warn!("Batch {} failed: {}", batch.index(), error);
                return EvaluationOutcome::failure(BatchFailure {
                    batch_index: batch.index(),
                    reason: error.to_string(),
                    transient: error.is_transient(),
                    attempts,
                });
            }

            let delay = self.retry.backoff(retries_used, batch.index());
            warn!(
                "Batch {} attempt {} failed ({}), retrying in {:.1}s",
                batch.index(),
                attempts,
                error,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
        }
    }
}
