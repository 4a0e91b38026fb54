//! Run ledger and result cache.
//!
//! The ledger records what each analysis run did: the run metadata, every
//! round's batches and outcomes, and the final artifact. It is a passive
//! recorder; writes for the same (run, round) overwrite the previous copy.
//!
//! Layout under the storage directory:
//!
//! ```text
//! runs/<run_id>/run.json
//! runs/<run_id>/dataset.json
//! runs/<run_id>/round-000.json
//! runs/<run_id>/final.md
//! cache/<sha256>.txt
//! ```

use crate::models::{Batch, ContentUnit, EvaluationOutcome, RoundSummary, RunId, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run not found: {0}")]
    NotFound(String),

    #[error("invalid run id: {0:?}")]
    InvalidRunId(String),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Metadata of one run as persisted in `run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub analysis_key: String,
    pub filter_name: String,
    pub dataset: String,
    pub model: String,
    pub prompt: String,
    pub unit_count: usize,
    pub status: RunStatus,
    /// Last round the run reached.
    #[serde(default)]
    pub round: usize,
    #[serde(default)]
    pub rounds: Vec<RoundSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Batch as persisted: unit ids and cost, not the unit text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub index: usize,
    pub unit_ids: Vec<String>,
    pub cost: usize,
}

impl From<&Batch> for BatchRecord {
    fn from(batch: &Batch) -> Self {
        Self {
            index: batch.index(),
            unit_ids: batch.unit_ids().into_iter().map(String::from).collect(),
            cost: batch.cost(),
        }
    }
}

/// One round as persisted in `round-NNN.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub run_id: RunId,
    pub round: usize,
    pub batches: Vec<BatchRecord>,
    pub outcomes: Vec<EvaluationOutcome>,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only recorder for analysis runs.
#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn record_start(&self, record: &RunRecord) -> LedgerResult<()>;

    /// Snapshot of the round-0 units, so a run stays reproducible after its source changes.
    async fn record_dataset(&self, run_id: &RunId, units: &[ContentUnit]) -> LedgerResult<()>;

    async fn record_round(
        &self,
        run_id: &RunId,
        round: usize,
        batches: &[Batch],
        outcomes: &[EvaluationOutcome],
    ) -> LedgerResult<()>;

    async fn record_final(&self, run_id: &RunId, artifact: &str) -> LedgerResult<()>;

    async fn record_failure(&self, run_id: &RunId, round: usize, reason: &str) -> LedgerResult<()>;
}

/// Content-addressed store of batch results.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    async fn put(&self, key: &str, text: &str) -> LedgerResult<()>;
}

/// JSON-file ledger rooted at a storage directory.
#[derive(Debug, Clone)]
pub struct FileLedger {
    root: PathBuf,
}

impl FileLedger {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: storage_dir.into(),
        }
    }

    /// Directory of one run. Ids that could leave `runs/` are rejected.
    fn run_dir(&self, run_id: &RunId) -> LedgerResult<PathBuf> {
        let id = run_id.as_str();
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
            return Err(LedgerError::InvalidRunId(id.to_string()));
        }
        Ok(self.root.join("runs").join(id))
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.root.join("cache").join(format!("{}.txt", key))
    }

    /// Load the metadata of one run.
    pub async fn load_run(&self, run_id: &RunId) -> LedgerResult<RunRecord> {
        let path = self.run_dir(run_id)?.join("run.json");
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(LedgerError::NotFound(run_id.to_string()));
        }
        read_json(&path).await
    }

    /// Load all recorded rounds of a run, in round order.
    pub async fn load_rounds(&self, run_id: &RunId) -> LedgerResult<Vec<RoundRecord>> {
        let dir = self.run_dir(run_id)?;
        let mut rounds = Vec::new();
        for round in 0.. {
            let path = dir.join(round_file_name(round));
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                break;
            }
            rounds.push(read_json(&path).await?);
        }
        Ok(rounds)
    }

    /// Load the round-0 units recorded when the run started.
    pub async fn load_dataset(&self, run_id: &RunId) -> LedgerResult<Vec<ContentUnit>> {
        read_json(&self.run_dir(run_id)?.join("dataset.json")).await
    }

    /// Load the final artifact of a completed run.
    pub async fn load_artifact(&self, run_id: &RunId) -> LedgerResult<String> {
        let path = self.run_dir(run_id)?.join("final.md");
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| LedgerError::Io { path, source })
    }

    /// List all runs, newest first.
    pub async fn list_runs(&self) -> LedgerResult<Vec<RunRecord>> {
        let runs_dir = self.root.join("runs");
        let mut runs = Vec::new();

        let mut entries = match tokio::fs::read_dir(&runs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: runs_dir,
                    source,
                })
            }
        };

        while let Some(entry) = entries.next_entry().await.map_err(|source| LedgerError::Io {
            path: runs_dir.clone(),
            source,
        })? {
            let path = entry.path().join("run.json");
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                match read_json::<RunRecord>(&path).await {
                    Ok(record) => runs.push(record),
                    Err(e) => debug!("Skipping unreadable run {}: {}", path.display(), e),
                }
            }
        }

        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn update_run(
        &self,
        run_id: &RunId,
        update: impl FnOnce(&mut RunRecord),
    ) -> LedgerResult<()> {
        let path = self.run_dir(run_id)?.join("run.json");
        let mut record: RunRecord = read_json(&path).await?;
        update(&mut record);
        record.updated_at = Utc::now();
        write_json(&path, &record).await
    }
}

#[async_trait]
impl RunLedger for FileLedger {
    async fn record_start(&self, record: &RunRecord) -> LedgerResult<()> {
        let path = self.run_dir(&record.run_id)?.join("run.json");
        write_json(&path, record).await
    }

    async fn record_dataset(&self, run_id: &RunId, units: &[ContentUnit]) -> LedgerResult<()> {
        let path = self.run_dir(run_id)?.join("dataset.json");
        write_json(&path, &units).await
    }

    async fn record_round(
        &self,
        run_id: &RunId,
        round: usize,
        batches: &[Batch],
        outcomes: &[EvaluationOutcome],
    ) -> LedgerResult<()> {
        let record = RoundRecord {
            run_id: run_id.clone(),
            round,
            batches: batches.iter().map(BatchRecord::from).collect(),
            outcomes: outcomes.to_vec(),
            recorded_at: Utc::now(),
        };
        let path = self.run_dir(run_id)?.join(round_file_name(round));
        write_json(&path, &record).await?;

        let summary = RoundSummary {
            round,
            units: batches.iter().map(Batch::len).sum(),
            batches: batches.len(),
            failed: outcomes.iter().filter(|o| !o.is_success()).count(),
            cached: outcomes.iter().filter(|o| o.cached).count(),
        };
        self.update_run(run_id, |run| {
            run.round = round;
            run.rounds.retain(|r| r.round != round);
            run.rounds.push(summary);
            run.rounds.sort_by_key(|r| r.round);
        })
        .await
    }

    async fn record_final(&self, run_id: &RunId, artifact: &str) -> LedgerResult<()> {
        let path = self.run_dir(run_id)?.join("final.md");
        write_text(&path, artifact).await?;
        self.update_run(run_id, |run| {
            run.status = RunStatus::Completed;
            run.failure_reason = None;
        })
        .await
    }

    async fn record_failure(&self, run_id: &RunId, round: usize, reason: &str) -> LedgerResult<()> {
        self.update_run(run_id, |run| {
            run.status = RunStatus::Failed;
            run.round = round;
            run.failure_reason = Some(reason.to_string());
        })
        .await
    }
}

#[async_trait]
impl ResultCache for FileLedger {
    async fn get(&self, key: &str) -> Option<String> {
        tokio::fs::read_to_string(self.cache_path(key)).await.ok()
    }

    async fn put(&self, key: &str, text: &str) -> LedgerResult<()> {
        write_text(&self.cache_path(key), text).await
    }
}

fn round_file_name(round: usize) -> String {
    format!("round-{:03}.json", round)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> LedgerResult<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(serde_json::from_str(&content)?)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> LedgerResult<()> {
    let content = serde_json::to_string_pretty(value)?;
    write_text(path, &content).await
}

async fn write_text(path: &Path, content: &str) -> LedgerResult<()> {
    let io_err = |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::write(path, content).await.map_err(io_err)
}

/// In-memory ledger for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: std::sync::Mutex<MemoryLedgerState>,
    fail_writes: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryLedgerState {
    pub runs: std::collections::HashMap<String, RunRecord>,
    pub datasets: std::collections::HashMap<String, Vec<ContentUnit>>,
    pub rounds: std::collections::BTreeMap<(String, usize), RoundRecord>,
    pub finals: std::collections::HashMap<String, String>,
    pub cache: std::collections::HashMap<String, String>,
}

#[cfg(test)]
impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every ledger write fail with an I/O error.
    pub fn failing() -> Self {
        let ledger = Self::default();
        ledger
            .fail_writes
            .store(true, std::sync::atomic::Ordering::SeqCst);
        ledger
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MemoryLedgerState> {
        self.inner.lock().unwrap()
    }

    fn check(&self) -> LedgerResult<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(LedgerError::Io {
                path: PathBuf::from("memory"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl RunLedger for MemoryLedger {
    async fn record_start(&self, record: &RunRecord) -> LedgerResult<()> {
        self.check()?;
        self.state()
            .runs
            .insert(record.run_id.to_string(), record.clone());
        Ok(())
    }

    async fn record_dataset(&self, run_id: &RunId, units: &[ContentUnit]) -> LedgerResult<()> {
        self.check()?;
        self.state()
            .datasets
            .insert(run_id.to_string(), units.to_vec());
        Ok(())
    }

    async fn record_round(
        &self,
        run_id: &RunId,
        round: usize,
        batches: &[Batch],
        outcomes: &[EvaluationOutcome],
    ) -> LedgerResult<()> {
        self.check()?;
        let record = RoundRecord {
            run_id: run_id.clone(),
            round,
            batches: batches.iter().map(BatchRecord::from).collect(),
            outcomes: outcomes.to_vec(),
            recorded_at: Utc::now(),
        };
        self.state().rounds.insert((run_id.to_string(), round), record);
        Ok(())
    }

    async fn record_final(&self, run_id: &RunId, artifact: &str) -> LedgerResult<()> {
        self.check()?;
        let mut state = self.state();
        state.finals.insert(run_id.to_string(), artifact.to_string());
        if let Some(run) = state.runs.get_mut(run_id.as_str()) {
            run.status = RunStatus::Completed;
        }
        Ok(())
    }

    async fn record_failure(&self, run_id: &RunId, round: usize, reason: &str) -> LedgerResult<()> {
        self.check()?;
        if let Some(run) = self.state().runs.get_mut(run_id.as_str()) {
            run.status = RunStatus::Failed;
            run.round = round;
            run.failure_reason = Some(reason.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl ResultCache for MemoryLedger {
    async fn get(&self, key: &str) -> Option<String> {
        self.state().cache.get(key).cloned()
    }

    async fn put(&self, key: &str, text: &str) -> LedgerResult<()> {
        self.check()?;
        self.state().cache.insert(key.to_string(), text.to_string());
        Ok(())
    }
}
