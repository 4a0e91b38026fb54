//! Persisted ingestion runs.
//!
//! Each run is one JSON file, `ingestion_runs/<id>.json`, with ids
//! increasing from 1.

use crate::ingest::cookie_fun::{AgentDetails, DeltaInterval};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// One agent snapshot inside an ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Position within the run, starting at 1.
    pub id: u64,
    pub agent_name: String,
    pub data: AgentDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub delta_interval: DeltaInterval,
    #[serde(default)]
    pub agents: Vec<AgentRecord>,
}

impl IngestionRun {
    pub fn push_agent(&mut self, data: AgentDetails) {
        let id = self.agents.len() as u64 + 1;
        self.agents.push(AgentRecord {
            id,
            agent_name: data.agent_name.clone(),
            data,
        });
    }
}

#[derive(Debug, Clone)]
pub struct IngestionStore {
    dir: PathBuf,
}

impl IngestionStore {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: storage_dir.into().join("ingestion_runs"),
        }
    }

    fn path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Ids of all stored runs, ascending.
    pub async fn ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.dir.display()))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to read {}", self.dir.display()))?
        {
            let name = entry.file_name();
            let id = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(id) = id {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Create and persist an empty run with the next free id.
    pub async fn create_run(&self, delta_interval: DeltaInterval) -> Result<IngestionRun> {
        let id = self.ids().await?.last().map_or(1, |last| last + 1);
        let run = IngestionRun {
            id,
            created_at: Utc::now(),
            delta_interval,
            agents: Vec::new(),
        };
        self.save(&run).await?;
        Ok(run)
    }

    pub async fn save(&self, run: &IngestionRun) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path(run.id);
        let content = serde_json::to_string_pretty(run).context("Failed to serialize ingestion run")?;
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("Saved ingestion run {} ({} agents)", run.id, run.agents.len());
        Ok(())
    }

    pub async fn load(&self, id: u64) -> Result<IngestionRun> {
        let path = self.path(id);
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Newest snapshot of the agent whose first twitter handle is `handle`.
    ///
    /// Runs are searched from the highest id down; the match ignores case and a leading `@`.
    pub async fn find_by_twitter_handle(&self, handle: &str) -> Result<Option<(u64, AgentRecord)>> {
        let handle = handle.trim().trim_start_matches('@');
        for id in self.ids().await?.into_iter().rev() {
            let run = self.load(id).await?;
            let found = run.agents.into_iter().find(|record| {
                record
                    .data
                    .twitter_handle()
                    .is_some_and(|h| h.eq_ignore_ascii_case(handle))
            });
            if let Some(record) = found {
                return Ok(Some((id, record)));
            }
        }
        Ok(None)
    }

    /// The run with the highest id, if any.
    pub async fn latest(&self) -> Result<Option<IngestionRun>> {
        match self.ids().await?.last() {
            Some(&id) => Ok(Some(self.load(id).await?)),
            None => Ok(None),
        }
    }
}
