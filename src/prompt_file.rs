//! Prompt files with optional YAML frontmatter.
//!
//! ```text
//! filter: small_caps
//! ---
//! Which of these agents are undervalued?
//! ```
//!
//! The file is read as if it began with a newline, so a file that starts
//! with `---` has empty frontmatter and one without a separator line has
//! none at all.

use crate::ingest::cookie_fun::AgentFilter;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SEPARATOR: &str = "\n---\n";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to read prompt file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid prompt frontmatter: {0}")]
    Frontmatter(#[from] serde_yaml::Error),

    #[error("Filter '{0}' not found (expected one of: unfiltered, small_caps, large_caps, resilient)")]
    UnknownFilter(String),
}

#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    #[serde(default)]
    filter: Option<String>,
}

/// A parsed prompt file.
#[derive(Debug, Clone)]
pub struct PromptFile {
    prompt: String,
    filter: AgentFilter,
}

impl PromptFile {
    pub fn load(path: &Path) -> Result<Self, PromptError> {
        let content = std::fs::read_to_string(path).map_err(|source| PromptError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, PromptError> {
        let content = format!("\n{}", content);

        let (frontmatter, prompt) = match content.find(SEPARATOR) {
            Some(index) => (&content[..index], &content[index + SEPARATOR.len() - 1..]),
            None => ("", content.as_str()),
        };

        let frontmatter: Frontmatter = if frontmatter.trim().is_empty() {
            Frontmatter::default()
        } else {
            serde_yaml::from_str(frontmatter)?
        };

        let filter_name = frontmatter.filter.unwrap_or_else(|| "unfiltered".to_string());
        let filter =
            AgentFilter::from_name(&filter_name).ok_or(PromptError::UnknownFilter(filter_name))?;

        Ok(Self {
            prompt: prompt.to_string(),
            filter,
        })
    }

    /// Prompt body without frontmatter.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn filter(&self) -> AgentFilter {
        self.filter
    }

    /// `<filter>:<first 6 hex chars of sha256(prompt)>`.
    pub fn analysis_key(&self) -> String {
        let digest = hex::encode(Sha256::digest(self.prompt.as_bytes()));
        format!("{}:{}", self.filter.name(), &digest[..6])
    }
}
