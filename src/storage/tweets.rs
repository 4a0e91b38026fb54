//! Local tweet cache, one JSON file per account.

use crate::ingest::tweets::Tweet;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Counts reported after an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: usize,
    pub updated: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct TweetStore {
    dir: PathBuf,
}

impl TweetStore {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: storage_dir.into().join("tweets"),
        }
    }

    fn path(&self, username: &str) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{}.json", normalize_username(username)?)))
    }

    /// Cached tweets of `username`, newest first. Unknown users have none.
    pub async fn load(&self, username: &str) -> Result<Vec<Tweet>> {
        let path = self.path(username)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Merge `tweets` into the cache of `username`; newer copies replace older ones by id.
    pub async fn import(&self, username: &str, tweets: Vec<Tweet>) -> Result<ImportSummary> {
        let path = self.path(username)?;
        let mut merged: HashMap<String, Tweet> = self
            .load(username)
            .await?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();

        let mut summary = ImportSummary {
            added: 0,
            updated: 0,
            total: 0,
        };
        for tweet in tweets {
            match merged.insert(tweet.id.clone(), tweet) {
                Some(_) => summary.updated += 1,
                None => summary.added += 1,
            }
        }

        let mut all: Vec<Tweet> = merged.into_values().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        summary.total = all.len();

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let content = serde_json::to_string_pretty(&all).context("Failed to serialize tweets")?;
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!(
            "Imported tweets for @{}: {} new, {} updated, {} total",
            normalize_username(username)?,
            summary.added,
            summary.updated,
            summary.total
        );
        Ok(summary)
    }
}

/// Read a JSON array of tweets from a file.
pub async fn read_tweet_file(path: &Path) -> Result<Vec<Tweet>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of tweets", path.display()))
}

/// Lowercased handle without `@`. Only letters, digits and `_` are valid in a handle.
fn normalize_username(username: &str) -> Result<String> {
    let handle = username.trim().trim_start_matches('@');
    if handle.is_empty() || !handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("Invalid Twitter username: {:?}", username);
    }
    Ok(handle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::tweets::tests::tweet;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_import_merges_by_id() {
        let dir = TempDir::new().unwrap();
        let store = TweetStore::new(dir.path());

        let first = store
            .import("CookieBot", vec![tweet("1", 1, "a"), tweet("2", 2, "b")])
            .await
            .unwrap();
        assert_eq!(first, ImportSummary { added: 2, updated: 0, total: 2 });

        let second = store
            .import("@cookiebot", vec![tweet("2", 2, "b edited"), tweet("3", 5, "c")])
            .await
            .unwrap();
        assert_eq!(second, ImportSummary { added: 1, updated: 1, total: 3 });

        let cached = store.load("cookiebot").await.unwrap();
        let ids: Vec<&str> = cached.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2", "1"]);
        assert_eq!(cached[1].text, "b edited");
    }

    #[tokio::test]
    async fn test_unknown_user_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = TweetStore::new(dir.path());
        assert!(store.load("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_usernames_cannot_escape_storage() {
        let dir = TempDir::new().unwrap();
        let store = TweetStore::new(dir.path().join("storage"));

        for name in ["../escape", "a/b", "..", "", "@"] {
            assert!(store.load(name).await.is_err());
            assert!(store.import(name, vec![tweet("1", 1, "x")]).await.is_err());
        }
        assert!(!dir.path().join("escape.json").exists());
        assert_eq!(normalize_username(" @Cookie_Bot ").unwrap(), "cookie_bot");
    }

    #[tokio::test]
    async fn test_read_tweet_file_validates() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        let tweets = vec![tweet("9", 9, "hello")];
        std::fs::write(&good, serde_json::to_string(&tweets).unwrap()).unwrap();
        std::fs::write(&bad, r#"{"id": "9"}"#).unwrap();

        assert_eq!(read_tweet_file(&good).await.unwrap(), tweets);
        assert!(read_tweet_file(&bad).await.is_err());
    }
}
