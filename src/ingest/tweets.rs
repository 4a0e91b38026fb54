//! Cached tweets as an analysis dataset.

use crate::analysis::estimator::CostEstimator;
use crate::ingest::DatasetProvider;
use crate::models::ContentUnit;
use crate::storage::tweets::TweetStore;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Objective used by `summarize-tweets`.
pub const MARKET_OVERVIEW_OBJECTIVE: &str = "Provide a detailed overview over the current state of the cryptocurrency market. Highlight current narratives and trends, including social media activity, and technological developments. Briefly mention major events and news relevant to the broader market, if any. \n\nTime span: Last few weeks. \n\nDo not reference specific tweets.\n\nOutput as a markdown document, with sections for each topic.";

/// Appended to the objective with `--focus-ai`.
pub const AI_FOCUS: &str = "\n\nFocus on the topic of AI in web3, and the impact of AI on the market.";

/// Output instructions for tweet batches.
pub const SUMMARY_OUTPUT_PROMPT: &str = "Summarize the tweets in a way that is useful for a finance professional. Respond with nothing but the summary.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TweetAuthor {
    pub name: String,
    pub username: String,
}

/// A tweet referenced by another one (quote, reply target, retweet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencedTweet {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<TweetAuthor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tweet {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub author: TweetAuthor,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_tweets: Vec<ReferencedTweet>,
    /// Follow-up tweets of the same thread, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thread: Vec<Tweet>,
}

#[derive(Serialize)]
struct TweetView<'a> {
    created_at: String,
    author: String,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    referenced_tweets: Vec<ReferenceView<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    thread: Vec<TweetView<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ReferenceView<'a> {
    Resolved {
        #[serde(rename = "type")]
        kind: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        created_at: Option<String>,
        author: String,
        text: &'a str,
    },
    Missing(String),
}

fn author_label(author: &TweetAuthor) -> String {
    format!("{} (@{})", author.name, author.username)
}

fn view(tweet: &Tweet, include_ids: bool, resolve_thread: bool) -> TweetView<'_> {
    let referenced_tweets = tweet
        .referenced_tweets
        .iter()
        .map(|r| match (&r.author, &r.text) {
            (Some(author), Some(text)) => ReferenceView::Resolved {
                kind: &r.kind,
                created_at: r.created_at.map(|t| t.to_rfc3339()),
                author: author_label(author),
                text,
            },
            _ => ReferenceView::Missing(format!("Uncached tweet {}", r.id)),
        })
        .collect();

    let thread = if resolve_thread {
        tweet.thread.iter().map(|t| view(t, include_ids, false)).collect()
    } else {
        Vec::new()
    };

    TweetView {
        created_at: tweet.created_at.to_rfc3339(),
        author: author_label(&tweet.author),
        text: &tweet.text,
        id: include_ids.then_some(tweet.id.as_str()),
        referenced_tweets,
        thread,
    }
}

/// Render one tweet with its references and thread as YAML.
pub fn serialize_tweet(tweet: &Tweet, include_ids: bool) -> Result<String> {
    serde_yaml::to_string(&view(tweet, include_ids, true))
        .with_context(|| format!("Failed to serialize tweet {}", tweet.id))
}

/// Recent cached tweets of one or more accounts.
pub struct TweetDatasetProvider {
    usernames: Vec<String>,
    tweets: Vec<Tweet>,
    include_ids: bool,
}

impl TweetDatasetProvider {
    /// Load up to `count` newest tweets per username. Unknown usernames are an error.
    pub async fn open(store: &TweetStore, usernames: &[String], count: usize) -> Result<Self> {
        let mut tweets = Vec::new();
        for username in usernames {
            let cached = store.load(username).await?;
            if cached.is_empty() {
                bail!("User {} not found in local cache; import tweets first", username);
            }
            debug!("Loaded {} cached tweets for @{}", cached.len(), username);
            tweets.extend(cached.into_iter().take(count));
        }
        Ok(Self {
            usernames: usernames.to_vec(),
            tweets,
            include_ids: false,
        })
    }

    /// Also render each tweet's own id, so a model can refer to it.
    pub fn with_ids(mut self, include_ids: bool) -> Self {
        self.include_ids = include_ids;
        self
    }

    /// Drop the tweets whose unit ids are in `unit_ids`. Returns how many were dropped.
    pub fn discard(&mut self, unit_ids: &HashSet<String>) -> usize {
        let before = self.tweets.len();
        self.tweets.retain(|tweet| !unit_ids.contains(&unit_id(tweet)));
        before - self.tweets.len()
    }

    pub fn len(&self) -> usize {
        self.tweets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tweets.is_empty()
    }
}

fn unit_id(tweet: &Tweet) -> String {
    format!("tweet:{}", tweet.id)
}

#[async_trait]
impl DatasetProvider for TweetDatasetProvider {
    fn describe(&self) -> String {
        let handles: Vec<String> = self.usernames.iter().map(|u| format!("@{}", u)).collect();
        format!("{} cached tweets from {}", self.tweets.len(), handles.join(", "))
    }

    fn data_note(&self) -> Option<String> {
        None
    }

    async fn load(&self, estimator: &dyn CostEstimator) -> Result<Vec<ContentUnit>> {
        self.tweets
            .iter()
            .map(|tweet| {
                let text = serialize_tweet(tweet, self.include_ids)?;
                Ok(ContentUnit::record(unit_id(tweet), text, estimator))
            })
            .collect()
    }
}
