//! Cookie.fun market data.
//!
//! Pages through the `agentsPaged` endpoint, persists every page into an
//! ingestion run and turns stored runs back into analysis units.

use crate::analysis::estimator::CostEstimator;
use crate::ingest::DatasetProvider;
use crate::models::ContentUnit;
use crate::storage::ingestion::{IngestionRun, IngestionStore};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Time window the API computes delta values over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum DeltaInterval {
    #[default]
    #[serde(rename = "_3Days")]
    #[value(name = "_3Days")]
    ThreeDays,
    #[serde(rename = "_7Days")]
    #[value(name = "_7Days")]
    SevenDays,
}

impl DeltaInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaInterval::ThreeDays => "_3Days",
            DeltaInterval::SevenDays => "_7Days",
        }
    }
}

impl fmt::Display for DeltaInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub chain: i64,
    pub contract_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopTweet {
    pub tweet_url: String,
    #[serde(default)]
    pub tweet_author_profile_image_url: String,
    #[serde(default)]
    pub tweet_author_display_name: String,
    #[serde(default)]
    pub smart_engagement_points: i64,
    #[serde(default)]
    pub impressions_count: i64,
}

/// One agent as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDetails {
    pub agent_name: String,
    #[serde(default)]
    pub contracts: Vec<Contract>,
    #[serde(default)]
    pub twitter_usernames: Vec<String>,
    #[serde(default)]
    pub mindshare: f64,
    #[serde(default)]
    pub mindshare_delta_percent: f64,
    #[serde(default)]
    pub market_cap: f64,
    #[serde(default)]
    pub market_cap_delta_percent: f64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub price_delta_percent: f64,
    #[serde(default)]
    pub liquidity: f64,
    #[serde(default)]
    pub volume24_hours: f64,
    #[serde(default)]
    pub volume24_hours_delta_percent: f64,
    #[serde(default)]
    pub holders_count: f64,
    #[serde(default)]
    pub holders_count_delta_percent: f64,
    #[serde(default)]
    pub average_impressions_count: f64,
    #[serde(default)]
    pub average_impressions_count_delta_percent: f64,
    #[serde(default)]
    pub average_engagements_count: f64,
    #[serde(default)]
    pub average_engagements_count_delta_percent: f64,
    #[serde(default)]
    pub followers_count: u64,
    #[serde(default)]
    pub smart_followers_count: u64,
    #[serde(default)]
    pub top_tweets: Vec<TopTweet>,
}

impl AgentDetails {
    /// First listed twitter handle, if any.
    pub fn twitter_handle(&self) -> Option<&str> {
        self.twitter_usernames.first().map(String::as_str)
    }
}

/// Named record filter selectable from prompt frontmatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentFilter {
    #[default]
    Unfiltered,
    /// Market cap below 5M.
    SmallCaps,
    /// Market cap of at least 100M.
    LargeCaps,
    /// Market cap fell by less than 10% over the delta interval.
    Resilient,
}

impl AgentFilter {
    pub const ALL: [AgentFilter; 4] = [
        AgentFilter::Unfiltered,
        AgentFilter::SmallCaps,
        AgentFilter::LargeCaps,
        AgentFilter::Resilient,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            AgentFilter::Unfiltered => "unfiltered",
            AgentFilter::SmallCaps => "small_caps",
            AgentFilter::LargeCaps => "large_caps",
            AgentFilter::Resilient => "resilient",
        }
    }

    pub fn matches(&self, agent: &AgentDetails) -> bool {
        match self {
            AgentFilter::Unfiltered => true,
            AgentFilter::SmallCaps => agent.market_cap < 5_000_000.0,
            AgentFilter::LargeCaps => agent.market_cap >= 100_000_000.0,
            AgentFilter::Resilient => agent.market_cap_delta_percent > -10.0,
        }
    }
}

impl fmt::Display for AgentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Source of agent pages.
#[async_trait]
pub trait AgentPageSource: Send + Sync {
    async fn fetch_page(
        &self,
        page: u32,
        page_size: u32,
        interval: DeltaInterval,
    ) -> Result<Vec<AgentDetails>>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: Option<Payload>,
}

#[derive(Debug, Deserialize)]
struct Payload {
    data: Option<Vec<AgentDetails>>,
}

/// HTTP client for the cookie.fun API.
pub struct CookieFunClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl CookieFunClient {
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/agents/agentsPaged", self.base_url)
    }
}

#[async_trait]
impl AgentPageSource for CookieFunClient {
    async fn fetch_page(
        &self,
        page: u32,
        page_size: u32,
        interval: DeltaInterval,
    ) -> Result<Vec<AgentDetails>> {
        debug!("Fetching agents page {} (size {}, {})", page, page_size, interval);

        let response = self
            .client
            .get(self.endpoint())
            .header("x-api-key", &self.api_key)
            .query(&[
                ("interval", interval.as_str().to_string()),
                ("page", page.to_string()),
                ("pageSize", page_size.to_string()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::anyhow!("cookie.fun request timed out on page {}", page)
                } else if e.is_connect() {
                    anyhow::anyhow!("Cannot connect to cookie.fun at {}", self.base_url)
                } else {
                    anyhow::anyhow!("cookie.fun request failed: {}", e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            bail!("API request failed with status {}", status.as_u16());
        }

        let envelope: Envelope = response
            .json()
            .await
            .context("Invalid API response format")?;
        parse_envelope(envelope)
    }
}

fn parse_envelope(envelope: Envelope) -> Result<Vec<AgentDetails>> {
    envelope
        .ok
        .and_then(|payload| payload.data)
        .context("Invalid API response format: missing ok.data")
}

/// Paging settings for one ingestion.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub page_size: u32,
    pub max_pages: u32,
    pub page_delay: Duration,
    pub interval: DeltaInterval,
    pub show_progress: bool,
}

/// Fetch pages until a short page or `max_pages`, persisting a new ingestion run.
pub async fn ingest(
    source: &dyn AgentPageSource,
    store: &IngestionStore,
    options: &IngestOptions,
) -> Result<IngestionRun> {
    let mut run = store.create_run(options.interval).await?;
    info!("Started ingestion run {} ({})", run.id, options.interval);

    let progress = if options.show_progress {
        let pb = ProgressBar::new(u64::from(options.max_pages));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] page {pos}/{len} {msg}")
                .context("Invalid progress template")?
                .progress_chars("#>-"),
        );
        Some(pb)
    } else {
        None
    };

    for page in 1..=options.max_pages {
        let agents = source
            .fetch_page(page, options.page_size, options.interval)
            .await
            .with_context(|| format!("Failed to fetch page {}", page))?;
        let fetched = agents.len();

        for agent in agents {
            run.push_agent(agent);
        }
        store.save(&run).await?;

        if let Some(ref pb) = progress {
            pb.inc(1);
            pb.set_message(format!("{} agents", run.agents.len()));
        }

        if fetched < options.page_size as usize {
            debug!("Short page {} ({} agents), stopping", page, fetched);
            break;
        }
        if page < options.max_pages && !options.page_delay.is_zero() {
            tokio::time::sleep(options.page_delay).await;
        }
    }

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    info!("Ingestion run {} stored {} agents", run.id, run.agents.len());
    Ok(run)
}

/// Agent records of one ingestion run, narrowed by a filter.
pub struct AgentDatasetProvider {
    run: IngestionRun,
    filter: AgentFilter,
}

impl AgentDatasetProvider {
    /// Open run `run_id`, or the latest run when `None`.
    pub async fn open(store: &IngestionStore, run_id: Option<u64>, filter: AgentFilter) -> Result<Self> {
        let run = match run_id {
            Some(id) => store
                .load(id)
                .await
                .with_context(|| format!("Ingestion run {} not found", id))?,
            None => store
                .latest()
                .await?
                .context("No ingestion runs found; run `ingest` first")?,
        };
        Ok(Self { run, filter })
    }
}

#[async_trait]
impl DatasetProvider for AgentDatasetProvider {
    fn describe(&self) -> String {
        format!(
            "cookie.fun ingestion run {} ({}, filter {})",
            self.run.id, self.run.delta_interval, self.filter
        )
    }

    fn data_note(&self) -> Option<String> {
        Some(format!(
            "All delta values are between {} ago and now.",
            self.run.delta_interval
        ))
    }

    async fn load(&self, estimator: &dyn CostEstimator) -> Result<Vec<ContentUnit>> {
        let mut units = Vec::new();
        for record in self.run.agents.iter().filter(|r| self.filter.matches(&r.data)) {
            let text = serde_json::to_string_pretty(&record.data)
                .with_context(|| format!("Failed to serialize agent {}", record.agent_name))?;
            units.push(ContentUnit::record(format!("agent:{}", record.id), text, estimator));
        }
        debug!(
            "Filter {} kept {} of {} agents",
            self.filter,
            units.len(),
            self.run.agents.len()
        );
        Ok(units)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::analysis::estimator::CharRatioEstimator;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    pub(crate) fn agent(name: &str, market_cap: f64, delta: f64) -> AgentDetails {
        serde_json::from_value(serde_json::json!({
            "agentName": name,
            "contracts": [{"chain": 8453, "contractAddress": "0xabc"}],
            "twitterUsernames": [name.to_lowercase()],
            "marketCap": market_cap,
            "marketCapDeltaPercent": delta,
            "price": 0.0125,
        }))
        .unwrap()
    }

    struct FakePages {
        pages: Vec<Vec<AgentDetails>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AgentPageSource for FakePages {
        async fn fetch_page(&self, page: u32, _: u32, _: DeltaInterval) -> Result<Vec<AgentDetails>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.pages.get(page as usize - 1).cloned().unwrap_or_default())
        }
    }

    fn options(page_size: u32, max_pages: u32) -> IngestOptions {
        IngestOptions {
            page_size,
            max_pages,
            page_delay: Duration::ZERO,
            interval: DeltaInterval::ThreeDays,
            show_progress: false,
        }
    }

    #[test]
    fn test_agent_details_deserialize_api_shape() {
        let json = r#"{
            "agentName": "aixbt",
            "contracts": [{"chain": -2, "contractAddress": "14zP2ToQ79XWvc7FQpm4bRnp9d6Mp1rFfsUW3gpLcRX"}],
            "twitterUsernames": ["aixbt_agent"],
            "mindshare": 21.5,
            "mindshareDeltaPercent": -3.2,
            "marketCap": 250000000.0,
            "marketCapDeltaPercent": 12.4,
            "price": 0.31,
            "priceDeltaPercent": 12.1,
            "liquidity": 4000000.0,
            "volume24Hours": 9000000.0,
            "volume24HoursDeltaPercent": 1.5,
            "holdersCount": 51000,
            "holdersCountDeltaPercent": 0.4,
            "averageImpressionsCount": 12000,
            "averageImpressionsCountDeltaPercent": 2.0,
            "averageEngagementsCount": 300,
            "averageEngagementsCountDeltaPercent": -1.0,
            "followersCount": 470000,
            "smartFollowersCount": 3100,
            "topTweets": [{
                "tweetUrl": "https://x.com/aixbt_agent/status/1",
                "tweetAuthorProfileImageUrl": "https://pbs.twimg.com/a.jpg",
                "tweetAuthorDisplayName": "aixbt",
                "smartEngagementPoints": 40,
                "impressionsCount": 90000
            }]
        }"#;
        let agent: AgentDetails = serde_json::from_str(json).unwrap();
        assert_eq!(agent.agent_name, "aixbt");
        assert_eq!(agent.twitter_handle(), Some("aixbt_agent"));
        assert_eq!(agent.volume24_hours, 9_000_000.0);
        assert_eq!(agent.top_tweets[0].impressions_count, 90_000);

        let back = serde_json::to_value(&agent).unwrap();
        assert!(back.get("volume24Hours").is_some());
        assert!(back.get("marketCapDeltaPercent").is_some());
    }

    #[test]
    fn test_envelope_validation() {
        let ok: Envelope = serde_json::from_str(r#"{"ok": {"data": []}}"#).unwrap();
        assert!(parse_envelope(ok).unwrap().is_empty());

        let bad: Envelope = serde_json::from_str(r#"{"error": "nope"}"#).unwrap();
        assert!(parse_envelope(bad).is_err());
    }

    #[test]
    fn test_filters() {
        let small = agent("Small", 1_000_000.0, -20.0);
        let large = agent("Large", 150_000_000.0, -5.0);
        let mid = agent("Mid", 5_000_000.0, -10.0);

        assert!(AgentFilter::SmallCaps.matches(&small));
        assert!(!AgentFilter::SmallCaps.matches(&mid));
        assert!(AgentFilter::LargeCaps.matches(&large));
        assert!(!AgentFilter::LargeCaps.matches(&mid));
        assert!(AgentFilter::Resilient.matches(&large));
        assert!(!AgentFilter::Resilient.matches(&mid));
        assert!(AgentFilter::Unfiltered.matches(&small));

        assert_eq!(AgentFilter::from_name("large_caps"), Some(AgentFilter::LargeCaps));
        assert_eq!(AgentFilter::from_name("mid_caps"), None);
    }

    #[tokio::test]
    async fn test_ingest_stops_on_short_page() {
        let dir = TempDir::new().unwrap();
        let store = IngestionStore::new(dir.path());
        let source = FakePages {
            pages: vec![
                vec![agent("A", 1.0, 0.0), agent("B", 1.0, 0.0)],
                vec![agent("C", 1.0, 0.0)],
                vec![agent("D", 1.0, 0.0), agent("E", 1.0, 0.0)],
            ],
            calls: AtomicU32::new(0),
        };

        let run = ingest(&source, &store, &options(2, 15)).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(run.id, 1);
        let names: Vec<&str> = run.agents.iter().map(|a| a.agent_name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);

        let stored = store.load(1).await.unwrap();
        assert_eq!(stored.agents.len(), 3);
    }

    #[tokio::test]
    async fn test_ingest_respects_max_pages() {
        let dir = TempDir::new().unwrap();
        let store = IngestionStore::new(dir.path());
        let full = vec![agent("A", 1.0, 0.0)];
        let source = FakePages {
            pages: vec![full.clone(), full.clone(), full.clone(), full],
            calls: AtomicU32::new(0),
        };

        let run = ingest(&source, &store, &options(1, 3)).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(run.agents.len(), 3);
    }

    #[tokio::test]
    async fn test_agent_provider_applies_filter() {
        let dir = TempDir::new().unwrap();
        let store = IngestionStore::new(dir.path());
        let mut run = store.create_run(DeltaInterval::SevenDays).await.unwrap();
        run.push_agent(agent("Tiny", 100_000.0, 3.0));
        run.push_agent(agent("Huge", 900_000_000.0, 3.0));
        store.save(&run).await.unwrap();

        let provider = AgentDatasetProvider::open(&store, None, AgentFilter::SmallCaps)
            .await
            .unwrap();
        let units = provider.load(&CharRatioEstimator::default()).await.unwrap();

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id(), "agent:1");
        assert!(units[0].text().contains("\"agentName\": \"Tiny\""));
        assert!(provider.data_note().unwrap().contains("_7Days ago"));
        assert!(provider.describe().contains("small_caps"));
    }

    #[tokio::test]
    async fn test_agent_provider_without_runs() {
        let dir = TempDir::new().unwrap();
        let store = IngestionStore::new(dir.path());
        assert!(AgentDatasetProvider::open(&store, None, AgentFilter::Unfiltered)
            .await
            .is_err());
        assert!(AgentDatasetProvider::open(&store, Some(4), AgentFilter::Unfiltered)
            .await
            .is_err());
    }
}
