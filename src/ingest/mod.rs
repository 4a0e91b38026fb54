//! Data sources.
//!
//! Each source turns its stored records into content units for the
//! reducer through the `DatasetProvider` trait.

pub mod cookie_fun;
pub mod tweets;

use crate::analysis::estimator::CostEstimator;
use crate::models::ContentUnit;
use anyhow::Result;
use async_trait::async_trait;

pub use cookie_fun::{AgentDatasetProvider, CookieFunClient, DeltaInterval};
pub use tweets::TweetDatasetProvider;

/// Something the reducer can analyze.
#[async_trait]
pub trait DatasetProvider: Send + Sync {
    /// Human-readable description, stored with the run.
    fn describe(&self) -> String;

    /// Extra sentence for the request's purpose block.
    fn data_note(&self) -> Option<String>;

    /// Serialize every record into a round-0 unit, in a stable order.
    async fn load(&self, estimator: &dyn CostEstimator) -> Result<Vec<ContentUnit>>;
}
