//! On-disk state under the storage directory.

pub mod ingestion;
pub mod ledger;
pub mod tweets;

pub use ingestion::IngestionStore;
pub use ledger::FileLedger;
pub use tweets::TweetStore;
