//! Greedy, order-preserving partitioning of content into batches.

use crate::models::{Batch, ContentUnit};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkingError {
    #[error("batch budget must be greater than zero")]
    InvalidBudget,
}

/// Split `units` into contiguous batches whose summed cost stays within `budget`.
///
/// Walks the input left to right and closes the current batch as soon as the
/// next unit would push it over budget. A unit that alone exceeds the budget
/// becomes a singleton batch. Empty input yields no batches.
pub fn chunk(units: &[ContentUnit], budget: usize) -> Result<Vec<Batch>, ChunkingError> {
    if budget == 0 {
        return Err(ChunkingError::InvalidBudget);
    }

    let mut batches = Vec::new();
    let mut current: Vec<ContentUnit> = Vec::new();
    let mut current_cost = 0usize;

    for unit in units {
        if !current.is_empty() && current_cost.saturating_add(unit.cost()) > budget {
            batches.push(Batch::new(batches.len(), std::mem::take(&mut current)));
            current_cost = 0;
        }
        current_cost = current_cost.saturating_add(unit.cost());
        current.push(unit.clone());
    }

    if !current.is_empty() {
        batches.push(Batch::new(batches.len(), current));
    }

    Ok(batches)
}
