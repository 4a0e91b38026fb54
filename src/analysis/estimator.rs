//! Token budget estimation.
//!
//! Maps a piece of text to an approximate cost in model-context units.
//! The same estimator sizes serialized records and prior-round outputs.

/// Default characters per token (conservative estimate for English text).
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Estimates the context cost of a piece of text.
///
/// Implementations must be pure, deterministic and monotonic in the
/// length of the text. Empty text costs nothing.
pub trait CostEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Character-count estimator: `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    /// Create an estimator. Non-positive or non-finite ratios fall back to the default.
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl CostEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        (chars as f64 / self.chars_per_token).ceil() as usize
    }
}
