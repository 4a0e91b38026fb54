//! Reasoning backend access.
//!
//! This module provides the backend trait and its HTTP implementation,
//! the request template and the retry schedule used by the evaluator.

pub mod backend;
pub mod prompt;
pub mod retry;

#[cfg(test)]
pub mod testing;

pub use backend::ChatCompletionsBackend;
pub use prompt::RequestTemplate;
