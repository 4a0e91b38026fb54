//! Critique of one agent's own tweets.
//!
//! The agent's latest market record is condensed into a short summary first;
//! that summary travels with every batch as context while the agent's tweets
//! are reduced under the critique objective.

use crate::agent::prompt::RequestTemplate;
use crate::analysis::estimator::CostEstimator;
use crate::analysis::evaluator::BatchEvaluator;
use crate::ingest::cookie_fun::AgentDetails;
use crate::models::{Batch, ContentUnit};
use anyhow::{Context, Result};

const AGENT_SUMMARY_PURPOSE: &str = "Provide a concise summary of the following market and social media impact data in markdown format.";

const AGENT_SUMMARY_OUTPUT: &str = "Respond with nothing but the summary.";

/// Output instructions for tweet batches of a critique.
pub const CRITIQUE_OUTPUT_PROMPT: &str = "Analyze the tweets in a way that is useful for a professional in the field of AI and finance. Respond with nothing but the analysis.";

/// Objective for critiquing the agent behind `username`.
pub fn critique_objective(username: &str) -> String {
    format!(
        "Provide a detailed critical evaluation of the AI agent @{}, based on the tweets it has posted (see below). \n\n\
         Judge the quality of the agent's tweets, the consistency of its messages, and estimate the effort required for someone to launch a similar agent. \n\n\
         Does the agent do what it claims to do, does the agent's purpose warrant any investment? \n\n\
         State your confidence in your assessments and what more information you would need to make a more informed assessment. \n\n\
         Output as a markdown document, with sections for each topic.",
        username.trim().trim_start_matches('@')
    )
}

/// Template for the one-off market record summary.
pub fn agent_summary_template() -> RequestTemplate {
    RequestTemplate::new(AGENT_SUMMARY_PURPOSE).with_output_prompt(AGENT_SUMMARY_OUTPUT)
}

/// Summarize one agent record with a single evaluation.
pub async fn summarize_agent(
    evaluator: &BatchEvaluator,
    agent: &AgentDetails,
    estimator: &dyn CostEstimator,
) -> Result<String> {
    let text = serde_json::to_string_pretty(agent)
        .with_context(|| format!("Failed to serialize agent {}", agent.agent_name))?;
    let batch = Batch::new(
        0,
        vec![ContentUnit::record(format!("agent:{}", agent.agent_name), text, estimator)],
    );

    evaluator
        .evaluate(&batch)
        .await
        .result
        .map_err(|failure| anyhow::anyhow!("Failed to summarize agent data: {}", failure))
}

/// User-supplied context followed by the agent summary.
pub fn critique_context(user_context: Option<&str>, agent_summary: &str) -> String {
    match user_context.map(str::trim).filter(|c| !c.is_empty()) {
        Some(context) => format!("{}\n\n---\n\n{}", context, agent_summary.trim()),
        None => agent_summary.trim().to_string(),
    }
}
