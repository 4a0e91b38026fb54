//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::ingest::cookie_fun::DeltaInterval;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// cookie-analyst - hierarchical LLM analysis of cookie.fun market data
///
/// Ingest AI agent market data, then analyze it with a reasoning model
/// by reducing batches of records into one report.
///
/// Examples:
///   cookie-analyst ingest --delta-interval _7Days
///   cookie-analyst analyze prompts/small_caps.md --context-path notes.md
///   cookie-analyst analyze prompts/leaders.md --dry-run
///   cookie-analyst import-tweets aixbt_agent tweets.json
///   cookie-analyst summarize-tweets aixbt_agent vaderai --focus-ai
///   cookie-analyst analyze-agent-tweets aixbt_agent --context notes.md
///   cookie-analyst init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .cookie-analyst.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Storage directory (overrides config)
    #[arg(long, value_name = "DIR", global = true, env = "COOKIE_ANALYST_STORAGE")]
    pub storage_dir: Option<PathBuf>,

    /// Reasoning model (overrides config)
    #[arg(short, long, global = true, env = "COOKIE_ANALYST_MODEL")]
    pub model: Option<String>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Ingest agent market data from cookie.fun
    Ingest {
        /// Interval the delta values are computed over
        #[arg(long, value_name = "INTERVAL")]
        delta_interval: Option<DeltaInterval>,
    },

    /// Analyze an ingestion run with a prompt file
    Analyze {
        /// Prompt file, optionally with YAML frontmatter selecting a filter
        prompt_file: PathBuf,

        /// Ingestion run to analyze (default: latest)
        #[arg(long, value_name = "ID")]
        run_id: Option<u64>,

        /// File with additional context for the analysis
        #[arg(long, value_name = "FILE")]
        context_path: Option<PathBuf>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Summarize cached tweets of one or more accounts
    SummarizeTweets {
        /// Twitter usernames
        #[arg(required = true)]
        usernames: Vec<String>,

        /// Newest tweets per account
        #[arg(long, default_value = "200", value_name = "COUNT")]
        count: usize,

        /// Focus on AI in web3
        #[arg(long)]
        focus_ai: bool,

        /// Skip the pass that drops tweets irrelevant to the objective
        #[arg(long)]
        keep_all: bool,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Critique one AI agent's tweets, using its latest market record as context
    AnalyzeAgentTweets {
        /// Twitter username of the agent
        username: String,

        /// File with additional context for the analysis
        #[arg(long = "context", value_name = "FILE")]
        context_path: Option<PathBuf>,

        /// Newest tweets to analyze
        #[arg(long, default_value = "20", value_name = "COUNT")]
        count: usize,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Import a JSON array of tweets into the local cache
    ImportTweets {
        username: String,
        file: PathBuf,
    },

    /// List recorded analysis runs
    Runs,

    /// Show one recorded analysis run
    Show {
        run_id: String,
    },

    /// Generate a default .cookie-analyst.toml configuration file
    InitConfig,
}

/// Flags shared by the commands that run a reduction.
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Maximum estimated tokens per batch
    #[arg(long, value_name = "TOKENS")]
    pub budget: Option<usize>,

    /// Batches evaluated at the same time
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Replace failed batches with a marked placeholder instead of aborting
    #[arg(long)]
    pub best_effort: bool,

    /// Do not reuse cached batch results
    #[arg(long)]
    pub ignore_cached: bool,

    /// Dry run: print the first round's batches without calling the model
    #[arg(long)]
    pub dry_run: bool,

    /// Output file path for the report
    #[arg(short, long, default_value = "analysis_report.md", value_name = "FILE")]
    pub output: PathBuf,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        match &self.command {
            Command::Analyze {
                prompt_file, run, ..
            } => {
                if !prompt_file.is_file() {
                    return Err(format!("Prompt file does not exist: {}", prompt_file.display()));
                }
                run.validate()
            }
            Command::SummarizeTweets { count, run, .. } => {
                if *count == 0 {
                    return Err("Count must be at least 1".to_string());
                }
                run.validate()
            }
            Command::AnalyzeAgentTweets {
                context_path,
                count,
                run,
                ..
            } => {
                if *count == 0 {
                    return Err("Count must be at least 1".to_string());
                }
                if let Some(path) = context_path {
                    if !path.is_file() {
                        return Err(format!("Context file does not exist: {}", path.display()));
                    }
                }
                run.validate()
            }
            Command::ImportTweets { file, .. } => {
                if !file.is_file() {
                    return Err(format!("Tweet file does not exist: {}", file.display()));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Returns the log level based on verbosity settings.
    ///
    /// `config_verbose` is the config file's `general.verbose`; `--quiet` wins over both.
    pub fn log_level(&self, config_verbose: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || config_verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

impl RunArgs {
    fn validate(&self) -> Result<(), String> {
        if self.budget == Some(0) {
            return Err("Budget must be at least 1 token".to_string());
        }
        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}
