//! cookie-analyst - hierarchical LLM analysis of cookie.fun market data
//!
//! A CLI tool that ingests AI agent market data and cached tweets, then
//! reduces them with a reasoning model into a single analysis report.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (connection, config, missing data, etc.)
//!   2 - The analysis run finished with status Failed

mod agent;
mod analysis;
mod cli;
mod config;
mod ingest;
mod models;
mod prompt_file;
mod report;
mod storage;

use agent::{ChatCompletionsBackend, RequestTemplate};
use analysis::chunker::chunk;
use analysis::critique::{self, CRITIQUE_OUTPUT_PROMPT};
use analysis::relevance::{self, RelevanceScreen};
use analysis::{BatchEvaluator, CharRatioEstimator, Reducer, RunRequest};
use anyhow::{Context, Result};
use chrono::Utc;
use cli::{Args, Command, OutputFormat, RunArgs};
use config::{Config, CONFIG_FILE};
use ingest::cookie_fun::{self, IngestOptions};
use ingest::tweets::{AI_FOCUS, MARKET_OVERVIEW_OBJECTIVE, SUMMARY_OUTPUT_PROMPT};
use ingest::{AgentDatasetProvider, CookieFunClient, DatasetProvider, DeltaInterval, TweetDatasetProvider};
use models::{Report, ReportMetadata, RunId, RunStatus};
use prompt_file::PromptFile;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::{FileLedger, IngestionStore, TweetStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Secrets may live in a local .env file
    dotenvy::dotenv().ok();

    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if matches!(args.command, Command::InitConfig) {
        return handle_init_config();
    }

    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    init_logging(args.log_level(config.general.verbose));

    info!("cookie-analyst v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .cookie-analyst.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!("⚠️  {} already exists. Remove it first or edit it manually.", CONFIG_FILE);
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to customize the model, budget, concurrency and ingestion.");
    Ok(())
}

/// Initialize logging at the given level.
fn init_logging(level: tracing::Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Dispatch a command. Returns the exit code.
async fn run(args: Args, mut config: Config) -> Result<i32> {
    match args.command.clone() {
        Command::Ingest { delta_interval } => {
            let interval = delta_interval.unwrap_or(config.ingest.delta_interval);
            handle_ingest(&config, interval, !args.quiet).await
        }
        Command::Analyze {
            prompt_file,
            run_id,
            context_path,
            run,
        } => {
            config.merge_with_run_args(&run);
            handle_analyze(&config, &prompt_file, run_id, context_path.as_deref(), &run).await
        }
        Command::SummarizeTweets {
            usernames,
            count,
            focus_ai,
            keep_all,
            run,
        } => {
            config.merge_with_run_args(&run);
            handle_summarize_tweets(&config, &usernames, count, focus_ai, keep_all, &run).await
        }
        Command::AnalyzeAgentTweets {
            username,
            context_path,
            count,
            run,
        } => {
            config.merge_with_run_args(&run);
            handle_analyze_agent_tweets(&config, &username, context_path.as_deref(), count, &run).await
        }
        Command::ImportTweets { username, file } => {
            handle_import_tweets(&config, &username, &file).await
        }
        Command::Runs => handle_runs(&config).await,
        Command::Show { run_id } => handle_show(&config, &run_id).await,
        Command::InitConfig => handle_init_config().map(|_| 0),
    }
}

/// Load configuration from file or use defaults.
///
/// Runs before logging is set up, so problems go straight to stderr.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        return Config::load(config_path);
    }

    match Config::load_default() {
        Ok(Some(config)) => Ok(config),
        Ok(None) => Ok(Config::default()),
        Err(e) => {
            eprintln!("⚠️  Failed to load {}: {:#}. Using defaults.", CONFIG_FILE, e);
            Ok(Config::default())
        }
    }
}

/// HTTP backend for the configured model. Fails early when no API key is set.
fn build_backend(config: &Config) -> Result<Arc<ChatCompletionsBackend>> {
    config.require_model_key()?;
    Ok(Arc::new(ChatCompletionsBackend::new(config.backend_config())?))
}

fn read_context(path: Option<&Path>) -> Result<Option<String>> {
    path.map(|path| {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read context file: {}", path.display()))
    })
    .transpose()
}

async fn handle_ingest(config: &Config, interval: DeltaInterval, show_progress: bool) -> Result<i32> {
    let api_key = std::env::var(&config.ingest.api_key_env)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .with_context(|| format!("{} is not set", config.ingest.api_key_env))?;

    let client = CookieFunClient::new(
        &config.ingest.api_url,
        api_key,
        Duration::from_secs(config.model.timeout_seconds),
    )?;
    let store = IngestionStore::new(&config.general.storage_dir);
    let options = IngestOptions {
        page_size: config.ingest.page_size,
        max_pages: config.ingest.max_pages,
        page_delay: Duration::from_millis(config.ingest.page_delay_ms),
        interval,
        show_progress,
    };

    println!("📥 Ingesting cookie.fun agents ({})", interval);
    let run = cookie_fun::ingest(&client, &store, &options).await?;

    for record in &run.agents {
        let agent = &record.data;
        println!("- Name: {}", agent.agent_name);
        println!("  Price: ${}", format_amount(agent.price, 4));
        println!("  Market Cap: ${}", format_amount(agent.market_cap, 0));
        println!("  Twitter: @{}", agent.twitter_handle().unwrap_or("-"));
    }
    println!(
        "\n✅ Ingestion run {} stored {} agents.",
        run.id,
        run.agents.len()
    );
    Ok(0)
}

async fn handle_analyze(
    config: &Config,
    prompt_path: &Path,
    run_id: Option<u64>,
    context_path: Option<&Path>,
    run: &RunArgs,
) -> Result<i32> {
    let prompt = PromptFile::load(prompt_path)?;
    let store = IngestionStore::new(&config.general.storage_dir);
    let provider = AgentDatasetProvider::open(&store, run_id, prompt.filter()).await?;

    let context = read_context(context_path)?;

    let mut template = RequestTemplate::new(prompt.prompt()).with_context(context);
    if let Some(note) = provider.data_note() {
        template = template.with_data_note(note);
    }

    run_reduction(
        config,
        &provider,
        template,
        prompt.analysis_key(),
        prompt.filter().name(),
        run,
    )
    .await
}

async fn handle_summarize_tweets(
    config: &Config,
    usernames: &[String],
    count: usize,
    focus_ai: bool,
    keep_all: bool,
    run: &RunArgs,
) -> Result<i32> {
    let store = TweetStore::new(&config.general.storage_dir);
    let mut provider = TweetDatasetProvider::open(&store, usernames, count).await?;

    let mut objective = MARKET_OVERVIEW_OBJECTIVE.to_string();
    if focus_ai {
        objective.push_str(AI_FOCUS);
    }

    if keep_all || run.dry_run {
        debug!("Skipping relevance screening");
    } else {
        provider = screen_tweets(config, provider, &objective, run).await?;
    }
    println!("🐦 Summarizing {} tweets…", provider.len());

    let digest = hex::encode(Sha256::digest(objective.as_bytes()));
    let analysis_key = format!("tweets:{}", &digest[..6]);

    let template = RequestTemplate::new(objective).with_output_prompt(SUMMARY_OUTPUT_PROMPT);
    run_reduction(config, &provider, template, analysis_key, "tweets", run).await
}

/// Drop the tweets the model judges irrelevant to `objective`.
async fn screen_tweets(
    config: &Config,
    provider: TweetDatasetProvider,
    objective: &str,
    run: &RunArgs,
) -> Result<TweetDatasetProvider> {
    println!("🧹 Filtering {} tweets…", provider.len());

    // Ids are rendered so the model can name the tweets to drop.
    let provider = provider.with_ids(true);
    let estimator = CharRatioEstimator::new(config.reduction.chars_per_token);
    let units = provider.load(&estimator).await?;

    let evaluator = BatchEvaluator::new(
        build_backend(config)?,
        relevance::screening_template(objective),
        config.retry_config(),
    )
    .with_cache(
        Arc::new(FileLedger::new(&config.general.storage_dir)),
        !run.ignore_cached,
    );
    let screen = RelevanceScreen::new(
        evaluator,
        config.reduction.budget_tokens,
        config.reduction.concurrency,
    );
    let screening = screen.screen(&units).await?;
    if screening.unanswered > 0 {
        warn!(
            "{} of {} screening batch(es) gave no usable answer; their tweets were kept",
            screening.unanswered, screening.batches
        );
    }

    let mut provider = provider.with_ids(false);
    let dropped = provider.discard(&screening.discarded);
    println!(
        "   Dropped {} irrelevant tweet(s) in {} backend call(s)",
        dropped,
        screen.calls()
    );
    if provider.is_empty() {
        warn!("Every tweet was judged irrelevant to the objective");
    }
    Ok(provider)
}

async fn handle_analyze_agent_tweets(
    config: &Config,
    username: &str,
    context_path: Option<&Path>,
    count: usize,
    run: &RunArgs,
) -> Result<i32> {
    let handle = username.trim().trim_start_matches('@');
    let tweets = TweetStore::new(&config.general.storage_dir);
    let provider = TweetDatasetProvider::open(&tweets, &[handle.to_string()], count).await?;

    let ingestion = IngestionStore::new(&config.general.storage_dir);
    let (ingestion_run, record) = ingestion
        .find_by_twitter_handle(handle)
        .await?
        .with_context(|| format!("No agent with twitter handle @{} in any ingestion run", handle))?;
    let user_context = read_context(context_path)?;

    let summary = if run.dry_run {
        format!("Market data of {} (ingestion run {})", record.agent_name, ingestion_run)
    } else {
        println!(
            "🍪 Summarizing market data of {} (ingestion run {})…",
            record.agent_name, ingestion_run
        );
        let evaluator = BatchEvaluator::new(
            build_backend(config)?,
            critique::agent_summary_template(),
            config.retry_config(),
        )
        .with_cache(
            Arc::new(FileLedger::new(&config.general.storage_dir)),
            !run.ignore_cached,
        );
        let estimator = CharRatioEstimator::new(config.reduction.chars_per_token);
        critique::summarize_agent(&evaluator, &record.data, &estimator).await?
    };

    let template = RequestTemplate::new(critique::critique_objective(handle))
        .with_output_prompt(CRITIQUE_OUTPUT_PROMPT)
        .with_context(Some(critique::critique_context(user_context.as_deref(), &summary)));

    println!("🐦 Analyzing {} tweets of @{}…", provider.len(), handle);
    let analysis_key = format!("agent_tweets:{}", handle.to_lowercase());
    run_reduction(config, &provider, template, analysis_key, "agent_tweets", run).await
}

/// Reduce a dataset to one report. Returns 2 when the run failed.
async fn run_reduction(
    config: &Config,
    provider: &dyn DatasetProvider,
    template: RequestTemplate,
    analysis_key: String,
    filter_name: &str,
    run: &RunArgs,
) -> Result<i32> {
    let start_time = Instant::now();
    let estimator = Arc::new(CharRatioEstimator::new(config.reduction.chars_per_token));
    let units = provider.load(estimator.as_ref()).await?;
    let dataset = provider.describe();
    let reduction = config.reduction_config();

    println!("📊 Dataset: {} ({} units)", dataset, units.len());

    if run.dry_run {
        return handle_dry_run(&units, reduction.budget);
    }

    let backend = build_backend(config)?;

    println!("🤖 Model: {} via {}", config.model.name, config.model.api_url);
    println!(
        "   Budget: {} tokens/batch (~{} chars/token) | Concurrency: {} | Policy: {}",
        reduction.budget,
        estimator.chars_per_token(),
        reduction.concurrency,
        reduction.failure_policy
    );

    let ledger = Arc::new(FileLedger::new(&config.general.storage_dir));
    let evaluator = BatchEvaluator::new(backend, template, config.retry_config())
        .with_cache(ledger.clone(), !run.ignore_cached);
    let reducer = Reducer::new(evaluator, ledger, estimator, reduction);

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current round");
            watcher.cancel();
        }
    });

    let run_id = RunId::generate();
    let unit_count = units.len();
    println!("\n🔬 Running analysis {} ({})…", analysis_key, run_id);

    let result = reducer
        .run_analysis(
            RunRequest {
                run_id: run_id.clone(),
                analysis_key: analysis_key.clone(),
                filter_name: filter_name.to_string(),
                dataset: dataset.clone(),
                units,
            },
            &cancel,
        )
        .await?;

    let report = Report {
        metadata: ReportMetadata {
            run_id,
            analysis_key,
            dataset,
            model_used: config.model.name.clone(),
            units: unit_count,
            analysis_date: Utc::now(),
            duration_seconds: start_time.elapsed().as_secs_f64(),
        },
        result,
    };

    report::write_report(&report, &run.output, run.format == OutputFormat::Json)
        .with_context(|| format!("Failed to write report to {}", run.output.display()))?;

    let result = &report.result;
    println!("\n📊 Analysis Summary:");
    println!("   Rounds: {}", result.rounds.len());
    println!("   Batches: {}", result.total_batches());
    println!("   Backend calls: {}", result.backend_calls);
    println!(
        "   Duration: {:.1}s",
        report.metadata.duration_seconds
    );

    match report.result.clone().into_artifact() {
        Ok(_) => {
            println!("\n✅ Analysis complete! Report saved to: {}", run.output.display());
            Ok(0)
        }
        Err(e) => {
            eprintln!(
                "\n⛔ Analysis failed: {}. Details saved to: {}",
                e,
                run.output.display()
            );
            Ok(2)
        }
    }
}

/// Print the first round's partition without calling the model.
fn handle_dry_run(units: &[models::ContentUnit], budget: usize) -> Result<i32> {
    println!("\n🔍 Dry run: partitioning units (no model calls)...\n");

    let batches = chunk(units, budget)?;
    if batches.is_empty() {
        println!("   No units to analyze.");
    }
    for batch in &batches {
        println!(
            "     📦 Batch {}: {} units, ~{} tokens",
            batch.index(),
            batch.len(),
            batch.cost()
        );
    }
    println!("\n   Total: {} batches for round 0", batches.len());
    println!("\n✅ Dry run complete. No model calls were made.");
    Ok(0)
}

async fn handle_import_tweets(config: &Config, username: &str, file: &Path) -> Result<i32> {
    let tweets = storage::tweets::read_tweet_file(file).await?;
    let store = TweetStore::new(&config.general.storage_dir);
    let summary = store.import(username, tweets).await?;
    println!(
        "✅ Imported tweets for @{}: {} new, {} updated, {} cached.",
        username.trim_start_matches('@'),
        summary.added,
        summary.updated,
        summary.total
    );
    Ok(0)
}

async fn handle_runs(config: &Config) -> Result<i32> {
    let ledger = FileLedger::new(&config.general.storage_dir);
    let runs = ledger.list_runs().await?;

    if runs.is_empty() {
        println!("No analysis runs recorded yet.");
        return Ok(0);
    }

    for run in runs {
        println!(
            "{} {}  {}  {}  {} units, {} round(s)  {}",
            run.status.emoji(),
            run.run_id,
            run.created_at.format("%Y-%m-%d %H:%M"),
            run.analysis_key,
            run.unit_count,
            run.rounds.len(),
            run.dataset
        );
    }
    Ok(0)
}

async fn handle_show(config: &Config, run_id: &str) -> Result<i32> {
    let ledger = FileLedger::new(&config.general.storage_dir);
    let run_id = RunId::from(run_id);
    let run = ledger.load_run(&run_id).await?;

    println!("Run:      {}", run.run_id);
    println!("Analysis: {}", run.analysis_key);
    println!("Status:   {} {}", run.status.emoji(), run.status);
    println!("Model:    {}", run.model);
    println!("Dataset:  {}", run.dataset);
    println!("Units:    {}", run.unit_count);
    for round in &run.rounds {
        println!(
            "  round {}: {} units, {} batches, {} failed, {} cached",
            round.round, round.units, round.batches, round.failed, round.cached
        );
    }
    match ledger.load_dataset(&run_id).await {
        Ok(units) => println!("Snapshot: {} units recorded", units.len()),
        Err(e) => debug!("No dataset snapshot for {}: {}", run_id, e),
    }
    if let Some(ref reason) = run.failure_reason {
        println!("Failure:  {}", reason);
    }

    match run.status {
        RunStatus::Completed => {
            let artifact = ledger.load_artifact(&run_id).await?;
            println!("\n{}", artifact);
        }
        RunStatus::Failed => {
            let rounds = ledger.load_rounds(&run_id).await?;
            if let Some(last) = rounds.last() {
                let succeeded = last.outcomes.iter().filter(|o| o.is_success()).count();
                println!(
                    "\nRound {}: {} of {} batch(es) succeeded",
                    last.round,
                    succeeded,
                    last.outcomes.len()
                );
                for failure in last.outcomes.iter().filter_map(|o| o.result.as_ref().err()) {
                    println!("  ❌ {}", failure);
                }
            }
        }
        RunStatus::Running => {}
    }
    Ok(0)
}

/// Format a number with thousands separators and fixed decimals.
fn format_amount(value: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };

    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    let sign = if value < 0.0 { "-" } else { "" };
    match frac_part {
        Some(frac) => format!("{}{}.{}", sign, grouped, frac),
        None => format!("{}{}", sign, grouped),
    }
}
