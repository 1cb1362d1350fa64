#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;

use storyforge::brief::IdeaBrief;
use storyforge::bundle::write_bundle;
use storyforge::cache::SqliteJudgementCache;
use storyforge::config::Config;
use storyforge::error::{CancelFlag, EngineError};
use storyforge::gateway::{EmbeddingGateway, ProviderGateway};
use storyforge::index::VectorIndex;
use storyforge::kg::KgStore;
use storyforge::novelty::NoveltyChecker;
use storyforge::pipeline::{Pipeline, PipelineResult};
use storyforge::recall::RecallEngine;
use storyforge::refine::{IdeaFusionEngine, StoryReflector};
use storyforge::review::{
    nodes_paper_hash, AnchoredCritic, BlindJudge, CoachReviewer, ReviewIndex, TauTable,
};
use storyforge::runlog::{RunLogUsageSink, RunLogger};
use storyforge::selector::PatternSelector;
use storyforge::story::StoryGenerator;

#[derive(Parser)]
#[command(name = "storyforge", version, about = "Idea-to-story generation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for one idea and write the results bundle
    Run {
        /// The research idea, as free text
        idea: String,

        /// JSON config file (overrides STORYFORGE_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Optional structured idea brief (JSON)
        #[arg(long)]
        brief: Option<PathBuf>,

        /// Chat model for generation/refinement (default: STORYFORGE_MODEL)
        #[arg(long)]
        model: Option<String>,

        /// Model for blind judging (defaults to --model)
        #[arg(long)]
        judge_model: Option<String>,

        /// Embedding model (default: STORYFORGE_EMBED_MODEL)
        #[arg(long)]
        embed_model: Option<String>,

        /// SQLite cache for blind judgements
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Disable the structured run log
        #[arg(long)]
        no_log: bool,
    },
    /// Validate the τ calibration table against the current engine pins
    TauCheck {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Judge model the pins are checked against
        #[arg(long)]
        judge_model: String,
    },
    /// Prune old rows from the judgement cache
    CachePrune {
        #[arg(long)]
        db: PathBuf,

        #[arg(long, default_value_t = 90)]
        max_age_days: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            idea,
            config,
            brief,
            model,
            judge_model,
            embed_model,
            cache,
            no_log,
        } => {
            run_command(
                idea,
                config,
                brief,
                model,
                judge_model,
                embed_model,
                cache,
                no_log,
            )
            .await
        }
        Commands::TauCheck {
            config,
            judge_model,
        } => tau_check_command(config, judge_model),
        Commands::CachePrune { db, max_age_days } => cache_prune_command(db, max_age_days).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    idea: String,
    config: Option<PathBuf>,
    brief: Option<PathBuf>,
    model: Option<String>,
    judge_model: Option<String>,
    embed_model: Option<String>,
    cache: Option<PathBuf>,
    no_log: bool,
) -> ExitCode {
    let cfg = match Config::load(config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("storyforge: {err}");
            return ExitCode::from(2);
        }
    };

    let idea = idea.trim().to_string();
    if idea.is_empty() {
        eprintln!("storyforge: idea text must not be empty");
        return ExitCode::from(2);
    }

    let idea_brief = match brief {
        Some(path) => match load_brief(&path) {
            Ok(brief) => Some(brief),
            Err(err) => {
                eprintln!("storyforge: failed to load brief: {err}");
                return ExitCode::from(2);
            }
        },
        None => None,
    };

    let chat_model = model
        .or_else(|| std::env::var("STORYFORGE_MODEL").ok())
        .unwrap_or_else(|| "glm-4-plus".to_string());
    let judge_model = judge_model.unwrap_or_else(|| chat_model.clone());
    let embed_model = embed_model
        .or_else(|| std::env::var("STORYFORGE_EMBED_MODEL").ok())
        .unwrap_or_else(|| "text-embedding-3-small".to_string());

    let run_id = format!("run_{}", uuid::Uuid::new_v4().simple());

    // Run logger first so gateway usage lands in it from the start.
    let (logger, log_worker) = if no_log {
        (None, None)
    } else {
        match RunLogger::new(
            &cfg.log_dir,
            &run_id,
            json!({
                "idea": idea,
                "chat_model": chat_model,
                "judge_model": judge_model,
                "embed_model": embed_model,
            }),
            cfg.log_max_text_chars,
        ) {
            Ok((logger, worker)) => (Some(logger), Some(worker)),
            Err(err) => {
                eprintln!("storyforge: run logging disabled: {err}");
                (None, None)
            }
        }
    };

    let outcome = run_pipeline(
        &cfg,
        idea,
        idea_brief,
        chat_model,
        judge_model,
        embed_model,
        cache.or_else(|| cfg.cache_path.clone()),
        logger.clone(),
        run_id.clone(),
    )
    .await;

    // Flush the run log before bundling it.
    drop(logger);
    let run_log_dir = match log_worker {
        Some(worker) => {
            let dir = worker.run_dir.clone();
            if let Err(err) = worker.join() {
                eprintln!("storyforge: log flush failed: {err}");
            }
            Some(dir)
        }
        None => None,
    };

    match outcome {
        Ok(result) => {
            match write_bundle(&cfg.results_dir, &result, run_log_dir.as_deref()) {
                Ok(dir) => eprintln!("storyforge: results written to {}", dir.display()),
                Err(err) => eprintln!("storyforge: failed to write results: {err}"),
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("storyforge: {err}");
            // Leave a structured failure record behind.
            let failure = PipelineResult {
                run_id: run_id.clone(),
                success: false,
                reason: Some("fatal_error".to_string()),
                final_story: None,
                final_story_source: None,
                iterations: 0,
                pivots: 0,
                selected_patterns: Default::default(),
                review_history: vec![],
                refinement_history: vec![],
                recall_audit: Default::default(),
                verification: None,
                novelty_report: None,
                error: Some(err.to_string()),
            };
            if let Err(bundle_err) = write_bundle(&cfg.results_dir, &failure, run_log_dir.as_deref())
            {
                eprintln!("storyforge: failed to write failure record: {bundle_err}");
            }
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    cfg: &Config,
    idea: String,
    idea_brief: Option<IdeaBrief>,
    chat_model: String,
    judge_model: String,
    embed_model: String,
    cache_path: Option<PathBuf>,
    logger: Option<RunLogger>,
    run_id: String,
) -> Result<PipelineResult, EngineError> {
    // τ pins are checked before anything talks to an LLM.
    let corpus_hash = nodes_paper_hash(&cfg.output_dir)?;
    let tau = TauTable::load(cfg, &judge_model, &corpus_hash)?;

    let kg = Arc::new(
        KgStore::load(&cfg.output_dir)
            .map_err(|e| EngineError::Config(storyforge::config::ConfigError::message(e.to_string())))?,
    );
    eprintln!(
        "[startup] KG loaded: {} ideas, {} patterns, {} domains, {} papers",
        kg.ideas().len(),
        kg.patterns().len(),
        kg.domains().len(),
        kg.papers().len()
    );

    let usage_sink: Arc<dyn storyforge::gateway::UsageSink> = match &logger {
        Some(logger) => Arc::new(RunLogUsageSink::new(logger.clone())),
        None => Arc::new(storyforge::gateway::NoopUsageSink),
    };
    let adapter = storyforge::gateway::openai::OpenAiCompatAdapter::from_env()?;
    let gateway = Arc::new(ProviderGateway::with_config(
        adapter,
        embed_model,
        usage_sink,
        storyforge::gateway::GatewayConfig {
            max_retries: cfg.max_retries,
            retry_base_delay: std::time::Duration::from_secs(1),
            embed_sleep: std::time::Duration::from_secs_f64(cfg.embed_sleep_sec.max(0.0)),
            embed_max_retries: cfg.embed_max_retries,
            embed_batch_size: cfg.embed_batch_size,
        },
    ));

    let profile = gateway.model_profile();

    let idea_items = || {
        kg.ideas()
            .iter()
            .map(|i| (i.idea_id.clone(), i.description.clone()))
            .collect::<Vec<_>>()
    };
    let paper_items = || {
        kg.papers()
            .iter()
            .map(|p| (p.paper_id.clone(), p.title.clone()))
            .collect::<Vec<_>>()
    };
    let novelty_items = || {
        kg.papers()
            .iter()
            .map(|p| {
                let text = match &p.abstract_text {
                    Some(abs) => format!("{}. {abs}", p.title),
                    None => p.title.clone(),
                };
                (p.paper_id.clone(), text)
            })
            .collect::<Vec<_>>()
    };

    let idea_index = load_index(
        &cfg.index_dir("recall", &profile).join("ideas"),
        cfg.index_allow_build,
        idea_items,
        gateway.as_ref(),
        "idea",
        &run_id,
    )
    .await;
    let paper_index = load_index(
        &cfg.index_dir("recall", &profile).join("papers"),
        cfg.index_allow_build,
        paper_items,
        gateway.as_ref(),
        "paper",
        &run_id,
    )
    .await;
    let novelty_index = load_index(
        &cfg.index_dir("novelty", &profile),
        cfg.index_allow_build,
        novelty_items,
        gateway.as_ref(),
        "novelty",
        &run_id,
    )
    .await;

    let judgement_cache: Option<Arc<dyn storyforge::cache::JudgementCache>> = match cache_path {
        Some(path) => match SqliteJudgementCache::new(&path) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(err) => {
                eprintln!("[startup] judgement cache unavailable ({err}); judging live");
                None
            }
        },
        None => None,
    };

    // Cooperative cancellation: ctrl-c sets the flag; no new external call
    // starts afterwards.
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("storyforge: cancellation requested");
                cancel.cancel();
            }
        });
    }

    let review_index = Arc::new(ReviewIndex::build(&kg));
    let chat: Arc<dyn storyforge::gateway::ChatGateway> = gateway.clone();

    let pipeline = Pipeline {
        kg: kg.clone(),
        recall: RecallEngine::new(kg.clone(), idea_index, paper_index),
        selector: PatternSelector::new(chat.clone(), &chat_model, &idea, idea_brief.clone()),
        generator: StoryGenerator::new(chat.clone(), &chat_model, &idea, idea_brief),
        critic: AnchoredCritic::new(
            kg.clone(),
            review_index,
            BlindJudge::new(chat.clone(), &judge_model, judgement_cache),
            CoachReviewer::new(chat.clone(), &chat_model),
            tau,
        ),
        fusion: IdeaFusionEngine::new(chat.clone(), &chat_model),
        reflector: StoryReflector::new(chat.clone(), &chat_model),
        novelty: NoveltyChecker::new(kg.clone(), novelty_index),
        embedder: gateway,
        logger,
        cancel,
        run_id,
        user_idea: idea,
    };

    pipeline.run(cfg).await
}

async fn load_index(
    dir: &std::path::Path,
    allow_build: bool,
    items: impl FnOnce() -> Vec<(String, String)>,
    gateway: &dyn EmbeddingGateway,
    corpus: &'static str,
    run_id: &str,
) -> Option<Arc<VectorIndex>> {
    let attribution = storyforge::gateway::Attribution::new("index::build").with_run(run_id);
    match VectorIndex::load_or_build(dir, allow_build, items, gateway, attribution).await {
        Ok(index) => {
            eprintln!("[startup] {corpus} index ready: {} vectors", index.len());
            Some(Arc::new(index))
        }
        Err(err) => {
            eprintln!("[startup] {corpus} index unavailable ({err}); lexical fallback");
            None
        }
    }
}

fn load_brief(path: &std::path::Path) -> Result<IdeaBrief, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&raw).map_err(|e| e.to_string())
}

fn tau_check_command(config: Option<PathBuf>, judge_model: String) -> ExitCode {
    let cfg = match Config::load(config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("storyforge: {err}");
            return ExitCode::from(2);
        }
    };
    let hash = match nodes_paper_hash(&cfg.output_dir) {
        Ok(hash) => hash,
        Err(err) => {
            eprintln!("storyforge: {err}");
            return ExitCode::from(2);
        }
    };
    match TauTable::load(&cfg, &judge_model, &hash) {
        Ok(table) => {
            println!(
                "tau ok ({:?}): methodology={:.3} novelty={:.3} storyteller={:.3}",
                table.source, table.tau_methodology, table.tau_novelty, table.tau_storyteller
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("storyforge: {err}");
            ExitCode::from(2)
        }
    }
}

async fn cache_prune_command(db: PathBuf, max_age_days: u64) -> ExitCode {
    let cache = match SqliteJudgementCache::new(&db) {
        Ok(cache) => cache,
        Err(err) => {
            eprintln!("storyforge: {err}");
            return ExitCode::from(2);
        }
    };
    let _lock = match cache.lock_exclusive() {
        Ok(lock) => lock,
        Err(err) => {
            eprintln!("storyforge: failed to lock cache: {err}");
            return ExitCode::from(3);
        }
    };
    match cache.prune(max_age_days).await {
        Ok(stats) => {
            println!("pruned {} rows, {} remaining", stats.deleted, stats.remaining);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("storyforge: {err}");
            ExitCode::from(3)
        }
    }
}
