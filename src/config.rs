//! Engine configuration.
//!
//! A single immutable [`Config`] is resolved at startup and shared read-only
//! for the rest of the process. Precedence: process environment
//! (`STORYFORGE_*`) > JSON config file > built-in defaults. Resolution is a
//! pure function over a snapshot of both sources, so tests can exercise it
//! without touching the real environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

/// Environment variable prefix for every recognized key.
pub const ENV_PREFIX: &str = "STORYFORGE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    FileParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }
}

/// What to do when the novelty check reports a collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoveltyAction {
    ReportOnly,
    Pivot,
    Fail,
}

impl NoveltyAction {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_lowercase().as_str() {
            "report_only" => Ok(Self::ReportOnly),
            "pivot" => Ok(Self::Pivot),
            "fail" => Ok(Self::Fail),
            other => Err(format!(
                "expected report_only|pivot|fail, got {other:?}"
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReportOnly => "report_only",
            Self::Pivot => "pivot",
            Self::Fail => "fail",
        }
    }
}

/// How vector index directories are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexDirMode {
    /// The caller passes explicit directories.
    Manual,
    /// Directories derive from the embedding model profile:
    /// `output/<corpus>_index__<profile>/`.
    AutoProfile,
}

impl IndexDirMode {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "auto_profile" => Ok(Self::AutoProfile),
            other => Err(format!("expected manual|auto_profile, got {other:?}")),
        }
    }
}

/// Resolved engine configuration. Construct via [`Config::load`] or
/// [`Config::resolve`]; never mutated after startup.
#[derive(Debug, Clone)]
pub struct Config {
    // -- Recall ---------------------------------------------------------------
    pub recall_idea_weight: f64,
    pub recall_domain_weight: f64,
    pub recall_paper_weight: f64,
    /// Min-max normalize per-path scores before weighting. The source system
    /// is inconsistent about this; we default on and keep it switchable.
    pub recall_normalize: bool,
    pub final_top_k: usize,
    pub coarse_recall_size: usize,
    pub fine_recall_size: usize,
    pub recall_top_domains: usize,
    pub recall_subdomain_boost: f64,

    // -- Selector -------------------------------------------------------------
    pub pattern_select_topn: usize,

    // -- Sampling temperatures ------------------------------------------------
    pub story_temperature: f32,
    pub critic_temperature: f32,
    pub coach_temperature: f32,
    pub fusion_temperature: f32,

    // -- JSON discipline ------------------------------------------------------
    pub critic_strict_json: bool,
    pub json_retries: u32,

    // -- Anchors / critic -----------------------------------------------------
    pub anchor_quantiles: Vec<f64>,
    pub anchor_max_initial: usize,
    pub anchor_max_total: usize,
    pub anchor_max_exemplars: usize,
    pub densify_enable: bool,
    pub densify_loss_threshold: f64,
    pub densify_min_avg_conf: f64,
    pub bucket_size: f64,
    pub bucket_count: usize,

    // -- Score inference ------------------------------------------------------
    pub tau_methodology: f64,
    pub tau_novelty: f64,
    pub tau_storyteller: f64,
    pub tau_default: f64,
    pub tau_path: PathBuf,
    pub grid_step: f64,

    // -- Pass rule ------------------------------------------------------------
    pub pass_min_pattern_papers: usize,
    pub pass_score: f64,

    // -- Refinement -----------------------------------------------------------
    pub max_refine_iterations: u32,
    pub novelty_mode_max_patterns: usize,
    pub fusion_quality_threshold: f64,
    pub degradation_threshold: f64,

    // -- Novelty / verification -----------------------------------------------
    pub novelty_enable: bool,
    pub novelty_action: NoveltyAction,
    pub novelty_require_embedding: bool,
    pub novelty_top_k: usize,
    pub max_pivots: u32,
    pub collision_threshold: f64,

    // -- Indexes --------------------------------------------------------------
    pub index_dir_mode: IndexDirMode,
    pub index_allow_build: bool,

    // -- Gateways -------------------------------------------------------------
    pub embed_batch_size: usize,
    pub embed_sleep_sec: f64,
    pub embed_max_retries: u32,
    pub max_retries: u32,
    pub llm_timeout_sec: u64,

    // -- Paths / logging ------------------------------------------------------
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub results_dir: PathBuf,
    pub log_max_text_chars: usize,
    pub cache_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recall_idea_weight: 0.4,
            recall_domain_weight: 0.2,
            recall_paper_weight: 0.4,
            recall_normalize: true,
            final_top_k: 10,
            coarse_recall_size: 100,
            fine_recall_size: 10,
            recall_top_domains: 5,
            recall_subdomain_boost: 0.3,
            pattern_select_topn: 20,
            story_temperature: 0.7,
            critic_temperature: 0.2,
            coach_temperature: 0.3,
            fusion_temperature: 0.6,
            critic_strict_json: true,
            json_retries: 2,
            anchor_quantiles: vec![0.05, 0.15, 0.25, 0.5, 0.75, 0.85, 0.95],
            anchor_max_initial: 11,
            anchor_max_total: 14,
            anchor_max_exemplars: 2,
            densify_enable: true,
            densify_loss_threshold: 0.03,
            densify_min_avg_conf: 0.45,
            bucket_size: 1.0,
            bucket_count: 3,
            tau_methodology: 1.0,
            tau_novelty: 1.0,
            tau_storyteller: 1.0,
            tau_default: 1.0,
            tau_path: PathBuf::from("output/judge_tau.json"),
            grid_step: 0.01,
            pass_min_pattern_papers: 20,
            pass_score: 7.0,
            max_refine_iterations: 3,
            novelty_mode_max_patterns: 10,
            fusion_quality_threshold: 0.65,
            degradation_threshold: 0.1,
            novelty_enable: true,
            novelty_action: NoveltyAction::ReportOnly,
            novelty_require_embedding: false,
            novelty_top_k: 10,
            max_pivots: 1,
            collision_threshold: 0.75,
            index_dir_mode: IndexDirMode::AutoProfile,
            index_allow_build: false,
            embed_batch_size: 16,
            embed_sleep_sec: 2.0,
            embed_max_retries: 3,
            max_retries: 2,
            llm_timeout_sec: 180,
            output_dir: PathBuf::from("output"),
            log_dir: PathBuf::from("log"),
            results_dir: PathBuf::from("results"),
            log_max_text_chars: 20_000,
            cache_path: None,
        }
    }
}

/// One flat source of raw string values, e.g. a snapshot of the environment.
pub type RawValues = HashMap<String, String>;

impl Config {
    /// Load configuration from the real environment plus an optional JSON
    /// config file (explicit path wins over `STORYFORGE_CONFIG`).
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let env = snapshot_env();
        let path = config_path
            .map(PathBuf::from)
            .or_else(|| env.get("CONFIG").map(PathBuf::from));

        let file = match &path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p).map_err(|source| ConfigError::FileRead {
                    path: p.clone(),
                    source,
                })?;
                serde_json::from_str(&raw).map_err(|source| ConfigError::FileParse {
                    path: p.clone(),
                    source,
                })?
            }
            Some(p) => {
                return Err(ConfigError::message(format!(
                    "config file not found: {}",
                    p.display()
                )))
            }
            None => Value::Null,
        };

        Self::resolve(&env, &file)
    }

    /// Pure precedence resolution: `env` (keys without the `STORYFORGE_`
    /// prefix) > `file` (flat JSON object) > defaults.
    pub fn resolve(env: &RawValues, file: &Value) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        let r = Resolver { env, file };

        r.f64("RECALL_IDEA_WEIGHT", &mut cfg.recall_idea_weight)?;
        r.f64("RECALL_DOMAIN_WEIGHT", &mut cfg.recall_domain_weight)?;
        r.f64("RECALL_PAPER_WEIGHT", &mut cfg.recall_paper_weight)?;
        r.bool("RECALL_NORMALIZE", &mut cfg.recall_normalize)?;
        r.usize("FINAL_TOP_K", &mut cfg.final_top_k)?;
        r.usize("COARSE_RECALL_SIZE", &mut cfg.coarse_recall_size)?;
        r.usize("FINE_RECALL_SIZE", &mut cfg.fine_recall_size)?;
        r.usize("RECALL_TOP_DOMAINS", &mut cfg.recall_top_domains)?;
        r.f64("RECALL_SUBDOMAIN_BOOST", &mut cfg.recall_subdomain_boost)?;
        r.usize("PATTERN_SELECT_TOPN", &mut cfg.pattern_select_topn)?;
        r.f32("STORY_TEMPERATURE", &mut cfg.story_temperature)?;
        r.f32("CRITIC_TEMPERATURE", &mut cfg.critic_temperature)?;
        r.f32("COACH_TEMPERATURE", &mut cfg.coach_temperature)?;
        r.f32("FUSION_TEMPERATURE", &mut cfg.fusion_temperature)?;
        r.bool("CRITIC_STRICT_JSON", &mut cfg.critic_strict_json)?;
        r.u32("JSON_RETRIES", &mut cfg.json_retries)?;
        r.f64_list("ANCHOR_QUANTILES", &mut cfg.anchor_quantiles)?;
        r.usize("ANCHOR_MAX_INITIAL", &mut cfg.anchor_max_initial)?;
        r.usize("ANCHOR_MAX_TOTAL", &mut cfg.anchor_max_total)?;
        r.usize("ANCHOR_MAX_EXEMPLARS", &mut cfg.anchor_max_exemplars)?;
        r.bool("DENSIFY_ENABLE", &mut cfg.densify_enable)?;
        r.f64("DENSIFY_LOSS_THRESHOLD", &mut cfg.densify_loss_threshold)?;
        r.f64("DENSIFY_MIN_AVG_CONF", &mut cfg.densify_min_avg_conf)?;
        r.f64("BUCKET_SIZE", &mut cfg.bucket_size)?;
        r.usize("BUCKET_COUNT", &mut cfg.bucket_count)?;
        r.f64("TAU_METHODOLOGY", &mut cfg.tau_methodology)?;
        r.f64("TAU_NOVELTY", &mut cfg.tau_novelty)?;
        r.f64("TAU_STORYTELLER", &mut cfg.tau_storyteller)?;
        r.f64("TAU_DEFAULT", &mut cfg.tau_default)?;
        r.path("TAU_PATH", &mut cfg.tau_path)?;
        r.f64("GRID_STEP", &mut cfg.grid_step)?;
        r.usize("PASS_MIN_PATTERN_PAPERS", &mut cfg.pass_min_pattern_papers)?;
        r.f64("PASS_SCORE", &mut cfg.pass_score)?;
        r.u32("MAX_REFINE_ITERATIONS", &mut cfg.max_refine_iterations)?;
        r.usize(
            "NOVELTY_MODE_MAX_PATTERNS",
            &mut cfg.novelty_mode_max_patterns,
        )?;
        r.f64(
            "FUSION_QUALITY_THRESHOLD",
            &mut cfg.fusion_quality_threshold,
        )?;
        r.f64("DEGRADATION_THRESHOLD", &mut cfg.degradation_threshold)?;
        r.bool("NOVELTY_ENABLE", &mut cfg.novelty_enable)?;
        if let Some(raw) = r.raw("NOVELTY_ACTION") {
            cfg.novelty_action =
                NoveltyAction::parse(&raw).map_err(|message| ConfigError::Invalid {
                    key: "NOVELTY_ACTION".into(),
                    message,
                })?;
        }
        r.bool(
            "NOVELTY_REQUIRE_EMBEDDING",
            &mut cfg.novelty_require_embedding,
        )?;
        r.usize("NOVELTY_TOP_K", &mut cfg.novelty_top_k)?;
        r.u32("MAX_PIVOTS", &mut cfg.max_pivots)?;
        r.f64("COLLISION_THRESHOLD", &mut cfg.collision_threshold)?;
        if let Some(raw) = r.raw("INDEX_DIR_MODE") {
            cfg.index_dir_mode =
                IndexDirMode::parse(&raw).map_err(|message| ConfigError::Invalid {
                    key: "INDEX_DIR_MODE".into(),
                    message,
                })?;
        }
        r.bool("INDEX_ALLOW_BUILD", &mut cfg.index_allow_build)?;
        r.usize("EMBED_BATCH_SIZE", &mut cfg.embed_batch_size)?;
        r.f64("EMBED_SLEEP_SEC", &mut cfg.embed_sleep_sec)?;
        r.u32("EMBED_MAX_RETRIES", &mut cfg.embed_max_retries)?;
        r.u32("MAX_RETRIES", &mut cfg.max_retries)?;
        r.u64("LLM_TIMEOUT_SEC", &mut cfg.llm_timeout_sec)?;
        r.path("OUTPUT_DIR", &mut cfg.output_dir)?;
        r.path("LOG_DIR", &mut cfg.log_dir)?;
        r.path("RESULTS_DIR", &mut cfg.results_dir)?;
        r.usize("LOG_MAX_TEXT_CHARS", &mut cfg.log_max_text_chars)?;
        if let Some(raw) = r.raw("CACHE_PATH") {
            cfg.cache_path = Some(PathBuf::from(raw));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: String| ConfigError::Invalid {
            key: key.into(),
            message,
        };
        if self.final_top_k == 0 {
            return Err(invalid("FINAL_TOP_K", "must be >= 1".into()));
        }
        if self.grid_step <= 0.0 {
            return Err(invalid("GRID_STEP", format!("must be > 0, got {}", self.grid_step)));
        }
        for (key, v) in [
            ("RECALL_IDEA_WEIGHT", self.recall_idea_weight),
            ("RECALL_DOMAIN_WEIGHT", self.recall_domain_weight),
            ("RECALL_PAPER_WEIGHT", self.recall_paper_weight),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(invalid(key, format!("must be in [0,1], got {v}")));
            }
        }
        if self
            .anchor_quantiles
            .iter()
            .any(|q| !(0.0..=1.0).contains(q))
        {
            return Err(invalid(
                "ANCHOR_QUANTILES",
                "every quantile must be in [0,1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.collision_threshold) {
            return Err(invalid(
                "COLLISION_THRESHOLD",
                format!("must be in [0,1], got {}", self.collision_threshold),
            ));
        }
        Ok(())
    }

    /// Directory for a vector index over the given corpus.
    pub fn index_dir(&self, corpus: &str, model_profile: &str) -> PathBuf {
        match self.index_dir_mode {
            IndexDirMode::Manual => self.output_dir.join(format!("{corpus}_index")),
            IndexDirMode::AutoProfile => self
                .output_dir
                .join(format!("{corpus}_index__{model_profile}")),
        }
    }
}

fn snapshot_env() -> RawValues {
    std::env::vars()
        .filter_map(|(k, v)| {
            k.strip_prefix(ENV_PREFIX)
                .map(|stripped| (stripped.to_string(), v))
        })
        .collect()
}

struct Resolver<'a> {
    env: &'a RawValues,
    file: &'a Value,
}

impl Resolver<'_> {
    fn raw(&self, key: &str) -> Option<String> {
        if let Some(v) = self.env.get(key) {
            return Some(v.clone());
        }
        match self.file.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => None,
        }
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, out: &mut T) -> Result<(), ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.raw(key) {
            *out = raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.into(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn f64(&self, key: &str, out: &mut f64) -> Result<(), ConfigError> {
        self.parse(key, out)
    }

    fn f32(&self, key: &str, out: &mut f32) -> Result<(), ConfigError> {
        self.parse(key, out)
    }

    fn u32(&self, key: &str, out: &mut u32) -> Result<(), ConfigError> {
        self.parse(key, out)
    }

    fn u64(&self, key: &str, out: &mut u64) -> Result<(), ConfigError> {
        self.parse(key, out)
    }

    fn usize(&self, key: &str, out: &mut usize) -> Result<(), ConfigError> {
        self.parse(key, out)
    }

    fn bool(&self, key: &str, out: &mut bool) -> Result<(), ConfigError> {
        if let Some(raw) = self.raw(key) {
            *out = match raw.trim() {
                "1" | "true" | "True" | "TRUE" => true,
                "0" | "false" | "False" | "FALSE" => false,
                other => {
                    return Err(ConfigError::Invalid {
                        key: key.into(),
                        message: format!("expected boolean, got {other:?}"),
                    })
                }
            };
        }
        Ok(())
    }

    fn f64_list(&self, key: &str, out: &mut Vec<f64>) -> Result<(), ConfigError> {
        if let Some(raw) = self.raw(key) {
            let mut parsed = Vec::new();
            for part in raw.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                parsed.push(part.parse().map_err(|_| ConfigError::Invalid {
                    key: key.into(),
                    message: format!("expected comma-separated floats, got {part:?}"),
                })?);
            }
            if !parsed.is_empty() {
                *out = parsed;
            }
        }
        Ok(())
    }

    fn path(&self, key: &str, out: &mut PathBuf) -> Result<(), ConfigError> {
        if let Some(raw) = self.raw(key) {
            *out = PathBuf::from(raw);
        }
        Ok(())
    }
}
