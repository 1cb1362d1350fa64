//! Engine-level error taxonomy.
//!
//! Gateway errors are retried where they occur; what reaches the pipeline
//! manager is one of these. `Config` is fatal (exit 2), `Cancelled` exits
//! 130, everything else either rolls back or degrades to the best-so-far
//! story.

use thiserror::Error;

use crate::config::ConfigError;
use crate::gateway::ProviderError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing/invalid configuration, τ mismatch. Fatal.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// LLM output failed schema/forbidden-term/length validation after all
    /// repair retries.
    #[error("invalid LLM output at {stage}: {reason}")]
    InvalidOutput { stage: &'static str, reason: String },

    /// A non-recoverable step; refinement rolls back and marks the pattern
    /// failed.
    #[error("step failed at {stage}: {reason}")]
    StepFailed { stage: &'static str, reason: String },

    /// The novelty check found a too-similar prior paper and policy says
    /// fail.
    #[error("collision detected: max similarity {max_similarity:.2} vs {paper_id}")]
    CollisionDetected {
        paper_id: String,
        max_similarity: f64,
    },

    /// Cooperative cancellation; flush logs and exit 130.
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn invalid_output(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOutput {
            stage,
            reason: reason.into(),
        }
    }

    pub fn step_failed(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::StepFailed {
            stage,
            reason: reason.into(),
        }
    }

    /// Exit code per the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Cancelled => 130,
            _ => 3,
        }
    }
}

impl From<ProviderError> for EngineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Config(msg) => Self::Config(ConfigError::Message(msg)),
            other => Self::StepFailed {
                stage: "gateway",
                reason: other.to_string(),
            },
        }
    }
}

/// Cooperative cancellation flag, checked at every external-call boundary.
/// No new call starts after the flag is set; in-flight calls complete.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Error out if cancellation was requested.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}
