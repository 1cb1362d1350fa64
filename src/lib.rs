#![forbid(unsafe_code)]

//! # storyforge
//!
//! Turn a one-line research idea into a structured paper "story", guided by
//! a pre-built knowledge graph of prior papers.
//!
//! Instead of asking an LLM to "rate this story 1–10" (unreliable,
//! miscalibrated), storyforge asks blind better/tie/worse questions against
//! real anchor papers with known review scores, then infers a calibrated
//! score deterministically. The pipeline: three-path recall over the KG →
//! LLM pattern selection → story generation → anchored blind critique →
//! idea-fusion refinement with rollback → novelty check with pivot.
//!
//! The KG itself is built offline; this crate consumes its `output/`
//! artifacts read-only.

pub mod brief;
pub mod bundle;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod index;
pub mod kg;
pub mod llmjson;
pub mod novelty;
pub mod pipeline;
pub mod recall;
pub mod refine;
pub mod review;
pub mod runlog;
pub mod selector;
pub mod story;

pub use config::{Config, ConfigError};
pub use error::{CancelFlag, EngineError};
pub use gateway::{ChatGateway, EmbeddingGateway, ProviderGateway};
pub use kg::KgStore;
pub use pipeline::{Pipeline, PipelineResult};
pub use story::Story;
