//! Refinement: idea fusion, reflection, and pattern-injection bookkeeping.

pub mod engine;
pub mod fusion;
pub mod reflect;

pub use engine::RefinementEngine;
pub use fusion::{FusedIdea, FusionAnalysis, IdeaDna, IdeaFusionEngine};
pub use reflect::{Reflection, ReflectionGuidance, ReflectionScores, StoryReflector};
