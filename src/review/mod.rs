//! Anchored review: blind cards, per-role judging, deterministic score
//! inference, pass rule, and the coach layer.

pub mod anchors;
pub mod cards;
pub mod coach;
pub mod critic;
pub mod inference;
pub mod judge;
pub mod rubric;
pub mod tau;

pub use anchors::{alias_anchors, PaperAnchor, Quantiles, ReviewIndex};
pub use cards::{build_paper_card, build_story_card, BlindCard, CARD_VERSION};
pub use coach::{CoachResult, CoachReviewer, FieldFeedback, SuggestedEdit};
pub use critic::{AnchoredCritic, CriticAudit, CriticResult, PassAudit, RoleDetail, RoleReview};
pub use inference::{
    infer_score_from_comparisons, AnchorSummary, Comparison, InferenceDetail, Judgement, Strength,
};
pub use judge::{guard_outgoing_prompt, BlindJudge, FORBIDDEN_TERMS};
pub use rubric::{IssueKind, Role, RUBRIC_VERSION};
pub use tau::{nodes_paper_hash, TauFile, TauSource, TauTable};
