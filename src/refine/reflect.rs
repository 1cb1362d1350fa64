//! Post-fusion reflection.
//!
//! After fusion and before (re)generation, a reflection pass grades how
//! organically the fused idea holds together. Low fusion quality tells
//! novelty mode to skip to the next pattern instead of wasting a generation
//! and a critic round on a stitched-together concept.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{CancelFlag, EngineError};
use crate::gateway::{Attribution, ChatGateway, ChatRequest, Message};
use crate::kg::Pattern;
use crate::llmjson::parse_llm_json;
use crate::refine::fusion::FusedIdea;
use crate::review::CriticResult;
use crate::story::Story;

/// Per-aspect reflection grades in [0,1].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReflectionScores {
    #[serde(default)]
    pub concept_unity: f64,
    #[serde(default)]
    pub technical_soundness: f64,
    #[serde(default)]
    pub novelty_level: f64,
    #[serde(default)]
    pub narrative_clarity: f64,
}

/// Strategy hints fed back into the refinement generation prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReflectionGuidance {
    #[serde(default)]
    pub title_evolution: Option<String>,
    #[serde(default)]
    pub method_evolution: Option<String>,
    #[serde(default)]
    pub narrative_strategy: Option<String>,
}

impl ReflectionGuidance {
    pub fn is_empty(&self) -> bool {
        self.title_evolution.is_none()
            && self.method_evolution.is_none()
            && self.narrative_strategy.is_none()
    }
}

/// Full reflection result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reflection {
    #[serde(default)]
    pub scores: ReflectionScores,
    /// Overall fusion quality in [0,1]; below the threshold the pattern is
    /// skipped.
    #[serde(default)]
    pub fusion_quality: f64,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub guidance: ReflectionGuidance,
}

impl Reflection {
    pub fn is_organic(&self, threshold: f64) -> bool {
        self.fusion_quality >= threshold
    }
}

pub struct StoryReflector {
    gateway: Arc<dyn ChatGateway>,
    model: String,
}

impl StoryReflector {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn reflect_on_fusion(
        &self,
        old_story: &Story,
        pattern: &Pattern,
        fused_idea: &FusedIdea,
        critic_feedback: &CriticResult,
        user_idea: &str,
        cfg: &Config,
        cancel: &CancelFlag,
        attribution: Attribution,
    ) -> Result<Reflection, EngineError> {
        cancel.check()?;

        let warnings = extract_critic_warnings(critic_feedback);
        let warnings_block = if warnings.is_empty() {
            String::new()
        } else {
            format!(
                "\n[Critic Warnings To Address]\n{}\n",
                warnings
                    .iter()
                    .map(|w| format!("- {w}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            )
        };

        let prompt = format!(
            r#"You are a senior research editor assessing whether a pattern fusion is organic or a mechanical stack.

[User's Original Idea]
{user_idea}

[Previous Story]
Title: {title}
Abstract: {abstract_text}
Problem Framing: {problem}
Claims: {claims}

[New Pattern]
Name: {pattern_name}

[Fused Idea]
Title: {fused_title}
Description: {fused_description}
New Problem Framing: {fused_problem}
Novelty Claim: {fused_claim}
{warnings_block}
Grade the fusion on four aspects in [0,1], give an overall fusion_quality in [0,1], and provide evolution strategies for the final draft.

Return JSON only:
{{
  "scores": {{
    "concept_unity": 0.0,
    "technical_soundness": 0.0,
    "novelty_level": 0.0,
    "narrative_clarity": 0.0
  }},
  "fusion_quality": 0.0,
  "suggestions": ["concrete improvement 1", "concrete improvement 2"],
  "guidance": {{
    "title_evolution": "how the title should evolve to reflect the fused concept",
    "method_evolution": "how the method should restructure so the new technique is organic",
    "narrative_strategy": "how to narrate the fusion as one coherent idea"
  }}
}}"#,
            user_idea = user_idea,
            title = old_story.title,
            abstract_text = clip(&old_story.abstract_text, 300),
            problem = clip(&old_story.problem_framing, 200),
            claims = serde_json::to_string(&old_story.innovation_claims).unwrap_or_default(),
            pattern_name = pattern.name,
            fused_title = fused_idea.fused_idea_title,
            fused_description = clip(&fused_idea.fused_idea_description, 300),
            fused_problem = clip(&fused_idea.problem_framing, 300),
            fused_claim = clip(&fused_idea.novelty_claim, 300),
            warnings_block = warnings_block,
        );

        let req = ChatRequest::new(
            self.model.clone(),
            vec![Message::user(prompt)],
            attribution,
        )
        .temperature(cfg.fusion_temperature)
        .max_tokens(1000)
        .json();

        let mut reflection = match self.gateway.chat(req).await {
            Ok(resp) => parse_llm_json::<Reflection>(&resp.content).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "reflection parse failed; neutral reflection");
                neutral_reflection()
            }),
            Err(err) => {
                tracing::warn!(error = %err, "reflection call failed; neutral reflection");
                neutral_reflection()
            }
        };

        reflection.fusion_quality = reflection.fusion_quality.clamp(0.0, 1.0);
        eprintln!(
            "[reflect] fusion_quality={:.2} organic={}",
            reflection.fusion_quality,
            reflection.is_organic(cfg.fusion_quality_threshold)
        );
        Ok(reflection)
    }
}

/// A neutral reflection passes the quality gate so a transient LLM failure
/// does not discard a pattern.
fn neutral_reflection() -> Reflection {
    Reflection {
        scores: ReflectionScores {
            concept_unity: 0.7,
            technical_soundness: 0.7,
            novelty_level: 0.7,
            narrative_clarity: 0.7,
        },
        fusion_quality: 0.7,
        suggestions: Vec::new(),
        guidance: ReflectionGuidance::default(),
    }
}

/// Pull the harshest critic feedback forward: low-scoring roles whose
/// feedback flags stacking or routine combinations.
fn extract_critic_warnings(critic: &CriticResult) -> Vec<String> {
    const CRITICAL_MARKERS: &[&str] = &[
        "stacking",
        "combination",
        "common",
        "typical",
        "conventional",
        "lack of novelty",
        "insufficient innovation",
        "widely explored",
        "similar work",
        "existing methods",
        "simple integration",
        "straightforward",
    ];

    critic
        .reviews
        .iter()
        .filter(|review| {
            let lower = review.feedback.to_lowercase();
            let flagged = CRITICAL_MARKERS.iter().any(|m| lower.contains(m));
            (review.score < 6.0 && flagged) || review.score < 5.5
        })
        .map(|review| {
            format!(
                "[{}] {}",
                review.role.as_str(),
                clip(&review.feedback, 200)
            )
        })
        .collect()
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::critic::{CriticAudit, RoleReview};
    use crate::review::rubric::Role;
    use crate::review::tau::TauSource;
    use crate::review::IssueKind;

    fn critic_with(reviews: Vec<RoleReview>) -> CriticResult {
        CriticResult {
            pass: false,
            avg_score: 5.0,
            reviews,
            main_issue: IssueKind::Novelty,
            suggestions: vec![],
            audit: CriticAudit {
                pattern_id: "pat".into(),
                anchors: vec![],
                densify_triggered: false,
                densify_added: 0,
                role_details: Default::default(),
                pass: None,
                rubric_version: "rubric_v1".into(),
                card_version: "blind_card_v1".into(),
                tau_source: TauSource::Config,
            },
            coach: None,
        }
    }

    #[test]
    fn warnings_extracted_for_flagged_low_scores() {
        let critic = critic_with(vec![
            RoleReview {
                reviewer: "Reviewer B".into(),
                role: Role::Novelty,
                score: 5.6,
                feedback: "Reads as a conventional combination of known parts".into(),
            },
            RoleReview {
                reviewer: "Reviewer A".into(),
                role: Role::Methodology,
                score: 7.5,
                feedback: "Solid design".into(),
            },
        ]);
        let warnings = extract_critic_warnings(&critic);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Novelty"));
    }

    #[test]
    fn very_low_scores_warn_unconditionally() {
        let critic = critic_with(vec![RoleReview {
            reviewer: "Reviewer C".into(),
            role: Role::Storyteller,
            score: 5.0,
            feedback: "Flat narrative".into(),
        }]);
        assert_eq!(extract_critic_warnings(&critic).len(), 1);
    }

    #[test]
    fn organic_threshold() {
        let mut reflection = neutral_reflection();
        reflection.fusion_quality = 0.64;
        assert!(!reflection.is_organic(0.65));
        reflection.fusion_quality = 0.65;
        assert!(reflection.is_organic(0.65));
    }
}
