//! Conceptual idea fusion.
//!
//! Refinement does not bolt a pattern's techniques onto the story; it fuses
//! the two ideas at the concept level. Four stages: extract the user idea's
//! DNA (problem, assumption, innovation claim), extract the pattern's DNA,
//! discover fusion points between them, then generate the fused idea. Each
//! LLM stage has a deterministic fallback so fusion always produces
//! something usable.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{CancelFlag, EngineError};
use crate::gateway::{Attribution, ChatGateway, ChatRequest, Message};
use crate::kg::Pattern;
use crate::llmjson::parse_llm_json;
use crate::story::Story;

/// Core DNA of one idea: what it solves, what it assumes, what it claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdeaDna {
    pub problem: String,
    pub assumption: String,
    pub novelty_claim: String,
}

/// Fusion opportunities between the user idea and a pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionAnalysis {
    #[serde(default)]
    pub problem_complement: String,
    #[serde(default)]
    pub assumption_intersection: String,
    #[serde(default)]
    pub innovation_product: String,
    #[serde(default)]
    pub fusion_mechanism: String,
}

/// The fused idea handed to the story generator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FusedIdea {
    #[serde(default)]
    pub fused_idea_title: String,
    #[serde(default)]
    pub fused_idea_description: String,
    #[serde(default)]
    pub problem_framing: String,
    #[serde(default)]
    pub core_assumption: String,
    #[serde(default)]
    pub novelty_claim: String,
    #[serde(default)]
    pub key_innovation_points: Vec<String>,
    #[serde(default)]
    pub why_not_straightforward_combination: String,
    /// Concept A (the user idea side) and concept B (the pattern side).
    #[serde(default)]
    pub concept_a: String,
    #[serde(default)]
    pub concept_b: String,
}

impl FusedIdea {
    /// Three-line digest in the injected-tricks format the generator expects.
    pub fn as_tricks(&self) -> Vec<String> {
        vec![
            format!("[conceptual fusion] {}", self.fused_idea_title),
            format!("[new problem definition] {}", clip(&self.problem_framing, 100)),
            format!("[new innovation claim] {}", clip(&self.novelty_claim, 100)),
        ]
    }
}

pub struct IdeaFusionEngine {
    gateway: Arc<dyn ChatGateway>,
    model: String,
}

impl IdeaFusionEngine {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
        }
    }

    /// Fuse the user idea with a pattern, optionally informed by the latest
    /// story version.
    pub async fn fuse(
        &self,
        user_idea: &str,
        pattern: &Pattern,
        previous_story: Option<&Story>,
        cfg: &Config,
        cancel: &CancelFlag,
        attribution: Attribution,
    ) -> Result<FusedIdea, EngineError> {
        cancel.check()?;
        eprintln!("[fusion] concept-level fusion with pattern {}", pattern.pattern_id);

        let user_dna = self
            .analyze_user_dna(user_idea, previous_story, cfg, attribution.clone())
            .await;
        cancel.check()?;
        let pattern_dna = self.analyze_pattern_dna(pattern, cfg, attribution.clone()).await;
        cancel.check()?;
        let analysis = self
            .discover_fusion_points(&user_dna, pattern, &pattern_dna, cfg, attribution.clone())
            .await;
        cancel.check()?;
        let mut fused = self
            .generate_fused_idea(user_idea, &user_dna, pattern, &pattern_dna, &analysis, cfg, attribution)
            .await;

        fused.concept_a = user_dna.novelty_claim.clone();
        fused.concept_b = pattern_dna.novelty_claim.clone();
        Ok(fused)
    }

    async fn analyze_user_dna(
        &self,
        user_idea: &str,
        previous_story: Option<&Story>,
        cfg: &Config,
        attribution: Attribution,
    ) -> IdeaDna {
        // A previous story already carries the structured DNA.
        if let Some(story) = previous_story {
            if !story.problem_framing.is_empty() {
                return IdeaDna {
                    problem: story.problem_framing.clone(),
                    assumption: story.gap_pattern.clone(),
                    novelty_claim: story.solution.clone(),
                };
            }
        }

        let prompt = format!(
            r#"Analyze the following research idea and extract its core DNA.

[Research Idea]
{user_idea}

Return JSON with each value under 100 words:
{{
  "problem": "what core problem does this idea address?",
  "assumption": "what assumption or observation is it based on? why does the problem exist?",
  "novelty_claim": "what is the core innovation claim, and how does it differ from existing methods?"
}}
Return JSON only."#
        );

        match self.chat_json::<IdeaDna>(&prompt, cfg, 500, attribution).await {
            Some(dna) => dna,
            None => IdeaDna {
                problem: user_idea.to_string(),
                assumption: "Seeks improvement over existing methods".to_string(),
                novelty_claim: "Proposes a new perspective or technique".to_string(),
            },
        }
    }

    async fn analyze_pattern_dna(
        &self,
        pattern: &Pattern,
        cfg: &Config,
        attribution: Attribution,
    ) -> IdeaDna {
        let mut description = pattern.name.clone();
        let approaches: Vec<&String> =
            pattern.summary.solution_approaches.iter().take(2).collect();
        if !approaches.is_empty() {
            description.push('\n');
            description.push_str(
                &approaches
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        } else if let Some(examples) = pattern.skeleton_examples.as_deref() {
            if let Some(first) = examples.first() {
                description.push('\n');
                description.push_str(&first.method_story);
            }
        }

        let prompt = format!(
            r#"Analyze the following research paradigm and extract its core DNA.

[Research Paradigm]
Name: {name}
Description:
{description}

Return JSON with each value under 100 words:
{{
  "problem": "what class of problems does this paradigm address?",
  "assumption": "what core assumption or insight is it built on?",
  "novelty_claim": "what is its core innovation relative to prior methods?"
}}
Return JSON only."#,
            name = pattern.name,
            description = clip(&description, 500),
        );

        match self.chat_json::<IdeaDna>(&prompt, cfg, 500, attribution).await {
            Some(dna) => dna,
            None => IdeaDna {
                problem: format!("Problems in the {} space", pattern.name),
                assumption: "Breakthroughs come from recombining known techniques".to_string(),
                novelty_claim: "Introduces a new architecture or methodology".to_string(),
            },
        }
    }

    async fn discover_fusion_points(
        &self,
        user_dna: &IdeaDna,
        pattern: &Pattern,
        pattern_dna: &IdeaDna,
        cfg: &Config,
        attribution: Attribution,
    ) -> FusionAnalysis {
        let prompt = format!(
            r#"Analyze the fusion potential between two research ideas.

[User Idea]
Problem: {up}
Assumption: {ua}
Innovation: {un}

[Pattern Idea]
Name: {name}
Problem: {pp}
Assumption: {pa}
Innovation: {pn}

Answer each point in 50-100 words:
1. problem_complement: how can the pattern extend or complement the user idea's problem definition?
2. assumption_intersection: do the two rest on similar observations approached from different angles?
3. innovation_product: can combining the two innovations produce something greater than their sum?
4. fusion_mechanism: concretely, how does the pattern's method become an organic part of the user idea rather than an add-on?

Return JSON only:
{{
  "problem_complement": "...",
  "assumption_intersection": "...",
  "innovation_product": "...",
  "fusion_mechanism": "..."
}}"#,
            up = user_dna.problem,
            ua = user_dna.assumption,
            un = user_dna.novelty_claim,
            name = pattern.name,
            pp = pattern_dna.problem,
            pa = pattern_dna.assumption,
            pn = pattern_dna.novelty_claim,
        );

        match self
            .chat_json::<FusionAnalysis>(&prompt, cfg, 800, attribution)
            .await
        {
            Some(analysis) => analysis,
            None => FusionAnalysis {
                problem_complement: "Extends the problem's application scope".to_string(),
                assumption_intersection: "Shared core challenge".to_string(),
                innovation_product: "Deep technical fusion".to_string(),
                fusion_mechanism: "Architectural integration".to_string(),
            },
        }
    }

    async fn generate_fused_idea(
        &self,
        user_idea: &str,
        user_dna: &IdeaDna,
        pattern: &Pattern,
        pattern_dna: &IdeaDna,
        analysis: &FusionAnalysis,
        cfg: &Config,
        attribution: Attribution,
    ) -> FusedIdea {
        let prompt = format!(
            r#"Based on the following analysis, generate a truly innovative fused idea (NOT a simple A+B combination).

[Original User Idea]
{user_idea}

[User Idea DNA]
- Problem: {up}
- Assumption: {ua}
- Innovation: {un}

[Pattern: {name}]
- Problem: {pp}
- Assumption: {pa}
- Innovation: {pn}

[Fusion Analysis]
- Problem Complement: {complement}
- Assumption Intersection: {intersection}
- Innovation Product: {product}
- Fusion Mechanism: {mechanism}

A good fusion redefines the task nature or elevates a tool into a mechanism, so the two ideas co-evolve instead of co-existing. A bad fusion reads "use B to improve A".

Return JSON only:
{{
  "fused_idea_title": "concise title within 10 words",
  "fused_idea_description": "within 150 words",
  "problem_framing": "reframed problem definition, within 200 words",
  "core_assumption": "within 150 words",
  "novelty_claim": "within 150 words, highlight what is NEW versus both inputs",
  "key_innovation_points": ["point 1", "point 2", "point 3"],
  "why_not_straightforward_combination": "within 100 words"
}}
Requirements: innovate in problem redefinition, assumption shift, or perspective transformation; avoid phrases like "combine X with Y" — prefer "reframe", "transform", "unify"."#,
            user_idea = user_idea,
            up = user_dna.problem,
            ua = user_dna.assumption,
            un = user_dna.novelty_claim,
            name = pattern.name,
            pp = pattern_dna.problem,
            pa = pattern_dna.assumption,
            pn = pattern_dna.novelty_claim,
            complement = analysis.problem_complement,
            intersection = analysis.assumption_intersection,
            product = analysis.innovation_product,
            mechanism = analysis.fusion_mechanism,
        );

        match self
            .chat_json::<FusedIdea>(&prompt, cfg, 1500, attribution)
            .await
        {
            Some(fused) if !fused.fused_idea_description.is_empty() => {
                eprintln!("[fusion]   fused: {}", fused.fused_idea_title);
                fused
            }
            _ => FusedIdea {
                fused_idea_title: format!("Unifying {} with the original approach", pattern.name),
                fused_idea_description: format!(
                    "Fusion through {}",
                    analysis.fusion_mechanism
                ),
                problem_framing: format!(
                    "{}, and {}",
                    user_dna.problem, analysis.problem_complement
                ),
                core_assumption: analysis.assumption_intersection.clone(),
                novelty_claim: analysis.innovation_product.clone(),
                key_innovation_points: vec![
                    "Multidimensional problem redefinition".to_string(),
                    "Assumption-space intersection".to_string(),
                    "Organic method fusion".to_string(),
                ],
                why_not_straightforward_combination:
                    "Conceptual fusion rather than technical combination".to_string(),
                concept_a: String::new(),
                concept_b: String::new(),
            },
        }
    }

    async fn chat_json<T: serde::de::DeserializeOwned>(
        &self,
        prompt: &str,
        cfg: &Config,
        max_tokens: u32,
        attribution: Attribution,
    ) -> Option<T> {
        let req = ChatRequest::new(
            self.model.clone(),
            vec![Message::user(prompt)],
            attribution,
        )
        .temperature(cfg.fusion_temperature)
        .max_tokens(max_tokens)
        .json();

        match self.gateway.chat(req).await {
            Ok(resp) => match parse_llm_json(&resp.content) {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    tracing::warn!(error = %err, "fusion stage parse failed; fallback");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "fusion stage call failed; fallback");
                None
            }
        }
    }
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

    #[test]
    fn tricks_digest_has_three_lines() {
        let fused = FusedIdea {
            fused_idea_title: "Contrastive Self-Evolution".into(),
            problem_framing: "Reframe adaptation as contrastive reasoning".into(),
            novelty_claim: "Co-evolving capacity and knowledge".into(),
            ..Default::default()
        };
        let tricks = fused.as_tricks();
        assert_eq!(tricks.len(), 3);
        assert!(tricks[0].contains("Contrastive Self-Evolution"));
        assert!(tricks[1].starts_with("[new problem definition]"));
    }
}
