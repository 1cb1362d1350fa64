//! Structured story generation.
//!
//! A [`Story`] is the unit the critic judges and the pipeline refines. The
//! generator has two modes: initial generation from a pattern, and
//! refinement, which carries the previous story, critic feedback, coach
//! edits, and optionally a fused idea plus reflection guidance. Output is
//! strict JSON; parse failures go through repair prompts before bubbling as
//! `InvalidOutput` so the pipeline can roll back.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use crate::brief::IdeaBrief;
use crate::config::Config;
use crate::error::{CancelFlag, EngineError};
use crate::gateway::{Attribution, ChatGateway, ChatRequest, Message};
use crate::kg::Pattern;
use crate::llmjson::parse_llm_json;
use crate::refine::{FusedIdea, ReflectionGuidance};
use crate::review::CriticResult;

// =============================================================================
// Story
// =============================================================================

/// The generated research-paper story.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Story {
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub problem_framing: String,
    pub gap_pattern: String,
    /// Narrative solution description, more descriptive than the skeleton.
    #[serde(default)]
    pub solution: String,
    pub method_skeleton: String,
    pub innovation_claims: Vec<String>,
    pub experiments_plan: String,
}

/// Wire shape as produced by the LLM; tolerates a `method_skeleton` object
/// and fills gaps with empty defaults so backfill can repair them.
#[derive(Debug, Deserialize)]
struct StoryDraft {
    #[serde(default)]
    title: String,
    #[serde(default, alias = "abstract")]
    abstract_text: String,
    #[serde(default)]
    problem_framing: String,
    #[serde(default)]
    gap_pattern: String,
    #[serde(default)]
    solution: String,
    #[serde(default, deserialize_with = "string_or_map")]
    method_skeleton: String,
    #[serde(default)]
    innovation_claims: Vec<String>,
    #[serde(default)]
    experiments_plan: String,
}

/// Accept either a string or a JSON object whose values get `;`-joined.
fn string_or_map<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(flatten_skeleton(&value))
}

fn flatten_skeleton(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .values()
            .filter_map(|v| match v {
                serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                other if !other.is_null() => Some(other.to_string()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("; "),
        serde_json::Value::Array(items) => items
            .iter()
            .map(flatten_skeleton)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("; "),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Placeholder claim names some models echo back instead of real claims.
const DEGENERATE_CLAIMS: &[&str] = &["novelty", "specific_contributions", "innovative_points"];

// =============================================================================
// Generator
// =============================================================================

/// Inputs beyond the pattern for one generation call.
#[derive(Debug, Default)]
pub struct GenerateContext<'a> {
    pub constraints: Option<&'a [String]>,
    pub injected_tricks: Option<&'a [String]>,
    pub previous_story: Option<&'a Story>,
    pub review_feedback: Option<&'a CriticResult>,
    pub fused_idea: Option<&'a FusedIdea>,
    pub reflection_guidance: Option<&'a ReflectionGuidance>,
}

pub struct StoryGenerator {
    gateway: Arc<dyn ChatGateway>,
    model: String,
    user_idea: String,
    idea_brief: Option<IdeaBrief>,
}

impl StoryGenerator {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        model: impl Into<String>,
        user_idea: impl Into<String>,
        idea_brief: Option<IdeaBrief>,
    ) -> Self {
        Self {
            gateway,
            model: model.into(),
            user_idea: user_idea.into(),
            idea_brief,
        }
    }

    /// Generate or refine a story. Refinement mode activates when both a
    /// previous story and review feedback are present.
    pub async fn generate(
        &self,
        pattern: &Pattern,
        ctx: GenerateContext<'_>,
        cfg: &Config,
        cancel: &CancelFlag,
        attribution: Attribution,
    ) -> Result<Story, EngineError> {
        cancel.check()?;

        let refinement = ctx.previous_story.is_some() && ctx.review_feedback.is_some();
        let prompt = if refinement {
            self.build_refinement_prompt(pattern, &ctx)
        } else {
            self.build_generation_prompt(pattern, &ctx)
        };

        let mut response = self
            .chat(&prompt, cfg, attribution.clone())
            .await
            .map_err(|e| EngineError::step_failed("story_generate", e.to_string()))?;

        let mut draft: Option<StoryDraft> = parse_llm_json(&response).ok();
        let mut attempts = 0u32;
        while draft.is_none() && attempts < cfg.json_retries {
            attempts += 1;
            cancel.check()?;
            tracing::warn!(attempt = attempts, "story JSON invalid; repair retry");
            let repair = build_repair_prompt(&response);
            response = self
                .chat(&repair, cfg, attribution.clone())
                .await
                .map_err(|e| EngineError::step_failed("story_repair", e.to_string()))?;
            draft = parse_llm_json(&response).ok();
        }

        let draft = draft.ok_or_else(|| {
            EngineError::invalid_output(
                "story_generate",
                format!("story JSON unparseable after {attempts} repair retries"),
            )
        })?;

        let mut story = Story {
            title: draft.title,
            abstract_text: draft.abstract_text,
            problem_framing: draft.problem_framing,
            gap_pattern: draft.gap_pattern,
            solution: draft.solution,
            method_skeleton: draft.method_skeleton,
            innovation_claims: draft.innovation_claims,
            experiments_plan: draft.experiments_plan,
        };

        if let Some(previous) = ctx.previous_story {
            backfill(&mut story, previous);
        } else if story.title.is_empty() || story.method_skeleton.is_empty() {
            return Err(EngineError::invalid_output(
                "story_generate",
                "initial story missing title or method_skeleton",
            ));
        }

        Ok(story)
    }

    async fn chat(
        &self,
        prompt: &str,
        cfg: &Config,
        attribution: Attribution,
    ) -> Result<String, crate::gateway::ProviderError> {
        let req = ChatRequest::new(
            self.model.clone(),
            vec![Message::user(prompt)],
            attribution,
        )
        .temperature(cfg.story_temperature)
        .max_tokens(1500)
        .json();
        Ok(self.gateway.chat(req).await?.content)
    }

    // -- Prompts --------------------------------------------------------------

    fn build_generation_prompt(&self, pattern: &Pattern, ctx: &GenerateContext<'_>) -> String {
        let summary = &pattern.summary;
        let section = |title: &str, items: &[String], cap: usize| -> String {
            if items.is_empty() {
                return String::new();
            }
            let body = items
                .iter()
                .take(cap)
                .enumerate()
                .map(|(i, s)| format!("{}. {s}", i + 1))
                .collect::<Vec<_>>()
                .join("\n");
            format!("\n[{title}]\n{body}\n")
        };

        let ideas = section("Representative Research Ideas", &summary.representative_ideas, 3);
        let problems = section("Common Problems In This Pattern", &summary.common_problems, 3);
        let solutions = section("Solution Approaches", &summary.solution_approaches, 3);
        let packaging = section("Story Packaging Strategy", &summary.story, 2);

        let skeletons = pattern
            .skeleton_examples
            .as_deref()
            .map(|examples| {
                let mut out = String::from("\n[Reference Paper Storytelling]\n");
                for (i, sk) in examples.iter().take(2).enumerate() {
                    out.push_str(&format!("Example {}: {}\n", i + 1, sk.title));
                    if !sk.problem_framing.is_empty() {
                        out.push_str(&format!("  Problem framing: {}\n", clip(&sk.problem_framing, 200)));
                    }
                    if !sk.gap_pattern.is_empty() {
                        out.push_str(&format!("  Gap presentation: {}\n", clip(&sk.gap_pattern, 200)));
                    }
                    if !sk.method_story.is_empty() {
                        out.push_str(&format!("  Method narrative: {}\n", clip(&sk.method_story, 200)));
                    }
                }
                out
            })
            .unwrap_or_default();

        let constraints = ctx
            .constraints
            .filter(|c| !c.is_empty())
            .map(|c| {
                let body = c.iter().map(|s| format!("  - {s}")).collect::<Vec<_>>().join("\n");
                format!("\n[Constraints]\n{body}\n")
            })
            .unwrap_or_default();

        let tricks = ctx
            .injected_tricks
            .filter(|t| !t.is_empty())
            .map(|t| {
                let body = t.iter().map(|s| format!("  - {s}")).collect::<Vec<_>>().join("\n");
                format!(
                    "\n[Techniques That Must Be Fused In]\n{body}\nIntegrate these naturally into the method; do not just append them.\n"
                )
            })
            .unwrap_or_default();

        let brief_block = self
            .idea_brief
            .as_ref()
            .map(|b| b.render_block())
            .unwrap_or_default();

        format!(
            r#"You are a senior paper author at a top AI conference. Generate a structured paper story based on the user's idea and the writing template below.

[User Idea]
"{user_idea}"
{brief_block}
Identify the 2-4 core concepts in the user idea before writing. They are the protagonists of the story; the template's techniques are tools to realize them. Title and abstract must highlight the core concepts, with technique names only as modifiers.

[Writing Template] {pattern_name} (cluster of {cluster_size} papers)
{ideas}{problems}{solutions}{packaging}{skeletons}{constraints}{tricks}
Use the Solution Approaches to build concrete method steps, always framed as means to realize the core concepts. Use the Story Packaging Strategy's "Reframe/Transform" pattern for problem_framing, gap_pattern, and innovation_claims.

Output pure JSON, no other text, all fields in English:
{{
  "title": "...",
  "abstract": "150-200 words, idea vision first, then the technical realization",
  "problem_framing": "100-150 words, Reframe [core concept] from X to Y",
  "gap_pattern": "100-150 words, why current approaches fail for the core concepts",
  "solution": "150-200 words, narrative methodology description",
  "method_skeleton": "Step 1; Step 2; Step 3 (one string, semicolon-separated, 3-5 steps)",
  "innovation_claims": ["claim 1", "claim 2", "claim 3"],
  "experiments_plan": "50-80 words"
}}
Each innovation claim must mention a core concept, describe a transformation, name the technical means, and state the benefit."#,
            user_idea = self.user_idea,
            brief_block = brief_block,
            pattern_name = pattern.name,
            cluster_size = pattern.cluster_size,
            ideas = ideas,
            problems = problems,
            solutions = solutions,
            packaging = packaging,
            skeletons = skeletons,
            constraints = constraints,
            tricks = tricks,
        )
    }

    fn build_refinement_prompt(&self, pattern: &Pattern, ctx: &GenerateContext<'_>) -> String {
        let previous = ctx.previous_story.expect("refinement requires previous story");
        let feedback = ctx.review_feedback.expect("refinement requires feedback");

        let mut critique = String::new();
        for review in &feedback.reviews {
            critique.push_str(&format!(
                "- {} ({}): {:.1}. Feedback: {}\n",
                review.reviewer,
                review.role.as_str(),
                review.score,
                clip(&review.feedback, 250)
            ));
        }

        let coach_block = feedback
            .coach
            .as_ref()
            .filter(|c| !c.suggested_edits.is_empty() || !c.priority.is_empty())
            .map(|c| {
                let mut out = String::from("\n[Coach Edits]\n");
                if !c.priority.is_empty() {
                    out.push_str(&format!("Priority fields: {}\n", c.priority.join(", ")));
                }
                for edit in c.suggested_edits.iter().take(6) {
                    out.push_str(&format!(
                        "- {} [{}]: {}\n",
                        edit.field,
                        edit.action,
                        clip(&edit.content, 200)
                    ));
                }
                out
            })
            .unwrap_or_default();

        let fused_block = ctx
            .fused_idea
            .map(|f| {
                format!(
                    r#"
[Conceptual Innovation From Idea Fusion]
Title: {title}
Description: {description}
New Problem Framing: {problem}
New Core Assumption: {assumption}
New Novelty Claim: {claim}
Why this is not a straightforward combination: {why}
Key innovation points: {points}

This fused idea is the most important guidance. Adopt its problem perspective in problem_framing, explain in gap_pattern why existing methods lack this conceptual unity, and frame innovation_claims as "transforming/reframing X from Y to Z", never "combining A with B". Show how the techniques CO-EVOLVE to realize the fused concept rather than co-exist.
"#,
                    title = f.fused_idea_title,
                    description = f.fused_idea_description,
                    problem = f.problem_framing,
                    assumption = f.core_assumption,
                    claim = f.novelty_claim,
                    why = f.why_not_straightforward_combination,
                    points = f.key_innovation_points.join("; "),
                )
            })
            .unwrap_or_default();

        let reflection_block = ctx
            .reflection_guidance
            .filter(|g| !g.is_empty())
            .map(|g| {
                let mut out = String::from("\n[Reflection Guidance From Fusion Quality Assessment]\n");
                if let Some(t) = &g.title_evolution {
                    out.push_str(&format!("Title evolution: {t}\n"));
                }
                if let Some(m) = &g.method_evolution {
                    out.push_str(&format!("Method evolution: {m}\n"));
                }
                if let Some(n) = &g.narrative_strategy {
                    out.push_str(&format!("Narrative strategy: {n}\n"));
                }
                out
            })
            .unwrap_or_default();

        let tricks = ctx
            .injected_tricks
            .filter(|t| !t.is_empty())
            .map(|t| {
                let body = t.iter().map(|s| format!("  - {s}")).collect::<Vec<_>>().join("\n");
                format!("\n[Newly Injected Techniques]\n{body}\nRestructure existing steps so these become organic components; do not stack them on top.\n")
            })
            .unwrap_or_default();

        let constraints = ctx
            .constraints
            .filter(|c| !c.is_empty())
            .map(|c| {
                let body = c.iter().map(|s| format!("  - {s}")).collect::<Vec<_>>().join("\n");
                format!("\n[Hard Constraints]\n{body}\n")
            })
            .unwrap_or_default();

        let pattern_reference = {
            let solutions = pattern
                .summary
                .solution_approaches
                .iter()
                .take(3)
                .enumerate()
                .map(|(i, s)| format!("  {}. {s}", i + 1))
                .collect::<Vec<_>>()
                .join("\n");
            if solutions.is_empty() {
                String::new()
            } else {
                format!("\n[Pattern Reference: Solution Approaches]\n{solutions}\n")
            }
        };

        let brief_block = self
            .idea_brief
            .as_ref()
            .map(|b| b.render_block())
            .unwrap_or_default();

        format!(
            r#"You are a senior paper author, skilled in deeply integrating new techniques into existing methods.

[User's Original Idea - THE PROTAGONIST]
"{user_idea}"
{brief_block}
The user's core idea stays the protagonist through every revision; injected techniques are implementation means. Title and abstract must keep highlighting the core concepts.

[Current Story Version]
Title: {title}
Abstract: {abstract_text}
Problem Framing: {problem_framing}
Gap Pattern: {gap_pattern}
Solution: {solution}
Method: {method_skeleton}
Claims: {claims}

[Review Feedback] (preserve what scored well, deeply revise what was criticized)
{critique}{coach_block}{fused_block}{reflection_block}{tricks}{constraints}{pattern_reference}
Refinement principles: keep the user idea central; preserve dimensions that were not criticized; transform existing steps rather than appending; be concrete about how techniques combine.

Output the refined complete story as pure JSON, no other text, all fields filled:
{{
  "title": "...",
  "abstract": "...",
  "problem_framing": "...",
  "gap_pattern": "...",
  "solution": "...",
  "method_skeleton": "Step 1; Step 2; Step 3",
  "innovation_claims": ["claim 1", "claim 2", "claim 3"],
  "experiments_plan": "..."
}}"#,
            user_idea = self.user_idea,
            brief_block = brief_block,
            title = previous.title,
            abstract_text = previous.abstract_text,
            problem_framing = previous.problem_framing,
            gap_pattern = previous.gap_pattern,
            solution = previous.solution,
            method_skeleton = previous.method_skeleton,
            claims = serde_json::to_string(&previous.innovation_claims).unwrap_or_default(),
            critique = critique,
            coach_block = coach_block,
            fused_block = fused_block,
            reflection_block = reflection_block,
            tricks = tricks,
            constraints = constraints,
            pattern_reference = pattern_reference,
        )
    }
}

fn build_repair_prompt(previous_output: &str) -> String {
    format!(
        r#"Fix the previous output into STRICT valid JSON only.
Rules:
1) Output JSON ONLY (no markdown, no explanation).
2) All of these fields must be present: title, abstract, problem_framing, gap_pattern, solution, method_skeleton, innovation_claims, experiments_plan.
3) method_skeleton must be one string with steps separated by semicolons.
4) innovation_claims must be an array of strings.

Previous output:
{}

Return ONLY the corrected JSON."#,
        clip(previous_output, 6000)
    )
}

/// Restore empty or degenerate fields from the previous version.
fn backfill(story: &mut Story, previous: &Story) {
    if story.title.is_empty() {
        story.title = previous.title.clone();
    }
    if story.abstract_text.is_empty() {
        story.abstract_text = previous.abstract_text.clone();
    }
    if story.problem_framing.is_empty() {
        story.problem_framing = previous.problem_framing.clone();
    }
    if story.gap_pattern.is_empty() {
        story.gap_pattern = previous.gap_pattern.clone();
    }
    if story.solution.is_empty() {
        story.solution = previous.solution.clone();
    }
    if story.method_skeleton.is_empty() {
        story.method_skeleton = previous.method_skeleton.clone();
    }
    if story.experiments_plan.is_empty() {
        story.experiments_plan = previous.experiments_plan.clone();
    }
    let degenerate = story.innovation_claims.is_empty()
        || story
            .innovation_claims
            .iter()
            .any(|c| DEGENERATE_CLAIMS.contains(&c.as_str()));
    if degenerate {
        story.innovation_claims = previous.innovation_claims.clone();
    }
}

fn clip(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skeleton_map_flattens_to_string() {
        let raw = serde_json::json!({
            "title": "T",
            "method_skeleton": {"step1": "Build graph", "step2": "Train"}
        });
        let draft: StoryDraft = serde_json::from_value(raw).unwrap();
        assert!(draft.method_skeleton.contains("Build graph"));
        assert!(draft.method_skeleton.contains("; "));
    }

    #[test]
    fn backfill_restores_empty_fields() {
        let previous = Story {
            title: "Old title".into(),
            abstract_text: "Old abstract".into(),
            method_skeleton: "Step 1".into(),
            innovation_claims: vec!["real claim".into()],
            ..Default::default()
        };
        let mut story = Story {
            title: "New title".into(),
            innovation_claims: vec!["novelty".into()],
            ..Default::default()
        };
        backfill(&mut story, &previous);
        assert_eq!(story.title, "New title");
        assert_eq!(story.abstract_text, "Old abstract");
        assert_eq!(story.method_skeleton, "Step 1");
        assert_eq!(story.innovation_claims, vec!["real claim".to_string()]);
    }

    #[test]
    fn clip_respects_char_boundaries() {
        let text = "héllo wörld";
        let clipped = clip(text, 3);
        assert!(clipped.len() <= 3);
        assert!(text.starts_with(clipped));
    }
}
