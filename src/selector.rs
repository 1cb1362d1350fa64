//! Pattern selection: 3-dimension LLM scoring of recalled patterns.
//!
//! For the top N recalled patterns an LLM rates stability, novelty, and
//! domain distance in [0,1]; the selector then ranks all recalled patterns
//! three ways (stability ↓, novelty ↓, domain distance ↑). Scoring calls run
//! concurrently; an LLM failure for a pattern falls back to a cluster-size
//! rule so selection never blocks the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::brief::IdeaBrief;
use crate::config::Config;
use crate::error::CancelFlag;
use crate::gateway::{Attribution, ChatGateway, ChatRequest, Message};
use crate::kg::Pattern;
use crate::llmjson::parse_llm_json;
use crate::recall::RecalledPattern;

/// Scores for one pattern across the three dimensions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DimensionScores {
    pub stability_score: f64,
    pub novelty_score: f64,
    pub domain_distance: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// One entry in a ranked dimension list.
#[derive(Debug, Clone)]
pub struct RankedPattern {
    pub pattern_id: String,
    pub pattern: Pattern,
    pub recall_score: f64,
    pub scores: DimensionScores,
}

/// All recalled patterns, ranked per dimension.
#[derive(Debug, Clone, Default)]
pub struct RankedPatterns {
    /// stability_score descending.
    pub stability: Vec<RankedPattern>,
    /// novelty_score descending.
    pub novelty: Vec<RankedPattern>,
    /// domain_distance ascending (smaller = closer to the user idea).
    pub domain_distance: Vec<RankedPattern>,
}

impl RankedPatterns {
    pub fn is_empty(&self) -> bool {
        self.stability.is_empty() && self.novelty.is_empty() && self.domain_distance.is_empty()
    }

    pub fn by_issue(&self, issue: crate::review::IssueKind) -> &[RankedPattern] {
        match issue {
            crate::review::IssueKind::Novelty => &self.novelty,
            crate::review::IssueKind::Stability => &self.stability,
            crate::review::IssueKind::DomainDistance => &self.domain_distance,
        }
    }
}

pub struct PatternSelector {
    gateway: Arc<dyn ChatGateway>,
    model: String,
    user_idea: String,
    idea_brief: Option<IdeaBrief>,
}

impl PatternSelector {
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

    /// Score the top N recalled patterns with the LLM and rank everything.
    /// Empty input produces empty rankings.
    pub async fn select(
        &self,
        recalled: &[RecalledPattern],
        cfg: &Config,
        cancel: &CancelFlag,
        attribution: Attribution,
    ) -> RankedPatterns {
        if recalled.is_empty() || cancel.is_cancelled() {
            return RankedPatterns::default();
        }

        let top: Vec<&RecalledPattern> =
            recalled.iter().take(cfg.pattern_select_topn).collect();

        eprintln!(
            "[selector] scoring {} of {} recalled patterns on 3 dimensions",
            top.len(),
            recalled.len()
        );

        let scored: Vec<(String, DimensionScores)> = stream::iter(top.iter().map(|rp| {
            let attribution = attribution.clone();
            async move {
                let scores = self
                    .score_pattern(&rp.pattern, attribution)
                    .await
                    .unwrap_or_else(|| fallback_scores(rp.pattern.cluster_size));
                (rp.pattern_id.clone(), scores)
            }
        }))
        .buffer_unordered(top.len().max(1))
        .collect()
        .await;

        let mut by_id: HashMap<String, DimensionScores> = scored.into_iter().collect();

        let entries: Vec<RankedPattern> = recalled
            .iter()
            .map(|rp| {
                let scores = by_id
                    .remove(&rp.pattern_id)
                    .unwrap_or_else(|| fallback_scores(rp.pattern.cluster_size));
                RankedPattern {
                    pattern_id: rp.pattern_id.clone(),
                    pattern: rp.pattern.clone(),
                    recall_score: rp.score,
                    scores,
                }
            })
            .collect();

        let mut stability = entries.clone();
        stability.sort_by(|a, b| {
            b.scores
                .stability_score
                .partial_cmp(&a.scores.stability_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });

        let mut novelty = entries.clone();
        novelty.sort_by(|a, b| {
            b.scores
                .novelty_score
                .partial_cmp(&a.scores.novelty_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });

        let mut domain_distance = entries;
        domain_distance.sort_by(|a, b| {
            a.scores
                .domain_distance
                .partial_cmp(&b.scores.domain_distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });

        RankedPatterns {
            stability,
            novelty,
            domain_distance,
        }
    }

    async fn score_pattern(
        &self,
        pattern: &Pattern,
        attribution: Attribution,
    ) -> Option<DimensionScores> {
        let prompt = self.build_prompt(pattern);
        let req = ChatRequest::new(
            self.model.clone(),
            vec![Message::user(prompt)],
            attribution,
        )
        .temperature(0.3)
        .max_tokens(300)
        .json();

        let response = match self.gateway.chat(req).await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::warn!(pattern_id = %pattern.pattern_id, error = %err, "pattern scoring failed; rule fallback");
                return None;
            }
        };

        let mut parsed: DimensionScores = match parse_llm_json(&response.content) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(pattern_id = %pattern.pattern_id, error = %err, "pattern score parse failed; rule fallback");
                return None;
            }
        };
        parsed.stability_score = parsed.stability_score.clamp(0.0, 1.0);
        parsed.novelty_score = parsed.novelty_score.clamp(0.0, 1.0);
        parsed.domain_distance = parsed.domain_distance.clamp(0.0, 1.0);
        Some(parsed)
    }

    fn build_prompt(&self, pattern: &Pattern) -> String {
        let ideas_text = pattern
            .summary
            .representative_ideas
            .iter()
            .take(3)
            .map(|i| format!("- {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let problems_text = pattern
            .summary
            .common_problems
            .iter()
            .take(2)
            .map(|p| format!("- {p}"))
            .collect::<Vec<_>>()
            .join("\n");
        let brief_block = self
            .idea_brief
            .as_ref()
            .map(|b| b.render_block())
            .unwrap_or_default();

        format!(
            r#"You are a critical multidimensional pattern scorer for top-tier AI conferences.
Evaluate one research pattern across THREE independent dimensions. Avoid clustering scores in the middle range; be discriminative.

[User's Research Idea]
"{user_idea}"
{brief_block}
[Pattern Information]
Name: {name}
Cluster Size: {size} papers
Representative Research Ideas:
{ideas}
Common Problems:
{problems}

[Scoring Guidelines]
stability_score (0.0-1.0): how proven, mature, widely adopted. Small experimental clusters score low; foundational approaches with standard benchmarks score high. Large cluster size alone does not guarantee high stability.
novelty_score (0.0-1.0): how original and counter-intuitive. Routine combinations score low; paradigm shifts and problem reframings score high. Small clusters can still be highly novel.
domain_distance (0.0-1.0): semantic and methodological distance from the user's idea. 0 = same problem and method family, 1 = completely different field.

Return JSON ONLY:
{{
  "stability_score": 0.75,
  "novelty_score": 0.55,
  "domain_distance": 0.25,
  "reasoning": "one sentence"
}}"#,
            user_idea = self.user_idea,
            brief_block = brief_block,
            name = pattern.name,
            size = pattern.cluster_size,
            ideas = if ideas_text.is_empty() { "N/A" } else { &ideas_text },
            problems = if problems_text.is_empty() { "N/A" } else { &problems_text },
        )
    }
}

/// Rule fallback when the LLM call or parse fails:
/// stability scales with cluster size, novelty mirrors it, distance neutral.
pub fn fallback_scores(cluster_size: usize) -> DimensionScores {
    let stability = (cluster_size as f64 / 50.0).clamp(0.0, 1.0);
    DimensionScores {
        stability_score: stability,
        novelty_score: 1.0 - stability,
        domain_distance: 0.5,
        reasoning: format!("rule fallback: cluster_size={cluster_size}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_curve_clips() {
        let low = fallback_scores(5);
        assert!((low.stability_score - 0.1).abs() < 1e-9);
        assert!((low.novelty_score - 0.9).abs() < 1e-9);
        assert_eq!(low.domain_distance, 0.5);

        let high = fallback_scores(500);
        assert_eq!(high.stability_score, 1.0);
        assert_eq!(high.novelty_score, 0.0);
    }
}
