//! Refinement pattern selection and failure tracking.
//!
//! When the critic fails a story, the weak role maps to a dimension and the
//! engine walks that dimension's ranking for the next pattern to fuse in.
//! Failures are remembered per (pattern, issue kind): a pattern that made
//! Methodology worse can still be tried for Novelty, but never again for
//! Methodology.

use std::collections::{HashMap, HashSet};

use crate::kg::Pattern;
use crate::review::IssueKind;
use crate::selector::RankedPatterns;

/// Generic experimental tricks that never raise technical novelty on their
/// own; filtered out of injected insight lists.
const GENERIC_TRICKS: &[&str] = &[
    "ablation",
    "multi-dataset validation",
    "comparison experiment",
    "case study",
    "visualization",
    "attention visualization",
    "parameter sensitivity",
    "robustness test",
    "narrative structure",
    "performance gain",
    "experimental validation",
];

pub struct RefinementEngine {
    ranked: RankedPatterns,
    cursors: HashMap<IssueKind, usize>,
    used: HashSet<String>,
    failure_map: HashMap<String, HashSet<IssueKind>>,
    current_pattern_id: Option<String>,
}

impl RefinementEngine {
    pub fn new(ranked: RankedPatterns) -> Self {
        Self {
            ranked,
            cursors: HashMap::new(),
            used: HashSet::new(),
            failure_map: HashMap::new(),
            current_pattern_id: None,
        }
    }

    pub fn current_pattern_id(&self) -> Option<&str> {
        self.current_pattern_id.as_deref()
    }

    pub fn failure_map(&self) -> &HashMap<String, HashSet<IssueKind>> {
        &self.failure_map
    }

    pub fn is_failed_for(&self, pattern_id: &str, issue: IssueKind) -> bool {
        self.failure_map
            .get(pattern_id)
            .map(|issues| issues.contains(&issue))
            .unwrap_or(false)
    }

    /// Record that injecting `pattern_id` made `issue` worse; it will be
    /// skipped for that issue from now on.
    pub fn mark_pattern_failed(&mut self, pattern_id: &str, issue: IssueKind) {
        eprintln!("[refine] marking {pattern_id} failed for {}", issue.as_str());
        self.failure_map
            .entry(pattern_id.to_string())
            .or_default()
            .insert(issue);
    }

    /// Advance the dimension cursor to the next eligible pattern.
    ///
    /// Normal mode returns only patterns not used before; `force_next`
    /// (novelty mode) also revisits used ones, still skipping failures.
    pub fn select_pattern(&mut self, issue: IssueKind, force_next: bool) -> Option<Pattern> {
        let ranking = self.ranked.by_issue(issue);
        let mut idx = self.cursors.get(&issue).copied().unwrap_or(0);

        while idx < ranking.len() {
            let candidate = &ranking[idx];
            idx += 1;

            if self.is_failed_for(&candidate.pattern_id, issue) {
                eprintln!(
                    "[refine] skipping {} (failed for {})",
                    candidate.pattern_id,
                    issue.as_str()
                );
                continue;
            }
            if !force_next && self.used.contains(&candidate.pattern_id) {
                continue;
            }

            self.cursors.insert(issue, idx);
            self.used.insert(candidate.pattern_id.clone());
            self.current_pattern_id = Some(candidate.pattern_id.clone());
            eprintln!(
                "[refine] selected {} from {} ranking (position {})",
                candidate.pattern_id,
                issue.as_str(),
                idx
            );
            return Some(candidate.pattern.clone());
        }

        self.cursors.insert(issue, idx);
        None
    }

    /// Traditional injection fallback when fusion is unavailable: distill the
    /// pattern's methodology into injectable instructions.
    pub fn extract_pattern_insights(pattern: &Pattern) -> Vec<String> {
        let mut instructions = Vec::new();

        if let Some(approach) = pattern.summary.solution_approaches.first() {
            instructions.push(format!(
                "[methodology restructuring] follow the core technical route of {}: {}",
                pattern.name,
                clip(approach, 200)
            ));
        }
        if let Some(guide) = pattern.summary.story.first() {
            instructions.push(format!("[packaging strategy] {}", clip(guide, 200)));
        }

        let tech_tricks: Vec<&str> = pattern
            .common_tricks
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|t| t.as_str())
            .filter(|t| {
                let lower = t.to_lowercase();
                !GENERIC_TRICKS.iter().any(|g| lower.contains(g))
            })
            .take(2)
            .collect();
        if !tech_tricks.is_empty() {
            instructions.push(format!(
                "[core techniques] fuse the key techniques of {}: {}",
                pattern.name,
                tech_tricks.join(" + ")
            ));
        }

        if instructions.is_empty() {
            instructions.push(format!(
                "Fuse the core approach of {} and restructure the existing methodology",
                pattern.name
            ));
        }
        instructions
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
    use crate::kg::PatternSummary;
    use crate::selector::{DimensionScores, RankedPattern};

    fn pattern(id: &str) -> Pattern {
        Pattern {
            pattern_id: id.into(),
            name: format!("Pattern {id}"),
            cluster_size: 10,
            domain: "dom".into(),
            sub_domains: vec![],
            summary: PatternSummary::default(),
            skeleton_examples: None,
            common_tricks: None,
            exemplar_paper_ids: vec![],
        }
    }

    fn ranked(ids: &[&str]) -> RankedPatterns {
        let entries: Vec<RankedPattern> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| RankedPattern {
                pattern_id: id.to_string(),
                pattern: pattern(id),
                recall_score: 1.0 - i as f64 * 0.1,
                scores: DimensionScores {
                    stability_score: 0.5,
                    novelty_score: 0.9 - i as f64 * 0.1,
                    domain_distance: 0.2 + i as f64 * 0.1,
                    reasoning: String::new(),
                },
            })
            .collect();
        RankedPatterns {
            stability: entries.clone(),
            novelty: entries.clone(),
            domain_distance: entries,
        }
    }

    #[test]
    fn walks_ranking_without_repeats() {
        let mut engine = RefinementEngine::new(ranked(&["a", "b", "c"]));
        let first = engine.select_pattern(IssueKind::Novelty, false).unwrap();
        let second = engine.select_pattern(IssueKind::Novelty, false).unwrap();
        assert_eq!(first.pattern_id, "a");
        assert_eq!(second.pattern_id, "b");
    }

    #[test]
    fn failed_patterns_are_skipped() {
        let mut engine = RefinementEngine::new(ranked(&["a", "b"]));
        engine.mark_pattern_failed("a", IssueKind::Novelty);
        let picked = engine.select_pattern(IssueKind::Novelty, false).unwrap();
        assert_eq!(picked.pattern_id, "b");
    }

    #[test]
    fn failure_is_per_issue_kind() {
        let mut engine = RefinementEngine::new(ranked(&["a", "b"]));
        engine.mark_pattern_failed("a", IssueKind::Stability);
        assert!(engine.is_failed_for("a", IssueKind::Stability));
        assert!(!engine.is_failed_for("a", IssueKind::Novelty));
        let picked = engine.select_pattern(IssueKind::Novelty, false).unwrap();
        assert_eq!(picked.pattern_id, "a");
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut engine = RefinementEngine::new(ranked(&["a"]));
        assert!(engine.select_pattern(IssueKind::Novelty, false).is_some());
        assert!(engine.select_pattern(IssueKind::Novelty, false).is_none());
    }

    #[test]
    fn insights_fall_back_to_generic_instruction() {
        let p = pattern("x");
        let insights = RefinementEngine::extract_pattern_insights(&p);
        assert_eq!(insights.len(), 1);
        assert!(insights[0].contains("Pattern x"));
    }
}
