//! Anchor selection over real papers with review statistics.
//!
//! Papers are indexed by pattern at startup. Anchor selection is fully
//! deterministic: papers sort by `(score10, paper_id)`, quantile picks index
//! `round(q·(n−1))`, exemplars rank by reliability, and trimming is by weight
//! then score then id. The same KG therefore always yields the same anchor
//! set, which is a precondition for reproducible critic scores.

use std::collections::HashMap;

use serde::Serialize;

use crate::kg::{KgStore, Pattern};
use crate::review::inference::AnchorSummary;

/// One indexed paper with its derived anchor statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PaperAnchor {
    pub paper_id: String,
    pub pattern_id: String,
    pub score10: f64,
    pub review_count: u32,
    pub dispersion10: f64,
    /// `ln(1 + review_count) / (1 + dispersion10)` — reviews raise trust,
    /// reviewer disagreement lowers it.
    pub weight: f64,
}

/// Quantile thresholds for the pass rule.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Quantiles {
    pub n: usize,
    pub q50: Option<f64>,
    pub q75: Option<f64>,
}

/// Read-only index of anchorable papers grouped by pattern.
#[derive(Debug)]
pub struct ReviewIndex {
    by_pattern: HashMap<String, Vec<PaperAnchor>>,
    by_domain: HashMap<String, Vec<PaperAnchor>>,
    by_id: HashMap<String, PaperAnchor>,
    global_scores_sorted: Vec<f64>,
}

impl ReviewIndex {
    pub fn build(kg: &KgStore) -> Self {
        let mut by_pattern: HashMap<String, Vec<PaperAnchor>> = HashMap::new();
        let mut by_domain: HashMap<String, Vec<PaperAnchor>> = HashMap::new();
        let mut by_id = HashMap::new();
        let mut global_scores = Vec::new();

        for paper in kg.papers() {
            let Some(stats) = &paper.review_stats else {
                continue;
            };
            let Some(pattern_id) = &paper.pattern_id else {
                continue;
            };
            let dispersion10 = stats.dispersion10.max(0.0);
            let anchor = PaperAnchor {
                paper_id: paper.paper_id.clone(),
                pattern_id: pattern_id.clone(),
                score10: stats.avg_score10,
                review_count: stats.review_count,
                dispersion10,
                weight: ((1.0 + stats.review_count as f64).ln()) / (1.0 + dispersion10),
            };
            global_scores.push(anchor.score10);
            by_pattern
                .entry(pattern_id.clone())
                .or_default()
                .push(anchor.clone());
            if !paper.domain_id.is_empty() {
                by_domain
                    .entry(paper.domain_id.clone())
                    .or_default()
                    .push(anchor.clone());
            }
            by_id.insert(anchor.paper_id.clone(), anchor);
        }

        for list in by_pattern.values_mut().chain(by_domain.values_mut()) {
            list.sort_by(|a, b| {
                a.score10
                    .partial_cmp(&b.score10)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.paper_id.cmp(&b.paper_id))
            });
        }
        global_scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Self {
            by_pattern,
            by_domain,
            by_id,
            global_scores_sorted: global_scores,
        }
    }

    pub fn pattern_papers(&self, pattern_id: &str) -> &[PaperAnchor] {
        self.by_pattern
            .get(pattern_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn anchor_by_paper_id(&self, paper_id: &str) -> Option<&PaperAnchor> {
        self.by_id.get(paper_id)
    }

    // -- Quantiles ------------------------------------------------------------

    fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
        if sorted.is_empty() {
            return None;
        }
        if sorted.len() == 1 {
            return Some(sorted[0]);
        }
        let idx = (q * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn pattern_quantiles(&self, pattern_id: &str) -> Quantiles {
        let scores: Vec<f64> = self
            .pattern_papers(pattern_id)
            .iter()
            .map(|p| p.score10)
            .collect();
        Quantiles {
            n: scores.len(),
            q50: Self::quantile(&scores, 0.5),
            q75: Self::quantile(&scores, 0.75),
        }
    }

    pub fn global_quantiles(&self) -> Quantiles {
        Quantiles {
            n: self.global_scores_sorted.len(),
            q50: Self::quantile(&self.global_scores_sorted, 0.5),
            q75: Self::quantile(&self.global_scores_sorted, 0.75),
        }
    }

    // -- Anchor selection -----------------------------------------------------

    fn quantile_anchors<'a>(papers: &'a [PaperAnchor], quantiles: &[f64]) -> Vec<&'a PaperAnchor> {
        if papers.is_empty() {
            return Vec::new();
        }
        if papers.len() <= quantiles.len() {
            return papers.iter().collect();
        }
        quantiles
            .iter()
            .map(|&q| {
                let idx = (q * (papers.len() - 1) as f64).round() as usize;
                &papers[idx.min(papers.len() - 1)]
            })
            .collect()
    }

    fn dedupe(anchors: Vec<&PaperAnchor>) -> Vec<&PaperAnchor> {
        let mut seen = std::collections::HashSet::new();
        anchors
            .into_iter()
            .filter(|a| seen.insert(a.paper_id.clone()))
            .collect()
    }

    /// Select the initial anchor set for a pattern: quantile anchors, plus up
    /// to `max_exemplars` exemplar papers by reliability, trimmed to
    /// `max_initial`. Fewer than 3 usable anchors widens to the pattern's
    /// whole domain.
    pub fn select_initial_anchors(
        &self,
        pattern: &Pattern,
        quantiles: &[f64],
        max_initial: usize,
        max_exemplars: usize,
    ) -> Vec<PaperAnchor> {
        let papers = self.pattern_papers(&pattern.pattern_id);
        let mut anchors = Self::dedupe(Self::quantile_anchors(papers, quantiles));

        // Exemplars: pattern-designated representative papers, most reliable
        // first.
        let anchor_ids: std::collections::HashSet<String> =
            anchors.iter().map(|a| a.paper_id.clone()).collect();
        let mut exemplars: Vec<&PaperAnchor> = pattern
            .exemplar_paper_ids
            .iter()
            .filter_map(|pid| self.by_id.get(pid))
            .filter(|a| !anchor_ids.contains(&a.paper_id))
            .collect();
        exemplars.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.review_count.cmp(&a.review_count))
                .then_with(|| a.paper_id.cmp(&b.paper_id))
        });
        anchors.extend(exemplars.into_iter().take(max_exemplars));
        let mut anchors = Self::dedupe(anchors);

        // Too thin for calibrated comparison: widen to the domain.
        if anchors.len() < 3 {
            if let Some(domain_papers) = self.by_domain.get(&pattern.domain) {
                anchors = Self::dedupe(Self::quantile_anchors(domain_papers, quantiles));
            }
        }

        if anchors.len() > max_initial {
            anchors.sort_by(|a, b| {
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        a.score10
                            .partial_cmp(&b.score10)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.paper_id.cmp(&b.paper_id))
            });
            anchors.truncate(max_initial);
        }

        anchors.into_iter().cloned().collect()
    }

    /// Densify: pick up to `count` papers whose score falls inside the bucket
    /// around `center`, closest to the center first, skipping already
    /// selected ids.
    pub fn select_bucket_anchors(
        &self,
        pattern_id: &str,
        center: f64,
        bucket_size: f64,
        count: usize,
        exclude: &std::collections::HashSet<String>,
    ) -> Vec<PaperAnchor> {
        let half = bucket_size / 2.0;
        let mut candidates: Vec<&PaperAnchor> = self
            .pattern_papers(pattern_id)
            .iter()
            .filter(|p| !exclude.contains(&p.paper_id))
            .filter(|p| (p.score10 - center).abs() <= half + 1e-9)
            .collect();
        candidates.sort_by(|a, b| {
            let da = (a.score10 - center).abs();
            let db = (b.score10 - center).abs();
            da.partial_cmp(&db)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.weight
                        .partial_cmp(&a.weight)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.paper_id.cmp(&b.paper_id))
        });
        candidates.into_iter().take(count).cloned().collect()
    }
}

/// Alias anchors `A1..AK` in score10-ascending order (ties by paper id) so
/// replays reproduce the exact prompt.
pub fn alias_anchors(mut anchors: Vec<PaperAnchor>) -> (Vec<AnchorSummary>, Vec<PaperAnchor>) {
    anchors.sort_by(|a, b| {
        a.score10
            .partial_cmp(&b.score10)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.paper_id.cmp(&b.paper_id))
    });
    let summaries = anchors
        .iter()
        .enumerate()
        .map(|(i, a)| AnchorSummary {
            anchor_id: format!("A{}", i + 1),
            paper_id: a.paper_id.clone(),
            score10: a.score10,
            weight: a.weight,
        })
        .collect();
    (summaries, anchors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kg::{Paper, PatternSummary, ReviewStats};

    fn paper(id: &str, pattern: &str, score: f64, reviews: u32, dispersion: f64) -> Paper {
        Paper {
            paper_id: id.into(),
            title: format!("Paper {id}"),
            pattern_id: Some(pattern.into()),
            domain_id: "dom_1".into(),
            review_stats: Some(ReviewStats {
                avg_score10: score,
                review_count: reviews,
                dispersion10: dispersion,
            }),
            skeleton: None,
            abstract_text: None,
        }
    }

    fn kg(papers: Vec<Paper>) -> KgStore {
        KgStore::from_parts(vec![], vec![], vec![], papers, vec![]).unwrap()
    }

    fn test_pattern(id: &str) -> Pattern {
        Pattern {
            pattern_id: id.into(),
            name: "P".into(),
            cluster_size: 10,
            domain: "dom_1".into(),
            sub_domains: vec![],
            summary: PatternSummary::default(),
            skeleton_examples: None,
            common_tricks: None,
            exemplar_paper_ids: vec![],
        }
    }

    #[test]
    fn weight_formula() {
        let store = kg(vec![paper("p1", "pat", 6.0, 9, 1.0)]);
        let index = ReviewIndex::build(&store);
        let anchor = index.anchor_by_paper_id("p1").unwrap();
        let expected = (10.0f64).ln() / 2.0;
        assert!((anchor.weight - expected).abs() < 1e-9);
    }

    #[test]
    fn papers_without_stats_are_skipped() {
        let mut no_stats = paper("p2", "pat", 5.0, 1, 0.0);
        no_stats.review_stats = None;
        let store = kg(vec![paper("p1", "pat", 6.0, 4, 1.0), no_stats]);
        let index = ReviewIndex::build(&store);
        assert_eq!(index.pattern_papers("pat").len(), 1);
    }

    #[test]
    fn quantile_selection_is_deterministic() {
        let papers: Vec<Paper> = (0..20)
            .map(|i| paper(&format!("p{i:02}"), "pat", 1.0 + 0.45 * i as f64, 3, 0.5))
            .collect();
        let index = ReviewIndex::build(&kg(papers));
        let a1 = index.select_initial_anchors(&test_pattern("pat"), &[0.25, 0.5, 0.75], 11, 2);
        let a2 = index.select_initial_anchors(&test_pattern("pat"), &[0.25, 0.5, 0.75], 11, 2);
        let ids1: Vec<&str> = a1.iter().map(|a| a.paper_id.as_str()).collect();
        let ids2: Vec<&str> = a2.iter().map(|a| a.paper_id.as_str()).collect();
        assert_eq!(ids1, ids2);
        assert_eq!(ids1.len(), 3);
    }

    #[test]
    fn thin_cluster_widens_to_domain() {
        let mut papers = vec![paper("thin1", "pat_thin", 5.0, 3, 0.5)];
        for i in 0..10 {
            papers.push(paper(&format!("dom{i}"), "pat_other", 3.0 + i as f64 * 0.5, 3, 0.5));
        }
        let index = ReviewIndex::build(&kg(papers));
        let anchors =
            index.select_initial_anchors(&test_pattern("pat_thin"), &[0.25, 0.5, 0.75], 11, 2);
        assert!(anchors.len() >= 3, "expected domain widening, got {}", anchors.len());
    }

    #[test]
    fn aliasing_sorts_by_score_ascending() {
        let store = kg(vec![
            paper("pz", "pat", 8.0, 3, 0.5),
            paper("pa", "pat", 4.0, 3, 0.5),
            paper("pm", "pat", 6.0, 3, 0.5),
        ]);
        let index = ReviewIndex::build(&store);
        let anchors = index.pattern_papers("pat").to_vec();
        let (summaries, _) = alias_anchors(anchors);
        assert_eq!(summaries[0].anchor_id, "A1");
        assert_eq!(summaries[0].paper_id, "pa");
        assert_eq!(summaries[2].paper_id, "pz");
    }

    #[test]
    fn bucket_anchors_respect_exclusions() {
        let papers: Vec<Paper> = (0..10)
            .map(|i| paper(&format!("p{i}"), "pat", 5.0 + 0.2 * i as f64, 3, 0.5))
            .collect();
        let index = ReviewIndex::build(&kg(papers));
        let mut exclude = std::collections::HashSet::new();
        exclude.insert("p5".to_string());
        let picked = index.select_bucket_anchors("pat", 6.0, 1.0, 3, &exclude);
        assert!(picked.iter().all(|p| p.paper_id != "p5"));
        assert!(picked.len() <= 3);
        assert!(picked.iter().all(|p| (p.score10 - 6.0).abs() <= 0.5 + 1e-9));
    }

    #[test]
    fn pattern_quantiles_need_papers() {
        let index = ReviewIndex::build(&kg(vec![]));
        let q = index.pattern_quantiles("missing");
        assert_eq!(q.n, 0);
        assert!(q.q50.is_none());
    }
}
