//! Three-path fused recall over the knowledge graph.
//!
//! Path 1 walks similar Ideas (Jaccard coarse → embedding fine), path 2 walks
//! Domains through `works_well_in` edges, path 3 walks similar Papers through
//! `uses_pattern` edges. Each path produces `PatternId → f64`; fusion min-max
//! normalizes (configurable) and blends with fixed weights. Every decision is
//! captured in a [`RecallAudit`] so a run can be replayed from its log alone.
//!
//! Embedding outages never fail recall: affected paths degrade to their
//! lexical stage and the audit records the degradation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::gateway::{Attribution, EmbedRequest, EmbeddingGateway};
use crate::index::{cosine, VectorIndex};
use crate::kg::{KgStore, Pattern, Relation};

// =============================================================================
// Results & audit
// =============================================================================

/// One recalled pattern with its fused score.
#[derive(Debug, Clone)]
pub struct RecalledPattern {
    pub pattern_id: String,
    pub pattern: Pattern,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathOneAudit {
    /// (idea_id, similarity) for the surviving fine-stage ideas.
    pub top_ideas: Vec<(String, f64)>,
    /// Per-pattern contribution totals.
    pub contributions: HashMap<String, f64>,
    /// True when the fine stage fell back to Jaccard scores.
    pub degraded_to_jaccard: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathTwoAudit {
    pub top_domains: Vec<(String, f64)>,
    pub top_sub_domains: Vec<(String, f64)>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathThreeAudit {
    pub top_papers: Vec<(String, f64)>,
    pub degraded_to_jaccard: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedEntry {
    pub pattern_id: String,
    pub final_score: f64,
    pub path1: f64,
    pub path2: f64,
    pub path3: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallAudit {
    pub path1: PathOneAudit,
    pub path2: PathTwoAudit,
    pub path3: PathThreeAudit,
    pub final_top_k: Vec<FusedEntry>,
    /// Set when the candidate set came out empty.
    pub empty_reason: Option<String>,
    pub normalized: bool,
}

// =============================================================================
// Engine
// =============================================================================

pub struct RecallEngine {
    kg: Arc<KgStore>,
    idea_index: Option<Arc<VectorIndex>>,
    paper_index: Option<Arc<VectorIndex>>,
}

impl RecallEngine {
    pub fn new(
        kg: Arc<KgStore>,
        idea_index: Option<Arc<VectorIndex>>,
        paper_index: Option<Arc<VectorIndex>>,
    ) -> Self {
        Self {
            kg,
            idea_index,
            paper_index,
        }
    }

    /// Run all three paths and fuse. Returns at most `FINAL_TOP_K` patterns,
    /// unique, with non-negative scores, ranked descending.
    pub async fn recall(
        &self,
        user_idea: &str,
        gateway: &dyn EmbeddingGateway,
        cfg: &Config,
        attribution: Attribution,
    ) -> (Vec<RecalledPattern>, RecallAudit) {
        let mut audit = RecallAudit {
            normalized: cfg.recall_normalize,
            ..Default::default()
        };

        let query_vec = self.embed_query(user_idea, gateway, attribution.clone()).await;

        let path1 = self.path_similar_ideas(user_idea, query_vec.as_deref(), cfg, &mut audit.path1);
        let path2 = self
            .path_domains(user_idea, query_vec.as_deref(), gateway, cfg, attribution, &mut audit.path2)
            .await;
        let path3 = self.path_similar_papers(user_idea, query_vec.as_deref(), cfg, &mut audit.path3);

        let fused = fuse_paths(
            &path1,
            &path2,
            &path3,
            cfg.recall_idea_weight,
            cfg.recall_domain_weight,
            cfg.recall_paper_weight,
            cfg.recall_normalize,
        );

        let mut entries: Vec<FusedEntry> = fused
            .into_iter()
            .map(|(pattern_id, (final_score, p1, p2, p3))| FusedEntry {
                pattern_id,
                final_score,
                path1: p1,
                path2: p2,
                path3: p3,
            })
            .collect();
        entries.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });
        entries.truncate(cfg.final_top_k);

        if entries.is_empty() {
            audit.empty_reason = Some("no path produced any candidate pattern".to_string());
        }
        audit.final_top_k = entries.clone();

        let recalled = entries
            .into_iter()
            .filter_map(|e| {
                self.kg.pattern_by_id(&e.pattern_id).map(|p| RecalledPattern {
                    pattern_id: e.pattern_id,
                    pattern: p.clone(),
                    score: e.final_score,
                })
            })
            .collect();

        (recalled, audit)
    }

    async fn embed_query(
        &self,
        user_idea: &str,
        gateway: &dyn EmbeddingGateway,
        attribution: Attribution,
    ) -> Option<Vec<f32>> {
        match gateway
            .embed(EmbedRequest::single(
                String::new(),
                user_idea.to_string(),
                attribution,
            ))
            .await
        {
            Ok(resp) => resp.embeddings.into_iter().next(),
            Err(err) => {
                tracing::warn!(error = %err, "query embedding failed; recall degrades to lexical paths");
                None
            }
        }
    }

    // -- Path 1: similar ideas ------------------------------------------------

    fn path_similar_ideas(
        &self,
        user_idea: &str,
        query_vec: Option<&[f32]>,
        cfg: &Config,
        audit: &mut PathOneAudit,
    ) -> HashMap<String, f64> {
        // Coarse stage: lexical Jaccard over every idea description.
        let mut coarse: Vec<(usize, f64)> = self
            .kg
            .ideas()
            .iter()
            .enumerate()
            .map(|(i, idea)| (i, jaccard(user_idea, &idea.description)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        coarse.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        coarse.truncate(cfg.coarse_recall_size);

        // Fine stage: cosine over the prebuilt idea index, restricted to the
        // coarse survivors. Missing vectors or a failed query embedding fall
        // back to the coarse Jaccard scores.
        let mut fine: Vec<(usize, f64)> = Vec::with_capacity(coarse.len());
        let mut degraded = false;
        match (query_vec, &self.idea_index) {
            (Some(query), Some(index)) => {
                for &(i, coarse_score) in &coarse {
                    let idea = &self.kg.ideas()[i];
                    match index.vector(&idea.idea_id) {
                        Some(vec) => fine.push((i, cosine(query, vec) as f64)),
                        None => fine.push((i, coarse_score)),
                    }
                }
            }
            _ => {
                degraded = true;
                fine = coarse.clone();
            }
        }
        fine.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        fine.truncate(cfg.fine_recall_size);

        let mut scores: HashMap<String, f64> = HashMap::new();
        for &(i, sim) in &fine {
            let idea = &self.kg.ideas()[i];
            audit.top_ideas.push((idea.idea_id.clone(), sim));
            if sim <= 0.0 {
                continue;
            }
            for pattern_id in &idea.pattern_ids {
                *scores.entry(pattern_id.clone()).or_default() += sim;
            }
        }
        audit.degraded_to_jaccard = degraded;
        audit.contributions = scores.clone();
        scores
    }

    // -- Path 2: domains ------------------------------------------------------

    async fn path_domains(
        &self,
        user_idea: &str,
        query_vec: Option<&[f32]>,
        gateway: &dyn EmbeddingGateway,
        cfg: &Config,
        attribution: Attribution,
        audit: &mut PathTwoAudit,
    ) -> HashMap<String, f64> {
        let Some(query) = query_vec else {
            audit.degraded = true;
            return HashMap::new();
        };

        // Build per-domain text: name + compressed sub-domain pool (cap 50).
        let domains = self.kg.domains();
        if domains.is_empty() {
            return HashMap::new();
        }
        let domain_texts: Vec<String> = domains
            .iter()
            .map(|d| {
                let subs: Vec<&str> = d
                    .sub_domains
                    .iter()
                    .take(50)
                    .map(|s| s.as_str())
                    .collect();
                if subs.is_empty() {
                    d.name.clone()
                } else {
                    format!("{} | {}", d.name, subs.join(" | "))
                }
            })
            .collect();

        let domain_vecs = match gateway
            .embed(EmbedRequest::new(
                String::new(),
                domain_texts,
                attribution.clone(),
            ))
            .await
        {
            Ok(resp) => resp.embeddings,
            Err(err) => {
                tracing::warn!(error = %err, "domain embedding failed; domain path skipped");
                audit.degraded = true;
                return HashMap::new();
            }
        };

        let mut ranked: Vec<(usize, f64)> = domain_vecs
            .iter()
            .enumerate()
            .map(|(i, vec)| (i, cosine(query, vec) as f64))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(cfg.recall_top_domains);

        // Sub-domain matching inside the selected domains.
        let sub_texts: Vec<(usize, String)> = ranked
            .iter()
            .flat_map(|&(i, _)| {
                domains[i]
                    .sub_domains
                    .iter()
                    .map(move |s| (i, s.clone()))
            })
            .collect();
        let mut sub_sims: HashMap<usize, (String, f64)> = HashMap::new();
        if !sub_texts.is_empty() {
            match gateway
                .embed(EmbedRequest::new(
                    String::new(),
                    sub_texts.iter().map(|(_, s)| s.clone()).collect(),
                    attribution,
                ))
                .await
            {
                Ok(resp) => {
                    for ((domain_idx, name), vec) in sub_texts.iter().zip(&resp.embeddings) {
                        let sim = cosine(query, vec) as f64;
                        let entry = sub_sims
                            .entry(*domain_idx)
                            .or_insert_with(|| (name.clone(), sim));
                        if sim > entry.1 {
                            *entry = (name.clone(), sim);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "sub-domain embedding failed; boost skipped");
                }
            }
        }

        let mut scores: HashMap<String, f64> = HashMap::new();
        for &(i, domain_weight) in &ranked {
            let domain = &domains[i];
            audit.top_domains.push((domain.domain_id.clone(), domain_weight));
            if domain_weight <= 0.0 {
                continue;
            }

            let (best_sub, max_sub_sim) = sub_sims
                .get(&i)
                .cloned()
                .unwrap_or((String::new(), 0.0));
            if !best_sub.is_empty() {
                audit.top_sub_domains.push((best_sub.clone(), max_sub_sim));
            }

            for (pattern_id, attrs) in self.kg.incoming(&domain.domain_id, Relation::WorksWellIn) {
                // Sub-domain hit narrows candidates to patterns tagged with it.
                if !best_sub.is_empty() && max_sub_sim > 0.0 {
                    let tagged = self
                        .kg
                        .pattern_by_id(pattern_id)
                        .map(|p| p.sub_domains.iter().any(|s| s == &best_sub))
                        .unwrap_or(false);
                    if !tagged {
                        continue;
                    }
                }
                let effectiveness = attrs.effectiveness.unwrap_or(0.0).max(0.1);
                let confidence = attrs.confidence.unwrap_or(0.0);
                let boost = 1.0 + cfg.recall_subdomain_boost * max_sub_sim;
                *scores.entry(pattern_id.to_string()).or_default() +=
                    domain_weight * effectiveness * confidence * boost;
            }
        }
        scores
    }

    // -- Path 3: similar papers -----------------------------------------------

    fn path_similar_papers(
        &self,
        user_idea: &str,
        query_vec: Option<&[f32]>,
        cfg: &Config,
        audit: &mut PathThreeAudit,
    ) -> HashMap<String, f64> {
        let mut coarse: Vec<(usize, f64)> = self
            .kg
            .papers()
            .iter()
            .enumerate()
            .map(|(i, paper)| (i, jaccard(user_idea, &paper.title)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        coarse.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        coarse.truncate(cfg.coarse_recall_size);

        let mut fine: Vec<(usize, f64)> = Vec::with_capacity(coarse.len());
        let mut degraded = false;
        match (query_vec, &self.paper_index) {
            (Some(query), Some(index)) => {
                for &(i, coarse_score) in &coarse {
                    let paper = &self.kg.papers()[i];
                    match index.vector(&paper.paper_id) {
                        Some(vec) => fine.push((i, cosine(query, vec) as f64)),
                        None => fine.push((i, coarse_score)),
                    }
                }
            }
            _ => {
                degraded = true;
                fine = coarse.clone();
            }
        }
        fine.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        fine.truncate(cfg.fine_recall_size);

        let mut scores: HashMap<String, f64> = HashMap::new();
        for &(i, sim) in &fine {
            let paper = &self.kg.papers()[i];
            audit.top_papers.push((paper.paper_id.clone(), sim));
            if sim <= 0.0 {
                continue;
            }
            // Missing review stats fall back to neutral quality.
            let quality = paper
                .review_stats
                .as_ref()
                .map(|s| s.avg_score10 / 10.0)
                .unwrap_or(0.5);
            for (pattern_id, attrs) in self.kg.neighbors(&paper.paper_id, Relation::UsesPattern) {
                let edge_quality = attrs.quality.unwrap_or(0.0);
                *scores.entry(pattern_id.to_string()).or_default() +=
                    sim * quality * edge_quality;
            }
        }
        audit.degraded_to_jaccard = degraded;
        scores
    }
}

// =============================================================================
// Pure helpers
// =============================================================================

/// Jaccard similarity of whitespace-lowercased token sets.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let ta: HashSet<&str> = a.split_whitespace().collect();
    let tb: HashSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let a_lower: HashSet<String> = ta.iter().map(|t| t.to_lowercase()).collect();
    let b_lower: HashSet<String> = tb.iter().map(|t| t.to_lowercase()).collect();
    let intersection = a_lower.intersection(&b_lower).count();
    let union = a_lower.union(&b_lower).count();
    intersection as f64 / union as f64
}

/// Min-max normalize a score map in place; a constant map collapses to 1.0.
fn normalize(scores: &HashMap<String, f64>) -> HashMap<String, f64> {
    if scores.is_empty() {
        return HashMap::new();
    }
    let min = scores.values().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.values().cloned().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    scores
        .iter()
        .map(|(k, &v)| {
            let n = if range > 0.0 { (v - min) / range } else { 1.0 };
            (k.clone(), n)
        })
        .collect()
}

type Fused = HashMap<String, (f64, f64, f64, f64)>;

fn fuse_paths(
    path1: &HashMap<String, f64>,
    path2: &HashMap<String, f64>,
    path3: &HashMap<String, f64>,
    w1: f64,
    w2: f64,
    w3: f64,
    normalize_paths: bool,
) -> Fused {
    let (n1, n2, n3) = if normalize_paths {
        (normalize(path1), normalize(path2), normalize(path3))
    } else {
        (path1.clone(), path2.clone(), path3.clone())
    };

    let mut ids: HashSet<&String> = HashSet::new();
    ids.extend(n1.keys());
    ids.extend(n2.keys());
    ids.extend(n3.keys());

    ids.into_iter()
        .map(|id| {
            let p1 = n1.get(id).copied().unwrap_or(0.0);
            let p2 = n2.get(id).copied().unwrap_or(0.0);
            let p3 = n3.get(id).copied().unwrap_or(0.0);
            (id.clone(), (w1 * p1 + w2 * p2 + w3 * p3, p1, p2, p3))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jaccard_is_case_insensitive() {
        assert!((jaccard("Graph Neural Networks", "graph neural networks") - 1.0).abs() < 1e-9);
        assert_eq!(jaccard("", "anything"), 0.0);
        let partial = jaccard("reinforcement learning for inference", "reinforcement learning");
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[test]
    fn normalize_collapses_constant_maps() {
        let mut scores = HashMap::new();
        scores.insert("a".to_string(), 2.0);
        scores.insert("b".to_string(), 2.0);
        let n = normalize(&scores);
        assert_eq!(n["a"], 1.0);
        assert_eq!(n["b"], 1.0);
    }

    #[test]
    fn fusion_weights_apply() {
        let mut p1 = HashMap::new();
        p1.insert("x".to_string(), 1.0);
        let mut p3 = HashMap::new();
        p3.insert("x".to_string(), 1.0);
        p3.insert("y".to_string(), 0.0);
        let fused = fuse_paths(&p1, &HashMap::new(), &p3, 0.4, 0.2, 0.4, false);
        let (total, ..) = fused["x"];
        assert!((total - 0.8).abs() < 1e-9);
        assert!(fused.contains_key("y"));
    }
}
