//! Novelty check against the recent-conference corpus, and pivot
//! constraints when a collision is found.
//!
//! On a critic pass the story is scanned against the novelty vector index.
//! Cosine over embeddings when available; silently degrades to keyword
//! overlap when not (recorded in the report, and `pivot` policy downgrades
//! to report-only since keyword overlap is too coarse to justify a rewrite).

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{Config, NoveltyAction};
use crate::error::CancelFlag;
use crate::gateway::{Attribution, EmbedRequest, EmbeddingGateway};
use crate::index::VectorIndex;
use crate::kg::KgStore;
use crate::recall::jaccard;
use crate::story::Story;

// =============================================================================
// Report types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoveltyCandidate {
    pub paper_id: String,
    pub title: String,
    #[serde(default)]
    pub pattern_id: String,
    #[serde(default)]
    pub domain: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoveltyReport {
    pub embedding_available: bool,
    /// "cosine" | "keyword_overlap"
    pub metric: String,
    pub max_similarity: f64,
    pub risk_level: RiskLevel,
    pub candidates: Vec<NoveltyCandidate>,
    pub method_keywords: Vec<String>,
    #[serde(default)]
    pub pivot_attempts: u32,
    #[serde(default)]
    pub action: Option<String>,
}

/// Verification view of a novelty report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub pass: bool,
    pub collision_detected: bool,
    pub similar_papers: Vec<NoveltyCandidate>,
    pub max_similarity: f64,
    pub metric: String,
    pub threshold: f64,
    #[serde(default)]
    pub skipped: bool,
}

impl VerificationResult {
    pub fn skipped(threshold: f64) -> Self {
        Self {
            pass: true,
            collision_detected: false,
            similar_papers: Vec::new(),
            max_similarity: 0.0,
            metric: "disabled".to_string(),
            threshold,
            skipped: true,
        }
    }
}

/// Constraints injected into regeneration after a collision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PivotConstraints {
    pub forbidden_techniques: Vec<String>,
    pub pivot_direction: String,
    pub domain_shift: String,
}

impl PivotConstraints {
    /// Render as generation constraint lines.
    pub fn as_constraints(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.forbidden_techniques.is_empty() {
            out.push(format!(
                "Do not rely on these core techniques, which collide with prior work: {}",
                self.forbidden_techniques.join("; ")
            ));
        }
        out.push(self.pivot_direction.clone());
        out.push(self.domain_shift.clone());
        out
    }
}

// =============================================================================
// Checker
// =============================================================================

pub struct NoveltyChecker {
    kg: Arc<KgStore>,
    index: Option<Arc<VectorIndex>>,
}

impl NoveltyChecker {
    pub fn new(kg: Arc<KgStore>, index: Option<Arc<VectorIndex>>) -> Self {
        Self { kg, index }
    }

    /// Scan the story against the novelty corpus.
    pub async fn check(
        &self,
        story: &Story,
        gateway: &dyn EmbeddingGateway,
        cfg: &Config,
        cancel: &CancelFlag,
        attribution: Attribution,
    ) -> NoveltyReport {
        let method_keywords = extract_method_keywords(&story.method_skeleton);
        let story_text = format!("{}. {}", story.title, story.abstract_text);

        if cancel.is_cancelled() {
            return empty_report(method_keywords, false);
        }

        // Embedding path.
        if let Some(index) = &self.index {
            match gateway
                .embed(EmbedRequest::single(
                    String::new(),
                    story_text.clone(),
                    attribution,
                ))
                .await
            {
                Ok(resp) => {
                    if let Some(query) = resp.embeddings.into_iter().next() {
                        let hits = index.search(&query, cfg.novelty_top_k);
                        return self.report_from_hits(hits, method_keywords, cfg);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "novelty embedding failed; keyword fallback");
                }
            }
        }

        // Keyword-overlap fallback over the paper corpus.
        let mut scored: Vec<NoveltyCandidate> = self
            .kg
            .papers()
            .iter()
            .map(|paper| {
                let candidate_text = match &paper.abstract_text {
                    Some(abs) => format!("{}. {abs}", paper.title),
                    None => paper.title.clone(),
                };
                NoveltyCandidate {
                    paper_id: paper.paper_id.clone(),
                    title: paper.title.clone(),
                    pattern_id: paper.pattern_id.clone().unwrap_or_default(),
                    domain: paper.domain_id.clone(),
                    similarity: jaccard(&story_text, &candidate_text),
                }
            })
            .filter(|c| c.similarity > 0.0)
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.paper_id.cmp(&b.paper_id))
        });
        scored.truncate(cfg.novelty_top_k);

        let max_similarity = scored.first().map(|c| c.similarity).unwrap_or(0.0);
        NoveltyReport {
            embedding_available: false,
            metric: "keyword_overlap".to_string(),
            max_similarity,
            risk_level: risk_level(max_similarity, cfg.collision_threshold),
            candidates: scored,
            method_keywords,
            pivot_attempts: 0,
            action: None,
        }
    }

    fn report_from_hits(
        &self,
        hits: Vec<(String, f32)>,
        method_keywords: Vec<String>,
        cfg: &Config,
    ) -> NoveltyReport {
        let candidates: Vec<NoveltyCandidate> = hits
            .into_iter()
            .map(|(paper_id, sim)| {
                let paper = self.kg.paper_by_id(&paper_id);
                NoveltyCandidate {
                    title: paper.map(|p| p.title.clone()).unwrap_or_default(),
                    pattern_id: paper
                        .and_then(|p| p.pattern_id.clone())
                        .unwrap_or_default(),
                    domain: paper.map(|p| p.domain_id.clone()).unwrap_or_default(),
                    paper_id,
                    similarity: sim as f64,
                }
            })
            .collect();

        let max_similarity = candidates
            .iter()
            .map(|c| c.similarity)
            .fold(0.0f64, f64::max);

        NoveltyReport {
            embedding_available: true,
            metric: "cosine".to_string(),
            max_similarity,
            risk_level: risk_level(max_similarity, cfg.collision_threshold),
            candidates,
            method_keywords,
            pivot_attempts: 0,
            action: None,
        }
    }

    /// Pivot constraints against the top colliding paper: its methods become
    /// forbidden techniques, and the story gets pushed toward a new angle.
    pub fn pivot_constraints(&self, report: &NoveltyReport) -> PivotConstraints {
        let forbidden_techniques = report
            .candidates
            .first()
            .map(|top| {
                self.kg
                    .paper_by_id(&top.paper_id)
                    .and_then(|p| p.skeleton.as_ref())
                    .map(|sk| {
                        sk.method
                            .split(';')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .take(4)
                            .collect::<Vec<_>>()
                    })
                    .filter(|methods| !methods.is_empty())
                    .unwrap_or_else(|| vec![format!("the core technique combination of \"{}\"", top.title)])
            })
            .unwrap_or_default();

        PivotConstraints {
            forbidden_techniques,
            pivot_direction:
                "Shift the core contribution to a different mechanism or problem formulation than the colliding work"
                    .to_string(),
            domain_shift:
                "Move the application setting to a different domain or add a distinguishing constraint (e.g. unsupervised, few-shot)"
                    .to_string(),
        }
    }
}

/// Normalize a novelty report into a verification decision.
pub fn verification_from_report(
    report: Option<&NoveltyReport>,
    collision_threshold: f64,
) -> VerificationResult {
    let Some(report) = report else {
        return VerificationResult {
            pass: true,
            collision_detected: false,
            similar_papers: Vec::new(),
            max_similarity: 0.0,
            metric: "unknown".to_string(),
            threshold: collision_threshold,
            skipped: false,
        };
    };

    let collision_detected = report.max_similarity > collision_threshold;
    VerificationResult {
        pass: !collision_detected,
        collision_detected,
        similar_papers: report.candidates.iter().take(3).cloned().collect(),
        max_similarity: report.max_similarity,
        metric: report.metric.clone(),
        threshold: collision_threshold,
        skipped: false,
    }
}

/// Effective action given embedding availability: keyword overlap is too
/// coarse to justify an automatic pivot.
pub fn effective_action(report: &NoveltyReport, configured: NoveltyAction) -> NoveltyAction {
    if !report.embedding_available && configured == NoveltyAction::Pivot {
        NoveltyAction::ReportOnly
    } else {
        configured
    }
}

fn risk_level(max_similarity: f64, threshold: f64) -> RiskLevel {
    if max_similarity > threshold {
        RiskLevel::High
    } else if max_similarity > threshold * 0.8 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn empty_report(method_keywords: Vec<String>, embedding_available: bool) -> NoveltyReport {
    NoveltyReport {
        embedding_available,
        metric: if embedding_available {
            "cosine".to_string()
        } else {
            "keyword_overlap".to_string()
        },
        max_similarity: 0.0,
        risk_level: RiskLevel::Low,
        candidates: Vec::new(),
        method_keywords,
        pivot_attempts: 0,
        action: None,
    }
}

/// Tokenize the method skeleton into distinct lowercase keywords, dropping
/// connective stopwords.
pub fn extract_method_keywords(method_skeleton: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "a", "an", "the", "and", "or", "of", "to", "in", "on", "for", "with", "by", "via",
        "using", "use", "step", "then", "into", "from", "that", "this", "is", "are", "we",
        "our", "its", "as", "at", "be",
    ];
    let mut seen = HashSet::new();
    method_skeleton
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_skip_stopwords_and_dupes() {
        let kw = extract_method_keywords(
            "Step 1: Build the contrastive graph; Step 2: Train with the contrastive loss",
        );
        assert!(kw.contains(&"contrastive".to_string()));
        assert!(kw.contains(&"graph".to_string()));
        assert!(!kw.contains(&"the".to_string()));
        assert_eq!(kw.iter().filter(|k| *k == "contrastive").count(), 1);
    }

    #[test]
    fn risk_levels_bracket_threshold() {
        assert_eq!(risk_level(0.8, 0.75), RiskLevel::High);
        assert_eq!(risk_level(0.65, 0.75), RiskLevel::Medium);
        assert_eq!(risk_level(0.2, 0.75), RiskLevel::Low);
    }

    #[test]
    fn verification_collides_above_threshold() {
        let report = NoveltyReport {
            embedding_available: true,
            metric: "cosine".to_string(),
            max_similarity: 0.82,
            risk_level: RiskLevel::High,
            candidates: vec![NoveltyCandidate {
                paper_id: "p1".into(),
                title: "Colliding Work".into(),
                pattern_id: String::new(),
                domain: String::new(),
                similarity: 0.82,
            }],
            method_keywords: vec![],
            pivot_attempts: 0,
            action: None,
        };
        let verification = verification_from_report(Some(&report), 0.75);
        assert!(verification.collision_detected);
        assert!(!verification.pass);
        assert_eq!(verification.similar_papers.len(), 1);
    }

    #[test]
    fn keyword_metric_downgrades_pivot() {
        let mut report = empty_report(vec![], false);
        report.max_similarity = 0.9;
        assert_eq!(
            effective_action(&report, NoveltyAction::Pivot),
            NoveltyAction::ReportOnly
        );
        assert_eq!(
            effective_action(&report, NoveltyAction::Fail),
            NoveltyAction::Fail
        );
    }
}
