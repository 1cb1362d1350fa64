//! Read-only knowledge-graph store.
//!
//! All entities and edges are loaded once at process start from the
//! `output/` artifacts produced by the KG-construction toolchain, then shared
//! immutably. The graph is held as four node arrays plus typed adjacency
//! maps keyed by node id — no back-pointers, so Idea ↔ Pattern ↔ Paper cycles
//! cannot form ownership loops.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Node types
// =============================================================================

/// A historical research idea mined from prior papers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Idea {
    pub idea_id: String,
    pub description: String,
    #[serde(default)]
    pub pattern_ids: Vec<String>,
}

/// LLM-enhanced cluster summary attached to a pattern.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PatternSummary {
    #[serde(default)]
    pub representative_ideas: Vec<String>,
    #[serde(default)]
    pub common_problems: Vec<String>,
    #[serde(default)]
    pub solution_approaches: Vec<String>,
    #[serde(default)]
    pub story: Vec<String>,
}

/// A storytelling example mined from one paper in the cluster.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SkeletonExample {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub problem_framing: String,
    #[serde(default)]
    pub gap_pattern: String,
    #[serde(default)]
    pub method_story: String,
}

/// A research-trope template: the cluster summary of prior papers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Pattern {
    pub pattern_id: String,
    pub name: String,
    #[serde(default)]
    pub cluster_size: usize,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub sub_domains: Vec<String>,
    #[serde(default)]
    pub summary: PatternSummary,
    /// Optional enrichment; presence is tagged `source=structured` at build
    /// time and merged in here as plain optional fields.
    #[serde(default)]
    pub skeleton_examples: Option<Vec<SkeletonExample>>,
    #[serde(default)]
    pub common_tricks: Option<Vec<String>>,
    #[serde(default)]
    pub exemplar_paper_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Domain {
    pub domain_id: String,
    pub name: String,
    #[serde(default)]
    pub sub_domains: Vec<String>,
    #[serde(default)]
    pub paper_count: usize,
}

/// Aggregated review signal for a paper; the sole ground truth for anchors.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReviewStats {
    /// Mean reviewer score on the 1–10 scale.
    pub avg_score10: f64,
    pub review_count: u32,
    /// Spread of reviewer scores on the same scale.
    #[serde(default)]
    pub dispersion10: f64,
}

/// Card-facing fields extracted from the paper at KG-build time.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PaperSkeleton {
    #[serde(default)]
    pub problem: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub contribution: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Paper {
    pub paper_id: String,
    pub title: String,
    #[serde(default)]
    pub pattern_id: Option<String>,
    #[serde(default)]
    pub domain_id: String,
    #[serde(default)]
    pub review_stats: Option<ReviewStats>,
    #[serde(default)]
    pub skeleton: Option<PaperSkeleton>,
    #[serde(default)]
    pub abstract_text: Option<String>,
}

// =============================================================================
// Edges
// =============================================================================

/// Typed edge relations. Weights are validated on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// Paper → Pattern, `quality ∈ [0,1]`.
    UsesPattern,
    /// Pattern → Domain, `effectiveness ∈ [-1,1]`, `confidence ∈ [0,1]`.
    WorksWellIn,
    /// Idea → Domain, `weight ∈ [0,1]`.
    BelongsTo,
}

/// Edge attributes; which fields are meaningful depends on the relation.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EdgeAttrs {
    #[serde(default)]
    pub quality: Option<f64>,
    #[serde(default)]
    pub effectiveness: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub relation: Relation,
    #[serde(flatten)]
    pub attrs: EdgeAttrs,
}

#[derive(Debug, Deserialize)]
struct GraphFile {
    #[serde(default)]
    edges: Vec<Edge>,
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Error)]
pub enum KgError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("edge {relation:?} {source_id} -> {target_id}: {message}")]
    InvalidEdge {
        relation: Relation,
        source_id: String,
        target_id: String,
        message: String,
    },

    #[error("paper {paper_id}: {message}")]
    InvalidPaper { paper_id: String, message: String },
}

/// Immutable knowledge-graph view. Safe to share across tasks via `Arc`.
#[derive(Debug, Default)]
pub struct KgStore {
    ideas: Vec<Idea>,
    patterns: Vec<Pattern>,
    domains: Vec<Domain>,
    papers: Vec<Paper>,

    pattern_index: HashMap<String, usize>,
    domain_index: HashMap<String, usize>,
    paper_index: HashMap<String, usize>,

    /// (relation, source id) → outgoing edges, in file order.
    adjacency: HashMap<(Relation, String), Vec<Edge>>,
    /// (relation, target id) → incoming edges, in file order.
    reverse_adjacency: HashMap<(Relation, String), Vec<Edge>>,
}

impl KgStore {
    /// Load `nodes_{idea,pattern,domain,paper}.json` + `knowledge_graph_v2.json`
    /// from the output directory.
    pub fn load(output_dir: &Path) -> Result<Self, KgError> {
        let ideas: Vec<Idea> = read_json(&output_dir.join("nodes_idea.json"))?;
        let patterns: Vec<Pattern> = read_json(&output_dir.join("nodes_pattern.json"))?;
        let domains: Vec<Domain> = read_json(&output_dir.join("nodes_domain.json"))?;
        let papers: Vec<Paper> = read_json(&output_dir.join("nodes_paper.json"))?;
        let graph: GraphFile = read_json(&output_dir.join("knowledge_graph_v2.json"))?;
        Self::from_parts(ideas, patterns, domains, papers, graph.edges)
    }

    /// Assemble a store from already-parsed parts. Used by tests and by the
    /// loader above; validates every invariant the data model promises.
    pub fn from_parts(
        ideas: Vec<Idea>,
        patterns: Vec<Pattern>,
        domains: Vec<Domain>,
        papers: Vec<Paper>,
        edges: Vec<Edge>,
    ) -> Result<Self, KgError> {
        for paper in &papers {
            if let Some(stats) = &paper.review_stats {
                if !(1.0..=10.0).contains(&stats.avg_score10) {
                    return Err(KgError::InvalidPaper {
                        paper_id: paper.paper_id.clone(),
                        message: format!("avg_score10 out of [1,10]: {}", stats.avg_score10),
                    });
                }
            }
        }

        let mut adjacency: HashMap<(Relation, String), Vec<Edge>> = HashMap::new();
        let mut reverse_adjacency: HashMap<(Relation, String), Vec<Edge>> = HashMap::new();
        for edge in edges {
            validate_edge(&edge)?;
            reverse_adjacency
                .entry((edge.relation, edge.target.clone()))
                .or_default()
                .push(edge.clone());
            adjacency
                .entry((edge.relation, edge.source.clone()))
                .or_default()
                .push(edge);
        }

        let pattern_index = patterns
            .iter()
            .enumerate()
            .map(|(i, p)| (p.pattern_id.clone(), i))
            .collect();
        let domain_index = domains
            .iter()
            .enumerate()
            .map(|(i, d)| (d.domain_id.clone(), i))
            .collect();
        let paper_index = papers
            .iter()
            .enumerate()
            .map(|(i, p)| (p.paper_id.clone(), i))
            .collect();

        Ok(Self {
            ideas,
            patterns,
            domains,
            papers,
            pattern_index,
            domain_index,
            paper_index,
            adjacency,
            reverse_adjacency,
        })
    }

    pub fn ideas(&self) -> &[Idea] {
        &self.ideas
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    pub fn papers(&self) -> &[Paper] {
        &self.papers
    }

    pub fn pattern_by_id(&self, id: &str) -> Option<&Pattern> {
        self.pattern_index.get(id).map(|&i| &self.patterns[i])
    }

    pub fn domain_by_id(&self, id: &str) -> Option<&Domain> {
        self.domain_index.get(id).map(|&i| &self.domains[i])
    }

    pub fn paper_by_id(&self, id: &str) -> Option<&Paper> {
        self.paper_index.get(id).map(|&i| &self.papers[i])
    }

    /// Outgoing edges of `node` under `relation`, as `(target_id, attrs)`.
    pub fn neighbors(&self, node: &str, relation: Relation) -> Vec<(&str, &EdgeAttrs)> {
        self.adjacency
            .get(&(relation, node.to_string()))
            .map(|edges| {
                edges
                    .iter()
                    .map(|e| (e.target.as_str(), &e.attrs))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Incoming edges of `node` under `relation`, as `(source_id, attrs)`.
    pub fn incoming(&self, node: &str, relation: Relation) -> Vec<(&str, &EdgeAttrs)> {
        self.reverse_adjacency
            .get(&(relation, node.to_string()))
            .map(|edges| {
                edges
                    .iter()
                    .map(|e| (e.source.as_str(), &e.attrs))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All papers assigned to a pattern cluster.
    pub fn papers_in_pattern(&self, pattern_id: &str) -> Vec<&Paper> {
        self.papers
            .iter()
            .filter(|p| p.pattern_id.as_deref() == Some(pattern_id))
            .collect()
    }

    /// All papers whose domain matches.
    pub fn papers_in_domain(&self, domain_id: &str) -> Vec<&Paper> {
        self.papers
            .iter()
            .filter(|p| p.domain_id == domain_id)
            .collect()
    }
}

fn validate_edge(edge: &Edge) -> Result<(), KgError> {
    let bad = |message: String| KgError::InvalidEdge {
        relation: edge.relation,
        source_id: edge.source.clone(),
        target_id: edge.target.clone(),
        message,
    };
    let unit = |name: &str, v: Option<f64>| -> Result<(), KgError> {
        match v {
            Some(v) if !(0.0..=1.0).contains(&v) => {
                Err(bad(format!("{name} out of [0,1]: {v}")))
            }
            _ => Ok(()),
        }
    };
    match edge.relation {
        Relation::UsesPattern => unit("quality", edge.attrs.quality),
        Relation::BelongsTo => unit("weight", edge.attrs.weight),
        Relation::WorksWellIn => {
            if let Some(e) = edge.attrs.effectiveness {
                if !(-1.0..=1.0).contains(&e) {
                    return Err(bad(format!("effectiveness out of [-1,1]: {e}")));
                }
            }
            unit("confidence", edge.attrs.confidence)
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, KgError> {
    let raw = std::fs::read_to_string(path).map_err(|source| KgError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| KgError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> KgStore {
        let ideas = vec![Idea {
            idea_id: "idea_1".into(),
            description: "contrastive pretraining for tabular data".into(),
            pattern_ids: vec!["pat_1".into()],
        }];
        let patterns = vec![Pattern {
            pattern_id: "pat_1".into(),
            name: "Contrastive reframing".into(),
            cluster_size: 12,
            domain: "dom_1".into(),
            sub_domains: vec!["representation learning".into()],
            summary: PatternSummary::default(),
            skeleton_examples: None,
            common_tricks: None,
            exemplar_paper_ids: vec![],
        }];
        let domains = vec![Domain {
            domain_id: "dom_1".into(),
            name: "Machine Learning".into(),
            sub_domains: vec!["representation learning".into()],
            paper_count: 2,
        }];
        let papers = vec![Paper {
            paper_id: "paper_1".into(),
            title: "A Paper".into(),
            pattern_id: Some("pat_1".into()),
            domain_id: "dom_1".into(),
            review_stats: Some(ReviewStats {
                avg_score10: 6.5,
                review_count: 4,
                dispersion10: 1.0,
            }),
            skeleton: None,
            abstract_text: None,
        }];
        let edges = vec![
            Edge {
                source: "paper_1".into(),
                target: "pat_1".into(),
                relation: Relation::UsesPattern,
                attrs: EdgeAttrs {
                    quality: Some(0.8),
                    ..Default::default()
                },
            },
            Edge {
                source: "pat_1".into(),
                target: "dom_1".into(),
                relation: Relation::WorksWellIn,
                attrs: EdgeAttrs {
                    effectiveness: Some(0.6),
                    confidence: Some(0.9),
                    ..Default::default()
                },
            },
        ];
        KgStore::from_parts(ideas, patterns, domains, papers, edges).unwrap()
    }

    #[test]
    fn lookups_resolve() {
        let kg = store();
        assert!(kg.pattern_by_id("pat_1").is_some());
        assert!(kg.pattern_by_id("missing").is_none());
        assert_eq!(kg.papers_in_pattern("pat_1").len(), 1);
    }

    #[test]
    fn neighbors_by_relation() {
        let kg = store();
        let out = kg.neighbors("pat_1", Relation::WorksWellIn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "dom_1");
        assert_eq!(out[0].1.effectiveness, Some(0.6));

        let incoming = kg.incoming("pat_1", Relation::UsesPattern);
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].0, "paper_1");
    }

    #[test]
    fn score_out_of_range_rejected() {
        let papers = vec![Paper {
            paper_id: "p".into(),
            title: "t".into(),
            pattern_id: None,
            domain_id: "d".into(),
            review_stats: Some(ReviewStats {
                avg_score10: 11.0,
                review_count: 1,
                dispersion10: 0.0,
            }),
            skeleton: None,
            abstract_text: None,
        }];
        let err = KgStore::from_parts(vec![], vec![], vec![], papers, vec![]).unwrap_err();
        assert!(matches!(err, KgError::InvalidPaper { .. }));
    }

    #[test]
    fn bad_edge_weight_rejected() {
        let edges = vec![Edge {
            source: "a".into(),
            target: "b".into(),
            relation: Relation::UsesPattern,
            attrs: EdgeAttrs {
                quality: Some(1.5),
                ..Default::default()
            },
        }];
        let err = KgStore::from_parts(vec![], vec![], vec![], vec![], edges).unwrap_err();
        assert!(matches!(err, KgError::InvalidEdge { .. }));
    }
}
