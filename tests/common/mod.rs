//! Shared test fixtures: a scripted gateway and a small knowledge graph.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use storyforge::gateway::{
    ChatGateway, ChatRequest, ChatResponse, EmbedRequest, EmbedResponse, EmbeddingGateway,
    FinishReason, ProviderError,
};
use storyforge::kg::{
    Domain, Edge, EdgeAttrs, Idea, KgStore, Paper, PaperSkeleton, Pattern, PatternSummary,
    Relation, ReviewStats,
};

// =============================================================================
// Scripted gateway
// =============================================================================

/// Routes chat calls by prompt shape; embeddings either fail (degrading the
/// caller to its lexical fallback) or return a fixed vector per text hash.
pub struct ScriptedGateway {
    /// Per-role queues of judge responses; the last response repeats once a
    /// queue drains.
    pub judge: Mutex<HashMap<String, VecDeque<String>>>,
    pub story: Mutex<VecDeque<String>>,
    pub selector_response: String,
    pub coach_response: String,
    pub pattern_dna_response: String,
    pub fusion_points_response: String,
    pub fused_idea_response: String,
    pub reflection_response: String,
    pub embed_fails: bool,
    /// (substring, vector) pairs; the first matching substring wins over the
    /// default hash vector.
    pub embed_overrides: Vec<(String, Vec<f32>)>,
    pub calls: Mutex<Vec<String>>,
    pub prompts: Mutex<Vec<(String, String)>>,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self {
            judge: Mutex::new(HashMap::new()),
            story: Mutex::new(VecDeque::new()),
            selector_response: default_selector_response(),
            coach_response: default_coach_response(),
            pattern_dna_response: default_pattern_dna_response(),
            fusion_points_response: default_fusion_points_response(),
            fused_idea_response: default_fused_idea_response(),
            reflection_response: default_reflection_response(),
            embed_fails: true,
            embed_overrides: Vec::new(),
            calls: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedGateway {
    pub fn push_judge(&self, role: &str, response: impl Into<String>) {
        self.judge
            .lock()
            .unwrap()
            .entry(role.to_string())
            .or_default()
            .push_back(response.into());
    }

    pub fn push_story(&self, response: impl Into<String>) {
        self.story.lock().unwrap().push_back(response.into());
    }

    pub fn call_kinds(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn route(&self, prompt: &str) -> (String, String) {
        for role in ["Methodology", "Novelty", "Storyteller"] {
            if prompt.contains(&format!("strict reviewer focused on {role}")) {
                let mut queues = self.judge.lock().unwrap();
                let queue = queues.entry(role.to_string()).or_default();
                let response = if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap_or_default()
                };
                return (format!("judge::{role}"), response);
            }
        }
        if prompt.contains("research writing coach") {
            return ("coach".into(), self.coach_response.clone());
        }
        if prompt.contains("multidimensional pattern scorer") {
            return ("selector".into(), self.selector_response.clone());
        }
        if prompt.contains("organic or a mechanical stack") {
            return ("reflection".into(), self.reflection_response.clone());
        }
        if prompt.contains("[Research Paradigm]") {
            return ("pattern_dna".into(), self.pattern_dna_response.clone());
        }
        if prompt.contains("[Research Idea]") {
            return ("idea_dna".into(), self.pattern_dna_response.clone());
        }
        if prompt.contains("fusion potential") {
            return ("fusion_points".into(), self.fusion_points_response.clone());
        }
        if prompt.contains("truly innovative fused idea") {
            return ("fused_idea".into(), self.fused_idea_response.clone());
        }
        if prompt.contains("senior paper author") {
            let mut queue = self.story.lock().unwrap();
            let response = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap_or_else(|| story_json("Fallback Story"))
            };
            return ("story".into(), response);
        }
        ("unknown".into(), String::new())
    }
}

#[async_trait]
impl ChatGateway for ScriptedGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let prompt = req
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let (kind, content) = self.route(&prompt);
        self.calls.lock().unwrap().push(kind.clone());
        self.prompts.lock().unwrap().push((kind, prompt));
        Ok(ChatResponse {
            content,
            input_tokens: 100,
            output_tokens: 50,
            latency: Duration::from_millis(1),
            finish_reason: FinishReason::Stop,
        })
    }
}

#[async_trait]
impl EmbeddingGateway for ScriptedGateway {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        if self.embed_fails {
            return Err(ProviderError::provider("mock", "embeddings offline", false));
        }
        let embeddings = req
            .texts
            .iter()
            .map(|t| {
                self.embed_overrides
                    .iter()
                    .find(|(needle, _)| t.contains(needle))
                    .map(|(_, vec)| vec.clone())
                    .unwrap_or_else(|| text_vector(t))
            })
            .collect();
        Ok(EmbedResponse {
            embeddings,
            tokens: req.texts.len() as u32,
            latency: Duration::from_millis(1),
        })
    }

    fn model_profile(&self) -> String {
        "mock-embed".to_string()
    }
}

/// Deterministic 4-dim vector from text bytes; similar texts do not get
/// similar vectors, which is fine for plumbing tests.
pub fn text_vector(text: &str) -> Vec<f32> {
    let mut acc = [0u32; 4];
    for (i, b) in text.bytes().enumerate() {
        acc[i % 4] = acc[i % 4].wrapping_add(b as u32).wrapping_mul(31);
    }
    let v: Vec<f32> = acc.iter().map(|&x| (x % 1000) as f32 / 1000.0 + 0.001).collect();
    v
}

// =============================================================================
// Canned responses
// =============================================================================

pub fn story_json(title: &str) -> String {
    serde_json::json!({
        "title": title,
        "abstract": "We study adaptive retrieval for efficient inference and show consistent gains across benchmarks with a calibrated controller.",
        "problem_framing": "Reframe inference efficiency from static pruning to adaptive retrieval-driven computation.",
        "gap_pattern": "Existing methods treat efficiency as a fixed budget and miss input-dependent structure.",
        "solution": "A controller learns when to retrieve and when to compute, trained end to end.",
        "method_skeleton": "Build a retrieval controller; Train with policy gradients; Distill into the base model",
        "innovation_claims": [
            "Transform inference efficiency from static budgets to adaptive retrieval-driven computation",
            "Unify retrieval and computation scheduling in one learned controller",
            "Calibrated gains without retraining the base model"
        ],
        "experiments_plan": "Compare against static baselines on three benchmarks with ablations over controller capacity."
    })
    .to_string()
}

/// A judge response covering aliases A1..An.
pub fn judge_json(judgements: &[(&str, &str)]) -> String {
    let comparisons: Vec<serde_json::Value> = judgements
        .iter()
        .enumerate()
        .map(|(i, (judgement, strength))| {
            serde_json::json!({
                "anchor_id": format!("A{}", i + 1),
                "judgement": judgement,
                "strength": strength,
                "rationale": "clearer framing and tighter method narrative",
            })
        })
        .collect();
    serde_json::json!({
        "rubric_version": "rubric_v1",
        "comparisons": comparisons,
    })
    .to_string()
}

fn default_selector_response() -> String {
    serde_json::json!({
        "stability_score": 0.7,
        "novelty_score": 0.6,
        "domain_distance": 0.2,
        "reasoning": "established but flexible"
    })
    .to_string()
}

fn default_coach_response() -> String {
    serde_json::json!({
        "field_feedback": {
            "title": {"issue": "generic", "edit_instruction": "name the core mechanism", "expected_effect": "sharper identity"}
        },
        "suggested_edits": [
            {"field": "innovation_claims", "action": "rewrite", "content": "Lead with the transformation, not the technique"}
        ],
        "priority": ["innovation_claims", "method_skeleton"]
    })
    .to_string()
}

fn default_pattern_dna_response() -> String {
    serde_json::json!({
        "problem": "Scaling structured prediction",
        "assumption": "Structure can be learned jointly with content",
        "novelty_claim": "Treats structure discovery as part of learning"
    })
    .to_string()
}

fn default_fusion_points_response() -> String {
    serde_json::json!({
        "problem_complement": "Extends the efficiency problem to structure discovery",
        "assumption_intersection": "Both assume input-dependent computation",
        "innovation_product": "Structure-aware adaptive computation",
        "fusion_mechanism": "The controller discovers structure while scheduling computation"
    })
    .to_string()
}

fn default_fused_idea_response() -> String {
    serde_json::json!({
        "fused_idea_title": "Structure-Aware Adaptive Computation",
        "fused_idea_description": "Reframes efficient inference as joint structure discovery and computation scheduling.",
        "problem_framing": "Reframe efficiency from budget allocation to structure-driven scheduling.",
        "core_assumption": "Input structure predicts where computation matters.",
        "novelty_claim": "Unifies structure discovery with computation scheduling in one controller.",
        "key_innovation_points": ["Joint discovery and scheduling", "Calibrated structure priors", "No base-model retraining"],
        "why_not_straightforward_combination": "The controller and the structure model co-evolve; neither exists in the inputs."
    })
    .to_string()
}

fn default_reflection_response() -> String {
    serde_json::json!({
        "scores": {
            "concept_unity": 0.8,
            "technical_soundness": 0.75,
            "novelty_level": 0.7,
            "narrative_clarity": 0.8
        },
        "fusion_quality": 0.78,
        "suggestions": ["Tighten the bridge between structure priors and scheduling"],
        "guidance": {
            "title_evolution": "Put the fused mechanism in the title",
            "method_evolution": "Make structure discovery step one of the skeleton",
            "narrative_strategy": "One mechanism, two consequences"
        }
    })
    .to_string()
}

// =============================================================================
// Fixture knowledge graph
// =============================================================================

/// A KG with one idea, two patterns, one domain, and anchorable papers with
/// review scores 5..=9 under `pat_1`.
pub fn fixture_kg() -> Arc<KgStore> {
    let ideas = vec![
        Idea {
            idea_id: "idea_1".into(),
            description: "reinforcement learning to optimize inference efficiency".into(),
            pattern_ids: vec!["pat_1".into()],
        },
        Idea {
            idea_id: "idea_2".into(),
            description: "reinforcement learning with contrastive structure for efficiency".into(),
            pattern_ids: vec!["pat_2".into()],
        },
    ];

    let patterns = vec![
        Pattern {
            pattern_id: "pat_1".into(),
            name: "Adaptive computation scheduling".into(),
            cluster_size: 30,
            domain: "dom_1".into(),
            sub_domains: vec!["efficient inference".into()],
            summary: PatternSummary {
                representative_ideas: vec!["learned early exit policies".into()],
                common_problems: vec!["static budgets waste computation".into()],
                solution_approaches: vec!["train a lightweight controller over layer skips".into()],
                story: vec!["reframe efficiency as learned scheduling".into()],
            },
            skeleton_examples: None,
            common_tricks: None,
            exemplar_paper_ids: vec![],
        },
        Pattern {
            pattern_id: "pat_2".into(),
            name: "Contrastive structure discovery".into(),
            cluster_size: 8,
            domain: "dom_1".into(),
            sub_domains: vec!["representation learning".into()],
            summary: PatternSummary::default(),
            skeleton_examples: None,
            common_tricks: None,
            exemplar_paper_ids: vec![],
        },
    ];

    let domains = vec![Domain {
        domain_id: "dom_1".into(),
        name: "Efficient Machine Learning".into(),
        sub_domains: vec!["efficient inference".into(), "representation learning".into()],
        paper_count: 5,
    }];

    let papers: Vec<Paper> = (0..5)
        .map(|i| Paper {
            paper_id: format!("paper_{}", i + 1),
            title: format!("Anchor Study Number {}", i + 1),
            pattern_id: Some("pat_1".into()),
            domain_id: "dom_1".into(),
            review_stats: Some(ReviewStats {
                avg_score10: 5.0 + i as f64,
                review_count: 4,
                dispersion10: 1.0,
            }),
            skeleton: Some(PaperSkeleton {
                problem: format!("anchor problem statement {}", i + 1),
                method: format!("anchor method outline {}", i + 1),
                contribution: format!("anchor contribution summary {}", i + 1),
            }),
            abstract_text: Some(format!("anchor abstract text {}", i + 1)),
        })
        .collect();

    let mut edges: Vec<Edge> = papers
        .iter()
        .map(|p| Edge {
            source: p.paper_id.clone(),
            target: "pat_1".into(),
            relation: Relation::UsesPattern,
            attrs: EdgeAttrs {
                quality: Some(0.8),
                ..Default::default()
            },
        })
        .collect();
    edges.push(Edge {
        source: "pat_1".into(),
        target: "dom_1".into(),
        relation: Relation::WorksWellIn,
        attrs: EdgeAttrs {
            effectiveness: Some(0.7),
            confidence: Some(0.9),
            ..Default::default()
        },
    });
    edges.push(Edge {
        source: "idea_1".into(),
        target: "dom_1".into(),
        relation: Relation::BelongsTo,
        attrs: EdgeAttrs {
            weight: Some(1.0),
            ..Default::default()
        },
    });

    Arc::new(KgStore::from_parts(ideas, patterns, domains, papers, edges).unwrap())
}
