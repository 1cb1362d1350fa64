//! Recall engine invariants with and without embeddings.

mod common;

use std::sync::Arc;

use common::{fixture_kg, text_vector, ScriptedGateway};
use storyforge::config::Config;
use storyforge::gateway::Attribution;
use storyforge::index::VectorIndex;
use storyforge::recall::RecallEngine;

const IDEA: &str = "Using reinforcement learning to optimize LLM inference efficiency";

#[tokio::test]
async fn degraded_recall_still_finds_patterns() {
    let kg = fixture_kg();
    let gateway = ScriptedGateway::default(); // embed_fails = true
    let engine = RecallEngine::new(kg, None, None);

    let cfg = Config::default();
    let (recalled, audit) = engine
        .recall(IDEA, &gateway, &cfg, Attribution::new("test"))
        .await;

    // Jaccard-only path 1 matches the fixture idea and carries its pattern.
    assert!(!recalled.is_empty());
    assert!(recalled.iter().any(|r| r.pattern_id == "pat_1"));
    assert!(audit.path1.degraded_to_jaccard);
    assert!(audit.path2.degraded);

    // Invariants: bounded, unique, non-negative, descending.
    assert!(recalled.len() <= cfg.final_top_k);
    let mut seen = std::collections::HashSet::new();
    for r in &recalled {
        assert!(seen.insert(r.pattern_id.clone()), "duplicate {}", r.pattern_id);
        assert!(r.score >= 0.0);
    }
    for pair in recalled.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn embedding_recall_uses_all_three_paths() {
    let kg = fixture_kg();
    let mut gateway = ScriptedGateway::default();
    gateway.embed_fails = false;

    // Indexes built from the same deterministic vectors the gateway returns.
    let idea_index = VectorIndex::from_vectors(
        "mock-embed",
        kg.ideas()
            .iter()
            .map(|i| (i.idea_id.clone(), text_vector(&i.description)))
            .collect(),
    );
    let paper_index = VectorIndex::from_vectors(
        "mock-embed",
        kg.papers()
            .iter()
            .map(|p| (p.paper_id.clone(), text_vector(&p.title)))
            .collect(),
    );

    let engine = RecallEngine::new(kg, Some(Arc::new(idea_index)), Some(Arc::new(paper_index)));
    let cfg = Config::default();
    let (recalled, audit) = engine
        .recall(IDEA, &gateway, &cfg, Attribution::new("test"))
        .await;

    assert!(!recalled.is_empty());
    assert!(!audit.path1.degraded_to_jaccard);
    assert!(!audit.path2.degraded);
    assert!(!audit.path2.top_domains.is_empty());
    // The audit's fused entries decompose into per-path contributions.
    for entry in &audit.final_top_k {
        assert!(entry.final_score >= 0.0);
        assert!(entry.path1 >= 0.0 && entry.path2 >= 0.0 && entry.path3 >= 0.0);
    }
}

#[tokio::test]
async fn empty_corpus_returns_empty_with_reason() {
    let kg = Arc::new(
        storyforge::kg::KgStore::from_parts(vec![], vec![], vec![], vec![], vec![]).unwrap(),
    );
    let gateway = ScriptedGateway::default();
    let engine = RecallEngine::new(kg, None, None);

    let (recalled, audit) = engine
        .recall(IDEA, &gateway, &Config::default(), Attribution::new("test"))
        .await;
    assert!(recalled.is_empty());
    assert!(audit.empty_reason.is_some());
}

#[tokio::test]
async fn normalization_toggle_changes_fusion_not_membership() {
    let kg = fixture_kg();
    let gateway = ScriptedGateway::default();
    let engine = RecallEngine::new(kg, None, None);

    let cfg_on = Config::default();
    let mut cfg_off = Config::default();
    cfg_off.recall_normalize = false;

    let (on, audit_on) = engine
        .recall(IDEA, &gateway, &cfg_on, Attribution::new("test"))
        .await;
    let (off, audit_off) = engine
        .recall(IDEA, &gateway, &cfg_off, Attribution::new("test"))
        .await;

    assert!(audit_on.normalized);
    assert!(!audit_off.normalized);
    let ids_on: Vec<&str> = on.iter().map(|r| r.pattern_id.as_str()).collect();
    let ids_off: Vec<&str> = off.iter().map(|r| r.pattern_id.as_str()).collect();
    assert_eq!(ids_on, ids_off);
}
