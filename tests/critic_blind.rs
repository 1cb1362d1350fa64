//! Critic-level behavior: blind-leak rejection, strict-JSON repair, and the
//! insufficient-anchors refusal.

mod common;

use std::sync::Arc;

use common::{fixture_kg, judge_json, ScriptedGateway};
use storyforge::config::Config;
use storyforge::error::{CancelFlag, EngineError};
use storyforge::gateway::Attribution;
use storyforge::review::{
    build_story_card, guard_outgoing_prompt, AnchorSummary, AnchoredCritic, BlindJudge,
    CoachReviewer, ReviewIndex, TauSource, TauTable,
};
use storyforge::story::Story;

fn tau() -> TauTable {
    TauTable {
        tau_methodology: 1.0,
        tau_novelty: 1.0,
        tau_storyteller: 1.0,
        source: TauSource::Config,
    }
}

fn story() -> Story {
    Story {
        title: "Adaptive Inference Scheduling".into(),
        abstract_text: "We schedule computation adaptively.".into(),
        problem_framing: "Reframe efficiency as adaptive scheduling".into(),
        gap_pattern: "Static budgets miss input structure".into(),
        solution: "A learned controller".into(),
        method_skeleton: "Build controller; Train policy; Distill".into(),
        innovation_claims: vec!["Transform budgets into learned schedules".into()],
        experiments_plan: "Three benchmarks with ablations".into(),
    }
}

#[tokio::test]
async fn critic_reviews_all_roles_and_audits_anchors() {
    let gateway = Arc::new(ScriptedGateway::default());
    let strong = judge_json(&[
        ("better", "medium"),
        ("better", "medium"),
        ("tie", "medium"),
        ("worse", "medium"),
        ("better", "medium"),
    ]);
    for role in ["Methodology", "Novelty", "Storyteller"] {
        gateway.push_judge(role, strong.clone());
    }

    let kg = fixture_kg();
    let chat: Arc<dyn storyforge::gateway::ChatGateway> = gateway.clone();
    let critic = AnchoredCritic::new(
        kg.clone(),
        Arc::new(ReviewIndex::build(&kg)),
        BlindJudge::new(chat.clone(), "mock-judge", None),
        CoachReviewer::new(chat, "mock-chat"),
        tau(),
    );

    let pattern = kg.pattern_by_id("pat_1").unwrap().clone();
    let result = critic
        .review(
            &story(),
            &pattern,
            &Config::default(),
            &CancelFlag::new(),
            Attribution::new("test"),
        )
        .await
        .expect("critic runs");

    assert_eq!(result.reviews.len(), 3);
    // Anchor aliases are score-ascending: A1 is the weakest anchor.
    assert_eq!(result.audit.anchors.len(), 5);
    assert_eq!(result.audit.anchors[0].anchor_id, "A1");
    assert!(result.audit.anchors[0].score10 < result.audit.anchors[4].score10);
    // Audit carries the pass thresholds.
    let pass = result.audit.pass.as_ref().unwrap();
    assert_eq!(pass.q50, Some(7.0));
    assert_eq!(pass.q75, Some(8.0));
    assert!(result.pass);
    // Every role score stays inside the defined range.
    for review in &result.reviews {
        assert!((1.0..=10.0).contains(&review.score));
    }
    // Coach ran and attached priorities to feedback.
    assert!(result.coach.is_some());
    assert!(result.reviews[0].feedback.contains("CoachPriority"));
}

#[tokio::test]
async fn strict_json_bubbles_after_repair_budget() {
    let gateway = Arc::new(ScriptedGateway::default());
    for role in ["Methodology", "Novelty", "Storyteller"] {
        gateway.push_judge(role, "not json at all");
    }

    let kg = fixture_kg();
    let chat: Arc<dyn storyforge::gateway::ChatGateway> = gateway.clone();
    let critic = AnchoredCritic::new(
        kg.clone(),
        Arc::new(ReviewIndex::build(&kg)),
        BlindJudge::new(chat.clone(), "mock-judge", None),
        CoachReviewer::new(chat, "mock-chat"),
        tau(),
    );

    let pattern = kg.pattern_by_id("pat_1").unwrap().clone();
    let err = critic
        .review(
            &story(),
            &pattern,
            &Config::default(),
            &CancelFlag::new(),
            Attribution::new("test"),
        )
        .await
        .expect_err("strict json must fail");
    assert!(matches!(err, EngineError::InvalidOutput { .. }));
}

#[tokio::test]
async fn lenient_json_downgrades_to_neutral_ties() {
    let gateway = Arc::new(ScriptedGateway::default());
    for role in ["Methodology", "Novelty", "Storyteller"] {
        gateway.push_judge(role, "not json at all");
    }

    let kg = fixture_kg();
    let chat: Arc<dyn storyforge::gateway::ChatGateway> = gateway.clone();
    let critic = AnchoredCritic::new(
        kg.clone(),
        Arc::new(ReviewIndex::build(&kg)),
        BlindJudge::new(chat.clone(), "mock-judge", None),
        CoachReviewer::new(chat, "mock-chat"),
        tau(),
    );

    let mut cfg = Config::default();
    cfg.critic_strict_json = false;

    let pattern = kg.pattern_by_id("pat_1").unwrap().clone();
    let result = critic
        .review(
            &story(),
            &pattern,
            &cfg,
            &CancelFlag::new(),
            Attribution::new("test"),
        )
        .await
        .expect("lenient mode keeps going");

    // All-tie comparisons land every role on the anchor quasi-median.
    for review in &result.reviews {
        assert!((review.score - 7.0).abs() < 0.1, "{}", review.score);
    }
    assert!(!result.pass);
}

#[tokio::test]
async fn insufficient_anchors_refuse_scoring() {
    let gateway = Arc::new(ScriptedGateway::default());
    let kg = fixture_kg();
    let chat: Arc<dyn storyforge::gateway::ChatGateway> = gateway.clone();
    let critic = AnchoredCritic::new(
        kg.clone(),
        Arc::new(ReviewIndex::build(&kg)),
        BlindJudge::new(chat.clone(), "mock-judge", None),
        CoachReviewer::new(chat, "mock-chat"),
        tau(),
    );

    // pat_2 has no papers, and its domain widening also needs review stats —
    // give it a domain with none.
    let mut pattern = kg.pattern_by_id("pat_2").unwrap().clone();
    pattern.domain = "dom_without_papers".to_string();

    let err = critic
        .review(
            &story(),
            &pattern,
            &Config::default(),
            &CancelFlag::new(),
            Attribution::new("test"),
        )
        .await
        .expect_err("no anchors anywhere");
    assert!(matches!(err, EngineError::Config(_)));
    assert!(err.to_string().contains("insufficient anchors"));
    // No judge call may have happened.
    assert!(gateway.call_kinds().iter().all(|k| !k.starts_with("judge")));
}

// =============================================================================
// Blind-leak fuzzing (spec scenario: injected anchor fields must be caught
// before transmission)
// =============================================================================

#[test]
fn leak_guard_rejects_injected_anchor_fields() {
    let anchors = vec![AnchorSummary {
        anchor_id: "A1".into(),
        paper_id: "paper_1234".into(),
        score10: 7.0,
        weight: 1.0,
    }];
    let titles = vec!["Adaptive Retrieval Under Distribution Shift".to_string()];

    let clean = "Compare the story card against anchor card A1 on the rubric.";
    assert!(guard_outgoing_prompt(clean, &anchors, &titles).is_ok());

    let injections = [
        "... paper_id=paper_1234 ...".to_string(),
        "see paper_1234 for details".to_string(),
        "this is rated 9/10 easily".to_string(),
        "the committee would accept this".to_string(),
        "a high score overall".to_string(),
        "resembles Adaptive Retrieval Under Distribution Shift".to_string(),
        // A fragment of the title, 8+ chars, embedded mid-sentence.
        "echoes of retrieval under something".to_string(),
    ];
    for injected in &injections {
        let prompt = format!("{clean}\n{injected}");
        assert!(
            guard_outgoing_prompt(&prompt, &anchors, &titles).is_err(),
            "injection not caught: {injected}"
        );
    }
}

#[test]
fn story_card_never_carries_identifiers() {
    let mut s = story();
    s.title = "A Very Identifiable Title String".into();
    let card = build_story_card(&s);
    let rendered = card.render();
    assert!(!rendered.contains("Identifiable"));
    assert!(!rendered.to_lowercase().contains("title"));
}
