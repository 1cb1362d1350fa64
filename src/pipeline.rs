//! Idea → story pipeline orchestration.
//!
//! The control loop:
//!
//! ```text
//! recall → select → GENERATE → CRITIC
//! CRITIC --pass--------------------→ novelty check (→ pivot?) → DONE
//! CRITIC --fail & stagnation------→ NOVELTY_MODE (fusion→reflect→gen→critic per pattern)
//! CRITIC --fail & !stagnation-----→ fuse + inject → GENERATE
//! score drop > threshold ---------→ rollback, mark (pattern, issue) failed
//! iterations exhausted -----------→ fall back to the global best story
//! ```
//!
//! One pipeline instance runs one idea end-to-end; KG structures, indexes,
//! and the τ table are shared read-only.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{Config, NoveltyAction};
use crate::error::{CancelFlag, EngineError};
use crate::gateway::{Attribution, EmbeddingGateway};
use crate::kg::{KgStore, Pattern};
use crate::novelty::{
    effective_action, verification_from_report, NoveltyChecker, NoveltyReport, RiskLevel,
    VerificationResult,
};
use crate::recall::{RecallAudit, RecallEngine};
use crate::refine::{FusedIdea, IdeaFusionEngine, RefinementEngine, StoryReflector};
use crate::review::{AnchoredCritic, CriticResult, IssueKind};
use crate::runlog::{to_value, RunLogger};
use crate::selector::{PatternSelector, RankedPatterns};
use crate::story::{GenerateContext, Story, StoryGenerator};

// =============================================================================
// Result types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementRecord {
    pub iteration: u32,
    pub issue: IssueKind,
    pub pattern_id: Option<String>,
    pub injected_tricks: Vec<String>,
    pub fused_idea: Option<FusedIdea>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalStorySource {
    pub iteration: u32,
    pub score: f64,
    pub is_best_across_iterations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub final_story: Option<Story>,
    pub final_story_source: Option<FinalStorySource>,
    pub iterations: u32,
    pub pivots: u32,
    /// Top pattern ids per dimension, for the record.
    pub selected_patterns: HashMap<String, Vec<String>>,
    pub review_history: Vec<CriticResult>,
    pub refinement_history: Vec<RefinementRecord>,
    pub recall_audit: RecallAudit,
    pub verification: Option<VerificationResult>,
    pub novelty_report: Option<NoveltyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One attempt inside novelty mode.
#[derive(Debug, Clone)]
struct NoveltyAttempt {
    pattern_id: Option<String>,
    avg_score: f64,
    story: Story,
    critic: CriticResult,
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct Pipeline {
    pub kg: Arc<KgStore>,
    pub recall: RecallEngine,
    pub selector: PatternSelector,
    pub generator: StoryGenerator,
    pub critic: AnchoredCritic,
    pub fusion: IdeaFusionEngine,
    pub reflector: StoryReflector,
    pub novelty: NoveltyChecker,
    pub embedder: Arc<dyn EmbeddingGateway>,
    pub logger: Option<RunLogger>,
    pub cancel: CancelFlag,
    pub run_id: String,
    pub user_idea: String,
}

impl Pipeline {
    fn log_event(&self, event: &str, payload: serde_json::Value) {
        if let Some(logger) = &self.logger {
            logger.log_event(event, payload);
        }
    }

    fn attribution(&self, caller: &'static str) -> Attribution {
        Attribution::new(caller).with_run(self.run_id.clone())
    }

    /// Run the full pipeline for one idea.
    pub async fn run(&self, cfg: &Config) -> Result<PipelineResult, EngineError> {
        eprintln!("[pipeline] run {} starting", self.run_id);
        eprintln!("[pipeline] idea: {}", self.user_idea);

        // -- Recall -----------------------------------------------------------
        self.cancel.check()?;
        let (recalled, recall_audit) = self
            .recall
            .recall(
                &self.user_idea,
                self.embedder.as_ref(),
                cfg,
                self.attribution("recall::embed"),
            )
            .await;
        self.log_event("recall_done", to_value(&recall_audit));
        eprintln!("[pipeline] recall: {} candidate patterns", recalled.len());

        if recalled.is_empty() {
            return Ok(self.empty_result(recall_audit, "no_candidate_patterns"));
        }

        // -- Select -----------------------------------------------------------
        let ranked = self
            .selector
            .select(&recalled, cfg, &self.cancel, self.attribution("selector::score"))
            .await;
        self.cancel.check()?;
        if ranked.is_empty() {
            return Ok(self.empty_result(recall_audit, "no_candidate_patterns"));
        }

        let selected_patterns = summarize_rankings(&ranked);
        let (mut pattern, dimension) = pick_initial_pattern(&ranked);
        eprintln!(
            "[pipeline] initial pattern: {} (from {} ranking)",
            pattern.pattern_id, dimension
        );
        self.log_event(
            "pattern_selected",
            json!({"pattern_id": pattern.pattern_id, "dimension": dimension}),
        );

        let mut refinement = RefinementEngine::new(ranked.clone());

        // -- Iteration state --------------------------------------------------
        let mut iterations: u32 = 0;
        let mut constraints: Option<Vec<String>> = None;
        let mut injected_tricks: Vec<String> = Vec::new();
        let mut review_history: Vec<CriticResult> = Vec::new();
        let mut refinement_history: Vec<RefinementRecord> = Vec::new();

        let mut last_story_before_refinement: Option<Story> = None;
        let mut last_issue: Option<IssueKind> = None;

        let mut novelty_mode = false;
        let mut novelty_attempts: Vec<NoveltyAttempt> = Vec::new();
        let mut novelty_mode_activated = false;

        let mut global_best: Option<(Story, f64, u32, CriticResult)> = None;

        // -- Initial generation ----------------------------------------------
        let mut current_story = self
            .generator
            .generate(
                &pattern,
                GenerateContext::default(),
                cfg,
                &self.cancel,
                self.attribution("story::generate"),
            )
            .await?;
        self.log_event("story_generated", json!({"iteration": 0, "title": current_story.title}));

        let mut last_critic: Option<CriticResult> = None;

        // -- Main loop --------------------------------------------------------
        while iterations < cfg.max_refine_iterations || novelty_mode {
            iterations += 1;
            eprintln!(
                "[pipeline] iteration {}/{}{}",
                iterations,
                cfg.max_refine_iterations,
                if novelty_mode { " (novelty mode)" } else { "" }
            );
            self.log_event(
                "iteration",
                json!({"iteration": iterations, "novelty_mode": novelty_mode}),
            );

            // -- Critic -------------------------------------------------------
            let critic_pattern = self.current_pattern(&refinement, &pattern);
            let critic_result = self
                .critic
                .review(
                    &current_story,
                    &critic_pattern,
                    cfg,
                    &self.cancel,
                    self.attribution("critic::judge"),
                )
                .await?;
            self.log_event(
                "critic_result",
                json!({
                    "iteration": iterations,
                    "avg_score": critic_result.avg_score,
                    "pass": critic_result.pass,
                    "main_issue": critic_result.main_issue.as_str(),
                }),
            );

            // -- Rollback on degradation -------------------------------------
            if let (Some(issue), Some(previous)) = (last_issue, review_history.last()) {
                let role = issue.role();
                let current_score = critic_result.role_score(role).unwrap_or(0.0);
                let previous_score = previous.role_score(role).unwrap_or(0.0);

                if current_score < previous_score - cfg.degradation_threshold {
                    eprintln!(
                        "[pipeline] ROLLBACK: {} dropped {:.2} -> {:.2}",
                        role.as_str(),
                        previous_score,
                        current_score
                    );
                    self.log_event(
                        "rollback_triggered",
                        json!({
                            "issue": issue.as_str(),
                            "prev_score": previous_score,
                            "curr_score": current_score,
                        }),
                    );

                    if let Some(saved) = last_story_before_refinement.take() {
                        current_story = saved;
                    }
                    if let Some(removed) = refinement_history.pop() {
                        for trick in &removed.injected_tricks {
                            injected_tricks.retain(|t| t != trick);
                        }
                        if let Some(failed_pattern) = removed.pattern_id {
                            refinement.mark_pattern_failed(&failed_pattern, issue);
                        }
                    }
                    last_issue = None;
                    continue;
                }
            }

            review_history.push(critic_result.clone());
            last_critic = Some(critic_result.clone());

            // -- Global best --------------------------------------------------
            let is_new_best = global_best
                .as_ref()
                .map(|(_, best, _, _)| critic_result.avg_score > *best)
                .unwrap_or(true);
            if is_new_best {
                eprintln!(
                    "[pipeline] new global best: {:.2} (iteration {})",
                    critic_result.avg_score, iterations
                );
                global_best = Some((
                    current_story.clone(),
                    critic_result.avg_score,
                    iterations,
                    critic_result.clone(),
                ));
            }

            if critic_result.pass {
                eprintln!("[pipeline] critic passed on iteration {iterations}");
                if novelty_mode {
                    novelty_attempts.push(NoveltyAttempt {
                        pattern_id: refinement.current_pattern_id().map(String::from),
                        avg_score: critic_result.avg_score,
                        story: current_story.clone(),
                        critic: critic_result.clone(),
                    });
                }
                break;
            }

            eprintln!(
                "[pipeline] critic failed (avg {:.2}, issue {})",
                critic_result.avg_score,
                critic_result.main_issue.as_str()
            );

            if novelty_mode {
                novelty_attempts.push(NoveltyAttempt {
                    pattern_id: refinement.current_pattern_id().map(String::from),
                    avg_score: critic_result.avg_score,
                    story: current_story.clone(),
                    critic: critic_result.clone(),
                });
                if novelty_attempts.len() >= cfg.novelty_mode_max_patterns {
                    eprintln!("[pipeline] novelty mode exhausted; falling back to best attempt");
                    novelty_mode = false;
                    break;
                }
            }

            let main_issue = critic_result.main_issue;
            last_story_before_refinement = Some(current_story.clone());

            // -- Stagnation check ---------------------------------------------
            if iterations >= 2
                && main_issue == IssueKind::Novelty
                && !novelty_mode
                && !novelty_mode_activated
            {
                let curr = critic_result
                    .role_score(crate::review::Role::Novelty)
                    .unwrap_or(0.0);
                let prev = review_history
                    .len()
                    .checked_sub(2)
                    .and_then(|i| review_history.get(i))
                    .and_then(|r| r.role_score(crate::review::Role::Novelty))
                    .unwrap_or(0.0);

                if curr <= prev + 0.5 {
                    eprintln!(
                        "[pipeline] novelty stagnation ({curr:.1} <= {prev:.1} + 0.5); entering novelty mode"
                    );
                    self.log_event(
                        "novelty_mode_activated",
                        json!({"iteration": iterations, "curr": curr, "prev": prev}),
                    );
                    novelty_mode = true;
                    novelty_mode_activated = true;
                }
            }

            // -- Pattern selection + fusion -----------------------------------
            let force_next = novelty_mode && main_issue == IssueKind::Novelty;
            let Some(next_pattern) = refinement.select_pattern(main_issue, force_next) else {
                if novelty_mode {
                    eprintln!("[pipeline] no more novelty patterns; exiting novelty mode");
                    novelty_mode = false;
                    break;
                }
                eprintln!("[pipeline] no unused pattern left for {}", main_issue.as_str());
                break;
            };

            let fused = self
                .fusion
                .fuse(
                    &self.user_idea,
                    &next_pattern,
                    Some(&current_story),
                    cfg,
                    &self.cancel,
                    self.attribution("fusion::fuse"),
                )
                .await?;

            // Reflection gates novelty-mode attempts before spending a
            // generation and a critic round.
            let reflection = self
                .reflector
                .reflect_on_fusion(
                    &current_story,
                    &next_pattern,
                    &fused,
                    &critic_result,
                    &self.user_idea,
                    cfg,
                    &self.cancel,
                    self.attribution("reflect::fusion"),
                )
                .await?;
            self.log_event(
                "fusion_reflected",
                json!({
                    "pattern_id": next_pattern.pattern_id,
                    "fusion_quality": reflection.fusion_quality,
                }),
            );

            if novelty_mode && !reflection.is_organic(cfg.fusion_quality_threshold) {
                eprintln!(
                    "[pipeline] fusion quality {:.2} below threshold; skipping pattern {}",
                    reflection.fusion_quality, next_pattern.pattern_id
                );
                novelty_attempts.push(NoveltyAttempt {
                    pattern_id: Some(next_pattern.pattern_id.clone()),
                    avg_score: 0.0,
                    story: current_story.clone(),
                    critic: critic_result.clone(),
                });
                if novelty_attempts.len() >= cfg.novelty_mode_max_patterns {
                    novelty_mode = false;
                    break;
                }
                continue;
            }

            let new_tricks = fused.as_tricks();
            for trick in &new_tricks {
                if !injected_tricks.contains(trick) {
                    injected_tricks.push(trick.clone());
                }
            }

            refinement_history.push(RefinementRecord {
                iteration: iterations,
                issue: main_issue,
                pattern_id: refinement.current_pattern_id().map(String::from),
                injected_tricks: new_tricks.clone(),
                fused_idea: Some(fused.clone()),
            });
            last_issue = Some(main_issue);
            pattern = next_pattern;

            // -- Regenerate ---------------------------------------------------
            current_story = self
                .generator
                .generate(
                    &pattern,
                    GenerateContext {
                        constraints: constraints.as_deref(),
                        injected_tricks: Some(&injected_tricks),
                        previous_story: Some(&current_story),
                        review_feedback: Some(&critic_result),
                        fused_idea: Some(&fused),
                        reflection_guidance: Some(&reflection.guidance),
                    },
                    cfg,
                    &self.cancel,
                    self.attribution("story::refine"),
                )
                .await?;
            self.log_event(
                "story_refined",
                json!({"iteration": iterations, "title": current_story.title}),
            );
        }

        // -- Novelty-mode fallback -------------------------------------------
        let ever_passed = review_history.iter().any(|r| r.pass);
        if !ever_passed && !novelty_attempts.is_empty() {
            if let Some(best_attempt) = novelty_attempts.iter().max_by(|a, b| {
                a.avg_score
                    .partial_cmp(&b.avg_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }) {
                eprintln!(
                    "[pipeline] novelty fallback: best attempt avg {:.2} ({:?})",
                    best_attempt.avg_score, best_attempt.pattern_id
                );
                current_story = best_attempt.story.clone();
                last_critic = Some(best_attempt.critic.clone());
            }
        }

        // -- Final version selection ------------------------------------------
        let last_avg = last_critic.as_ref().map(|c| c.avg_score).unwrap_or(0.0);
        let mut final_story = current_story;
        let mut final_source = FinalStorySource {
            iteration: iterations,
            score: last_avg,
            is_best_across_iterations: false,
        };

        if !ever_passed {
            if let Some((best_story, best_score, best_iter, _)) = &global_best {
                if *best_score > last_avg {
                    eprintln!(
                        "[pipeline] using global best (iteration {best_iter}, avg {best_score:.2}) over final version"
                    );
                    final_story = best_story.clone();
                    final_source = FinalStorySource {
                        iteration: *best_iter,
                        score: *best_score,
                        is_best_across_iterations: true,
                    };
                }
            }
        }

        // -- Novelty check + pivot -------------------------------------------
        let mut pivots: u32 = 0;
        let mut novelty_report: Option<NoveltyReport> = None;

        if cfg.novelty_enable {
            let mut report = self
                .novelty
                .check(
                    &final_story,
                    self.embedder.as_ref(),
                    cfg,
                    &self.cancel,
                    self.attribution("novelty::check"),
                )
                .await;
            self.log_event(
                "novelty_check_done",
                json!({
                    "risk_level": to_value(&report.risk_level),
                    "max_similarity": report.max_similarity,
                    "embedding_available": report.embedding_available,
                }),
            );

            if !report.embedding_available && cfg.novelty_require_embedding {
                return Err(EngineError::step_failed(
                    "novelty_check",
                    "embeddings required for novelty check but unavailable",
                ));
            }

            let action = effective_action(&report, cfg.novelty_action);

            while report.risk_level == RiskLevel::High
                && action == NoveltyAction::Pivot
                && pivots < cfg.max_pivots
            {
                pivots += 1;
                let pivot = self.novelty.pivot_constraints(&report);
                eprintln!(
                    "[pipeline] collision (sim {:.2}); pivot {}/{}",
                    report.max_similarity, pivots, cfg.max_pivots
                );
                self.log_event(
                    "novelty_pivot_triggered",
                    json!({
                        "attempt": pivots,
                        "max_similarity": report.max_similarity,
                        "forbidden_techniques": pivot.forbidden_techniques,
                    }),
                );
                constraints = Some(pivot.as_constraints());

                // Pivot regenerates from the most novelty-leaning pattern.
                if let Some(pivot_pattern) = ranked
                    .novelty
                    .first()
                    .or_else(|| ranked.domain_distance.first())
                {
                    pattern = pivot_pattern.pattern.clone();
                }
                final_story = self
                    .generator
                    .generate(
                        &pattern,
                        GenerateContext {
                            constraints: constraints.as_deref(),
                            injected_tricks: Some(&injected_tricks),
                            ..Default::default()
                        },
                        cfg,
                        &self.cancel,
                        self.attribution("story::pivot"),
                    )
                    .await?;

                report = self
                    .novelty
                    .check(
                        &final_story,
                        self.embedder.as_ref(),
                        cfg,
                        &self.cancel,
                        self.attribution("novelty::recheck"),
                    )
                    .await;
                self.log_event(
                    "novelty_check_done",
                    json!({
                        "risk_level": to_value(&report.risk_level),
                        "max_similarity": report.max_similarity,
                        "pivot_attempt": pivots,
                    }),
                );
            }

            if report.risk_level == RiskLevel::High && action == NoveltyAction::Fail {
                let top = report.candidates.first();
                return Err(EngineError::CollisionDetected {
                    paper_id: top.map(|c| c.paper_id.clone()).unwrap_or_default(),
                    max_similarity: report.max_similarity,
                });
            }

            report.pivot_attempts = pivots;
            report.action = Some(action.as_str().to_string());
            novelty_report = Some(report);
        }

        // -- Verification -----------------------------------------------------
        let verification = if cfg.novelty_enable {
            verification_from_report(novelty_report.as_ref(), cfg.collision_threshold)
        } else {
            VerificationResult::skipped(cfg.collision_threshold)
        };

        let success = ever_passed && verification.pass;
        let reason = if success {
            None
        } else if !ever_passed {
            Some("max_iterations_without_pass".to_string())
        } else {
            Some("novelty_collision_unresolved".to_string())
        };

        eprintln!(
            "[pipeline] done: success={} iterations={} pivots={} final=\"{}\"",
            success, iterations, pivots, final_story.title
        );

        Ok(PipelineResult {
            run_id: self.run_id.clone(),
            success,
            reason,
            final_story: Some(final_story),
            final_story_source: Some(final_source),
            iterations,
            pivots,
            selected_patterns,
            review_history,
            refinement_history,
            recall_audit,
            verification: Some(verification),
            novelty_report,
            error: None,
        })
    }

    fn current_pattern(&self, refinement: &RefinementEngine, fallback: &Pattern) -> Pattern {
        refinement
            .current_pattern_id()
            .and_then(|id| self.kg.pattern_by_id(id))
            .cloned()
            .unwrap_or_else(|| fallback.clone())
    }

    fn empty_result(&self, recall_audit: RecallAudit, reason: &str) -> PipelineResult {
        eprintln!("[pipeline] aborting: {reason}");
        self.log_event("pipeline_aborted", json!({"reason": reason}));
        PipelineResult {
            run_id: self.run_id.clone(),
            success: false,
            reason: Some(reason.to_string()),
            final_story: None,
            final_story_source: None,
            iterations: 0,
            pivots: 0,
            selected_patterns: HashMap::new(),
            review_history: Vec::new(),
            refinement_history: Vec::new(),
            recall_audit,
            verification: None,
            novelty_report: None,
            error: None,
        }
    }
}

fn pick_initial_pattern(ranked: &RankedPatterns) -> (Pattern, &'static str) {
    if let Some(first) = ranked.stability.first() {
        return (first.pattern.clone(), "stability");
    }
    if let Some(first) = ranked.novelty.first() {
        return (first.pattern.clone(), "novelty");
    }
    let first = ranked
        .domain_distance
        .first()
        .expect("rankings checked non-empty");
    (first.pattern.clone(), "domain_distance")
}

fn summarize_rankings(ranked: &RankedPatterns) -> HashMap<String, Vec<String>> {
    let top5 = |entries: &[crate::selector::RankedPattern]| {
        entries
            .iter()
            .take(5)
            .map(|e| e.pattern_id.clone())
            .collect::<Vec<_>>()
    };
    let mut out = HashMap::new();
    out.insert("stability".to_string(), top5(&ranked.stability));
    out.insert("novelty".to_string(), top5(&ranked.novelty));
    out.insert("domain_distance".to_string(), top5(&ranked.domain_distance));
    out
}
