//! Anchored multi-agent critic.
//!
//! Three blind role judgments against real anchor papers, deterministic
//! score inference per role, one optional densify round, then the
//! pattern-aware pass rule. Anchor identities live only in the audit, which
//! stays in the program log; the judge never sees them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{CancelFlag, EngineError};
use crate::gateway::Attribution;
use crate::kg::{KgStore, Pattern};
use crate::review::anchors::{alias_anchors, PaperAnchor, ReviewIndex};
use crate::review::cards::{build_paper_card, build_story_card, BlindCard, CARD_VERSION};
use crate::review::coach::{CoachResult, CoachReviewer};
use crate::review::inference::{
    infer_score_from_comparisons, AnchorSummary, Comparison, InferenceDetail,
};
use crate::review::judge::BlindJudge;
use crate::review::rubric::{IssueKind, Role, RUBRIC_VERSION};
use crate::review::tau::{TauSource, TauTable};
use crate::story::Story;

// =============================================================================
// Result types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleReview {
    pub reviewer: String,
    pub role: Role,
    pub score: f64,
    pub feedback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleDetail {
    pub comparisons: Vec<Comparison>,
    pub loss: f64,
    pub avg_strength: f64,
    pub monotonic_violations: usize,
    pub ci_low: Option<f64>,
    pub ci_high: Option<f64>,
    pub tau: f64,
    pub score: f64,
}

/// How the pass thresholds were derived and how the story measured up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassAudit {
    pub mode: String,
    /// "pattern" | "global" | "fixed"
    pub used_distribution: String,
    pub pattern_paper_count: usize,
    pub q50: Option<f64>,
    pub q75: Option<f64>,
    pub count_roles_ge_q75: usize,
    pub roles_ge_q75: HashMap<String, bool>,
    pub avg_ge_q50: Option<bool>,
    pub avg_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticAudit {
    pub pattern_id: String,
    /// Program log only; never serialized into a prompt.
    pub anchors: Vec<AnchorSummary>,
    pub densify_triggered: bool,
    pub densify_added: usize,
    pub role_details: HashMap<String, RoleDetail>,
    pub pass: Option<PassAudit>,
    pub rubric_version: String,
    pub card_version: String,
    pub tau_source: TauSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticResult {
    pub pass: bool,
    pub avg_score: f64,
    pub reviews: Vec<RoleReview>,
    pub main_issue: IssueKind,
    pub suggestions: Vec<String>,
    pub audit: CriticAudit,
    pub coach: Option<CoachResult>,
}

impl CriticResult {
    pub fn role_score(&self, role: Role) -> Option<f64> {
        self.reviews.iter().find(|r| r.role == role).map(|r| r.score)
    }
}

// =============================================================================
// Critic
// =============================================================================

pub struct AnchoredCritic {
    kg: Arc<KgStore>,
    review_index: Arc<ReviewIndex>,
    judge: BlindJudge,
    coach: CoachReviewer,
    tau: TauTable,
}

impl AnchoredCritic {
    pub fn new(
        kg: Arc<KgStore>,
        review_index: Arc<ReviewIndex>,
        judge: BlindJudge,
        coach: CoachReviewer,
        tau: TauTable,
    ) -> Self {
        Self {
            kg,
            review_index,
            judge,
            coach,
            tau,
        }
    }

    /// Review a story in the context of the pattern it was generated from.
    pub async fn review(
        &self,
        story: &Story,
        pattern: &Pattern,
        cfg: &Config,
        cancel: &CancelFlag,
        attribution: Attribution,
    ) -> Result<CriticResult, EngineError> {
        cancel.check()?;
        eprintln!(
            "[critic] blind review: pattern={} roles={}",
            pattern.pattern_id,
            Role::ALL.len()
        );

        let initial = self.review_index.select_initial_anchors(
            pattern,
            &cfg.anchor_quantiles,
            cfg.anchor_max_initial,
            cfg.anchor_max_exemplars,
        );

        if initial.len() < 3 {
            // No usable calibration basis anywhere near this pattern.
            return Err(EngineError::Config(crate::config::ConfigError::message(
                format!(
                    "insufficient anchors for pattern {} ({} usable; need 3)",
                    pattern.pattern_id,
                    initial.len()
                ),
            )));
        }

        let story_card = build_story_card(story);

        // -- Round 1 ----------------------------------------------------------
        let (anchors, ordered) = self.prepare(&initial);
        let (cards, titles) = self.cards_for(&ordered);
        let round1 = self
            .run_round(&story_card, &anchors, &cards, &titles, cfg, cancel, &attribution)
            .await?;

        // -- Densify ----------------------------------------------------------
        let densify_needed = cfg.densify_enable
            && round1.values().any(|d| {
                d.loss > cfg.densify_loss_threshold
                    || d.monotonic_violations >= 1
                    || d.avg_strength < cfg.densify_min_avg_conf
            });

        let mut densify_added = 0usize;
        let (final_anchors, role_details) = if densify_needed {
            let scores: Vec<f64> = round1.values().map(|d| d.score).collect();
            let hint = scores.iter().sum::<f64>() / scores.len().max(1) as f64;
            let center = (hint * 2.0).round() / 2.0;
            let selected: HashSet<String> =
                initial.iter().map(|a| a.paper_id.clone()).collect();
            let extra = self.review_index.select_bucket_anchors(
                &pattern.pattern_id,
                center,
                cfg.bucket_size,
                cfg.bucket_count,
                &selected,
            );

            if extra.is_empty() {
                eprintln!("[critic] densify found no new anchors; keeping round 1");
                (anchors, round1)
            } else {
                densify_added = extra.len();
                eprintln!(
                    "[critic] densify: +{} anchors centered at {:.1}; second blind round",
                    extra.len(),
                    center
                );
                let mut extended = initial.clone();
                extended.extend(extra);
                if extended.len() > cfg.anchor_max_total {
                    extended.truncate(cfg.anchor_max_total);
                }
                let (anchors2, ordered2) = self.prepare(&extended);
                let (cards2, titles2) = self.cards_for(&ordered2);
                let round2 = self
                    .run_round(&story_card, &anchors2, &cards2, &titles2, cfg, cancel, &attribution)
                    .await?;
                (anchors2, round2)
            }
        } else {
            (anchors, round1)
        };

        // -- Aggregate --------------------------------------------------------
        let mut reviews = Vec::new();
        let mut role_scores: HashMap<Role, f64> = HashMap::new();
        for role in Role::ALL {
            let detail = &role_details[role.as_str()];
            eprintln!(
                "[critic]   {}: S={:.2} loss={:.4} strength={:.2} tau={:.2}",
                role.as_str(),
                detail.score,
                detail.loss,
                detail.avg_strength,
                detail.tau
            );
            role_scores.insert(role, detail.score);
            reviews.push(RoleReview {
                reviewer: role.reviewer_name().to_string(),
                role,
                score: detail.score,
                feedback: format!(
                    "Blind comparisons vs {} anchors. Loss={:.4}, AvgStrength={:.2}.",
                    final_anchors.len(),
                    detail.loss,
                    detail.avg_strength
                ),
            });
        }

        let avg_score =
            reviews.iter().map(|r| r.score).sum::<f64>() / reviews.len().max(1) as f64;
        let (passed, pass_audit) = self.pass_decision(avg_score, &role_scores, pattern, cfg);
        let main_issue = diagnose(&reviews);
        let suggestions = main_issue.suggestions();

        eprintln!(
            "[critic] avg={:.2} pass={} main_issue={}",
            avg_score,
            passed,
            main_issue.as_str()
        );

        // Coach runs after scoring and never alters scores.
        let coach = match self
            .coach
            .review(story, &role_scores, main_issue, cfg, cancel, attribution.clone())
            .await
        {
            Ok(result) => Some(result),
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(err) => {
                tracing::warn!(error = %err, "coach failed; continuing without edits");
                None
            }
        };

        let mut reviews = reviews;
        if let Some(coach_result) = &coach {
            if !coach_result.priority.is_empty() {
                let top: Vec<&str> = coach_result
                    .priority
                    .iter()
                    .take(3)
                    .map(|s| s.as_str())
                    .collect();
                for review in &mut reviews {
                    review.feedback =
                        format!("{} CoachPriority: {}.", review.feedback, top.join(", "));
                }
            }
        }

        Ok(CriticResult {
            pass: passed,
            avg_score,
            reviews,
            main_issue,
            suggestions,
            audit: CriticAudit {
                pattern_id: pattern.pattern_id.clone(),
                anchors: final_anchors,
                densify_triggered: densify_needed,
                densify_added,
                role_details,
                pass: Some(pass_audit),
                rubric_version: RUBRIC_VERSION.to_string(),
                card_version: CARD_VERSION.to_string(),
                tau_source: self.tau.source,
            },
            coach,
        })
    }

    /// Alias + order one anchor set.
    fn prepare(&self, selected: &[PaperAnchor]) -> (Vec<AnchorSummary>, Vec<PaperAnchor>) {
        alias_anchors(selected.to_vec())
    }

    /// Cards and titles in alias order. Titles feed the leak guard only.
    fn cards_for(&self, ordered: &[PaperAnchor]) -> (Vec<BlindCard>, Vec<String>) {
        let mut cards = Vec::with_capacity(ordered.len());
        let mut titles = Vec::with_capacity(ordered.len());
        for anchor in ordered {
            match self.kg.paper_by_id(&anchor.paper_id) {
                Some(paper) => {
                    cards.push(build_paper_card(paper));
                    titles.push(paper.title.clone());
                }
                None => {
                    cards.push(build_paper_card(&crate::kg::Paper {
                        paper_id: anchor.paper_id.clone(),
                        title: String::new(),
                        pattern_id: None,
                        domain_id: String::new(),
                        review_stats: None,
                        skeleton: None,
                        abstract_text: None,
                    }));
                    titles.push(String::new());
                }
            }
        }
        (cards, titles)
    }

    /// One blind round: the three roles run concurrently.
    #[allow(clippy::too_many_arguments)]
    async fn run_round(
        &self,
        story_card: &BlindCard,
        anchors: &[AnchorSummary],
        cards: &[BlindCard],
        titles: &[String],
        cfg: &Config,
        cancel: &CancelFlag,
        attribution: &Attribution,
    ) -> Result<HashMap<String, RoleDetail>, EngineError> {
        let futures = Role::ALL.iter().map(|&role| {
            let attribution = attribution.clone();
            async move {
                let comparisons = self
                    .judge
                    .judge(role, story_card, cards, anchors, titles, cfg, cancel, attribution)
                    .await?;
                let tau = self.tau.for_role(role);
                let (score, detail) =
                    infer_score_from_comparisons(anchors, &comparisons, tau, cfg.grid_step);
                Ok::<(Role, Vec<Comparison>, f64, f64, InferenceDetail), EngineError>((
                    role,
                    comparisons,
                    tau,
                    score,
                    detail,
                ))
            }
        });

        let results = try_join_all(futures).await?;
        Ok(results
            .into_iter()
            .map(|(role, comparisons, tau, score, detail)| {
                (
                    role.as_str().to_string(),
                    RoleDetail {
                        comparisons,
                        loss: detail.loss,
                        avg_strength: detail.avg_strength,
                        monotonic_violations: detail.monotonic_violations,
                        ci_low: detail.ci_low,
                        ci_high: detail.ci_high,
                        tau,
                        score,
                    },
                )
            })
            .collect())
    }

    /// Pass iff ≥2 of 3 roles ≥ q75 and the average ≥ q50. Thresholds come
    /// from the pattern's own score distribution when it has enough papers,
    /// else the global distribution, else the fixed pass score.
    fn pass_decision(
        &self,
        avg_score: f64,
        role_scores: &HashMap<Role, f64>,
        pattern: &Pattern,
        cfg: &Config,
    ) -> (bool, PassAudit) {
        let pattern_stats = self.review_index.pattern_quantiles(&pattern.pattern_id);

        let (q50, q75, used_distribution) = if pattern_stats.n >= cfg.pass_min_pattern_papers
            && pattern_stats.q50.is_some()
            && pattern_stats.q75.is_some()
        {
            (pattern_stats.q50, pattern_stats.q75, "pattern")
        } else {
            let global = self.review_index.global_quantiles();
            match (global.q50, global.q75) {
                (Some(q50), Some(q75)) => (Some(q50), Some(q75), "global"),
                _ => (None, None, "fixed"),
            }
        };

        let mut roles_ge_q75 = HashMap::new();
        let (passed, count_ge, avg_ge) = match (q50, q75) {
            (Some(q50), Some(q75)) => {
                let mut count = 0usize;
                for role in Role::ALL {
                    let ok = role_scores.get(&role).copied().unwrap_or(0.0) >= q75;
                    roles_ge_q75.insert(role.as_str().to_string(), ok);
                    if ok {
                        count += 1;
                    }
                }
                let avg_ok = avg_score >= q50;
                (count >= 2 && avg_ok, count, Some(avg_ok))
            }
            _ => (avg_score >= cfg.pass_score, 0, None),
        };

        (
            passed,
            PassAudit {
                mode: "two_of_three_q75_and_avg_ge_q50".to_string(),
                used_distribution: used_distribution.to_string(),
                pattern_paper_count: pattern_stats.n,
                q50,
                q75,
                count_roles_ge_q75: count_ge,
                roles_ge_q75,
                avg_ge_q50: avg_ge,
                avg_score,
            },
        )
    }
}

/// Worst-scoring role names the refinement dimension.
fn diagnose(reviews: &[RoleReview]) -> IssueKind {
    reviews
        .iter()
        .min_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|worst| IssueKind::from_role(worst.role))
        .unwrap_or(IssueKind::Novelty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnose_maps_worst_role() {
        let reviews = vec![
            RoleReview {
                reviewer: "Reviewer A".into(),
                role: Role::Methodology,
                score: 7.0,
                feedback: String::new(),
            },
            RoleReview {
                reviewer: "Reviewer B".into(),
                role: Role::Novelty,
                score: 5.0,
                feedback: String::new(),
            },
            RoleReview {
                reviewer: "Reviewer C".into(),
                role: Role::Storyteller,
                score: 6.0,
                feedback: String::new(),
            },
        ];
        assert_eq!(diagnose(&reviews), IssueKind::Novelty);
    }

    #[test]
    fn diagnose_empty_defaults_to_novelty() {
        assert_eq!(diagnose(&[]), IssueKind::Novelty);
    }
}
