//! Deterministic score inference from blind pairwise judgments.
//!
//! Given K anchors with known real scores and the judge's better/tie/worse
//! calls against each, the story's score is the S ∈ [1,10] minimizing the
//! weighted binary cross-entropy of p_i(S) = σ((S − score10_i)/τ) against the
//! judgments. A pure grid search: no randomness, no solver state, so the same
//! comparisons always infer the same score to within the grid step.

use serde::{Deserialize, Serialize};

/// Judgment of the story against one anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Judgement {
    Better,
    Tie,
    Worse,
}

impl Judgement {
    /// Bernoulli target: better → 1, tie → 0.5, worse → 0.
    pub fn target(&self) -> f64 {
        match self {
            Judgement::Better => 1.0,
            Judgement::Tie => 0.5,
            Judgement::Worse => 0.0,
        }
    }
}

/// Judge-reported confidence band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Weak,
    Medium,
    Strong,
}

impl Strength {
    pub fn weight(&self) -> f64 {
        match self {
            Strength::Weak => 1.0,
            Strength::Medium => 2.0,
            Strength::Strong => 3.0,
        }
    }
}

/// One validated comparison as returned by the judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    /// Local alias (`A1`..`AK`); never a paper id.
    pub anchor_id: String,
    pub judgement: Judgement,
    pub strength: Strength,
    pub rationale: String,
}

/// Program-internal anchor summary. Never serialized into a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorSummary {
    /// Local alias matching the card order shown to the judge.
    pub anchor_id: String,
    pub paper_id: String,
    pub score10: f64,
    pub weight: f64,
}

/// Diagnostics emitted alongside the inferred score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceDetail {
    pub loss: f64,
    pub avg_strength: f64,
    pub monotonic_violations: usize,
    pub ci_low: Option<f64>,
    pub ci_high: Option<f64>,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn nll(y: f64, p: f64) -> f64 {
    let eps = 1e-9;
    let p = p.clamp(eps, 1.0 - eps);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

/// Infer the score for one role. Anchors without a matching comparison count
/// as (tie, weak). τ ≤ 0 falls back to 1.0.
pub fn infer_score_from_comparisons(
    anchors: &[AnchorSummary],
    comparisons: &[Comparison],
    tau: f64,
    grid_step: f64,
) -> (f64, InferenceDetail) {
    let tau = if tau > 0.0 { tau } else { 1.0 };
    let grid_step = if grid_step > 0.0 { grid_step } else { 0.01 };

    let mut ys = Vec::with_capacity(anchors.len());
    let mut weights = Vec::with_capacity(anchors.len());
    let mut scores = Vec::with_capacity(anchors.len());
    let mut strength_weights = Vec::with_capacity(anchors.len());

    for anchor in anchors {
        let comp = comparisons.iter().find(|c| c.anchor_id == anchor.anchor_id);
        let (y, strength_w) = match comp {
            Some(c) => (c.judgement.target(), c.strength.weight()),
            None => (Judgement::Tie.target(), Strength::Weak.weight()),
        };
        ys.push(y);
        weights.push(anchor.weight * strength_w);
        scores.push(anchor.score10);
        strength_weights.push(strength_w);
    }

    let mut best_s = 5.0;
    let mut best_loss: Option<f64> = None;
    let mut grid = Vec::new();
    let mut losses = Vec::new();

    let mut s = 1.0f64;
    while s <= 10.0 + 1e-9 {
        let mut loss = 0.0;
        for ((y, w), score) in ys.iter().zip(&weights).zip(&scores) {
            let p = sigmoid((s - score) / tau);
            loss += w * nll(*y, p);
        }
        grid.push(s);
        losses.push(loss);
        if best_loss.map(|b| loss < b).unwrap_or(true) {
            best_loss = Some(loss);
            best_s = s;
        }
        s += grid_step;
    }

    // Profile-likelihood 95% interval for one parameter.
    let (ci_low, ci_high) = match best_loss {
        Some(best) if !grid.is_empty() => {
            let threshold = best + 1.92;
            let within: Vec<f64> = grid
                .iter()
                .zip(&losses)
                .filter(|(_, &l)| l <= threshold)
                .map(|(&g, _)| g)
                .collect();
            (
                within.iter().cloned().fold(None, |acc: Option<f64>, v| {
                    Some(acc.map(|a| a.min(v)).unwrap_or(v))
                }),
                within.iter().cloned().fold(None, |acc: Option<f64>, v| {
                    Some(acc.map(|a| a.max(v)).unwrap_or(v))
                }),
            )
        }
        _ => (None, None),
    };

    // Judgments should not improve as anchors get stronger.
    let mut pairs: Vec<(f64, f64)> = scores.iter().cloned().zip(ys.iter().cloned()).collect();
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let mut monotonic_violations = 0;
    let mut prev_y: Option<f64> = None;
    for (_, y) in pairs {
        if let Some(prev) = prev_y {
            if y > prev + 0.1 {
                monotonic_violations += 1;
            }
        }
        prev_y = Some(y);
    }

    let avg_strength = if strength_weights.is_empty() {
        1.0
    } else {
        strength_weights.iter().sum::<f64>() / strength_weights.len() as f64
    };

    (
        best_s,
        InferenceDetail {
            loss: best_loss.unwrap_or(0.0),
            avg_strength,
            monotonic_violations,
            ci_low,
            ci_high,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchors(scores: &[f64]) -> Vec<AnchorSummary> {
        scores
            .iter()
            .enumerate()
            .map(|(i, &score10)| AnchorSummary {
                anchor_id: format!("A{}", i + 1),
                paper_id: format!("paper_{}", i + 1),
                score10,
                weight: 1.0,
            })
            .collect()
    }

    fn comparison(anchor_id: &str, judgement: Judgement) -> Comparison {
        Comparison {
            anchor_id: anchor_id.to_string(),
            judgement,
            strength: Strength::Medium,
            rationale: "clearer method".to_string(),
        }
    }

    #[test]
    fn golden_vector_uniform_strength() {
        // Anchors 5..9, judgments B,B,T,W,B, τ=1.0, all medium strength.
        // At the optimum Σ σ(S − s_i) = Σ y_i = 3.5, whose root sits at
        // S ≈ 8.2.
        let anchors = anchors(&[5.0, 6.0, 7.0, 8.0, 9.0]);
        let comparisons = vec![
            comparison("A1", Judgement::Better),
            comparison("A2", Judgement::Better),
            comparison("A3", Judgement::Tie),
            comparison("A4", Judgement::Worse),
            comparison("A5", Judgement::Better),
        ];
        let (s, detail) = infer_score_from_comparisons(&anchors, &comparisons, 1.0, 0.01);
        assert!(s > 8.0 && s < 8.45, "expected ~8.2, got {s}");
        assert!(detail.loss > 0.0);
        assert_eq!(detail.monotonic_violations, 1);
    }

    #[test]
    fn golden_vector_strong_worse_pulls_down() {
        // Same judgments, but the single "worse" call is strong while the
        // rest are weak: the weighted optimum drops to S ≈ 7.36.
        let anchors = anchors(&[5.0, 6.0, 7.0, 8.0, 9.0]);
        let mk = |id: &str, judgement, strength| Comparison {
            anchor_id: id.to_string(),
            judgement,
            strength,
            rationale: "clearer method".to_string(),
        };
        let comparisons = vec![
            mk("A1", Judgement::Better, Strength::Weak),
            mk("A2", Judgement::Better, Strength::Weak),
            mk("A3", Judgement::Tie, Strength::Weak),
            mk("A4", Judgement::Worse, Strength::Strong),
            mk("A5", Judgement::Better, Strength::Weak),
        ];
        let (s, _) = infer_score_from_comparisons(&anchors, &comparisons, 1.0, 0.01);
        assert!(s > 7.25 && s < 7.5, "expected ~7.4, got {s}");
    }

    #[test]
    fn all_tie_lands_on_weighted_mean() {
        let anchors = anchors(&[4.0, 6.0, 8.0]);
        let comparisons: Vec<Comparison> = anchors
            .iter()
            .map(|a| comparison(&a.anchor_id, Judgement::Tie))
            .collect();
        let (s, _) = infer_score_from_comparisons(&anchors, &comparisons, 1.0, 0.01);
        assert!((s - 6.0).abs() <= 0.01 + 1e-9, "expected mean 6.0, got {s}");
    }

    #[test]
    fn all_better_saturates_high() {
        let anchors = anchors(&[2.0, 3.0, 4.0]);
        let comparisons: Vec<Comparison> = anchors
            .iter()
            .map(|a| comparison(&a.anchor_id, Judgement::Better))
            .collect();
        let (s, _) = infer_score_from_comparisons(&anchors, &comparisons, 1.0, 0.01);
        assert!(s > 9.5, "expected saturation toward 10, got {s}");
    }

    #[test]
    fn monotone_in_judgments() {
        // Flipping every judgment to better must not decrease the score.
        let anchors = anchors(&[4.0, 5.0, 6.0, 7.0]);
        let mixed = vec![
            comparison("A1", Judgement::Better),
            comparison("A2", Judgement::Tie),
            comparison("A3", Judgement::Worse),
            comparison("A4", Judgement::Worse),
        ];
        let all_better: Vec<Comparison> = anchors
            .iter()
            .map(|a| comparison(&a.anchor_id, Judgement::Better))
            .collect();
        let (s_mixed, _) = infer_score_from_comparisons(&anchors, &mixed, 1.0, 0.01);
        let (s_better, _) = infer_score_from_comparisons(&anchors, &all_better, 1.0, 0.01);
        assert!(s_better >= s_mixed);
    }

    #[test]
    fn missing_comparison_defaults_to_weak_tie() {
        let anchors = anchors(&[5.0, 7.0]);
        let partial = vec![comparison("A1", Judgement::Better)];
        let (s, detail) = infer_score_from_comparisons(&anchors, &partial, 1.0, 0.01);
        assert!(s > 5.0);
        // A2 contributed weak strength (1.0), A1 medium (2.0).
        assert!((detail.avg_strength - 1.5).abs() < 1e-9);
    }

    #[test]
    fn deterministic_across_calls() {
        let anchors = anchors(&[5.0, 6.0, 7.0, 8.0, 9.0]);
        let comparisons = vec![
            comparison("A1", Judgement::Better),
            comparison("A2", Judgement::Better),
            comparison("A3", Judgement::Tie),
            comparison("A4", Judgement::Worse),
            comparison("A5", Judgement::Better),
        ];
        let (s1, d1) = infer_score_from_comparisons(&anchors, &comparisons, 1.0, 0.01);
        let (s2, d2) = infer_score_from_comparisons(&anchors, &comparisons, 1.0, 0.01);
        assert_eq!(s1, s2);
        assert_eq!(d1.loss, d2.loss);
        assert_eq!(d1.ci_low, d2.ci_low);
    }

    #[test]
    fn ci_brackets_best_score() {
        let anchors = anchors(&[5.0, 6.0, 7.0]);
        let comparisons = vec![
            comparison("A1", Judgement::Better),
            comparison("A2", Judgement::Tie),
            comparison("A3", Judgement::Worse),
        ];
        let (s, detail) = infer_score_from_comparisons(&anchors, &comparisons, 1.0, 0.01);
        let (low, high) = (detail.ci_low.unwrap(), detail.ci_high.unwrap());
        assert!(low <= s && s <= high);
    }
}
