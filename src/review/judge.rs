//! Blind per-role judging.
//!
//! One LLM call per role: the story card and K anonymized anchor cards go
//! in, K better/tie/worse comparisons come out. Two walls keep the process
//! blind:
//!
//! 1. an outbound leak guard rejects any prompt that carries a paper id, a
//!    title fragment, or a numeric-verdict token before transmission;
//! 2. inbound validation requires every anchor covered exactly once and
//!    filters rationales against a forbidden-term list, with repair retries
//!    up to the configured budget.

use std::sync::Arc;

use serde::Deserialize;

use crate::cache::{JudgementCache, JudgementCacheKey};
use crate::config::Config;
use crate::error::{CancelFlag, EngineError};
use crate::gateway::{Attribution, ChatGateway, ChatRequest, Message};
use crate::llmjson::parse_llm_json;
use crate::review::cards::{BlindCard, CARD_VERSION};
use crate::review::inference::{AnchorSummary, Comparison, Judgement, Strength};
use crate::review::rubric::{Role, RUBRIC_VERSION};

/// Terms that must never appear in a rationale (and never reach the judge in
/// the first place).
pub const FORBIDDEN_TERMS: &[&str] = &[
    "score",
    "rating",
    "accept",
    "paper_id",
    "title",
    "author",
    "link",
    "doi",
    "arxiv",
    "pattern_id",
    "/10",
];

/// Minimum title-fragment length the leak guard scans for.
const TITLE_FRAGMENT_MIN_CHARS: usize = 8;

/// Raw wire shape before validation.
#[derive(Debug, Deserialize)]
struct JudgementJson {
    #[serde(default)]
    rubric_version: Option<String>,
    #[serde(default)]
    comparisons: Vec<ComparisonJson>,
}

#[derive(Debug, Deserialize)]
struct ComparisonJson {
    #[serde(default)]
    anchor_id: Option<String>,
    #[serde(default)]
    judgement: Option<String>,
    #[serde(default)]
    strength: Option<String>,
    #[serde(default)]
    rationale: Option<String>,
}

pub struct BlindJudge {
    gateway: Arc<dyn ChatGateway>,
    model: String,
    cache: Option<Arc<dyn JudgementCache>>,
}

impl BlindJudge {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        model: impl Into<String>,
        cache: Option<Arc<dyn JudgementCache>>,
    ) -> Self {
        Self {
            gateway,
            model: model.into(),
            cache,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Judge the story against each anchor for one role. `anchors` carry the
    /// local aliases; `anchor_titles` exists only so the leak guard can scan
    /// for title fragments.
    #[allow(clippy::too_many_arguments)]
    pub async fn judge(
        &self,
        role: Role,
        story_card: &BlindCard,
        anchor_cards: &[BlindCard],
        anchors: &[AnchorSummary],
        anchor_titles: &[String],
        cfg: &Config,
        cancel: &CancelFlag,
        attribution: Attribution,
    ) -> Result<Vec<Comparison>, EngineError> {
        cancel.check()?;
        debug_assert_eq!(anchor_cards.len(), anchors.len());

        let anchor_ids: Vec<&str> = anchors.iter().map(|a| a.anchor_id.as_str()).collect();
        let prompt = build_judge_prompt(role, story_card, anchor_cards, &anchor_ids);

        // The whole point of blind cards: refuse to transmit anything that
        // would let the judge recognize an anchor.
        guard_outgoing_prompt(&prompt, anchors, anchor_titles)?;

        let cache_key = self.cache.as_ref().map(|_| {
            JudgementCacheKey::new(
                &self.model,
                RUBRIC_VERSION,
                CARD_VERSION,
                role.as_str(),
                &serde_json::to_string(story_card).unwrap_or_default(),
                &serde_json::to_string(anchor_cards).unwrap_or_default(),
            )
        });

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            match cache.get(key).await {
                Ok(Some(hit)) if hit.len() == anchors.len() => return Ok(hit),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "judgement cache read failed; judging live");
                }
            }
        }

        let mut response = self
            .chat(&prompt, cfg, attribution.clone())
            .await
            .map_err(|e| EngineError::step_failed("blind_judge", e.to_string()))?;

        let mut outcome = validate_judgement(&response, &anchor_ids);
        let mut attempts = 0u32;
        while outcome.is_err() && attempts < cfg.json_retries {
            attempts += 1;
            cancel.check()?;
            let reason = outcome.as_ref().err().cloned().unwrap_or_default();
            tracing::warn!(role = role.as_str(), attempt = attempts, %reason, "judge output invalid; repair retry");
            let repair = build_repair_prompt(&response, &anchor_ids);
            response = self
                .chat(&repair, cfg, attribution.clone())
                .await
                .map_err(|e| EngineError::step_failed("blind_judge_repair", e.to_string()))?;
            outcome = validate_judgement(&response, &anchor_ids);
        }

        let comparisons = match outcome {
            Ok(comparisons) => comparisons,
            Err(reason) => {
                if cfg.critic_strict_json {
                    return Err(EngineError::invalid_output(
                        "blind_judge",
                        format!("role {}: {reason} after {attempts} repair retries", role.as_str()),
                    ));
                }
                // Downgrade: neutral ties keep the pipeline moving.
                anchor_ids
                    .iter()
                    .map(|id| Comparison {
                        anchor_id: id.to_string(),
                        judgement: Judgement::Tie,
                        strength: Strength::Weak,
                        rationale: "Unable to parse; neutral comparison.".to_string(),
                    })
                    .collect()
            }
        };

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Err(err) = cache.put(key, &comparisons).await {
                tracing::warn!(error = %err, "judgement cache write failed");
            }
        }

        Ok(comparisons)
    }

    async fn chat(
        &self,
        prompt: &str,
        cfg: &Config,
        attribution: Attribution,
    ) -> Result<String, crate::gateway::ProviderError> {
        let req = ChatRequest::new(
            self.model.clone(),
            vec![Message::user(prompt)],
            attribution,
        )
        .temperature(cfg.critic_temperature)
        .max_tokens(800)
        .json();
        Ok(self.gateway.chat(req).await?.content)
    }
}

// =============================================================================
// Prompt building & leak guard
// =============================================================================

fn build_judge_prompt(
    role: Role,
    story_card: &BlindCard,
    anchor_cards: &[BlindCard],
    anchor_ids: &[&str],
) -> String {
    let anchors_text = anchor_ids
        .iter()
        .zip(anchor_cards)
        .map(|(id, card)| format!("{id}:\n{}", card.render()))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"You are a strict reviewer focused on {role}.
You MUST NOT output any numbers, identifiers, names of works, people, or sources.
You are given a Story card and multiple anonymous Anchor cards. Compare the Story against each Anchor on the rubric.

Rubric ({role}):
{rubric}

Story Card:
{story}

Anchor Cards:
{anchors}

Task:
For EACH anchor, output a judgement of the Story vs that Anchor on {role}:
- judgement: better | tie | worse
- strength: weak | medium | strong
- rationale: at most 25 words, referring ONLY to card content. No numbers, no identifiers.

Return JSON ONLY:
{{
  "rubric_version": "{rubric_version}",
  "comparisons": [
    {{"anchor_id": "A1", "judgement": "better|tie|worse", "strength": "weak|medium|strong", "rationale": "..."}}
  ]
}}"#,
        role = role.as_str(),
        rubric = role.rubric(),
        story = story_card.render(),
        anchors = anchors_text,
        rubric_version = RUBRIC_VERSION,
    )
}

fn build_repair_prompt(previous: &str, anchor_ids: &[&str]) -> String {
    let mut clipped = previous;
    if clipped.len() > 6000 {
        let mut cut = 6000;
        while !clipped.is_char_boundary(cut) {
            cut -= 1;
        }
        clipped = &clipped[..cut];
    }
    format!(
        r#"Fix the previous output into STRICT valid JSON only.
Rules:
1) Output JSON ONLY (no markdown, no explanation).
2) "comparisons" length MUST equal the number of anchors.
3) anchor_id MUST be one of: {ids}.
4) judgement must be one of: better|tie|worse.
5) strength must be one of: weak|medium|strong.
6) rationale must be at most 25 words with no numbers and no identifiers.

Previous output:
{previous}

Return ONLY the corrected JSON:
{{
  "rubric_version": "{rubric_version}",
  "comparisons": [
    {{"anchor_id": "A1", "judgement": "better|tie|worse", "strength": "weak|medium|strong", "rationale": "..."}}
  ]
}}"#,
        ids = anchor_ids.join(", "),
        previous = clipped,
        rubric_version = RUBRIC_VERSION,
    )
}

/// Reject a prompt that would de-anonymize an anchor: raw paper ids, title
/// fragments of 8+ chars, or verdict/number tokens.
pub fn guard_outgoing_prompt(
    prompt: &str,
    anchors: &[AnchorSummary],
    anchor_titles: &[String],
) -> Result<(), EngineError> {
    let lower = prompt.to_lowercase();

    for term in FORBIDDEN_TERMS {
        if lower.contains(term) {
            return Err(EngineError::invalid_output(
                "blind_judge_prompt",
                format!("prompt contains forbidden term {term:?}"),
            ));
        }
    }

    for anchor in anchors {
        if !anchor.paper_id.is_empty() && lower.contains(&anchor.paper_id.to_lowercase()) {
            return Err(EngineError::invalid_output(
                "blind_judge_prompt",
                format!("prompt leaks anchor paper id {}", anchor.paper_id),
            ));
        }
    }

    for title in anchor_titles {
        let title = title.trim().to_lowercase();
        if title.chars().count() >= TITLE_FRAGMENT_MIN_CHARS && lower.contains(&title) {
            return Err(EngineError::invalid_output(
                "blind_judge_prompt",
                "prompt leaks an anchor title".to_string(),
            ));
        }
        // Sliding window over longer titles catches partial leaks.
        let chars: Vec<char> = title.chars().collect();
        if chars.len() > TITLE_FRAGMENT_MIN_CHARS {
            for window in chars.windows(TITLE_FRAGMENT_MIN_CHARS) {
                let fragment: String = window.iter().collect();
                if fragment.trim().chars().count() == TITLE_FRAGMENT_MIN_CHARS
                    && lower.contains(&fragment)
                {
                    return Err(EngineError::invalid_output(
                        "blind_judge_prompt",
                        "prompt leaks an anchor title fragment".to_string(),
                    ));
                }
            }
        }
    }

    Ok(())
}

// =============================================================================
// Response validation
// =============================================================================

fn contains_forbidden(text: &str) -> bool {
    let lower = text.to_lowercase();
    FORBIDDEN_TERMS.iter().any(|term| lower.contains(term))
}

fn validate_judgement(raw: &str, anchor_ids: &[&str]) -> Result<Vec<Comparison>, String> {
    let parsed: JudgementJson =
        parse_llm_json(raw).map_err(|e| format!("parse_failed: {e}"))?;

    if let Some(version) = &parsed.rubric_version {
        if version != RUBRIC_VERSION {
            return Err(format!("rubric_version_mismatch: {version}"));
        }
    }

    let valid: std::collections::HashSet<&str> = anchor_ids.iter().copied().collect();
    let mut seen = std::collections::HashSet::new();
    let mut normalized = Vec::new();

    for comp in parsed.comparisons {
        let Some(anchor_id) = comp.anchor_id else {
            continue;
        };
        if !valid.contains(anchor_id.as_str()) || seen.contains(anchor_id.as_str()) {
            continue;
        }
        let judgement = match comp.judgement.as_deref() {
            Some("better") => Judgement::Better,
            Some("tie") => Judgement::Tie,
            Some("worse") => Judgement::Worse,
            _ => return Err("schema_invalid: bad judgement".to_string()),
        };
        let strength = match comp.strength.as_deref() {
            Some("weak") => Strength::Weak,
            Some("medium") => Strength::Medium,
            Some("strong") => Strength::Strong,
            _ => return Err("schema_invalid: bad strength".to_string()),
        };
        let rationale = comp
            .rationale
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if rationale.is_empty() {
            return Err("schema_invalid: empty rationale".to_string());
        }
        if rationale.split_whitespace().count() > 25 {
            return Err("rationale_too_long".to_string());
        }
        if contains_forbidden(&rationale) {
            return Err("rationale_contains_forbidden".to_string());
        }
        seen.insert(anchor_id.clone());
        normalized.push(Comparison {
            anchor_id,
            judgement,
            strength,
            rationale,
        });
    }

    if seen.len() != valid.len() {
        return Err(format!(
            "missing_anchors: got {} of {}",
            seen.len(),
            valid.len()
        ));
    }

    // Re-emit in prompt order.
    let mut ordered = Vec::with_capacity(anchor_ids.len());
    for id in anchor_ids {
        if let Some(pos) = normalized.iter().position(|c| c.anchor_id == *id) {
            ordered.push(normalized.remove(pos));
        }
    }
    Ok(ordered)
}
