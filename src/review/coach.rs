//! Coach layer: field-level edit advice after scoring.
//!
//! Runs once per critic round, after scores are fixed. It never changes a
//! score; it turns the role feedback into concrete edit instructions the
//! next generation round can execute.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{CancelFlag, EngineError};
use crate::gateway::{Attribution, ChatGateway, ChatRequest, Message};
use crate::llmjson::parse_llm_json;
use crate::review::rubric::{IssueKind, Role};
use crate::story::Story;

/// Feedback on one story field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldFeedback {
    #[serde(default)]
    pub issue: String,
    #[serde(default)]
    pub edit_instruction: String,
    #[serde(default)]
    pub expected_effect: String,
}

/// One concrete edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedEdit {
    pub field: String,
    /// rewrite | add | delete | expand
    pub action: String,
    pub content: String,
}

/// Full coach output for one round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoachResult {
    #[serde(default)]
    pub field_feedback: HashMap<String, FieldFeedback>,
    #[serde(default)]
    pub suggested_edits: Vec<SuggestedEdit>,
    /// Fields to fix first, most urgent first.
    #[serde(default)]
    pub priority: Vec<String>,
}

pub struct CoachReviewer {
    gateway: Arc<dyn ChatGateway>,
    model: String,
}

impl CoachReviewer {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
        }
    }

    pub async fn review(
        &self,
        story: &Story,
        role_scores: &HashMap<Role, f64>,
        main_issue: IssueKind,
        cfg: &Config,
        cancel: &CancelFlag,
        attribution: Attribution,
    ) -> Result<CoachResult, EngineError> {
        cancel.check()?;

        let prompt = build_prompt(story, role_scores, main_issue);
        let mut response = self
            .chat(&prompt, cfg, attribution.clone())
            .await
            .map_err(|e| EngineError::step_failed("coach", e.to_string()))?;

        let mut parsed: Option<CoachResult> = parse_llm_json(&response).ok();
        let mut attempts = 0u32;
        while parsed.is_none() && attempts < cfg.json_retries {
            attempts += 1;
            cancel.check()?;
            tracing::warn!(attempt = attempts, "coach output invalid; repair retry");
            let repair = build_repair_prompt(&response);
            response = self
                .chat(&repair, cfg, attribution.clone())
                .await
                .map_err(|e| EngineError::step_failed("coach_repair", e.to_string()))?;
            parsed = parse_llm_json(&response).ok();
        }

        match parsed {
            Some(result) => Ok(result),
            None if cfg.critic_strict_json => Err(EngineError::invalid_output(
                "coach",
                format!("coach JSON unparseable after {attempts} repair retries"),
            )),
            None => Ok(CoachResult::default()),
        }
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
        .temperature(cfg.coach_temperature)
        .max_tokens(4096)
        .json();
        Ok(self.gateway.chat(req).await?.content)
    }
}

fn build_prompt(story: &Story, role_scores: &HashMap<Role, f64>, main_issue: IssueKind) -> String {
    let scores_line = Role::ALL
        .iter()
        .map(|role| {
            format!(
                "{}={:.1}",
                role.as_str(),
                role_scores.get(role).copied().unwrap_or(0.0)
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"You are a strict research writing coach. Provide field-level, actionable edits.
Do NOT output any numeric overall scores. Focus on concrete fixes.

Role scores (for context only): {scores_line}
Main issue: {issue}

Story:
Title: {title}
Abstract: {abstract_text}
Problem: {problem}
Method: {method}
Innovation Claims: {claims}
Experiments Plan: {experiments}

Return JSON ONLY with this schema:
{{
  "field_feedback": {{
    "title": {{"issue":"...", "edit_instruction":"...", "expected_effect":"..."}},
    "abstract": {{"issue":"...", "edit_instruction":"...", "expected_effect":"..."}},
    "problem_framing": {{"issue":"...", "edit_instruction":"...", "expected_effect":"..."}},
    "method_skeleton": {{"issue":"...", "edit_instruction":"...", "expected_effect":"..."}},
    "innovation_claims": {{"issue":"...", "edit_instruction":"...", "expected_effect":"..."}},
    "experiments_plan": {{"issue":"...", "edit_instruction":"...", "expected_effect":"..."}}
  }},
  "suggested_edits": [
    {{"field":"innovation_claims","action":"rewrite|add|delete|expand","content":"..."}}
  ],
  "priority": ["innovation_claims","method_skeleton","abstract"]
}}"#,
        scores_line = scores_line,
        issue = main_issue.as_str(),
        title = story.title,
        abstract_text = story.abstract_text,
        problem = story.problem_framing,
        method = story.method_skeleton,
        claims = serde_json::to_string(&story.innovation_claims).unwrap_or_default(),
        experiments = story.experiments_plan,
    )
}

fn build_repair_prompt(previous: &str) -> String {
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
Return JSON ONLY with keys field_feedback (object), suggested_edits (array of {{field, action, content}}), priority (array of field names).

Previous output:
{clipped}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coach_result_parses_from_wire_shape() {
        let raw = r#"{
            "field_feedback": {
                "title": {"issue": "generic", "edit_instruction": "name the core concept", "expected_effect": "sharper identity"}
            },
            "suggested_edits": [
                {"field": "innovation_claims", "action": "rewrite", "content": "Transform X from A to B"}
            ],
            "priority": ["innovation_claims", "title"]
        }"#;
        let result: CoachResult = parse_llm_json(raw).unwrap();
        assert_eq!(result.priority.len(), 2);
        assert_eq!(result.suggested_edits[0].action, "rewrite");
        assert!(result.field_feedback.contains_key("title"));
    }
}
