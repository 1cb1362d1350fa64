//! Optional structured requirements brief accompanying the raw idea text.

use serde::{Deserialize, Serialize};

/// A user-supplied brief refining the free-text idea. Loaded from JSON via
/// `--brief`; every field is optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IdeaBrief {
    #[serde(default)]
    pub motivation: Option<String>,
    #[serde(default)]
    pub problem_definition: Option<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub technical_plan: Option<String>,
    #[serde(default)]
    pub expected_contributions: Vec<String>,
    #[serde(default)]
    pub evaluation_plan: Option<String>,
    #[serde(default)]
    pub keywords_en: Vec<String>,
}

impl IdeaBrief {
    /// Render the prompt block injected into generation and selection
    /// prompts. Empty brief renders nothing.
    pub fn render_block(&self) -> String {
        let mut block = String::new();
        if let Some(motivation) = &self.motivation {
            block.push_str(&format!("Motivation: {motivation}\n"));
        }
        if let Some(problem) = &self.problem_definition {
            block.push_str(&format!("Problem Definition: {problem}\n"));
        }
        if !self.constraints.is_empty() {
            block.push_str(&format!("Constraints: {}\n", self.constraints.join(", ")));
        }
        if let Some(plan) = &self.technical_plan {
            block.push_str(&format!("Technical Plan: {plan}\n"));
        }
        if !self.expected_contributions.is_empty() {
            block.push_str("Expected Contributions:\n");
            for (i, c) in self.expected_contributions.iter().enumerate() {
                block.push_str(&format!("  {}. {c}\n", i + 1));
            }
        }
        if let Some(eval) = &self.evaluation_plan {
            block.push_str(&format!("Evaluation Plan: {eval}\n"));
        }
        if !self.keywords_en.is_empty() {
            block.push_str(&format!("Keywords (EN): {}\n", self.keywords_en.join(", ")));
        }
        if block.is_empty() {
            return block;
        }
        let mut out = String::from("\n[User Requirements Brief]\n");
        out.push_str(&block);
        out.push_str("HARD REQUIREMENTS:\n");
        out.push_str("- MUST respect constraints and reflect them in method_skeleton and experiments_plan.\n");
        out.push_str(
            "- MUST include an explicit evaluation plan (datasets/metrics/baselines/ablations) in experiments_plan.\n",
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_brief_renders_nothing() {
        assert!(IdeaBrief::default().render_block().is_empty());
    }

    #[test]
    fn populated_brief_lists_requirements() {
        let brief = IdeaBrief {
            motivation: Some("cheaper inference".into()),
            constraints: vec!["no extra training".into()],
            ..Default::default()
        };
        let block = brief.render_block();
        assert!(block.contains("cheaper inference"));
        assert!(block.contains("HARD REQUIREMENTS"));
    }
}
