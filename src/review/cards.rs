//! Blind cards: the anonymized representation the judge LLM sees.
//!
//! A card carries exactly four content fields with hard length caps and a
//! version stamp. It must never carry paper ids, titles, URLs, scores, or
//! pattern ids — that anonymity is what makes the pairwise judgments usable
//! for calibration. Truncation is idempotent: building a card from a card's
//! own fields changes nothing.

use serde::{Deserialize, Serialize};

use crate::kg::Paper;
use crate::story::Story;

/// Version stamp pinned by the τ table.
pub const CARD_VERSION: &str = "blind_card_v1";

/// Hard caps per field, in characters.
pub const PROBLEM_MAX_CHARS: usize = 220;
pub const METHOD_MAX_CHARS: usize = 280;
pub const CONTRIB_MAX_CHARS: usize = 320;

/// The anonymized card. This is the only representation of a story or an
/// anchor paper that ever reaches the judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlindCard {
    pub problem: String,
    pub method: String,
    pub contrib: String,
    /// Fields that were empty at build time, e.g. `"method:missing"`.
    #[serde(default)]
    pub notes: Vec<String>,
    pub card_version: String,
}

impl BlindCard {
    fn build(problem: &str, method: &str, contrib: &str) -> Self {
        let mut notes = Vec::new();
        if problem.trim().is_empty() {
            notes.push("problem:missing".to_string());
        }
        if method.trim().is_empty() {
            notes.push("method:missing".to_string());
        }
        if contrib.trim().is_empty() {
            notes.push("contrib:missing".to_string());
        }
        Self {
            problem: clean_text(problem, PROBLEM_MAX_CHARS),
            method: clean_text(method, METHOD_MAX_CHARS),
            contrib: clean_text(contrib, CONTRIB_MAX_CHARS),
            notes,
            card_version: CARD_VERSION.to_string(),
        }
    }

    /// Render for the judge prompt.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        if !self.problem.is_empty() {
            lines.push(format!("- problem: {}", self.problem));
        }
        if !self.method.is_empty() {
            lines.push(format!("- method: {}", self.method));
        }
        if !self.contrib.is_empty() {
            lines.push(format!("- contrib: {}", self.contrib));
        }
        if !self.notes.is_empty() {
            lines.push(format!("- notes: {}", self.notes.join(", ")));
        }
        if lines.is_empty() {
            "- (empty)".to_string()
        } else {
            lines.join("\n")
        }
    }
}

/// Build the story's card from its whitelisted fields.
pub fn build_story_card(story: &Story) -> BlindCard {
    let contrib = story.innovation_claims.join(" ");
    BlindCard::build(&story.problem_framing, &story.method_skeleton, &contrib)
}

/// Build an anchor paper's card from its skeleton fields. Title and ids are
/// deliberately unreachable from here.
pub fn build_paper_card(paper: &Paper) -> BlindCard {
    match &paper.skeleton {
        Some(sk) => BlindCard::build(&sk.problem, &sk.method, &sk.contribution),
        None => BlindCard::build("", "", ""),
    }
}

/// Collapse whitespace and truncate at a character cap. Applying this twice
/// with the same cap is a no-op, which is what keeps card building
/// idempotent.
fn clean_text(text: &str, max_chars: usize) -> String {
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    collapsed.chars().take(max_chars).collect::<String>().trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kg::PaperSkeleton;

    fn story() -> Story {
        Story {
            title: "Secret Title".into(),
            problem_framing: "P ".repeat(300),
            method_skeleton: "M ".repeat(300),
            innovation_claims: vec!["C".repeat(200), "D".repeat(200)],
            ..Default::default()
        }
    }

    #[test]
    fn caps_enforced() {
        let card = build_story_card(&story());
        assert!(card.problem.chars().count() <= PROBLEM_MAX_CHARS);
        assert!(card.method.chars().count() <= METHOD_MAX_CHARS);
        assert!(card.contrib.chars().count() <= CONTRIB_MAX_CHARS);
        assert_eq!(card.card_version, CARD_VERSION);
    }

    #[test]
    fn card_build_is_idempotent() {
        let card = build_story_card(&story());
        let rebuilt = BlindCard::build(&card.problem, &card.method, &card.contrib);
        assert_eq!(card.problem, rebuilt.problem);
        assert_eq!(card.method, rebuilt.method);
        assert_eq!(card.contrib, rebuilt.contrib);
    }

    #[test]
    fn title_never_leaks_into_card() {
        let card = build_story_card(&story());
        let rendered = card.render();
        assert!(!rendered.contains("Secret Title"));
    }

    #[test]
    fn missing_fields_are_noted() {
        let paper = Paper {
            paper_id: "p1".into(),
            title: "T".into(),
            pattern_id: None,
            domain_id: "d".into(),
            review_stats: None,
            skeleton: Some(PaperSkeleton {
                problem: "A problem".into(),
                method: String::new(),
                contribution: String::new(),
            }),
            abstract_text: None,
        };
        let card = build_paper_card(&paper);
        assert!(card.notes.contains(&"method:missing".to_string()));
        assert!(card.notes.contains(&"contrib:missing".to_string()));
        assert!(!card.notes.contains(&"problem:missing".to_string()));
    }
}
