//! Role rubrics for blind judging.

use serde::{Deserialize, Serialize};

/// Version stamp embedded in every judge prompt and pinned by the τ table.
pub const RUBRIC_VERSION: &str = "rubric_v1";

/// The three reviewer roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Methodology,
    Novelty,
    Storyteller,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Methodology, Role::Novelty, Role::Storyteller];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Methodology => "Methodology",
            Role::Novelty => "Novelty",
            Role::Storyteller => "Storyteller",
        }
    }

    /// Reviewer label shown in feedback output.
    pub fn reviewer_name(&self) -> &'static str {
        match self {
            Role::Methodology => "Reviewer A",
            Role::Novelty => "Reviewer B",
            Role::Storyteller => "Reviewer C",
        }
    }

    pub fn rubric(&self) -> &'static str {
        match self {
            Role::Methodology => {
                "Evaluate technical soundness: clarity of method, feasibility, \
                 experimental rigor, and reproducibility. Reward well-justified \
                 design choices and complete evaluation plans; penalize vague \
                 or brittle methods."
            }
            Role::Novelty => {
                "Evaluate originality: novelty of the problem framing, method \
                 innovation beyond common combinations, and the uniqueness of \
                 the contribution. Penalize routine stacking or obvious extensions."
            }
            Role::Storyteller => {
                "Evaluate narrative quality: motivation, gap, method, experiment, \
                 conclusion coherence, clarity of claims, and completeness. \
                 Penalize gaps, hand-wavy claims, or missing experimental closure."
            }
        }
    }
}

/// Which refinement dimension a weak role maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Novelty,
    Stability,
    DomainDistance,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Novelty => "novelty",
            IssueKind::Stability => "stability",
            IssueKind::DomainDistance => "domain_distance",
        }
    }

    pub fn from_role(role: Role) -> Self {
        match role {
            Role::Novelty => IssueKind::Novelty,
            Role::Methodology => IssueKind::Stability,
            Role::Storyteller => IssueKind::DomainDistance,
        }
    }

    /// The role whose score tracks this issue.
    pub fn role(&self) -> Role {
        match self {
            IssueKind::Novelty => Role::Novelty,
            IssueKind::Stability => Role::Methodology,
            IssueKind::DomainDistance => Role::Storyteller,
        }
    }

    pub fn suggestions(&self) -> Vec<String> {
        match self {
            IssueKind::Novelty => vec![
                "Select an innovative pattern from the novelty ranking".to_string(),
                "Inject a long-tail pattern to raise originality".to_string(),
            ],
            IssueKind::Stability => vec![
                "Select a proven pattern from the stability ranking".to_string(),
                "Inject mature methods to strengthen robustness".to_string(),
            ],
            IssueKind::DomainDistance => vec![
                "Select a cross-domain pattern from the domain-distance ranking".to_string(),
                "Bring in a different perspective to improve the narrative".to_string(),
            ],
        }
    }
}
