//! Per-role τ calibration table.
//!
//! τ is the sigmoid temperature linking inferred scores to anchor real
//! scores. It is fit offline per (rubric, card schema, judge model, anchor
//! corpus) and pinned by version stamps. A present-but-mismatched file means
//! the calibration no longer describes this engine, so scoring refuses
//! before the first LLM call. An absent file falls back to configured τ
//! values, which is the mock/dev path.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigError};
use crate::review::cards::CARD_VERSION;
use crate::review::rubric::{Role, RUBRIC_VERSION};

/// On-disk shape of `output/judge_tau.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TauFile {
    pub tau_methodology: f64,
    pub tau_novelty: f64,
    pub tau_storyteller: f64,
    pub rubric_version: String,
    pub card_version: String,
    pub judge_model: String,
    /// blake3 of `nodes_paper.json` the fit was computed against.
    pub nodes_paper_hash: String,
}

/// Where the τ values in use came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TauSource {
    /// Calibration file validated against all four pins.
    Calibrated,
    /// No file present; configured per-role values in use.
    Config,
}

/// Resolved per-role τ, ready for inference.
#[derive(Debug, Clone, Serialize)]
pub struct TauTable {
    pub tau_methodology: f64,
    pub tau_novelty: f64,
    pub tau_storyteller: f64,
    pub source: TauSource,
}

impl TauTable {
    pub fn for_role(&self, role: Role) -> f64 {
        match role {
            Role::Methodology => self.tau_methodology,
            Role::Novelty => self.tau_novelty,
            Role::Storyteller => self.tau_storyteller,
        }
    }

    /// Load and pin-check the τ table. `nodes_paper_hash` is the blake3 hex
    /// digest of the current `nodes_paper.json`; `judge_model` is the model
    /// the critic will use.
    pub fn load(
        cfg: &Config,
        judge_model: &str,
        nodes_paper_hash: &str,
    ) -> Result<Self, ConfigError> {
        let path = &cfg.tau_path;
        if !path.exists() {
            return Ok(Self {
                tau_methodology: pick(cfg.tau_methodology, cfg.tau_default),
                tau_novelty: pick(cfg.tau_novelty, cfg.tau_default),
                tau_storyteller: pick(cfg.tau_storyteller, cfg.tau_default),
                source: TauSource::Config,
            });
        }

        let file = read_tau_file(path)?;

        let mismatch = |field: &str, found: &str, expected: &str| {
            ConfigError::Message(format!(
                "judge_tau.json {field} mismatch: file has {found:?}, engine expects {expected:?}; recalibrate before scoring"
            ))
        };
        if file.rubric_version != RUBRIC_VERSION {
            return Err(mismatch("rubric_version", &file.rubric_version, RUBRIC_VERSION));
        }
        if file.card_version != CARD_VERSION {
            return Err(mismatch("card_version", &file.card_version, CARD_VERSION));
        }
        if file.judge_model != judge_model {
            return Err(mismatch("judge_model", &file.judge_model, judge_model));
        }
        if file.nodes_paper_hash != nodes_paper_hash {
            return Err(mismatch(
                "nodes_paper_hash",
                &file.nodes_paper_hash,
                nodes_paper_hash,
            ));
        }

        for (name, tau) in [
            ("tau_methodology", file.tau_methodology),
            ("tau_novelty", file.tau_novelty),
            ("tau_storyteller", file.tau_storyteller),
        ] {
            if !(tau.is_finite() && tau > 0.0) {
                return Err(ConfigError::Message(format!(
                    "judge_tau.json {name} must be a positive finite number, got {tau}"
                )));
            }
        }

        Ok(Self {
            tau_methodology: file.tau_methodology,
            tau_novelty: file.tau_novelty,
            tau_storyteller: file.tau_storyteller,
            source: TauSource::Calibrated,
        })
    }
}

fn pick(role_tau: f64, default_tau: f64) -> f64 {
    if role_tau > 0.0 {
        role_tau
    } else if default_tau > 0.0 {
        default_tau
    } else {
        1.0
    }
}

fn read_tau_file(path: &Path) -> Result<TauFile, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::FileParse {
        path: path.to_path_buf(),
        source,
    })
}

/// blake3 hex digest of the anchor corpus file; pins the τ fit to the exact
/// paper set.
pub fn nodes_paper_hash(output_dir: &Path) -> Result<String, ConfigError> {
    let path = output_dir.join("nodes_paper.json");
    let raw = std::fs::read(&path).map_err(|source| ConfigError::FileRead {
        path: path.clone(),
        source,
    })?;
    Ok(blake3::hash(&raw).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tau(dir: &Path, rubric: &str) -> std::path::PathBuf {
        let path = dir.join("judge_tau.json");
        let file = TauFile {
            tau_methodology: 0.9,
            tau_novelty: 1.1,
            tau_storyteller: 1.0,
            rubric_version: rubric.to_string(),
            card_version: CARD_VERSION.to_string(),
            judge_model: "judge-model".to_string(),
            nodes_paper_hash: "abc123".to_string(),
        };
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();
        path
    }

    #[test]
    fn absent_file_uses_config_values() {
        let mut cfg = Config::default();
        cfg.tau_path = std::path::PathBuf::from("/nonexistent/judge_tau.json");
        cfg.tau_novelty = 1.3;
        let table = TauTable::load(&cfg, "judge-model", "hash").unwrap();
        assert_eq!(table.source, TauSource::Config);
        assert!((table.for_role(Role::Novelty) - 1.3).abs() < 1e-9);
    }

    #[test]
    fn matching_file_is_calibrated() {
        let dir = std::env::temp_dir().join(format!("storyforge-tau-ok-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_tau(&dir, RUBRIC_VERSION);
        let mut cfg = Config::default();
        cfg.tau_path = path;
        let table = TauTable::load(&cfg, "judge-model", "abc123").unwrap();
        assert_eq!(table.source, TauSource::Calibrated);
        assert!((table.for_role(Role::Methodology) - 0.9).abs() < 1e-9);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rubric_mismatch_refuses() {
        let dir = std::env::temp_dir().join(format!("storyforge-tau-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_tau(&dir, "rubric_v0");
        let mut cfg = Config::default();
        cfg.tau_path = path;
        let err = TauTable::load(&cfg, "judge-model", "abc123").unwrap_err();
        assert!(err.to_string().contains("rubric_version"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn corpus_hash_mismatch_refuses() {
        let dir = std::env::temp_dir().join(format!("storyforge-tau-hash-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_tau(&dir, RUBRIC_VERSION);
        let mut cfg = Config::default();
        cfg.tau_path = path;
        let err = TauTable::load(&cfg, "judge-model", "different").unwrap_err();
        assert!(err.to_string().contains("nodes_paper_hash"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
