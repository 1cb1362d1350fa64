//! Offline vector indexes over Ideas, Papers, and the novelty corpus.
//!
//! An index is a flat list of `(id, vector)` pairs with brute-force cosine
//! search — the corpora here are tens of thousands of entries at most, far
//! below the point where an ANN structure pays for itself. Indexes persist as
//! JSON under `output/<corpus>_index__<model_profile>/` so a build survives
//! across runs; the engine only builds when `INDEX_ALLOW_BUILD` is set.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::{Attribution, EmbedRequest, EmbeddingGateway, ProviderError};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse error at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("index at {path} was built with model profile {found:?}, expected {expected:?}")]
    ProfileMismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },

    #[error("index build disabled (INDEX_ALLOW_BUILD=false) and no index at {0}")]
    BuildDisabled(PathBuf),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexMeta {
    model_profile: String,
    dimension: usize,
    count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    id: String,
    vector: Vec<f32>,
}

/// In-memory cosine index over one corpus.
#[derive(Debug, Default)]
pub struct VectorIndex {
    model_profile: String,
    entries: Vec<IndexEntry>,
    by_id: std::collections::HashMap<String, usize>,
}

fn index_by_id(entries: &[IndexEntry]) -> std::collections::HashMap<String, usize> {
    entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.clone(), i))
        .collect()
}

impl VectorIndex {
    /// Build from `(id, text)` items by embedding every text. Batch splitting
    /// and input truncation are the embedding gateway's concern.
    pub async fn build(
        items: Vec<(String, String)>,
        gateway: &dyn EmbeddingGateway,
        attribution: Attribution,
    ) -> Result<Self, IndexError> {
        let texts: Vec<String> = items.iter().map(|(_, text)| text.clone()).collect();
        let resp = gateway
            .embed(EmbedRequest::new(String::new(), texts, attribution))
            .await?;

        let entries: Vec<IndexEntry> = items
            .into_iter()
            .zip(resp.embeddings)
            .map(|((id, _), vector)| IndexEntry { id, vector })
            .collect();

        let by_id = index_by_id(&entries);
        Ok(Self {
            model_profile: gateway.model_profile(),
            entries,
            by_id,
        })
    }

    /// Construct directly from precomputed vectors (tests, offline tools).
    pub fn from_vectors(model_profile: impl Into<String>, vectors: Vec<(String, Vec<f32>)>) -> Self {
        let entries: Vec<IndexEntry> = vectors
            .into_iter()
            .map(|(id, vector)| IndexEntry { id, vector })
            .collect();
        let by_id = index_by_id(&entries);
        Self {
            model_profile: model_profile.into(),
            entries,
            by_id,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn model_profile(&self) -> &str {
        &self.model_profile
    }

    /// Stored vector for an id, if present.
    pub fn vector(&self, id: &str) -> Option<&[f32]> {
        self.by_id
            .get(id)
            .map(|&i| self.entries[i].vector.as_slice())
    }

    /// Top-k ids by cosine similarity, descending; ties break by id so
    /// replays are stable.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let mut scored: Vec<(String, f32)> = self
            .entries
            .iter()
            .map(|e| (e.id.clone(), cosine(query, &e.vector)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    /// Load from a directory written by [`VectorIndex::save`]. The stored
    /// model profile must match the gateway that will produce query vectors.
    pub fn load(dir: &Path, expected_profile: &str) -> Result<Self, IndexError> {
        let meta: IndexMeta = read_json(&dir.join("meta.json"))?;
        if meta.model_profile != expected_profile {
            return Err(IndexError::ProfileMismatch {
                path: dir.to_path_buf(),
                found: meta.model_profile,
                expected: expected_profile.to_string(),
            });
        }
        let entries: Vec<IndexEntry> = read_json(&dir.join("vectors.json"))?;
        let by_id = index_by_id(&entries);
        Ok(Self {
            model_profile: meta.model_profile,
            entries,
            by_id,
        })
    }

    pub fn save(&self, dir: &Path) -> Result<(), IndexError> {
        std::fs::create_dir_all(dir).map_err(|source| IndexError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let meta = IndexMeta {
            model_profile: self.model_profile.clone(),
            dimension: self.entries.first().map(|e| e.vector.len()).unwrap_or(0),
            count: self.entries.len(),
        };
        write_json(&dir.join("meta.json"), &meta)?;
        write_json(&dir.join("vectors.json"), &self.entries)?;
        Ok(())
    }

    /// Load an index if present; otherwise build and save it when allowed.
    pub async fn load_or_build(
        dir: &Path,
        allow_build: bool,
        items: impl FnOnce() -> Vec<(String, String)>,
        gateway: &dyn EmbeddingGateway,
        attribution: Attribution,
    ) -> Result<Self, IndexError> {
        if dir.join("meta.json").exists() {
            return Self::load(dir, &gateway.model_profile());
        }
        if !allow_build {
            return Err(IndexError::BuildDisabled(dir.to_path_buf()));
        }
        let index = Self::build(items(), gateway, attribution).await?;
        index.save(dir)?;
        Ok(index)
    }
}

/// Cosine similarity; zero vectors and dimension mismatches score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, IndexError> {
    let raw = std::fs::read_to_string(path).map_err(|source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| IndexError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), IndexError> {
    let raw = serde_json::to_string(value).map_err(|source| IndexError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, raw).map_err(|source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn search_ranks_by_similarity() {
        let index = VectorIndex::from_vectors(
            "test-model",
            vec![
                ("a".into(), vec![1.0, 0.0]),
                ("b".into(), vec![0.7, 0.7]),
                ("c".into(), vec![0.0, 1.0]),
            ],
        );
        let hits = index.search(&[1.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "a");
        assert_eq!(hits[1].0, "b");
    }

    #[test]
    fn save_load_roundtrip_checks_profile() {
        let dir = std::env::temp_dir().join(format!("storyforge-index-{}", std::process::id()));
        let index = VectorIndex::from_vectors("profile-a", vec![("x".into(), vec![0.5, 0.5])]);
        index.save(&dir).unwrap();

        let loaded = VectorIndex::load(&dir, "profile-a").unwrap();
        assert_eq!(loaded.len(), 1);

        let err = VectorIndex::load(&dir, "profile-b").unwrap_err();
        assert!(matches!(err, IndexError::ProfileMismatch { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
