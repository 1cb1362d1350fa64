//! Results bundling.
//!
//! Each run leaves a self-contained directory under `results/<run_id>/`:
//! the final story, the full pipeline result, a manifest listing the
//! artifacts, and a copy of the structured run log.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use thiserror::Error;

use crate::pipeline::PipelineResult;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn write_file(path: &Path, contents: &str) -> Result<(), BundleError> {
    std::fs::write(path, contents).map_err(|source| BundleError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write the results bundle. `run_log_dir` is the live `log/<run_id>/`
/// directory, copied in as `run_log/` when present.
pub fn write_bundle(
    results_root: &Path,
    result: &PipelineResult,
    run_log_dir: Option<&Path>,
) -> Result<PathBuf, BundleError> {
    let bundle_dir = results_root.join(&result.run_id);
    std::fs::create_dir_all(&bundle_dir).map_err(|source| BundleError::Io {
        path: bundle_dir.clone(),
        source,
    })?;

    let mut artifacts = vec!["pipeline_result.json".to_string()];

    if let Some(story) = &result.final_story {
        write_file(
            &bundle_dir.join("final_story.json"),
            &serde_json::to_string_pretty(story)?,
        )?;
        artifacts.push("final_story.json".to_string());
    }

    write_file(
        &bundle_dir.join("pipeline_result.json"),
        &serde_json::to_string_pretty(result)?,
    )?;

    if let Some(log_dir) = run_log_dir {
        if log_dir.is_dir() {
            let dest = bundle_dir.join("run_log");
            copy_dir(log_dir, &dest)?;
            artifacts.push("run_log/".to_string());
        }
    }

    let manifest = json!({
        "run_id": result.run_id,
        "created_at": Utc::now().to_rfc3339(),
        "success": result.success,
        "iterations": result.iterations,
        "pivots": result.pivots,
        "artifacts": artifacts,
    });
    write_file(
        &bundle_dir.join("manifest.json"),
        &serde_json::to_string_pretty(&manifest)?,
    )?;

    Ok(bundle_dir)
}

fn copy_dir(src: &Path, dest: &Path) -> Result<(), BundleError> {
    std::fs::create_dir_all(dest).map_err(|source| BundleError::Io {
        path: dest.to_path_buf(),
        source,
    })?;
    let entries = std::fs::read_dir(src).map_err(|source| BundleError::Io {
        path: src.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| BundleError::Io {
            path: src.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let target = dest.join(entry.file_name());
        if path.is_dir() {
            copy_dir(&path, &target)?;
        } else {
            std::fs::copy(&path, &target).map_err(|source| BundleError::Io {
                path: path.clone(),
                source,
            })?;
        }
    }
    Ok(())
}
