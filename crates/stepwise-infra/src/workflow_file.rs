//! Workflow files on disk.
//!
//! A workflow file is a `WorkflowConfig` plus an optional `id`; the id
//! defaults to the file stem. YAML (`.yaml`, `.yml`) and JSON (`.json`) are
//! accepted.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use stepwise_core::validate_workflow;
use stepwise_types::workflow::WorkflowConfig;

use crate::error::InfraError;

/// A parsed, structurally valid workflow file.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowFile {
    pub id: String,
    pub definition: WorkflowConfig,
}

#[derive(Deserialize)]
struct RawWorkflowFile {
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    definition: WorkflowConfig,
}

#[derive(Clone, Copy)]
enum Format {
    Yaml,
    Json,
}

fn format_of(path: &Path) -> Option<Format> {
    match path.extension()?.to_str()? {
        "yaml" | "yml" => Some(Format::Yaml),
        "json" => Some(Format::Json),
        _ => None,
    }
}

/// Load and validate one workflow file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowFile, InfraError> {
    let format = format_of(path).ok_or_else(|| InfraError::UnsupportedFormat(path.to_path_buf()))?;
    let content = std::fs::read_to_string(path).map_err(|e| InfraError::io(path, e))?;

    let raw: RawWorkflowFile = match format {
        Format::Yaml => serde_yaml_ng::from_str(&content).map_err(|e| InfraError::parse(path, e))?,
        Format::Json => serde_json::from_str(&content).map_err(|e| InfraError::parse(path, e))?,
    };

    let id = match raw.id {
        Some(id) => id,
        None => path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
            .ok_or_else(|| InfraError::parse(path, "cannot derive workflow id from file name"))?,
    };

    validate_workflow(&id, &raw.definition).map_err(|source| InfraError::Invalid {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(WorkflowFile {
        id,
        definition: raw.definition,
    })
}

/// Load every workflow file under `dir`, recursively, sorted by path.
///
/// Files that fail to load are skipped with a warning. A missing directory
/// yields an empty list.
pub fn discover_workflows(dir: &Path) -> Result<Vec<(PathBuf, WorkflowFile)>, InfraError> {
    let mut results = Vec::new();
    if !dir.exists() {
        return Ok(results);
    }
    discover_recursive(dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowFile)>,
) -> Result<(), InfraError> {
    let entries = std::fs::read_dir(dir).map_err(|e| InfraError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| InfraError::io(dir, e))?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if format_of(&path).is_some() {
            match load_workflow_file(&path) {
                Ok(file) => results.push((path, file)),
                Err(err) => tracing::warn!(?path, error = %err, "skipping workflow file"),
            }
        }
    }
    Ok(())
}
