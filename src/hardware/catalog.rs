//! Backend, postprocessor, and project tables.
//!
//! Three JSON files describe what a site can record with:
//!
//! ```text
//! backends.json        { "<backend>": { ...recorder keys... } }
//! postprocessors.json  { "<postprocessor>": { ...recorder keys... } }
//! projects.json        { "<project>": { "Backend": { "<backend>": { "Postprocessor": ["<pp>", ...] } } } }
//! ```
//!
//! Backend and postprocessor definitions are flattened to recorder key/values
//! when resolved. String values are published as-is; anything else is
//! published as its JSON text.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::{BackendCatalog, KeyValues};
use crate::error::{SchedError, SchedResult};

/// Recorder key naming the configured backend.
pub const BACKEND_KEY: &str = "BACKEND";
/// Recorder key naming the project the data belongs to.
pub const PROJECT_KEY: &str = "PROJID";
/// Recorder key naming the configured postprocessor.
pub const POSTPROCESSOR_KEY: &str = "POSTPROC";

#[derive(Debug, Clone, Default, Deserialize)]
struct ProjectEntry {
    #[serde(rename = "Backend", default)]
    backends: BTreeMap<String, BackendChoice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BackendChoice {
    #[serde(rename = "Postprocessor", default)]
    postprocessors: Vec<String>,
}

/// In-memory catalog, usually loaded from the JSON tables.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    backends: BTreeMap<String, Value>,
    postprocessors: BTreeMap<String, Value>,
    projects: BTreeMap<String, ProjectEntry>,
}

impl Catalog {
    /// Catalog with no entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the three tables. A missing projects table is treated as empty.
    pub fn from_files(backends: &Path, postprocessors: &Path, projects: Option<&Path>) -> SchedResult<Self> {
        let mut catalog = Self {
            backends: read_table(backends)?,
            postprocessors: read_table(postprocessors)?,
            projects: BTreeMap::new(),
        };
        if let Some(path) = projects {
            catalog.projects = read_table(path)?;
        }
        info!(
            backends = catalog.backends.len(),
            postprocessors = catalog.postprocessors.len(),
            projects = catalog.projects.len(),
            "Loaded backend catalog"
        );
        Ok(catalog)
    }

    /// Adds or replaces a backend definition.
    pub fn with_backend(mut self, name: &str, config: Value) -> Self {
        self.backends.insert(name.to_string(), config);
        self
    }

    /// Adds or replaces a postprocessor definition.
    pub fn with_postprocessor(mut self, name: &str, config: Value) -> Self {
        self.postprocessors.insert(name.to_string(), config);
        self
    }

    /// Registers a project and the backend/postprocessor pairs it may use.
    pub fn with_project(mut self, project: &str, backend: &str, postprocessors: &[&str]) -> Self {
        self.projects
            .entry(project.to_string())
            .or_default()
            .backends
            .insert(
                backend.to_string(),
                BackendChoice {
                    postprocessors: postprocessors.iter().map(|s| s.to_string()).collect(),
                },
            );
        self
    }

    /// Known project ids, sorted.
    pub fn projects(&self) -> Vec<&str> {
        self.projects.keys().map(String::as_str).collect()
    }

    /// Backends a project may select, empty for an unknown project.
    pub fn backends_for(&self, project: &str) -> Vec<&str> {
        self.projects
            .get(project)
            .map(|p| p.backends.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Postprocessors a project may pair with a backend.
    pub fn postprocessors_for(&self, project: &str, backend: &str) -> Vec<&str> {
        self.projects
            .get(project)
            .and_then(|p| p.backends.get(backend))
            .map(|b| b.postprocessors.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Every backend and postprocessor a project names must be defined.
    pub fn check_consistency(&self) -> SchedResult<()> {
        for (project, entry) in &self.projects {
            for (backend, choice) in &entry.backends {
                if !self.backends.contains_key(backend) {
                    return Err(SchedError::Configuration(format!(
                        "project '{project}' names backend '{backend}', which is not defined"
                    )));
                }
                if let Some(pp) = choice
                    .postprocessors
                    .iter()
                    .find(|pp| !self.postprocessors.contains_key(*pp))
                {
                    return Err(SchedError::Configuration(format!(
                        "project '{project}' names postprocessor '{pp}', which is not defined"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl BackendCatalog for Catalog {
    fn resolve_backend(&self, name: &str) -> SchedResult<KeyValues> {
        let config = self
            .backends
            .get(name)
            .ok_or_else(|| SchedError::UnknownBackend(name.to_string()))?;
        debug!(backend = name, "Resolved backend");
        Ok(flatten(config))
    }

    fn resolve_postprocessor(&self, name: &str) -> SchedResult<KeyValues> {
        let config = self
            .postprocessors
            .get(name)
            .ok_or_else(|| SchedError::UnknownPostprocessor(name.to_string()))?;
        debug!(postprocessor = name, "Resolved postprocessor");
        Ok(flatten(config))
    }
}

fn read_table<T: serde::de::DeserializeOwned>(path: &Path) -> SchedResult<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn flatten(config: &Value) -> KeyValues {
    match config {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect(),
        Value::Null => KeyValues::new(),
        other => KeyValues::from([("CONFIG".to_string(), other.to_string())]),
    }
}
