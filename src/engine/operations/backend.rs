//! Recorder backend configuration.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::info;

use super::{Operation, OperationSettings};
use crate::error::{SchedError, SchedResult};
use crate::hardware::catalog::{BACKEND_KEY, POSTPROCESSOR_KEY, PROJECT_KEY};
use crate::hardware::{KeyValues, Services};
use crate::schedule::{fields, recorder_targets_to_map, Command, OperationTag};

/// Recorder key carrying the correlator integration time in seconds.
pub const INTEGRATION_TIME_KEY: &str = "XTIMEINT";

static INTEGRATION_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(\d+(?:\.\d+)?)\s*s(?:ec)?$").unwrap()
});

/// Broad kind of a backend, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackendFamily {
    /// Beamformers.
    Beamformer,
    /// Correlators may embed their integration time in the name, as in
    /// `xgpu_1.5s`.
    Correlator {
        /// Integration time parsed from the name.
        integration_secs: Option<f64>,
    },
    /// Anything else.
    Other,
}

impl BackendFamily {
    /// Family from a catalog backend name.
    pub fn of(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        if name.contains("beamform") || name.starts_with("bf") {
            BackendFamily::Beamformer
        } else if name.starts_with("xgpu") || name.starts_with("corr") {
            let integration_secs = INTEGRATION_SUFFIX
                .captures(&name)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok());
            BackendFamily::Correlator { integration_secs }
        } else {
            BackendFamily::Other
        }
    }
}

/// Applies a backend and postprocessor to the recorders.
#[derive(Debug, Clone)]
pub struct SetBackend {
    project: String,
    backend: String,
    postprocessor: String,
    targets: Vec<String>,
}

impl SetBackend {
    /// Requires project, backend, postprocessor, and at least one recorder target.
    pub fn construct(command: &Command, _: &OperationSettings) -> SchedResult<Arc<dyn Operation>> {
        let targets = command.identifiers(fields::RECORDER_TARGETS)?;
        if targets.is_empty() {
            return Err(SchedError::invalid(fields::RECORDER_TARGETS, "no recorder selected"));
        }
        recorder_targets_to_map(&targets)?;

        Ok(Arc::new(Self {
            project: command.identifier(fields::PROJECT_ID)?,
            backend: command.identifier(fields::BACKEND_NAME)?,
            postprocessor: command.identifier(fields::POSTPROCESSOR_NAME)?,
            targets,
        }))
    }
}

#[async_trait]
impl Operation for SetBackend {
    fn tag(&self) -> OperationTag {
        OperationTag::SetBackend
    }

    async fn run(&self, services: &Services) -> SchedResult<()> {
        let mut backend = services.catalog.resolve_backend(&self.backend)?;
        let mut postprocessor = services.catalog.resolve_postprocessor(&self.postprocessor)?;

        services.status.info(format!(
            "Configuring backend {} with postprocessor {} for project {}",
            self.backend, self.postprocessor, self.project
        ));

        backend.insert(BACKEND_KEY.to_string(), self.backend.clone());
        backend.insert(PROJECT_KEY.to_string(), self.project.clone());
        services
            .recorder
            .publish_keyvalues(&backend, &self.targets)
            .await?;

        if let BackendFamily::Correlator {
            integration_secs: Some(secs),
        } = BackendFamily::of(&self.backend)
        {
            info!(backend = %self.backend, secs, "Publishing integration time");
            let kv = KeyValues::from([(INTEGRATION_TIME_KEY.to_string(), secs.to_string())]);
            services.recorder.publish_keyvalues(&kv, &self.targets).await?;
        }

        postprocessor.insert(POSTPROCESSOR_KEY.to_string(), self.postprocessor.clone());
        services
            .recorder
            .publish_keyvalues(&postprocessor, &self.targets)
            .await
    }
}
