//! Configuration System using Figment
//!
//! Settings are loaded from, in increasing precedence:
//! 1. Built-in defaults
//! 2. A TOML file (`scheduler.toml` by default)
//! 3. Environment variables prefixed with `SCHED_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! SCHED_ENGINE__POLL_INTERVAL_MS=100
//! SCHED_TIMING__SETTLE_SECS=30
//! SCHED_OUTPUT__LOG_LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```no_run
//! use obs_scheduler::config::Settings;
//!
//! let settings = Settings::load_from("scheduler.toml")?;
//! println!("Poll interval: {}ms", settings.engine.poll_interval_ms);
//! # Ok::<(), obs_scheduler::error::SchedError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::astro::Site;
use crate::engine::{EngineSettings, OperationSettings, PlanSettings};
use crate::error::{SchedError, SchedResult};
use crate::hardware::AltAz;

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// `[engine]`
    pub engine: EngineConfig,
    /// `[timing]`
    pub timing: TimingConfig,
    /// `[plan]`
    pub plan: PlanConfig,
    /// `[park]`
    pub park: ParkConfig,
    /// `[catalog]`
    pub catalog: CatalogConfig,
    /// `[output]`
    pub output: OutputConfig,
}

/// Orchestrator behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often a running step is checked for stop requests
    pub poll_interval_ms: u64,
    /// Refuse schedules whose pre-flight plan has errors
    pub require_check: bool,
}

/// Waits built into the operations, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Pause after retuning, before gain adjustments
    pub settle_secs: f64,
    /// Recording starts this long after it is scheduled
    pub recording_lead_secs: f64,
    /// Extra wait after each recording
    pub safety_margin_secs: f64,
}

/// Feasibility planner parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Assumed length of an operator prompt
    pub wait_for_prompt_default_secs: f64,
    /// Time charged for a retune
    pub rf_if_overhead_secs: f64,
    /// Time charged for a digitizer mode switch
    pub digitizer_overhead_secs: f64,
    /// Time charged for recorder configuration
    pub backend_overhead_secs: f64,
    /// Slew speed
    pub slew_rate_deg_per_sec: f64,
    /// Sources lower than this draw a warning
    pub min_elevation_deg: f64,
    /// Observatory latitude
    pub site_latitude_deg: f64,
    /// East positive
    pub site_longitude_deg: f64,
}

/// Park orientation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkConfig {
    /// Degrees east of north
    pub azimuth_deg: f64,
    /// Degrees above the horizon
    pub elevation_deg: f64,
}

/// Catalog table locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Backend definitions (JSON)
    pub backends: PathBuf,
    /// Postprocessor definitions (JSON)
    pub postprocessors: PathBuf,
    /// Optional project table (JSON)
    #[serde(default)]
    pub projects: Option<PathBuf>,
}

/// Logging and published files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Where remaining-plan snapshots are written, if anywhere
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines
    pub log_json: bool,
}

// ============================================================================
// Default values
// ============================================================================

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            require_check: true,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_secs: 20.0,
            recording_lead_secs: 10.0,
            safety_margin_secs: 5.0,
        }
    }
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            wait_for_prompt_default_secs: 600.0,
            rf_if_overhead_secs: 60.0,
            digitizer_overhead_secs: 30.0,
            backend_overhead_secs: 30.0,
            slew_rate_deg_per_sec: 1.0,
            min_elevation_deg: 16.8,
            site_latitude_deg: 40.817_1,
            site_longitude_deg: -121.473_6,
        }
    }
}

impl Default for ParkConfig {
    fn default() -> Self {
        Self {
            azimuth_deg: 0.0,
            elevation_deg: 18.0,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            backends: PathBuf::from("backends.json"),
            postprocessors: PathBuf::from("postprocessors.json"),
            projects: Some(PathBuf::from("projects.json")),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

// ============================================================================
// Loading and Validation
// ============================================================================

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

impl Settings {
    /// Load settings from `scheduler.toml` and the environment.
    pub fn load() -> SchedResult<Self> {
        Self::load_from("scheduler.toml")
    }

    /// Load settings from a specific file. A missing file leaves the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> SchedResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCHED_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks:
    /// - Log level is valid
    /// - Poll interval is non-zero
    /// - Slew rate is positive
    /// - No duration is negative
    /// - Site latitude lies within +/-90 degrees
    pub fn validate(&self) -> SchedResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.output.log_level.as_str()) {
            return Err(SchedError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.output.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.engine.poll_interval_ms == 0 {
            return Err(SchedError::Configuration(
                "engine.poll_interval_ms must be > 0".into(),
            ));
        }

        if self.plan.slew_rate_deg_per_sec <= 0.0 {
            return Err(SchedError::Configuration(format!(
                "plan.slew_rate_deg_per_sec must be > 0, got {}",
                self.plan.slew_rate_deg_per_sec
            )));
        }

        let durations = [
            ("timing.settle_secs", self.timing.settle_secs),
            ("timing.recording_lead_secs", self.timing.recording_lead_secs),
            ("timing.safety_margin_secs", self.timing.safety_margin_secs),
            (
                "plan.wait_for_prompt_default_secs",
                self.plan.wait_for_prompt_default_secs,
            ),
            ("plan.rf_if_overhead_secs", self.plan.rf_if_overhead_secs),
            (
                "plan.digitizer_overhead_secs",
                self.plan.digitizer_overhead_secs,
            ),
            ("plan.backend_overhead_secs", self.plan.backend_overhead_secs),
        ];
        if let Some((name, value)) = durations.iter().find(|(_, v)| !(*v >= 0.0)) {
            return Err(SchedError::Configuration(format!(
                "{name} must not be negative, got {value}"
            )));
        }

        if !(-90.0..=90.0).contains(&self.plan.site_latitude_deg) {
            return Err(SchedError::Configuration(format!(
                "plan.site_latitude_deg {} is out of range",
                self.plan.site_latitude_deg
            )));
        }
        Ok(())
    }

    /// Timings for the operation variants.
    pub fn operation_settings(&self) -> OperationSettings {
        OperationSettings {
            settle: secs(self.timing.settle_secs),
            recording_lead: secs(self.timing.recording_lead_secs),
            safety_margin: secs(self.timing.safety_margin_secs),
            park_position: AltAz {
                azimuth_deg: self.park.azimuth_deg,
                elevation_deg: self.park.elevation_deg,
            },
        }
    }

    /// Timings and site for the planner.
    pub fn plan_settings(&self) -> PlanSettings {
        PlanSettings {
            wait_for_prompt_default: secs(self.plan.wait_for_prompt_default_secs),
            rf_if_overhead: secs(self.plan.rf_if_overhead_secs),
            digitizer_overhead: secs(self.plan.digitizer_overhead_secs),
            backend_overhead: secs(self.plan.backend_overhead_secs),
            recording_lead: secs(self.timing.recording_lead_secs),
            safety_margin: secs(self.timing.safety_margin_secs),
            slew_rate_deg_per_sec: self.plan.slew_rate_deg_per_sec,
            min_elevation_deg: self.plan.min_elevation_deg,
            site: Site::new(self.plan.site_latitude_deg, self.plan.site_longitude_deg),
        }
    }

    /// Everything the engine needs.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            poll_interval: Duration::from_millis(self.engine.poll_interval_ms),
            require_check: self.engine.require_check,
            operations: self.operation_settings(),
            plan: self.plan_settings(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        let engine = settings.engine_settings();
        assert_eq!(engine.poll_interval, Duration::from_millis(200));
        assert_eq!(engine.operations.settle, Duration::from_secs(20));
        assert_eq!(engine.plan.wait_for_prompt_default, Duration::from_secs(600));
        assert_eq!(engine.plan.digitizer_overhead, Duration::from_secs(30));
        assert_eq!(engine.operations.park_position.elevation_deg, 18.0);
    }

    #[test]
    fn test_file_and_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "scheduler.toml",
                r#"
                [timing]
                settle_secs = 2.5
                recording_lead_secs = 10
                safety_margin_secs = 5

                [output]
                log_level = "debug"
                log_json = true
                snapshot_path = "/tmp/ods.json"
                "#,
            )?;
            jail.set_env("SCHED_ENGINE__POLL_INTERVAL_MS", "50");

            let settings = Settings::load_from("scheduler.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.timing.settle_secs, 2.5);
            assert_eq!(settings.engine.poll_interval_ms, 50);
            assert!(settings.engine.require_check);
            assert_eq!(settings.output.log_level, "debug");
            assert_eq!(
                settings.output.snapshot_path.as_deref(),
                Some(Path::new("/tmp/ods.json"))
            );
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_| {
            let settings = Settings::load_from("absent.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn test_validation_failures() {
        let mut settings = Settings::default();
        settings.engine.poll_interval_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.plan.slew_rate_deg_per_sec = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.timing.safety_margin_secs = -1.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.output.log_level = "loud".into();
        assert!(matches!(
            settings.validate(),
            Err(SchedError::Configuration(_))
        ));
    }
}
