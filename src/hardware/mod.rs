//! Collaborator interfaces consumed by the schedule engine.
//!
//! The engine never talks to antennas, receivers, or recorders directly. Every
//! side effect goes through one of the capability traits below, shared as
//! `Arc<dyn Trait>` so a single implementation can serve the orchestrator and
//! the step workers at the same time.
//!
//! - [`EquipmentControl`]: reservation, tuning, pointing, parking
//! - [`BackendCatalog`]: backend and postprocessor definitions by name
//! - [`RecorderPublisher`]: key/value publication and recording control
//! - [`StatusSink`]: operator-facing status lines
//! - [`PlanPublisher`]: remaining-plan snapshots
//!
//! Implementations live in [`mock`] (recording test doubles that also back the
//! simulated CLI), [`catalog`], and [`snapshot`].

pub mod catalog;
pub mod mock;
pub mod snapshot;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::engine::plans::ObservationPlanEntry;
use crate::error::SchedResult;
use crate::schedule::Command;

/// Flat key/value configuration published to recorders.
pub type KeyValues = BTreeMap<String, String>;

/// Status severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine progress.
    Info,
    /// Something the operator should look at.
    Warning,
    /// A failure.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Equatorial (J2000) position. Right ascension in hours, declination in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyPosition {
    /// Right ascension, hours.
    pub ra_hours: f64,
    /// Declination, degrees.
    pub dec_deg: f64,
}

impl SkyPosition {
    /// Position from RA hours and declination degrees.
    pub fn new(ra_hours: f64, dec_deg: f64) -> Self {
        Self { ra_hours, dec_deg }
    }
}

/// Horizontal orientation used for parking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AltAz {
    /// Azimuth, degrees east of north.
    pub azimuth_deg: f64,
    /// Elevation above the horizon, degrees.
    pub elevation_deg: f64,
}

/// Independently tunable receiver channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TuningChannel {
    /// Channel A.
    A,
    /// Channel B.
    B,
    /// Channel C.
    C,
    /// Channel D.
    D,
}

impl TuningChannel {
    /// Every channel, in letter order.
    pub const ALL: [TuningChannel; 4] = [
        TuningChannel::A,
        TuningChannel::B,
        TuningChannel::C,
        TuningChannel::D,
    ];
}

impl fmt::Display for TuningChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            TuningChannel::A => "a",
            TuningChannel::B => "b",
            TuningChannel::C => "c",
            TuningChannel::D => "d",
        };
        f.write_str(c)
    }
}

/// Sampling mode of the digitizer feeding the recorders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigitizerMode {
    /// Wideband total-power sampling.
    Continuum,
    /// Narrowband 16 MHz spectral line sampling.
    SpectralLine16MHz,
}

impl DigitizerMode {
    /// Accepts the mode names operators type: anything starting with
    /// `continuum` or `spectral`, in any case.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim().to_ascii_lowercase();
        if text.starts_with("continuum") {
            Some(DigitizerMode::Continuum)
        } else if text.starts_with("spectral") {
            Some(DigitizerMode::SpectralLine16MHz)
        } else {
            None
        }
    }
}

impl fmt::Display for DigitizerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigitizerMode::Continuum => f.write_str("Continuum mode"),
            DigitizerMode::SpectralLine16MHz => f.write_str("Spectral line mode (16MHz)"),
        }
    }
}

/// Control surface of the shared equipment.
#[async_trait]
pub trait EquipmentControl: Send + Sync {
    /// Acquire exclusive hold. Fails with `Reservation` when already held.
    async fn reserve(&self, ids: &[String]) -> SchedResult<()>;
    /// Release hold. Succeeds when nothing is held.
    async fn release(&self, ids: &[String]) -> SchedResult<()>;
    /// Retune one channel. `defer_focus` skips the focus adjustment.
    async fn retune(
        &self,
        freq_mhz: f64,
        ids: &[String],
        channel: TuningChannel,
        defer_focus: bool,
    ) -> SchedResult<()>;
    /// Level the receiver gains automatically.
    async fn autotune(&self, ids: &[String]) -> SchedResult<()>;
    /// Tune the IF chain for the given channels.
    async fn tune_if(&self, ids: &[String], channels: &[TuningChannel]) -> SchedResult<()>;
    /// Switch the digitizer sampling mode.
    async fn set_digitizer_mode(&self, mode: DigitizerMode, ids: &[String]) -> SchedResult<()>;
    /// Point at and follow a named source.
    async fn track(&self, source: &str, ids: &[String]) -> SchedResult<()>;
    /// Source each piece of equipment is currently pointed at, keyed by id.
    async fn current_pointing(&self, ids: &[String]) -> SchedResult<BTreeMap<String, String>>;
    /// Catalog position of a source, `None` when the source is unknown.
    async fn source_coordinates(&self, source: &str) -> SchedResult<Option<SkyPosition>>;
    /// Position one piece of equipment reports it is pointed at.
    async fn pointing_coordinates(&self, id: &str) -> SchedResult<SkyPosition>;
    /// Move to a fixed orientation.
    async fn park(&self, ids: &[String], position: AltAz) -> SchedResult<()>;
}

/// Backend and postprocessor definitions by name.
pub trait BackendCatalog: Send + Sync {
    /// Fails with `UnknownBackend` when the name is not defined.
    fn resolve_backend(&self, name: &str) -> SchedResult<KeyValues>;
    /// Fails with `UnknownPostprocessor` when the name is not defined.
    fn resolve_postprocessor(&self, name: &str) -> SchedResult<KeyValues>;
}

/// Recorder-side control.
#[async_trait]
pub trait RecorderPublisher: Send + Sync {
    /// Push key/values to the recorder targets.
    async fn publish_keyvalues(&self, values: &KeyValues, targets: &[String]) -> SchedResult<()>;
    /// Start recording after `lead_time`, for `duration`.
    async fn begin_recording(
        &self,
        lead_time: Duration,
        duration: Duration,
        targets: &[String],
    ) -> SchedResult<()>;
    /// Name of the backend the recorders are currently configured for.
    async fn active_backend(&self, targets: &[String]) -> SchedResult<Option<String>>;
}

/// Operator-facing status lines.
pub trait StatusSink: Send + Sync {
    /// Show one line to the operator.
    fn report(&self, text: &str, severity: Severity);

    /// Progress through the schedule. Defaults to an info line.
    fn progress(&self, index: usize, command: &Command) {
        self.report(&format!("[{index}] {}", command.summary()), Severity::Info);
    }
}

/// Consumer of remaining-plan snapshots.
pub trait PlanPublisher: Send + Sync {
    /// Replace the published remaining plan.
    fn publish_snapshot(&self, entries: &[ObservationPlanEntry]) -> SchedResult<()>;
}

/// Status reporting that mirrors every line into `tracing`.
#[derive(Clone)]
pub struct StatusReporter {
    sink: Arc<dyn StatusSink>,
}

impl StatusReporter {
    /// Reporter writing to `sink`.
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self { sink }
    }

    /// Log the line and pass it to the sink.
    pub fn report(&self, text: &str, severity: Severity) {
        match severity {
            Severity::Info => info!(target: "status", "{text}"),
            Severity::Warning => warn!(target: "status", "{text}"),
            Severity::Error => error!(target: "status", "{text}"),
        }
        self.sink.report(text, severity);
    }

    /// Info line.
    pub fn info(&self, text: impl AsRef<str>) {
        self.report(text.as_ref(), Severity::Info);
    }

    /// Warning line.
    pub fn warn(&self, text: impl AsRef<str>) {
        self.report(text.as_ref(), Severity::Warning);
    }

    /// Error line.
    pub fn error(&self, text: impl AsRef<str>) {
        self.report(text.as_ref(), Severity::Error);
    }

    /// Announce the step about to run.
    pub fn progress(&self, index: usize, command: &Command) {
        info!(target: "status", index, tag = %command.tag(), "Starting step");
        self.sink.progress(index, command);
    }
}

/// Release point for `wait_for_prompt` steps.
///
/// Only a prompt that is already waiting can be released. A release issued
/// while nothing waits is ignored, so a stray Enter never skips a later prompt.
#[derive(Clone, Default)]
pub struct PromptGate {
    notify: Arc<Notify>,
    waiting: Arc<AtomicBool>,
}

/// Clears the waiting flag when a prompt finishes or is abandoned.
struct WaitingGuard<'a>(&'a AtomicBool);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PromptGate {
    /// Gate with no prompt waiting.
    pub fn new() -> Self {
        Self::default()
    }

    /// Operator action: let the waiting prompt continue.
    ///
    /// Returns `false` when no prompt was waiting.
    pub fn release(&self) -> bool {
        if !self.waiting.load(Ordering::Acquire) {
            debug!("Prompt release ignored, nothing is waiting");
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    /// Whether a prompt is currently waiting for the operator.
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    /// Waits for the next operator release.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Registered before the flag is raised so a release in between is not lost.
        notified.as_mut().enable();
        self.waiting.store(true, Ordering::Release);
        let _guard = WaitingGuard(&self.waiting);
        notified.await;
    }
}

/// Everything a step needs to perform its side effects.
#[derive(Clone)]
pub struct Services {
    /// Antennas and receivers.
    pub equipment: Arc<dyn EquipmentControl>,
    /// Recorder nodes.
    pub recorder: Arc<dyn RecorderPublisher>,
    /// Backend and postprocessor definitions.
    pub catalog: Arc<dyn BackendCatalog>,
    /// Operator status lines.
    pub status: StatusReporter,
    /// Remaining-plan snapshots.
    pub plans: Arc<dyn PlanPublisher>,
    /// Operator release for prompts.
    pub prompt: PromptGate,
}
