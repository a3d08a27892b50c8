//! Operation variants.
//!
//! Every [`OperationTag`] has exactly one implementation of [`Operation`].
//! Variants are built from a [`Command`] through a static lookup table, and
//! building is the only validation gate: a variant that exists is fully
//! configured. Running a variant performs its side effects through
//! [`Services`].
//!
//! Variants that block for long periods (tracking, waits) expose an
//! interrupt hook backed by [`Interrupt`]. The step runner calls
//! [`Operation::interrupt`] when a stop is requested; variants without a hook
//! run to completion and the stop takes effect at the next step boundary.

pub mod backend;
pub mod equipment;
pub mod track;
pub mod tuning;
pub mod wait;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{SchedError, SchedResult};
use crate::hardware::{AltAz, Services};
use crate::schedule::{Command, OperationTag};

pub use backend::{BackendFamily, SetBackend};
pub use equipment::{ParkEquipment, ReleaseEquipment, ReserveEquipment};
pub use track::{majority_source, TrackAndObserve};
pub use tuning::{focus_channel, SetDigitizerMode, SetFrequencyTuning};
pub use wait::{parse_target_datetime, WaitForDuration, WaitForPrompt, WaitUntil};

/// One executable schedule step.
#[async_trait]
pub trait Operation: Send + Sync {
    /// The tag this variant was built from.
    fn tag(&self) -> OperationTag;

    /// Performs the step's side effects.
    async fn run(&self, services: &Services) -> SchedResult<()>;

    /// Best-effort request to finish early. Returns false when the variant
    /// has no interrupt hook.
    fn interrupt(&self) -> bool {
        false
    }
}

/// Timing and positions the variants need beyond their own fields.
#[derive(Debug, Clone)]
pub struct OperationSettings {
    /// Wait after retuning before gain adjustments.
    pub settle: Duration,
    /// Recording starts this long after it is scheduled.
    pub recording_lead: Duration,
    /// Extra wait after a recording is expected to end.
    pub safety_margin: Duration,
    /// Where `park_equipment` points.
    pub park_position: AltAz,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(20),
            recording_lead: Duration::from_secs(10),
            safety_margin: Duration::from_secs(5),
            park_position: AltAz {
                azimuth_deg: 0.0,
                elevation_deg: 18.0,
            },
        }
    }
}

type Constructor = fn(&Command, &OperationSettings) -> SchedResult<Arc<dyn Operation>>;

const CONSTRUCTORS: &[(OperationTag, Constructor)] = &[
    (OperationTag::ReserveEquipment, ReserveEquipment::construct),
    (OperationTag::ReleaseEquipment, ReleaseEquipment::construct),
    (OperationTag::SetFrequencyTuning, SetFrequencyTuning::construct),
    (OperationTag::SetDigitizerMode, SetDigitizerMode::construct),
    (OperationTag::SetBackend, SetBackend::construct),
    (OperationTag::TrackAndObserve, TrackAndObserve::construct),
    (OperationTag::WaitUntil, WaitUntil::construct),
    (OperationTag::WaitForDuration, WaitForDuration::construct),
    (OperationTag::WaitForPrompt, WaitForPrompt::construct),
    (OperationTag::ParkEquipment, ParkEquipment::construct),
];

/// Builds the variant for one command.
pub fn build(command: &Command, settings: &OperationSettings) -> SchedResult<Arc<dyn Operation>> {
    command.check_required()?;
    let constructor = CONSTRUCTORS
        .iter()
        .find(|(tag, _)| *tag == command.tag())
        .map(|(_, c)| *c)
        .ok_or_else(|| {
            SchedError::InvalidSchedule(format!("no operation registered for {}", command.tag()))
        })?;
    constructor(command, settings)
}

/// Builds every variant, stopping at the first invalid command.
pub fn build_all(
    commands: &[Command],
    settings: &OperationSettings,
) -> SchedResult<Vec<Arc<dyn Operation>>> {
    commands.iter().map(|c| build(c, settings)).collect()
}

// =============================================================================
// Interrupt - cooperative early exit for blocking variants
// =============================================================================

/// Latched interrupt flag with wake-up.
#[derive(Debug, Default)]
pub struct Interrupt {
    triggered: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    /// Untriggered interrupt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the flag and wake every waiter.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether a stop was requested.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`. Returns true when cut short by an interrupt.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = notified => true,
        }
    }

    /// Waits until triggered.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}
