//! Mock Hardware Implementations
//!
//! Provides simulated collaborators for testing without physical equipment.
//! Every call is appended to a shared [`CallLog`] so tests can assert on the
//! exact sequence of side effects across equipment and recorders. The same
//! mocks back the CLI's simulated run mode, with a per-call delay.
//!
//! # Available Mocks
//!
//! - `MockEquipment` - reservation, tuning, tracking, and pointing
//! - `MockRecorder` - key/value publication and recording
//! - `MemoryStatusSink` / `MemoryPlanPublisher` - capture reports and snapshots
//! - `MockRig` - all of the above wired into a [`Services`] bundle

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use super::catalog::Catalog;
use super::{
    AltAz, DigitizerMode, EquipmentControl, KeyValues, PlanPublisher, PromptGate, RecorderPublisher, Services,
    Severity, SkyPosition, StatusReporter, StatusSink, TuningChannel,
};
use crate::engine::plans::ObservationPlanEntry;
use crate::error::{SchedError, SchedResult};

// =============================================================================
// CallLog - Shared record of side effects
// =============================================================================

/// One recorded collaborator call. Variants mirror the trait methods they
/// record.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum HwCall {
    Reserve(Vec<String>),
    Release(Vec<String>),
    Retune {
        freq_mhz: f64,
        channel: TuningChannel,
        defer_focus: bool,
    },
    Autotune(Vec<String>),
    TuneIf(Vec<TuningChannel>),
    DigitizerMode(DigitizerMode),
    Track(String),
    CurrentPointing,
    SourceCoordinates(String),
    PointingCoordinates(String),
    Park(Vec<String>),
    PublishKeyValues(KeyValues),
    BeginRecording {
        lead: Duration,
        duration: Duration,
    },
    ActiveBackend,
}

impl HwCall {
    /// Short call name, as used by `failing_on` and [`CallLog::count`].
    pub fn name(&self) -> &'static str {
        match self {
            HwCall::Reserve(_) => "reserve",
            HwCall::Release(_) => "release",
            HwCall::Retune { .. } => "retune",
            HwCall::Autotune(_) => "autotune",
            HwCall::TuneIf(_) => "tune_if",
            HwCall::DigitizerMode(_) => "digitizer_mode",
            HwCall::Track(_) => "track",
            HwCall::CurrentPointing => "current_pointing",
            HwCall::SourceCoordinates(_) => "source_coordinates",
            HwCall::PointingCoordinates(_) => "pointing_coordinates",
            HwCall::Park(_) => "park",
            HwCall::PublishKeyValues(_) => "publish_keyvalues",
            HwCall::BeginRecording { .. } => "begin_recording",
            HwCall::ActiveBackend => "active_backend",
        }
    }

    /// Read-only queries change nothing on the equipment.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            HwCall::CurrentPointing
                | HwCall::SourceCoordinates(_)
                | HwCall::PointingCoordinates(_)
                | HwCall::ActiveBackend
        )
    }
}

/// Ordered, shareable call log.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<HwCall>>>,
}

impl CallLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call.
    pub fn push(&self, call: HwCall) {
        debug!(call = call.name(), "mock hardware call");
        self.calls.lock().push(call);
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<HwCall> {
        self.calls.lock().clone()
    }

    /// Calls that change equipment or recorder state, in order.
    pub fn side_effects(&self) -> Vec<HwCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| !c.is_query())
            .cloned()
            .collect()
    }

    /// Number of calls with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.name() == name).count()
    }

    /// True before the first call.
    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

// =============================================================================
// MockEquipment - Simulated antennas and receivers
// =============================================================================

/// Mock equipment with reservation tracking and a small source catalog.
///
/// # Example
///
/// ```rust,ignore
/// let log = CallLog::new();
/// let equipment = MockEquipment::new(log.clone())
///     .with_source("casa", SkyPosition::new(23.39, 58.8))
///     .with_pointing("1a", "casa");
/// equipment.reserve(&ids).await?;
/// assert_eq!(log.count("reserve"), 1);
/// ```
pub struct MockEquipment {
    log: CallLog,
    reserved: Mutex<BTreeSet<String>>,
    pointing: Mutex<BTreeMap<String, String>>,
    positions: BTreeMap<String, SkyPosition>,
    sources: BTreeMap<String, SkyPosition>,
    fail_on: Option<&'static str>,
    panic_on: Option<&'static str>,
    delay: Duration,
}

impl MockEquipment {
    /// Equipment with nothing reserved and no known sources.
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            reserved: Mutex::new(BTreeSet::new()),
            pointing: Mutex::new(BTreeMap::new()),
            positions: BTreeMap::new(),
            sources: BTreeMap::new(),
            fail_on: None,
            panic_on: None,
            delay: Duration::ZERO,
        }
    }

    /// Add a catalog source.
    pub fn with_source(mut self, name: &str, position: SkyPosition) -> Self {
        self.sources.insert(name.to_string(), position);
        self
    }

    /// Add several catalog sources.
    pub fn with_sources(mut self, sources: BTreeMap<String, SkyPosition>) -> Self {
        self.sources.extend(sources);
        self
    }

    /// Equipment `id` starts out pointed at `source`.
    pub fn with_pointing(self, id: &str, source: &str) -> Self {
        self.pointing
            .lock()
            .insert(id.to_string(), source.to_string());
        self
    }

    /// Position reported by `pointing_coordinates(id)`.
    pub fn with_position(mut self, id: &str, position: SkyPosition) -> Self {
        self.positions.insert(id.to_string(), position);
        self
    }

    /// Calls named `call` (see [`HwCall::name`]) fail with a hardware error.
    pub fn failing_on(mut self, call: &'static str) -> Self {
        self.fail_on = Some(call);
        self
    }

    /// Calls named `call` panic, as a faulty driver would.
    pub fn panicking_on(mut self, call: &'static str) -> Self {
        self.panic_on = Some(call);
        self
    }

    /// Every call sleeps this long before completing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Marks equipment as held by someone else.
    pub fn already_reserved(self, ids: &[&str]) -> Self {
        self.reserved
            .lock()
            .extend(ids.iter().map(|s| s.to_string()));
        self
    }

    /// Whether `id` is currently held.
    pub fn is_reserved(&self, id: &str) -> bool {
        self.reserved.lock().contains(id)
    }

    async fn enter(&self, call: HwCall) -> SchedResult<()> {
        let name = call.name();
        self.log.push(call);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if self.panic_on == Some(name) {
            panic!("simulated {name} panic");
        }
        if self.fail_on == Some(name) {
            return Err(SchedError::Hardware(format!("simulated {name} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl EquipmentControl for MockEquipment {
    async fn reserve(&self, ids: &[String]) -> SchedResult<()> {
        self.enter(HwCall::Reserve(ids.to_vec())).await?;
        let mut reserved = self.reserved.lock();
        if let Some(held) = ids.iter().find(|id| reserved.contains(*id)) {
            return Err(SchedError::Reservation(format!("{held} is already reserved")));
        }
        reserved.extend(ids.iter().cloned());
        Ok(())
    }

    async fn release(&self, ids: &[String]) -> SchedResult<()> {
        self.enter(HwCall::Release(ids.to_vec())).await?;
        let mut reserved = self.reserved.lock();
        for id in ids {
            reserved.remove(id);
        }
        Ok(())
    }

    async fn retune(
        &self,
        freq_mhz: f64,
        _ids: &[String],
        channel: TuningChannel,
        defer_focus: bool,
    ) -> SchedResult<()> {
        self.enter(HwCall::Retune {
            freq_mhz,
            channel,
            defer_focus,
        })
        .await
    }

    async fn autotune(&self, ids: &[String]) -> SchedResult<()> {
        self.enter(HwCall::Autotune(ids.to_vec())).await
    }

    async fn tune_if(&self, _ids: &[String], channels: &[TuningChannel]) -> SchedResult<()> {
        self.enter(HwCall::TuneIf(channels.to_vec())).await
    }

    async fn set_digitizer_mode(&self, mode: DigitizerMode, _ids: &[String]) -> SchedResult<()> {
        self.enter(HwCall::DigitizerMode(mode)).await
    }

    async fn track(&self, source: &str, ids: &[String]) -> SchedResult<()> {
        self.enter(HwCall::Track(source.to_string())).await?;
        let mut pointing = self.pointing.lock();
        for id in ids {
            pointing.insert(id.clone(), source.to_string());
        }
        Ok(())
    }

    async fn current_pointing(&self, ids: &[String]) -> SchedResult<BTreeMap<String, String>> {
        self.enter(HwCall::CurrentPointing).await?;
        let pointing = self.pointing.lock();
        Ok(ids
            .iter()
            .filter_map(|id| pointing.get(id).map(|src| (id.clone(), src.clone())))
            .collect())
    }

    async fn source_coordinates(&self, source: &str) -> SchedResult<Option<SkyPosition>> {
        self.enter(HwCall::SourceCoordinates(source.to_string()))
            .await?;
        Ok(self.sources.get(source).copied())
    }

    async fn pointing_coordinates(&self, id: &str) -> SchedResult<SkyPosition> {
        self.enter(HwCall::PointingCoordinates(id.to_string()))
            .await?;
        if let Some(position) = self.positions.get(id) {
            return Ok(*position);
        }
        let source = self.pointing.lock().get(id).cloned();
        source
            .and_then(|s| self.sources.get(&s).copied())
            .ok_or_else(|| SchedError::Hardware(format!("{id} reports no pointing")))
    }

    async fn park(&self, ids: &[String], _position: AltAz) -> SchedResult<()> {
        self.enter(HwCall::Park(ids.to_vec())).await?;
        let mut pointing = self.pointing.lock();
        for id in ids {
            pointing.remove(id);
        }
        Ok(())
    }
}

// =============================================================================
// MockRecorder - Simulated recorder nodes
// =============================================================================

/// Mock recorder. Publishing a `BACKEND` key switches the active backend.
pub struct MockRecorder {
    log: CallLog,
    active_backend: Mutex<Option<String>>,
    fail_on: Option<&'static str>,
}

impl MockRecorder {
    /// Recorder with no active backend.
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            active_backend: Mutex::new(None),
            fail_on: None,
        }
    }

    /// Recorder already configured for `name`.
    pub fn with_active_backend(self, name: &str) -> Self {
        *self.active_backend.lock() = Some(name.to_string());
        self
    }

    /// Calls named `call` fail with a hardware error.
    pub fn failing_on(mut self, call: &'static str) -> Self {
        self.fail_on = Some(call);
        self
    }

    fn enter(&self, call: HwCall) -> SchedResult<()> {
        let name = call.name();
        self.log.push(call);
        if self.fail_on == Some(name) {
            return Err(SchedError::Hardware(format!("simulated {name} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl RecorderPublisher for MockRecorder {
    async fn publish_keyvalues(&self, values: &KeyValues, _targets: &[String]) -> SchedResult<()> {
        self.enter(HwCall::PublishKeyValues(values.clone()))?;
        if let Some(backend) = values.get(super::catalog::BACKEND_KEY) {
            *self.active_backend.lock() = Some(backend.clone());
        }
        Ok(())
    }

    async fn begin_recording(
        &self,
        lead_time: Duration,
        duration: Duration,
        _targets: &[String],
    ) -> SchedResult<()> {
        self.enter(HwCall::BeginRecording {
            lead: lead_time,
            duration,
        })
    }

    async fn active_backend(&self, _targets: &[String]) -> SchedResult<Option<String>> {
        self.enter(HwCall::ActiveBackend)?;
        Ok(self.active_backend.lock().clone())
    }
}

// =============================================================================
// In-memory sinks
// =============================================================================

/// Status sink that keeps every line.
#[derive(Default)]
pub struct MemoryStatusSink {
    lines: Mutex<Vec<(String, Severity)>>,
}

impl MemoryStatusSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every line so far.
    pub fn lines(&self) -> Vec<(String, Severity)> {
        self.lines.lock().clone()
    }

    /// Whether any line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|(text, _)| text.contains(needle))
    }

    /// Lines of one severity.
    pub fn count(&self, severity: Severity) -> usize {
        self.lines
            .lock()
            .iter()
            .filter(|(_, s)| *s == severity)
            .count()
    }

    /// Most recent line.
    pub fn last(&self) -> Option<(String, Severity)> {
        self.lines.lock().last().cloned()
    }
}

impl StatusSink for MemoryStatusSink {
    fn report(&self, text: &str, severity: Severity) {
        self.lines.lock().push((text.to_string(), severity));
    }
}

/// Plan publisher that keeps every snapshot.
#[derive(Default)]
pub struct MemoryPlanPublisher {
    snapshots: Mutex<Vec<Vec<ObservationPlanEntry>>>,
}

impl MemoryPlanPublisher {
    /// Publisher with no snapshots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every snapshot so far, oldest first.
    pub fn snapshots(&self) -> Vec<Vec<ObservationPlanEntry>> {
        self.snapshots.lock().clone()
    }
}

impl PlanPublisher for MemoryPlanPublisher {
    fn publish_snapshot(&self, entries: &[ObservationPlanEntry]) -> SchedResult<()> {
        self.snapshots.lock().push(entries.to_vec());
        Ok(())
    }
}

// =============================================================================
// MockRig - Everything wired together
// =============================================================================

/// A full set of mock collaborators sharing one call log.
pub struct MockRig {
    /// Log shared by equipment and recorder.
    pub log: CallLog,
    /// Simulated equipment.
    pub equipment: Arc<MockEquipment>,
    /// Simulated recorders.
    pub recorder: Arc<MockRecorder>,
    /// Backend tables.
    pub catalog: Arc<Catalog>,
    /// Captured status lines.
    pub status: Arc<MemoryStatusSink>,
    /// Captured plan snapshots.
    pub plans: Arc<MemoryPlanPublisher>,
    /// Prompt gate handed to the steps.
    pub prompt: PromptGate,
}

impl MockRig {
    /// Rig with default mocks and the given catalog.
    pub fn new(catalog: Catalog) -> Self {
        let log = CallLog::new();
        Self::from_parts(
            log.clone(),
            MockEquipment::new(log.clone()),
            MockRecorder::new(log),
            catalog,
        )
    }

    /// Rig from pre-configured mocks. Both mocks should share `log`.
    pub fn from_parts(
        log: CallLog,
        equipment: MockEquipment,
        recorder: MockRecorder,
        catalog: Catalog,
    ) -> Self {
        Self {
            log,
            equipment: Arc::new(equipment),
            recorder: Arc::new(recorder),
            catalog: Arc::new(catalog),
            status: Arc::new(MemoryStatusSink::new()),
            plans: Arc::new(MemoryPlanPublisher::new()),
            prompt: PromptGate::new(),
        }
    }

    /// Services bundle over the rig's mocks.
    pub fn services(&self) -> Services {
        Services {
            equipment: self.equipment.clone(),
            recorder: self.recorder.clone(),
            catalog: self.catalog.clone(),
            status: StatusReporter::new(self.status.clone()),
            plans: self.plans.clone(),
            prompt: self.prompt.clone(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_reserve_conflicts_and_release_is_idempotent() {
        let log = CallLog::new();
        let equipment = MockEquipment::new(log.clone()).already_reserved(&["2b"]);

        let err = equipment.reserve(&ids(&["1a", "2b"])).await.unwrap_err();
        assert!(matches!(err, SchedError::Reservation(_)));
        assert!(!equipment.is_reserved("1a"));

        equipment.reserve(&ids(&["1a"])).await.unwrap();
        assert!(equipment.is_reserved("1a"));

        equipment.release(&ids(&["1a"])).await.unwrap();
        equipment.release(&ids(&["1a"])).await.unwrap();
        assert!(!equipment.is_reserved("1a"));
        assert_eq!(log.count("release"), 2);
    }

    #[tokio::test]
    async fn test_track_updates_pointing() {
        let log = CallLog::new();
        let equipment = MockEquipment::new(log.clone()).with_pointing("1a", "3c84");

        equipment.track("casa", &ids(&["1a", "1c"])).await.unwrap();
        let pointing = equipment.current_pointing(&ids(&["1a", "1c"])).await.unwrap();
        assert_eq!(pointing["1a"], "casa");
        assert_eq!(pointing["1c"], "casa");
        assert_eq!(log.side_effects(), vec![HwCall::Track("casa".into())]);
    }

    #[tokio::test]
    async fn test_failing_call_is_still_logged() {
        let log = CallLog::new();
        let equipment = MockEquipment::new(log.clone()).failing_on("autotune");

        assert!(equipment.autotune(&ids(&["1a"])).await.is_err());
        assert_eq!(log.count("autotune"), 1);
    }

    #[tokio::test]
    async fn test_recorder_tracks_active_backend() {
        let log = CallLog::new();
        let recorder = MockRecorder::new(log.clone());
        assert_eq!(recorder.active_backend(&[]).await.unwrap(), None);

        let mut kv = KeyValues::new();
        kv.insert("BACKEND".into(), "xgpu_1.0s".into());
        recorder.publish_keyvalues(&kv, &[]).await.unwrap();
        assert_eq!(
            recorder.active_backend(&[]).await.unwrap().as_deref(),
            Some("xgpu_1.0s")
        );
    }
}
