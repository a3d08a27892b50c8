//! Source tracking and recording.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{BackendFamily, INTEGRATION_TIME_KEY};
use super::{Interrupt, Operation, OperationSettings};
use crate::error::{SchedError, SchedResult};
use crate::hardware::{KeyValues, Services};
use crate::schedule::{fields, recorder_targets_to_map, Command, ConfigValue, OperationTag};

/// Source name meaning "whatever the equipment is already pointed at".
pub const POINTED_SOURCE: &str = "none";

static BEAM_FIELD: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^beam(\d+)_(ra|dec)_offset$").unwrap()
});

/// Most common source among `pointing`, visiting equipment in `ids` order.
///
/// Ties go to the source seen first. The flag is true when every piece of
/// equipment that reported a pointing agrees.
pub fn majority_source(
    ids: &[String],
    pointing: &BTreeMap<String, String>,
) -> Option<(String, bool)> {
    let mut tally: Vec<(&str, usize)> = Vec::new();
    for id in ids {
        let Some(source) = pointing.get(id) else {
            continue;
        };
        match tally.iter_mut().find(|(s, _)| *s == source.as_str()) {
            Some((_, count)) => *count += 1,
            None => tally.push((source.as_str(), 1)),
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (source, count) in &tally {
        match best {
            Some((_, c)) if c >= *count => {}
            _ => best = Some((*source, *count)),
        }
    }
    best.map(|(source, _)| (source.to_string(), tally.len() == 1))
}

#[derive(Debug, Clone, PartialEq)]
enum SourceChoice {
    Named(String),
    Pointed,
}

/// Offsets of one numbered beam, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
struct BeamOffset {
    index: u32,
    ra: f64,
    dec: f64,
}

/// Tracks a source, then records for the requested time.
#[derive(Debug)]
pub struct TrackAndObserve {
    ids: Vec<String>,
    targets: Vec<String>,
    source: SourceChoice,
    obs_time: Duration,
    integration_time: Option<f64>,
    beams: Vec<BeamOffset>,
    incomplete_beams: Vec<u32>,
    recording_lead: Duration,
    safety_margin: Duration,
    interrupt: Interrupt,
}

impl TrackAndObserve {
    /// Needs a source name and a non-negative observation time.
    pub fn construct(
        command: &Command,
        settings: &OperationSettings,
    ) -> SchedResult<Arc<dyn Operation>> {
        let ids = command.identifiers(fields::EQUIPMENT_LIST)?;
        if ids.is_empty() {
            return Err(SchedError::invalid(fields::EQUIPMENT_LIST, "no equipment selected"));
        }
        let targets = command.identifiers(fields::RECORDER_TARGETS)?;
        recorder_targets_to_map(&targets)?;

        let source_name = command.identifier(fields::SOURCE_NAME)?;
        let source = if source_name.eq_ignore_ascii_case(POINTED_SOURCE) {
            SourceChoice::Pointed
        } else {
            SourceChoice::Named(source_name)
        };

        let obs_secs = command.number(fields::OBS_TIME)?;
        if obs_secs < 0.0 {
            return Err(SchedError::invalid(fields::OBS_TIME, "must not be negative"));
        }
        let obs_time = Duration::try_from_secs_f64(obs_secs)
            .map_err(|e| SchedError::invalid(fields::OBS_TIME, e.to_string()))?;

        let integration_time = command.optional_number(fields::INTEGRATION_TIME)?;
        if matches!(integration_time, Some(t) if t <= 0.0) {
            return Err(SchedError::invalid(fields::INTEGRATION_TIME, "must be positive"));
        }

        let (beams, incomplete_beams) = beam_offsets(command)?;

        Ok(Arc::new(Self {
            ids,
            targets,
            source,
            obs_time,
            integration_time,
            beams,
            incomplete_beams,
            recording_lead: settings.recording_lead,
            safety_margin: settings.safety_margin,
            interrupt: Interrupt::new(),
        }))
    }

    async fn resolve_source(&self, services: &Services) -> SchedResult<String> {
        match &self.source {
            SourceChoice::Named(name) => {
                services
                    .status
                    .info(format!("Tracking {name} with {}", self.ids.join(", ")));
                services.equipment.track(name, &self.ids).await?;
                Ok(name.clone())
            }
            SourceChoice::Pointed => {
                let pointing = services.equipment.current_pointing(&self.ids).await?;
                let (source, unanimous) = majority_source(&self.ids, &pointing).ok_or_else(|| {
                    SchedError::Hardware("no equipment reports what it is pointed at".into())
                })?;
                if unanimous {
                    services
                        .status
                        .info(format!("Equipment is already on {source}"));
                } else {
                    services.status.warn(format!(
                        "Equipment is pointed at different sources, using the most common: {source}"
                    ));
                }
                Ok(source)
            }
        }
    }

    async fn publish_beams(&self, services: &Services, source: &str) -> SchedResult<()> {
        let center = match services.equipment.source_coordinates(source).await? {
            Some(position) => position,
            None => {
                let first = self.ids.first().ok_or_else(|| {
                    SchedError::Hardware("no equipment to read a pointing from".into())
                })?;
                debug!(source, equipment = %first, "Source not in catalog, using reported pointing");
                services.equipment.pointing_coordinates(first).await?
            }
        };

        for index in &self.incomplete_beams {
            services.status.warn(format!(
                "Beam {index} needs both an RA and a Dec offset, skipping it"
            ));
        }

        let mut kv = KeyValues::new();
        kv.insert("RA".into(), center.ra_hours.to_string());
        kv.insert("DEC".into(), center.dec_deg.to_string());
        for beam in &self.beams {
            kv.insert(format!("RA_OFF{}", beam.index), beam.ra.to_string());
            kv.insert(format!("DEC_OFF{}", beam.index), beam.dec.to_string());
        }
        services.recorder.publish_keyvalues(&kv, &self.targets).await
    }
}

#[async_trait]
impl Operation for TrackAndObserve {
    fn tag(&self) -> OperationTag {
        OperationTag::TrackAndObserve
    }

    async fn run(&self, services: &Services) -> SchedResult<()> {
        let source = self.resolve_source(services).await?;
        if self.obs_time.is_zero() {
            return Ok(());
        }

        let active = services.recorder.active_backend(&self.targets).await?;
        match active.as_deref().map(BackendFamily::of) {
            Some(BackendFamily::Beamformer) => self.publish_beams(services, &source).await?,
            Some(BackendFamily::Correlator { .. }) => {
                if let Some(secs) = self.integration_time {
                    let kv =
                        KeyValues::from([(INTEGRATION_TIME_KEY.to_string(), secs.to_string())]);
                    services.recorder.publish_keyvalues(&kv, &self.targets).await?;
                }
            }
            _ => {}
        }

        services.status.info(format!(
            "Recording {source} for {}s",
            self.obs_time.as_secs_f64()
        ));
        services
            .recorder
            .begin_recording(self.recording_lead, self.obs_time, &self.targets)
            .await?;

        let total = self
            .obs_time
            .saturating_add(self.recording_lead)
            .saturating_add(self.safety_margin);
        if self.interrupt.sleep(total).await {
            services
                .status
                .warn(format!("Observation of {source} interrupted"));
        } else {
            info!(%source, "Observation finished");
        }
        Ok(())
    }

    fn interrupt(&self) -> bool {
        self.interrupt.trigger();
        true
    }
}

fn beam_offsets(command: &Command) -> SchedResult<(Vec<BeamOffset>, Vec<u32>)> {
    let mut partial: BTreeMap<u32, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for (field, value) in command.config() {
        let Some(caps) = BEAM_FIELD.captures(field) else {
            continue;
        };
        let index: u32 = caps[1]
            .parse()
            .map_err(|_| SchedError::invalid(field, "beam number out of range"))?;
        if matches!(value, ConfigValue::Text(s) if s.trim().is_empty()) {
            continue;
        }
        let offset = command.number(field)?;
        let entry = partial.entry(index).or_default();
        if &caps[2] == "ra" {
            entry.0 = Some(offset);
        } else {
            entry.1 = Some(offset);
        }
    }

    let mut beams = Vec::new();
    let mut incomplete = Vec::new();
    for (index, offsets) in partial {
        match offsets {
            (Some(ra), Some(dec)) => beams.push(BeamOffset { index, ra, dec }),
            _ => incomplete.push(index),
        }
    }
    Ok((beams, incomplete))
}
