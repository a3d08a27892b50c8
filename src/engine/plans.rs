//! Feasibility planning.
//!
//! [`PlanBuilder`] walks a command list and predicts when each observation
//! block will happen, starting from a known time and equipment position. It
//! never calls hardware: source positions are handed in as a
//! [`SourceTable`], resolved beforehand by whoever asks for the plan. The same
//! commands, origin, and table always produce the same plan.
//!
//! # Timeline rules
//!
//! ```text
//! set_frequency_tuning   + rf/if overhead
//! set_digitizer_mode     + digitizer overhead
//! set_backend            + backend overhead
//! track_and_observe      + slew + lead | block | + safety margin
//! wait_for_duration      + seconds
//! wait_until             cursor = max(cursor, target)
//! wait_for_prompt        + configured default, flagged as a warning
//! ```
//!
//! A source that cannot be resolved is an error. A source that is below the
//! elevation limit at any sampled point of its block is a warning. A timeline
//! that runs past the last representable date is an error and ends the walk.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::astro::{separation_deg, Site};
use super::operations::parse_target_datetime;
use super::operations::track::POINTED_SOURCE;
use crate::hardware::{Severity, SkyPosition};
use crate::schedule::{fields, Command, ConfigValue, OperationTag};

/// Visibility is checked at this spacing within a block...
const VISIBILITY_STEP_SECS: i64 = 60;
/// ...spread out further for long blocks so no block takes more samples than this.
const MAX_VISIBILITY_SAMPLES: i64 = 1440;

/// Source name to position.
pub type SourceTable = BTreeMap<String, SkyPosition>;

/// One predicted observation block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationPlanEntry {
    /// Source name as resolved.
    pub source_id: String,
    /// Hours.
    pub right_ascension: f64,
    /// Degrees.
    pub declination: f64,
    /// Recording starts.
    pub start_time: DateTime<Utc>,
    /// Recording ends.
    pub end_time: DateTime<Utc>,
}

/// Overall verdict of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Nothing to report.
    Ok,
    /// Runnable, with caveats.
    Warning,
    /// Would be rejected before reserving.
    Error,
}

impl From<Severity> for PlanStatus {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Info => PlanStatus::Ok,
            Severity::Warning => PlanStatus::Warning,
            Severity::Error => PlanStatus::Error,
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStatus::Ok => write!(f, "ok"),
            PlanStatus::Warning => write!(f, "warning"),
            PlanStatus::Error => write!(f, "error"),
        }
    }
}

/// A finding about one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNote {
    /// Position of the command in the list the plan was built from.
    pub index: usize,
    /// Error notes reject the plan.
    pub severity: Severity,
    /// Human readable finding.
    pub message: String,
}

/// Predicted timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Observation blocks, in schedule order.
    pub entries: Vec<ObservationPlanEntry>,
    /// Findings, in schedule order.
    pub notes: Vec<PlanNote>,
    /// Worst note severity.
    pub status: PlanStatus,
    /// Origin time.
    pub start: DateTime<Utc>,
    /// Predicted end of the last command.
    pub end: DateTime<Utc>,
}

impl Plan {
    /// True when any note is an error.
    pub fn is_rejected(&self) -> bool {
        self.status == PlanStatus::Error
    }

    /// Notes at or above `severity`, joined for display.
    pub fn describe(&self, severity: Severity) -> String {
        self.notes
            .iter()
            .filter(|n| n.severity >= severity)
            .map(|n| format!("[{}] {}", n.index, n.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Where and when the simulation starts.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanOrigin {
    /// Simulation start.
    pub now: DateTime<Utc>,
    /// Current equipment position, when known.
    pub position: Option<SkyPosition>,
    /// Source the equipment is pointed at, used for `none` source names.
    pub pointed_source: Option<String>,
}

impl PlanOrigin {
    /// Origin at `now` with unknown position.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            position: None,
            pointed_source: None,
        }
    }
}

/// Durations and limits used by the simulation.
#[derive(Debug, Clone)]
pub struct PlanSettings {
    /// Assumed length of an operator prompt.
    pub wait_for_prompt_default: Duration,
    /// Retune plus gain adjustment.
    pub rf_if_overhead: Duration,
    /// Digitizer mode switch.
    pub digitizer_overhead: Duration,
    /// Recorder configuration.
    pub backend_overhead: Duration,
    /// Delay between scheduling a recording and its start.
    pub recording_lead: Duration,
    /// Extra wait after each recording.
    pub safety_margin: Duration,
    /// Slew speed, degrees per second.
    pub slew_rate_deg_per_sec: f64,
    /// Sources below this elevation draw a warning.
    pub min_elevation_deg: f64,
    /// Observatory location.
    pub site: Site,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            wait_for_prompt_default: Duration::from_secs(600),
            rf_if_overhead: Duration::from_secs(60),
            digitizer_overhead: Duration::from_secs(30),
            backend_overhead: Duration::from_secs(30),
            recording_lead: Duration::from_secs(10),
            safety_margin: Duration::from_secs(5),
            slew_rate_deg_per_sec: 1.0,
            min_elevation_deg: 16.8,
            site: Site::new(40.817_1, -121.473_6),
        }
    }
}

/// Named sources a plan will need positions for, in first-use order.
pub fn sources_to_resolve(commands: &[Command]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    commands
        .iter()
        .filter(|c| c.tag() == OperationTag::TrackAndObserve)
        .filter_map(|c| c.identifier(fields::SOURCE_NAME).ok())
        .filter(|name| !name.eq_ignore_ascii_case(POINTED_SOURCE))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Pure timeline simulator.
#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    settings: PlanSettings,
}

struct Walk<'a> {
    settings: &'a PlanSettings,
    cursor: DateTime<Utc>,
    position: Option<SkyPosition>,
    entries: Vec<ObservationPlanEntry>,
    notes: Vec<PlanNote>,
    /// Set when the cursor could not be advanced.
    overflowed: bool,
}

impl PlanBuilder {
    /// Builder with the given timings.
    pub fn new(settings: PlanSettings) -> Self {
        Self { settings }
    }

    /// Timings in use.
    pub fn settings(&self) -> &PlanSettings {
        &self.settings
    }

    /// Simulates `commands` from `origin`.
    pub fn build(&self, commands: &[Command], origin: &PlanOrigin, sources: &SourceTable) -> Plan {
        let mut walk = Walk {
            settings: &self.settings,
            cursor: origin.now,
            position: origin.position,
            entries: Vec::new(),
            notes: Vec::new(),
            overflowed: false,
        };

        for (index, command) in commands.iter().enumerate() {
            match command.tag() {
                OperationTag::SetFrequencyTuning => walk.advance(self.settings.rf_if_overhead),
                OperationTag::SetDigitizerMode => walk.advance(self.settings.digitizer_overhead),
                OperationTag::SetBackend => walk.advance(self.settings.backend_overhead),
                OperationTag::TrackAndObserve => walk.track(index, command, origin, sources),
                OperationTag::WaitForDuration => match command.number(fields::SECONDS) {
                    Ok(secs) if secs >= 0.0 => walk.advance_secs(secs),
                    _ => walk.note(index, Severity::Error, "wait duration is not a valid number of seconds"),
                },
                OperationTag::WaitUntil => walk.wait_until(index, command),
                OperationTag::WaitForPrompt => {
                    walk.advance(self.settings.wait_for_prompt_default);
                    let msg = format!(
                        "operator prompt assumed to take {}s, later times are estimates",
                        self.settings.wait_for_prompt_default.as_secs()
                    );
                    walk.note(index, Severity::Warning, msg);
                }
                OperationTag::ParkEquipment => walk.position = None,
                OperationTag::ReserveEquipment | OperationTag::ReleaseEquipment => {}
            }
            if walk.overflowed {
                walk.note(index, Severity::Error, "timeline runs past the last representable date");
                break;
            }
        }

        let status = walk
            .notes
            .iter()
            .map(|n| PlanStatus::from(n.severity))
            .max()
            .unwrap_or(PlanStatus::Ok);
        debug!(
            blocks = walk.entries.len(),
            notes = walk.notes.len(),
            %status,
            "Built plan"
        );
        Plan {
            entries: walk.entries,
            notes: walk.notes,
            status,
            start: origin.now,
            end: walk.cursor,
        }
    }
}

/// Float to integer casts saturate, so only the range check can fail.
fn delta(secs: f64) -> Option<TimeDelta> {
    TimeDelta::try_milliseconds((secs * 1000.0).round() as i64)
}

impl Walk<'_> {
    fn note(&mut self, index: usize, severity: Severity, message: impl Into<String>) {
        self.notes.push(PlanNote {
            index,
            severity,
            message: message.into(),
        });
    }

    fn advance(&mut self, duration: Duration) {
        self.advance_secs(duration.as_secs_f64());
    }

    fn advance_secs(&mut self, secs: f64) {
        match delta(secs).and_then(|d| self.cursor.checked_add_signed(d)) {
            Some(cursor) => self.cursor = cursor,
            None => {
                self.cursor = DateTime::<Utc>::MAX_UTC;
                self.overflowed = true;
            }
        }
    }

    fn wait_until(&mut self, index: usize, command: &Command) {
        let target = match command.get(fields::TARGET_DATETIME) {
            Some(ConfigValue::Text(text)) => parse_target_datetime(text).ok(),
            _ => None,
        };
        match target {
            Some(target) => self.cursor = self.cursor.max(target.with_timezone(&Utc)),
            None => self.note(index, Severity::Error, "wait target is not a valid date and time"),
        }
    }

    fn track(&mut self, index: usize, command: &Command, origin: &PlanOrigin, sources: &SourceTable) {
        let obs_secs = match command.number(fields::OBS_TIME) {
            Ok(secs) if secs >= 0.0 => secs,
            _ => {
                self.note(index, Severity::Error, "observation time is not a valid number of seconds");
                return;
            }
        };

        let name = match command.identifier(fields::SOURCE_NAME) {
            Ok(name) if name.eq_ignore_ascii_case(POINTED_SOURCE) => origin.pointed_source.clone(),
            Ok(name) => Some(name),
            Err(_) => None,
        };
        let resolved = name
            .as_ref()
            .and_then(|n| sources.get(n).map(|p| (n.clone(), *p)));
        let Some((name, position)) = resolved else {
            let shown = name.unwrap_or_else(|| "pointed source".into());
            self.note(index, Severity::Error, format!("cannot resolve source {shown}"));
            self.advance(self.settings.recording_lead);
            self.advance_secs(obs_secs);
            self.advance(self.settings.safety_margin);
            return;
        };

        if let Some(current) = self.position {
            let slew = separation_deg(current, position) / self.settings.slew_rate_deg_per_sec;
            self.advance_secs(slew);
        }
        self.position = Some(position);

        self.advance(self.settings.recording_lead);
        let start = self.cursor;
        self.advance_secs(obs_secs);
        let end = self.cursor;
        self.advance(self.settings.safety_margin);

        if obs_secs <= 0.0 || self.overflowed {
            return;
        }

        let lowest = self.lowest_elevation(position, start, end);
        if lowest < self.settings.min_elevation_deg {
            self.note(
                index,
                Severity::Warning,
                format!(
                    "{name} drops to {lowest:.1} deg, below the {:.1} deg limit, during its block",
                    self.settings.min_elevation_deg
                ),
            );
        }
        self.entries.push(ObservationPlanEntry {
            source_id: name,
            right_ascension: position.ra_hours,
            declination: position.dec_deg,
            start_time: start,
            end_time: end,
        });
    }

    fn lowest_elevation(&self, position: SkyPosition, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
        let site = self.settings.site;
        let span = (end - start).num_seconds();
        let step = TimeDelta::seconds(VISIBILITY_STEP_SECS.max(span / MAX_VISIBILITY_SAMPLES + 1));
        let mut lowest = site.elevation_deg(position, end);
        let mut t = start;
        while t < end {
            lowest = lowest.min(site.elevation_deg(position, t));
            match t.checked_add_signed(step) {
                Some(next) => t = next,
                None => break,
            }
        }
        lowest
    }
}
