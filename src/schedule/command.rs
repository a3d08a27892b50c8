//! Typed schedule lines.
//!
//! A [`Command`] pairs an [`OperationTag`] with a mapping of named fields.
//! Field values keep the shape they were authored in ([`ConfigValue`]) and are
//! only interpreted through the typed lookups below, each of which accepts
//! exactly the representations of one semantic type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::context::ExecutionContext;
use crate::error::{SchedError, SchedResult};

/// Field names understood by the operation variants.
pub mod fields {
    /// Equipment ids the step acts on.
    pub const EQUIPMENT_LIST: &str = "equipment_list";
    /// Recorder targets in `node.instance` form.
    pub const RECORDER_TARGETS: &str = "recorder_targets";
    /// Run RF autotune after retuning.
    pub const RF_GAIN_FLAG: &str = "rf_gain_flag";
    /// Tune the IF chain of the retuned channels.
    pub const IF_GAIN_FLAG: &str = "if_gain_flag";
    /// Equalizer levelling.
    pub const EQ_LEVEL_FLAG: &str = "eq_level_flag";
    /// Let the highest retuned frequency move the focus. Optional, on by default.
    pub const FOCUS_FLAG: &str = "focus_flag";
    /// Digitizer mode name, e.g. `Continuum mode`.
    pub const DIGITIZER_MODE: &str = "digitizer_mode";
    /// Channel A frequency, MHz. Blank leaves the channel alone.
    pub const TUNING_A: &str = "tuning_a";
    /// Channel B frequency, MHz.
    pub const TUNING_B: &str = "tuning_b";
    /// Channel C frequency, MHz.
    pub const TUNING_C: &str = "tuning_c";
    /// Channel D frequency, MHz.
    pub const TUNING_D: &str = "tuning_d";
    /// Project the recording is filed under.
    pub const PROJECT_ID: &str = "project_id";
    /// Backend catalog entry.
    pub const BACKEND_NAME: &str = "backend_name";
    /// Postprocessor catalog entry.
    pub const POSTPROCESSOR_NAME: &str = "postprocessor_name";
    /// Source to track, or `pointed` for the current pointing.
    pub const SOURCE_NAME: &str = "source_name";
    /// Recording length, seconds.
    pub const OBS_TIME: &str = "obs_time";
    /// Recorder integration time, seconds. Optional.
    pub const INTEGRATION_TIME: &str = "integration_time";
    /// Wall-clock time to wait for.
    pub const TARGET_DATETIME: &str = "target_datetime";
    /// Wait length, seconds.
    pub const SECONDS: &str = "seconds";
}

/// The kind of a schedule line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationTag {
    /// Acquire the listed equipment.
    ReserveEquipment,
    /// Give the listed equipment back.
    ReleaseEquipment,
    /// Retune receiver channels and adjust gains.
    SetFrequencyTuning,
    /// Switch the digitizer between continuum and spectral line modes.
    SetDigitizerMode,
    /// Configure recorders for a backend and postprocessor.
    SetBackend,
    /// Point at a source and record.
    TrackAndObserve,
    /// Wait for a wall-clock time.
    WaitUntil,
    /// Wait a fixed number of seconds.
    WaitForDuration,
    /// Wait for the operator.
    WaitForPrompt,
    /// Move equipment to the park position.
    ParkEquipment,
}

impl OperationTag {
    /// Every tag, in declaration order.
    pub const ALL: [OperationTag; 10] = [
        OperationTag::ReserveEquipment,
        OperationTag::ReleaseEquipment,
        OperationTag::SetFrequencyTuning,
        OperationTag::SetDigitizerMode,
        OperationTag::SetBackend,
        OperationTag::TrackAndObserve,
        OperationTag::WaitUntil,
        OperationTag::WaitForDuration,
        OperationTag::WaitForPrompt,
        OperationTag::ParkEquipment,
    ];

    /// Tag name as written in schedule files.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationTag::ReserveEquipment => "reserve_equipment",
            OperationTag::ReleaseEquipment => "release_equipment",
            OperationTag::SetFrequencyTuning => "set_frequency_tuning",
            OperationTag::SetDigitizerMode => "set_digitizer_mode",
            OperationTag::SetBackend => "set_backend",
            OperationTag::TrackAndObserve => "track_and_observe",
            OperationTag::WaitUntil => "wait_until",
            OperationTag::WaitForDuration => "wait_for_duration",
            OperationTag::WaitForPrompt => "wait_for_prompt",
            OperationTag::ParkEquipment => "park_equipment",
        }
    }

    /// Fields that must be present for the tag to be constructed.
    pub fn required_fields(&self) -> &'static [&'static str] {
        use fields::*;
        match self {
            OperationTag::ReserveEquipment
            | OperationTag::ReleaseEquipment
            | OperationTag::ParkEquipment => &[EQUIPMENT_LIST],
            OperationTag::SetFrequencyTuning => {
                &[EQUIPMENT_LIST, RF_GAIN_FLAG, IF_GAIN_FLAG, EQ_LEVEL_FLAG]
            }
            OperationTag::SetDigitizerMode => &[EQUIPMENT_LIST, DIGITIZER_MODE],
            OperationTag::SetBackend => {
                &[PROJECT_ID, BACKEND_NAME, POSTPROCESSOR_NAME, RECORDER_TARGETS]
            }
            OperationTag::TrackAndObserve => {
                &[EQUIPMENT_LIST, RECORDER_TARGETS, SOURCE_NAME, OBS_TIME]
            }
            OperationTag::WaitUntil => &[TARGET_DATETIME],
            OperationTag::WaitForDuration => &[SECONDS],
            OperationTag::WaitForPrompt => &[],
        }
    }

    fn takes(&self, field: &str) -> bool {
        self.required_fields().contains(&field)
    }
}

impl fmt::Display for OperationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationTag {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        OperationTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == wanted)
            .ok_or_else(|| SchedError::InvalidSchedule(format!("unknown operation tag '{s}'")))
    }
}

/// A field value as it was authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// A bare number.
    Number(f64),
    /// Free text, including numbers and lists typed as text.
    Text(String),
    /// A list of identifiers.
    List(Vec<String>),
}

impl ConfigValue {
    fn kind(&self) -> &'static str {
        match self {
            ConfigValue::Number(_) => "number",
            ConfigValue::Text(_) => "text",
            ConfigValue::List(_) => "list",
        }
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Number(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Text(value)
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(value: Vec<String>) -> Self {
        ConfigValue::List(value)
    }
}

impl From<&[&str]> for ConfigValue {
    fn from(value: &[&str]) -> Self {
        ConfigValue::List(value.iter().map(|s| s.to_string()).collect())
    }
}

/// One schedule line: an operation tag plus its configuration.
///
/// Commands are immutable once built; [`Command::with`] consumes and returns
/// a new value, which keeps construction readable in tests and loaders.
/// Fields are stored sorted by name. Authoring order carries no meaning, so
/// summaries and saved files list fields alphabetically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    tag: OperationTag,
    #[serde(default)]
    config: BTreeMap<String, ConfigValue>,
}

impl Command {
    /// Command with no fields.
    pub fn new(tag: OperationTag) -> Self {
        Self {
            tag,
            config: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn with(mut self, field: &str, value: impl Into<ConfigValue>) -> Self {
        self.config.insert(field.to_string(), value.into());
        self
    }

    /// The operation this line runs.
    pub fn tag(&self) -> OperationTag {
        self.tag
    }

    /// All fields, sorted by name.
    pub fn config(&self) -> &BTreeMap<String, ConfigValue> {
        &self.config
    }

    /// Raw field value.
    pub fn get(&self, field: &str) -> Option<&ConfigValue> {
        self.config.get(field)
    }

    /// Whether the field is present, even if blank.
    pub fn has(&self, field: &str) -> bool {
        self.config.contains_key(field)
    }

    /// Looks a field up, failing with `MissingField` when it is absent.
    pub fn require(&self, field: &str) -> SchedResult<&ConfigValue> {
        self.config.get(field).ok_or_else(|| SchedError::MissingField {
            tag: self.tag,
            field: field.to_string(),
        })
    }

    /// Checks that every field the tag requires is present.
    pub fn check_required(&self) -> SchedResult<()> {
        for field in self.tag.required_fields() {
            self.require(field)?;
        }
        Ok(())
    }

    /// Numeric field. Text is accepted when it parses as a number.
    pub fn number(&self, field: &str) -> SchedResult<f64> {
        let value = match self.require(field)? {
            ConfigValue::Number(n) => *n,
            ConfigValue::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| SchedError::invalid(field, format!("'{s}' is not a number")))?,
            other => {
                return Err(SchedError::invalid(
                    field,
                    format!("expected a number, found a {}", other.kind()),
                ))
            }
        };
        if !value.is_finite() {
            return Err(SchedError::invalid(field, "must be finite"));
        }
        Ok(value)
    }

    /// Numeric field that may be absent or left blank.
    pub fn optional_number(&self, field: &str) -> SchedResult<Option<f64>> {
        match self.config.get(field) {
            None => Ok(None),
            Some(ConfigValue::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(_) => self.number(field).map(Some),
        }
    }

    /// Single identifier (source, backend, project...). Must be non-blank text.
    pub fn identifier(&self, field: &str) -> SchedResult<String> {
        match self.require(field)? {
            ConfigValue::Text(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            ConfigValue::Text(_) => Err(SchedError::invalid(field, "must not be blank")),
            other => Err(SchedError::invalid(
                field,
                format!("expected an identifier, found a {}", other.kind()),
            )),
        }
    }

    /// List of identifiers. Comma separated text is accepted.
    pub fn identifiers(&self, field: &str) -> SchedResult<Vec<String>> {
        let ids: Vec<String> = match self.require(field)? {
            ConfigValue::List(items) => items.iter().map(|s| s.trim().to_string()).collect(),
            ConfigValue::Text(s) => s.split(',').map(|s| s.trim().to_string()).collect(),
            ConfigValue::Number(_) => {
                return Err(SchedError::invalid(
                    field,
                    "expected a list of identifiers, found a number",
                ))
            }
        };
        Ok(ids.into_iter().filter(|s| !s.is_empty()).collect())
    }

    /// On/off flag: non-zero numbers, or `true/false`, `yes/no`, `1/0` text.
    pub fn flag(&self, field: &str) -> SchedResult<bool> {
        match self.require(field)? {
            ConfigValue::Number(n) => Ok(*n != 0.0),
            ConfigValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" | "" => Ok(false),
                _ => Err(SchedError::invalid(field, format!("'{s}' is not a flag"))),
            },
            ConfigValue::List(_) => Err(SchedError::invalid(field, "expected a flag, found a list")),
        }
    }

    /// Flag that may be absent or left blank, falling back to `default`.
    pub fn optional_flag(&self, field: &str, default: bool) -> SchedResult<bool> {
        match self.config.get(field) {
            None => Ok(default),
            Some(ConfigValue::Text(s)) if s.trim().is_empty() => Ok(default),
            Some(_) => self.flag(field),
        }
    }

    /// Fills in equipment and recorder lists from the execution context when
    /// the tag needs them and the line does not carry its own.
    pub fn supplemented(&self, ctx: &ExecutionContext) -> Command {
        let mut cmd = self.clone();
        if self.tag.takes(fields::EQUIPMENT_LIST) && !self.has(fields::EQUIPMENT_LIST) {
            cmd.config.insert(
                fields::EQUIPMENT_LIST.to_string(),
                ConfigValue::List(ctx.equipment.clone()),
            );
        }
        if self.tag.takes(fields::RECORDER_TARGETS) && !self.has(fields::RECORDER_TARGETS) {
            cmd.config.insert(
                fields::RECORDER_TARGETS.to_string(),
                ConfigValue::List(ctx.recorder_targets.clone()),
            );
        }
        cmd
    }

    /// One-line human summary, used in status reports.
    pub fn summary(&self) -> String {
        let body: Vec<String> = self
            .config
            .iter()
            .map(|(k, v)| match v {
                ConfigValue::Number(n) => format!("{k}: {n}"),
                ConfigValue::Text(s) => format!("{k}: {s}"),
                ConfigValue::List(items) => format!("{k}: [{}]", items.join(", ")),
            })
            .collect();
        if body.is_empty() {
            self.tag.to_string()
        } else {
            format!("{} -- {}", self.tag, body.join(", "))
        }
    }
}
