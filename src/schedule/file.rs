//! Schedule persistence.
//!
//! Schedules are stored as pretty-printed JSON:
//!
//! ```text
//! {
//!   "commands": [
//!     { "tag": "set_frequency_tuning", "config": { "tuning_a": 3000.0, ... } },
//!     { "tag": "track_and_observe", "config": { "source_name": "casa", ... } }
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::Schedule;
use crate::error::SchedResult;

impl Schedule {
    /// Pretty-printed JSON, the on-disk format.
    pub fn to_json(&self) -> SchedResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses the on-disk format.
    pub fn from_json(text: &str) -> SchedResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Writes a schedule file.
pub fn save(schedule: &Schedule, path: &Path) -> SchedResult<()> {
    let text = schedule.to_json()?;
    fs::write(path, text)?;
    info!(path = %path.display(), commands = schedule.len(), "Saved schedule");
    Ok(())
}

/// Reads a schedule file.
pub fn load(path: &Path) -> SchedResult<Schedule> {
    let text = fs::read_to_string(path)?;
    let schedule = Schedule::from_json(&text)?;
    debug!(path = %path.display(), commands = schedule.len(), "Loaded schedule");
    Ok(schedule)
}
