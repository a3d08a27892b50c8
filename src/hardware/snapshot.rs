//! Remaining-plan snapshot publishers.
//!
//! Downstream observation-planning tools read the upcoming blocks from a JSON
//! file. The file is replaced atomically (write to a sibling, then rename) so
//! readers never see a half-written list.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::PlanPublisher;
use crate::engine::plans::ObservationPlanEntry;
use crate::error::SchedResult;

/// One block as written to the snapshot file.
#[derive(Debug, Serialize)]
struct SnapshotRecord<'a> {
    src_id: &'a str,
    src_ra_j2000_deg: f64,
    src_dec_j2000_deg: f64,
    src_start_utc: String,
    src_end_utc: String,
}

impl<'a> From<&'a ObservationPlanEntry> for SnapshotRecord<'a> {
    fn from(entry: &'a ObservationPlanEntry) -> Self {
        Self {
            src_id: &entry.source_id,
            src_ra_j2000_deg: entry.right_ascension * 360.0 / 24.0,
            src_dec_j2000_deg: entry.declination,
            src_start_utc: entry.start_time.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            src_end_utc: entry.end_time.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        }
    }
}

/// Writes snapshots to a JSON file. Empty plans leave the file untouched.
pub struct JsonSnapshotPublisher {
    path: PathBuf,
}

impl JsonSnapshotPublisher {
    /// Publisher writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File the snapshots go to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PlanPublisher for JsonSnapshotPublisher {
    fn publish_snapshot(&self, entries: &[ObservationPlanEntry]) -> SchedResult<()> {
        if entries.is_empty() {
            debug!(path = %self.path.display(), "Empty plan, snapshot not written");
            return Ok(());
        }
        let records: Vec<SnapshotRecord<'_>> = entries.iter().map(SnapshotRecord::from).collect();
        let text = serde_json::to_string_pretty(&records)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        info!(path = %self.path.display(), blocks = records.len(), "Published plan snapshot");
        Ok(())
    }
}

/// Publisher used when no snapshot path is configured.
#[derive(Debug, Default)]
pub struct DiscardSnapshots;

impl PlanPublisher for DiscardSnapshots {
    fn publish_snapshot(&self, entries: &[ObservationPlanEntry]) -> SchedResult<()> {
        debug!(blocks = entries.len(), "Plan snapshot discarded");
        Ok(())
    }
}
