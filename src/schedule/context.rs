//! Per-attempt execution context.

use serde::{Deserialize, Serialize};

/// Identity and equipment selection shared by every step of one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Operator in charge. Execution is refused when blank.
    pub operator: String,
    /// Equipment identifiers selected for this attempt.
    pub equipment: Vec<String>,
    /// Recorder targets in `node.instance` notation.
    pub recorder_targets: Vec<String>,
}

impl ExecutionContext {
    /// Context for `operator`, with no equipment selected.
    pub fn new(operator: &str) -> Self {
        Self {
            operator: operator.trim().to_string(),
            ..Self::default()
        }
    }

    /// Replaces the equipment selection.
    pub fn with_equipment<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.equipment = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the recorder targets.
    pub fn with_recorder_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recorder_targets = targets.into_iter().map(Into::into).collect();
        self
    }

    /// False when the operator is blank.
    pub fn has_operator(&self) -> bool {
        !self.operator.trim().is_empty()
    }
}
