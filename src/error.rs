//! Custom error types for the scheduler.
//!
//! This module defines the primary error type, `SchedError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized way to describe every
//! failure an execution attempt can end with, from schedule validation through
//! hardware faults to configuration problems.
//!
//! ## Error Hierarchy
//!
//! - **`MissingField` / `InvalidField` / `InvalidSchedule`**: validation failures.
//!   These are raised while operations are constructed, before any reservation
//!   or hardware call.
//! - **`UnknownBackend` / `UnknownPostprocessor`**: catalog lookups that failed
//!   while a backend step was running. They abort the remaining schedule.
//! - **`Hardware`**: a collaborator call (equipment or recorder) failed.
//! - **`Reservation`**: the equipment could not be reserved, usually because it
//!   is already held elsewhere.
//! - **`NoOperator` / `PlanRejected` / `Busy`**: the attempt was refused before
//!   it started.
//! - **`StepPanicked`**: a step worker panicked; the panic is captured and
//!   surfaced here instead of tearing down the orchestrator.
//! - **`Io` / `Json` / `Config` / `Configuration`**: ambient failures loading
//!   schedules, catalogs, and settings.
//!
//! Cancellation is deliberately absent: an operator abort is a normal outcome
//! reported through `ExecutionOutcome`, not an error.

use crate::schedule::OperationTag;
use thiserror::Error;

/// Convenience alias for results using the scheduler error type.
pub type SchedResult<T> = std::result::Result<T, SchedError>;

/// Every way scheduling can fail.
#[derive(Error, Debug)]
pub enum SchedError {
    /// A required field is absent.
    #[error("Missing field '{field}' for {tag}")]
    MissingField {
        /// Line kind that needs the field.
        tag: OperationTag,
        /// Absent field name.
        field: String,
    },

    /// A field is present but unusable.
    #[error("Invalid value for field '{field}': {reason}")]
    InvalidField {
        /// Offending field name.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The schedule as a whole is malformed.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Backend name not in the catalog.
    #[error("Unknown backend '{0}'")]
    UnknownBackend(String),

    /// Postprocessor name not in the catalog.
    #[error("Unknown postprocessor '{0}'")]
    UnknownPostprocessor(String),

    /// Equipment or recorder call failed.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Equipment could not be reserved or released.
    #[error("Reservation error: {0}")]
    Reservation(String),

    /// Execution requires an operator in charge.
    #[error("No operator registered for this execution")]
    NoOperator,

    /// The pre-flight plan has errors.
    #[error("Pre-flight check rejected the schedule: {0}")]
    PlanRejected(String),

    /// Another schedule is executing on the same engine.
    #[error("Engine is already executing a schedule")]
    Busy,

    /// A step worker panicked.
    #[error("Step worker panicked: {0}")]
    StepPanicked(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Settings could not be loaded.
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Settings loaded but are out of range.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl From<figment::Error> for SchedError {
    fn from(err: figment::Error) -> Self {
        SchedError::Config(Box::new(err))
    }
}

impl SchedError {
    /// Shorthand for an `InvalidField` error.
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        SchedError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors raised before any side effect of an execution attempt.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedError::MissingField { .. }
                | SchedError::InvalidField { .. }
                | SchedError::InvalidSchedule(_)
                | SchedError::NoOperator
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedError::MissingField {
            tag: OperationTag::SetBackend,
            field: "backend_name".into(),
        };
        assert_eq!(
            err.to_string(),
            "Missing field 'backend_name' for set_backend"
        );
    }

    #[test]
    fn test_validation_classification() {
        assert!(SchedError::invalid("seconds", "negative").is_validation());
        assert!(SchedError::NoOperator.is_validation());
        assert!(!SchedError::Hardware("feed timeout".into()).is_validation());
        assert!(!SchedError::UnknownPostprocessor("none".into()).is_validation());
    }
}
