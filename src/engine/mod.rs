//! Schedule execution and feasibility planning.
//!
//! - [`operations`]: one variant per schedule tag, built through a lookup table
//! - [`runner`]: runs a single step in a worker task while polling for stops
//! - [`run_engine`]: the [`ScheduleEngine`] state machine and reservation envelope
//! - [`plans`]: the side-effect-free [`PlanBuilder`]
//! - [`cancel`]: one-shot stop requests

pub mod astro;
pub mod cancel;
pub mod operations;
pub mod plans;
pub mod reservation;
pub mod run_engine;
pub mod runner;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use operations::{Operation, OperationSettings};
pub use plans::{
    ObservationPlanEntry, Plan, PlanBuilder, PlanNote, PlanOrigin, PlanSettings, PlanStatus,
    SourceTable,
};
pub use reservation::ReservationToken;
pub use run_engine::{
    EngineSettings, EngineState, Envelope, ExecutionOutcome, ExecutionReport, ScheduleEngine,
};
pub use runner::{StepOutcome, StepRunner};
