//! Core library for the observing scheduler.
//!
//! This library contains the schedule model, the execution engine that runs a
//! schedule against shared observing equipment, and the feasibility planner
//! used to check a schedule before anything moves. It is used by the
//! `obs-scheduler` command-line tool and by the integration tests.
//!
//! - [`schedule`]: commands, execution context, persistence
//! - [`engine`]: operation variants, step runner, schedule engine, planner
//! - [`hardware`]: collaborator traits, catalog, snapshot publishing, mocks
//! - [`config`] / [`logging`]: settings and tracing setup

pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod schedule;
