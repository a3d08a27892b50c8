//! Schedule model: commands, their configuration, and persistence.

pub mod command;
pub mod context;
pub mod file;
pub mod targets;

pub use command::{fields, Command, ConfigValue, OperationTag};
pub use context::ExecutionContext;
pub use targets::{map_to_recorder_targets, recorder_targets_to_map};

use serde::{Deserialize, Serialize};

/// Ordered list of commands. Order is execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    commands: Vec<Command>,
}

impl Schedule {
    /// Empty schedule.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule running `commands` in the given order.
    pub fn from_commands(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    /// Appends a line at the end.
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Lines in execution order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Number of lines.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when there is nothing to run.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Iterates lines in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    /// Every command with context-provided fields filled in.
    pub fn supplemented(&self, ctx: &ExecutionContext) -> Vec<Command> {
        self.commands.iter().map(|c| c.supplemented(ctx)).collect()
    }
}
