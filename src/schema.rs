//! Database schema definitions for SQLx.
//!
//! This module contains the row types for the command scheduler's
//! persistent state: scheduled commands, their failure log, and the
//! named clocks they ride on.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// A single scheduled unit of work, identified by
/// `(aggregate_id, sequence_number)`.
#[derive(Debug, Clone, FromRow)]
pub struct ScheduledCommand {
    /// Aggregate the command targets.
    pub aggregate_id: Uuid,
    /// Index within the aggregate's stream; unique together with
    /// `aggregate_id`.
    pub sequence_number: i64,
    /// Name of the aggregate's event stream.
    pub aggregate_type: String,
    /// Name of the command, used by the repository for dispatch.
    pub command_name: String,
    /// Opaque serialized command payload.
    pub serialized_command: String,
    /// When the command was scheduled.
    pub created_time: DateTime<Utc>,
    /// When the command becomes due. `None` means as soon as possible.
    pub due_time: Option<DateTime<Utc>>,
    /// Set once, when the command is successfully applied.
    pub applied_time: Option<DateTime<Utc>>,
    /// Set once, when the command is permanently abandoned.
    pub final_attempt_time: Option<DateTime<Utc>>,
    /// Number of delivery attempts, including the successful one.
    pub attempts: i64,
    /// Name of the clock the command rides on.
    pub clock_name: String,
    /// True for commands that were elided from the store because they
    /// were already due and declared no durability requirement. Never
    /// persisted.
    #[sqlx(default)]
    pub non_durable: bool,
}

/// Lifecycle state derived from a command's timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Not yet applied or abandoned.
    Pending,
    /// Successfully applied; terminal.
    Applied,
    /// Permanently abandoned after a non-retryable failure; terminal.
    Abandoned,
}

impl ScheduledCommand {
    /// The command's lifecycle state. Exactly one of pending, applied,
    /// and abandoned holds; `applied_time` wins if both timestamps are
    /// somehow present.
    pub fn status(&self) -> CommandStatus {
        if self.applied_time.is_some() {
            CommandStatus::Applied
        } else if self.final_attempt_time.is_some() {
            CommandStatus::Abandoned
        } else {
            CommandStatus::Pending
        }
    }

    /// Whether the command is deliverable at `as_of`. A missing due
    /// time means "as soon as possible".
    pub fn is_due(&self, as_of: DateTime<Utc>) -> bool {
        self.due_time.is_none_or(|due| due <= as_of)
    }
}

/// One row of the append-only failure log.
#[derive(Debug, Clone, FromRow)]
pub struct CommandError {
    /// Row id.
    pub id: i64,
    /// Aggregate of the failed command.
    pub aggregate_id: Uuid,
    /// Sequence number of the failed command.
    pub sequence_number: i64,
    /// Serialized failure description.
    pub error: String,
    /// When the failed attempt was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// A named logical time source.
#[derive(Debug, Clone, FromRow)]
pub struct Clock {
    /// Unique clock name.
    pub name: String,
    /// The clock's current time; only ever moves forward.
    pub utc_now: DateTime<Utc>,
    /// When the clock was created.
    pub start_time: DateTime<Utc>,
}
