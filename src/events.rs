use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata key that pins an event to a named clock.
pub const CLOCK_NAME_KEY: &str = "ClockName";

/// The command half of a [`CommandScheduled`] event.
///
/// The scheduler never interprets the payload; it only carries the
/// command name for dispatch and the durability requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Name of the command, used by the repository for dispatch.
    pub command_name: String,
    /// Whether the command must survive a process restart.
    ///
    /// Commands that are already due when scheduled and do not require
    /// durability are delivered without ever touching the store.
    #[serde(default = "default_durable")]
    pub requires_durable_scheduling: bool,
    /// Opaque command payload.
    #[serde(default)]
    pub payload: Value,
}

fn default_durable() -> bool {
    true
}

impl CommandEnvelope {
    /// Create an envelope for a durable command with an empty payload.
    pub fn new(command_name: impl Into<String>) -> Self {
        Self {
            command_name: command_name.into(),
            requires_durable_scheduling: true,
            payload: Value::Null,
        }
    }

    /// Attach a payload to the envelope.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Mark the command as not requiring durable scheduling.
    pub fn non_durable(mut self) -> Self {
        self.requires_durable_scheduling = false;
        self
    }
}

/// A domain event requesting that a command be applied to an aggregate,
/// now or at a future instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandScheduled {
    /// Aggregate the command targets.
    pub aggregate_id: Uuid,
    /// Index within the aggregate's stream. Negative values are a
    /// sentinel meaning "scheduler-assigned"; the store allocates the
    /// next free slot by decrementing.
    pub sequence_number: i64,
    /// Name of the aggregate's event stream.
    pub aggregate_type: String,
    /// The command to deliver.
    pub command: CommandEnvelope,
    /// When the command becomes due. `None` means as soon as possible.
    pub due_time: Option<DateTime<Utc>>,
    /// Extensible metadata. The key [`CLOCK_NAME_KEY`] routes the event
    /// to a named clock.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Opaque concurrency tag carried through from the event stream.
    pub etag: Option<String>,
}

impl CommandScheduled {
    /// Create an event with no due time and empty metadata.
    pub fn new(
        aggregate_id: Uuid,
        sequence_number: i64,
        aggregate_type: impl Into<String>,
        command: CommandEnvelope,
    ) -> Self {
        Self {
            aggregate_id,
            sequence_number,
            aggregate_type: aggregate_type.into(),
            command,
            due_time: None,
            metadata: HashMap::new(),
            etag: None,
        }
    }

    /// Set the due time.
    pub fn due_at(mut self, due_time: DateTime<Utc>) -> Self {
        self.due_time = Some(due_time);
        self
    }

    /// Route the event to a named clock via metadata.
    pub fn on_clock(mut self, clock_name: impl Into<String>) -> Self {
        self.metadata
            .insert(CLOCK_NAME_KEY.to_owned(), clock_name.into());
        self
    }

    pub(crate) fn clock_name_hint(&self) -> Option<&str> {
        self.metadata.get(CLOCK_NAME_KEY).map(String::as_str)
    }
}
