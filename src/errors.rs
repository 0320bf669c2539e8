use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Error type for scheduling and clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// A command with the same caller-assigned identity is already scheduled.
    #[error("command ({aggregate_id}, {sequence_number}) is already scheduled")]
    DuplicateSchedule {
        /// Aggregate the duplicate command targets.
        aggregate_id: Uuid,
        /// Caller-assigned sequence number that collided.
        sequence_number: i64,
    },

    /// An advancement target lies before the clock's current `now`.
    #[error("clock `{clock}` cannot move backward from {current} to {target}")]
    ClockMovedBackward {
        /// Name of the clock that rejected the advancement.
        clock: String,
        /// The clock's current time.
        current: DateTime<Utc>,
        /// The rejected target time.
        target: DateTime<Utc>,
    },

    /// A virtual clock is already installed as the process-wide current clock.
    #[error("a virtual clock is already installed; dispose it before installing another")]
    ClockInstalled,

    /// The named clock does not exist.
    #[error("no clock named `{0}`")]
    UnknownClock(String),

    /// Command payload could not be serialized.
    #[error("failed to serialize command data")]
    Serialization(#[from] serde_json::Error),

    /// The underlying store failed.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Schema migrations could not be applied.
    #[error("failed to run database migrations")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}
