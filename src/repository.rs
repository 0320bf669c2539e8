use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::precondition::PreconditionVerifier;
use crate::schema::ScheduledCommand;

/// Per-delivery context handed to the repository.
///
/// The context pins the domain time observed during command application
/// to the command's due time, so an aggregate handling a command that
/// was due at noon sees noon as "now" even when the delivery happens
/// later.
#[derive(Debug, Clone)]
pub struct CommandContext {
    command: ScheduledCommand,
    effective_time: DateTime<Utc>,
}

impl CommandContext {
    pub(crate) fn new(command: ScheduledCommand, fallback_now: DateTime<Utc>) -> Self {
        let effective_time = command.due_time.unwrap_or(fallback_now);
        Self {
            command,
            effective_time,
        }
    }

    /// The command being delivered.
    pub fn command(&self) -> &ScheduledCommand {
        &self.command
    }

    /// The effective domain time for this delivery: the command's due
    /// time when it has one, the domain time at the start of the
    /// attempt otherwise.
    pub fn now(&self) -> DateTime<Utc> {
        self.effective_time
    }
}

/// Outcome of one delivery attempt, reported by the repository.
#[derive(Debug, Clone)]
pub enum DeliveryResult {
    /// The command was applied and its events persisted.
    Succeeded,
    /// The command was not applied.
    Failed(DeliveryFailure),
}

impl DeliveryResult {
    /// Whether the attempt succeeded.
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Details of a failed delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    /// The command was canceled mid-flight; always abandons.
    pub canceled: bool,
    /// How many attempts preceded this one, as observed by the
    /// repository.
    pub previous_attempts: i64,
    /// How long to wait before the next attempt. `None` means the
    /// failure is permanent and the command is abandoned, not "retry
    /// immediately".
    pub retry_after: Option<Duration>,
    /// Serialized failure description, appended to the error log.
    pub error: String,
}

impl DeliveryFailure {
    /// A failure that should be retried after `retry_after`.
    pub fn retryable(error: impl std::fmt::Display, retry_after: Duration) -> Self {
        Self {
            canceled: false,
            previous_attempts: 0,
            retry_after: Some(retry_after),
            error: error.to_string(),
        }
    }

    /// A permanent failure; the command is abandoned.
    pub fn permanent(error: impl std::fmt::Display) -> Self {
        Self {
            canceled: false,
            previous_attempts: 0,
            retry_after: None,
            error: error.to_string(),
        }
    }

    /// A cancellation; the command is abandoned regardless of
    /// `retry_after`.
    pub fn canceled(error: impl std::fmt::Display) -> Self {
        Self {
            canceled: true,
            previous_attempts: 0,
            retry_after: None,
            error: error.to_string(),
        }
    }

    /// Whether this failure abandons the command.
    pub fn is_permanent(&self) -> bool {
        self.canceled || self.retry_after.is_none()
    }
}

/// The event-sourced repository that loads an aggregate, applies a
/// command, and persists the resulting events.
///
/// Application-level failures are reported as
/// [`DeliveryResult::Failed`]; an `Err` from this method is treated as
/// a permanent failure of the attempt. Either way the scheduler's
/// retry/abandonment state machine takes over; nothing is re-thrown
/// out of the delivery engine.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Apply one scheduled command to its aggregate.
    async fn apply_scheduled_command(
        &self,
        ctx: &CommandContext,
        preconditions: &dyn PreconditionVerifier,
    ) -> anyhow::Result<DeliveryResult>;
}
