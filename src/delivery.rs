use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use sqlx::SqlitePool;
use tracing::{Instrument, debug, info_span, warn};

use crate::activity::{Activity, ActivityStream};
use crate::errors::ScheduleError;
use crate::precondition::PreconditionVerifier;
use crate::repository::{CommandContext, DeliveryFailure, DeliveryResult, Repository};
use crate::schema::ScheduledCommand;
use crate::storage;
use crate::virtual_clock::domain_now;

/// Everything a delivery needs besides the command itself.
pub(crate) struct DeliveryDeps {
    pub(crate) pool: SqlitePool,
    pub(crate) repository: Arc<dyn Repository>,
    pub(crate) preconditions: Arc<dyn PreconditionVerifier>,
    pub(crate) activity: ActivityStream,
}

/// What the state machine decided to do with a delivery result.
pub(crate) enum Disposition {
    Applied,
    Rescheduled {
        due_time: DateTime<Utc>,
        error: String,
    },
    Abandoned {
        error: String,
    },
}

/// The retry/abandonment state machine. `now` is the effective domain
/// time of the attempt; a retryable failure re-dates the command to
/// `now + retry_after` on the same clock.
pub(crate) fn disposition(result: &DeliveryResult, now: DateTime<Utc>) -> Disposition {
    match result {
        DeliveryResult::Succeeded => Disposition::Applied,
        DeliveryResult::Failed(failure) => match failure.retry_after {
            Some(retry_after) if !failure.canceled => Disposition::Rescheduled {
                due_time: now + retry_after,
                error: failure.error.clone(),
            },
            _ => Disposition::Abandoned {
                error: failure.error.clone(),
            },
        },
    }
}

/// Invoke the repository for one attempt, capturing panics as permanent
/// failures so a broken command handler cannot take the worker down.
/// `fallback_now` becomes the effective time for commands without a due
/// time.
pub(crate) async fn apply_via_repository(
    repository: &dyn Repository,
    preconditions: &dyn PreconditionVerifier,
    command: &ScheduledCommand,
    fallback_now: DateTime<Utc>,
) -> (CommandContext, DeliveryResult) {
    let ctx = CommandContext::new(command.clone(), fallback_now);

    let attempt = AssertUnwindSafe(repository.apply_scheduled_command(&ctx, preconditions))
        .catch_unwind()
        .await;

    let result = match attempt {
        Ok(Ok(result)) => result,
        Ok(Err(error)) => DeliveryResult::Failed(DeliveryFailure {
            canceled: false,
            previous_attempts: command.attempts,
            retry_after: None,
            error: format!("{error:#}"),
        }),
        Err(panic) => DeliveryResult::Failed(DeliveryFailure {
            canceled: false,
            previous_attempts: command.attempts,
            retry_after: None,
            error: panic_message(panic.as_ref()),
        }),
    };

    (ctx, result)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "command application panicked".to_owned()
    }
}

/// Deliver one command through the repository and record the outcome.
///
/// The aggregate observes the command's due time as "now" via the
/// command context. When `durable` is false the command was elided from
/// the store and no outcome is recorded. Application failures drive the
/// state machine and are returned as data; only store failures
/// propagate as errors.
pub(crate) async fn deliver(
    deps: &DeliveryDeps,
    command: &ScheduledCommand,
    durable: bool,
) -> Result<DeliveryResult, ScheduleError> {
    let span = info_span!(
        "deliver",
        command.aggregate = %command.aggregate_id,
        command.sequence = command.sequence_number,
        command.name = %command.command_name,
    );

    async move {
        debug!("Delivering command…");

        let (ctx, result) = apply_via_repository(
            deps.repository.as_ref(),
            deps.preconditions.as_ref(),
            command,
            domain_now(),
        )
        .await;
        let now = ctx.now();
        let disposition = disposition(&result, now);

        match &disposition {
            Disposition::Applied => {
                deps.activity.publish(Activity::Succeeded {
                    aggregate_id: command.aggregate_id,
                    sequence_number: command.sequence_number,
                    applied_time: now,
                });
            }
            Disposition::Rescheduled { due_time, error } => {
                warn!(%error, retry_at = %due_time, "Command delivery failed, will retry");
                deps.activity.publish(Activity::Failed {
                    aggregate_id: command.aggregate_id,
                    sequence_number: command.sequence_number,
                    error: error.clone(),
                    retry_at: *due_time,
                });
            }
            Disposition::Abandoned { error } => {
                warn!(%error, "Command delivery failed permanently, abandoning");
                deps.activity.publish(Activity::Abandoned {
                    aggregate_id: command.aggregate_id,
                    sequence_number: command.sequence_number,
                    error: error.clone(),
                });
            }
        }

        if durable {
            let mut tx = deps.pool.begin().await?;
            storage::increment_attempts(&mut tx, command.aggregate_id, command.sequence_number)
                .await?;
            match &disposition {
                Disposition::Applied => {
                    storage::mark_applied(&mut tx, command.aggregate_id, command.sequence_number, now)
                        .await?;
                }
                Disposition::Rescheduled { due_time, error } => {
                    storage::reschedule(
                        &mut tx,
                        command.aggregate_id,
                        command.sequence_number,
                        *due_time,
                    )
                    .await?;
                    storage::record_error(
                        &mut tx,
                        command.aggregate_id,
                        command.sequence_number,
                        error,
                        now,
                    )
                    .await?;
                }
                Disposition::Abandoned { error } => {
                    storage::mark_abandoned(
                        &mut tx,
                        command.aggregate_id,
                        command.sequence_number,
                        now,
                    )
                    .await?;
                    storage::record_error(
                        &mut tx,
                        command.aggregate_id,
                        command.sequence_number,
                        error,
                        now,
                    )
                    .await?;
                }
            }
            tx.commit().await?;
        }

        Ok(result)
    }
    .instrument(span)
    .await
}
