use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::trace;
use uuid::Uuid;

use crate::errors::ScheduleError;
use crate::schema::{CommandError, ScheduledCommand};

/// Create the scheduler's tables by running the embedded migrations.
pub async fn setup_database(pool: &SqlitePool) -> Result<(), ScheduleError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const COMMAND_COLUMNS: &str = "aggregate_id, sequence_number, aggregate_type, command_name, \
     serialized_command, created_time, due_time, applied_time, final_attempt_time, attempts, \
     clock_name";

/// Inserts a scheduled command.
///
/// A negative `sequence_number` is a sentinel meaning
/// "scheduler-assigned": on a unique-key collision the number is
/// decremented and the insert retried until a free slot is found. A
/// collision on a caller-assigned (non-negative) number surfaces as
/// [`ScheduleError::DuplicateSchedule`].
pub(crate) async fn insert_command(
    pool: &SqlitePool,
    command: &mut ScheduledCommand,
) -> Result<(), ScheduleError> {
    loop {
        let result = sqlx::query(
            r"
            INSERT INTO scheduled_commands
                (aggregate_id, sequence_number, aggregate_type, command_name,
                 serialized_command, created_time, due_time, attempts, clock_name)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(command.aggregate_id)
        .bind(command.sequence_number)
        .bind(&command.aggregate_type)
        .bind(&command.command_name)
        .bind(&command.serialized_command)
        .bind(command.created_time)
        .bind(command.due_time)
        .bind(command.attempts)
        .bind(&command.clock_name)
        .execute(pool)
        .await;

        match result {
            Ok(_) => return Ok(()),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                if command.sequence_number < 0 {
                    trace!(
                        command.aggregate = %command.aggregate_id,
                        command.sequence = command.sequence_number,
                        "Scheduler-assigned sequence number collided, decrementing"
                    );
                    command.sequence_number -= 1;
                } else {
                    return Err(ScheduleError::DuplicateSchedule {
                        aggregate_id: command.aggregate_id,
                        sequence_number: command.sequence_number,
                    });
                }
            }
            Err(error) => return Err(error.into()),
        }
    }
}

/// Load a single scheduled command by its identity.
pub async fn load_command(
    pool: &SqlitePool,
    aggregate_id: Uuid,
    sequence_number: i64,
) -> Result<Option<ScheduledCommand>, ScheduleError> {
    let command = sqlx::query_as::<_, ScheduledCommand>(&format!(
        "SELECT {COMMAND_COLUMNS} FROM scheduled_commands \
         WHERE aggregate_id = $1 AND sequence_number = $2",
    ))
    .bind(aggregate_id)
    .bind(sequence_number)
    .fetch_optional(pool)
    .await?;

    Ok(command)
}

/// Every pending command on `clock_name` whose due time is at or before
/// `as_of`, ordered by due time ascending with sequence number as the
/// tie-break. Commands without a due time sort first.
pub async fn due_commands(
    pool: &SqlitePool,
    clock_name: &str,
    as_of: DateTime<Utc>,
) -> Result<Vec<ScheduledCommand>, ScheduleError> {
    let commands = sqlx::query_as::<_, ScheduledCommand>(&format!(
        "SELECT {COMMAND_COLUMNS} FROM scheduled_commands \
         WHERE clock_name = $1 \
           AND applied_time IS NULL \
           AND final_attempt_time IS NULL \
           AND (due_time IS NULL OR due_time <= $2) \
         ORDER BY due_time ASC, sequence_number ASC",
    ))
    .bind(clock_name)
    .bind(as_of)
    .fetch_all(pool)
    .await?;

    Ok(commands)
}

/// Counts one delivery attempt. Called for every attempt, including the
/// successful one.
pub(crate) async fn increment_attempts(
    tx: &mut Transaction<'_, Sqlite>,
    aggregate_id: Uuid,
    sequence_number: i64,
) -> Result<(), ScheduleError> {
    sqlx::query(
        "UPDATE scheduled_commands SET attempts = attempts + 1 \
         WHERE aggregate_id = $1 AND sequence_number = $2",
    )
    .bind(aggregate_id)
    .bind(sequence_number)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Marks a command as successfully applied. A no-op on rows that are
/// already terminal, so a racing duplicate attempt cannot overwrite the
/// recorded outcome.
pub(crate) async fn mark_applied(
    tx: &mut Transaction<'_, Sqlite>,
    aggregate_id: Uuid,
    sequence_number: i64,
    at: DateTime<Utc>,
) -> Result<(), ScheduleError> {
    sqlx::query(
        "UPDATE scheduled_commands SET applied_time = $3 \
         WHERE aggregate_id = $1 AND sequence_number = $2 \
           AND applied_time IS NULL AND final_attempt_time IS NULL",
    )
    .bind(aggregate_id)
    .bind(sequence_number)
    .bind(at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Marks a command as permanently abandoned. A no-op on rows that are
/// already terminal.
pub(crate) async fn mark_abandoned(
    tx: &mut Transaction<'_, Sqlite>,
    aggregate_id: Uuid,
    sequence_number: i64,
    at: DateTime<Utc>,
) -> Result<(), ScheduleError> {
    sqlx::query(
        "UPDATE scheduled_commands SET final_attempt_time = $3 \
         WHERE aggregate_id = $1 AND sequence_number = $2 \
           AND applied_time IS NULL AND final_attempt_time IS NULL",
    )
    .bind(aggregate_id)
    .bind(sequence_number)
    .bind(at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Pushes a pending command's due time forward after a retryable
/// failure. The command stays on its clock.
pub(crate) async fn reschedule(
    tx: &mut Transaction<'_, Sqlite>,
    aggregate_id: Uuid,
    sequence_number: i64,
    due_time: DateTime<Utc>,
) -> Result<(), ScheduleError> {
    sqlx::query(
        "UPDATE scheduled_commands SET due_time = $3 \
         WHERE aggregate_id = $1 AND sequence_number = $2 \
           AND applied_time IS NULL AND final_attempt_time IS NULL",
    )
    .bind(aggregate_id)
    .bind(sequence_number)
    .bind(due_time)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Appends a failed attempt to the error log.
pub(crate) async fn record_error(
    tx: &mut Transaction<'_, Sqlite>,
    aggregate_id: Uuid,
    sequence_number: i64,
    error: &str,
    at: DateTime<Utc>,
) -> Result<(), ScheduleError> {
    sqlx::query(
        "INSERT INTO command_errors (aggregate_id, sequence_number, error, recorded_at) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(aggregate_id)
    .bind(sequence_number)
    .bind(error)
    .bind(at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// The failure log for one command, oldest first.
pub async fn command_errors(
    pool: &SqlitePool,
    aggregate_id: Uuid,
    sequence_number: i64,
) -> Result<Vec<CommandError>, ScheduleError> {
    let errors = sqlx::query_as::<_, CommandError>(
        "SELECT id, aggregate_id, sequence_number, error, recorded_at FROM command_errors \
         WHERE aggregate_id = $1 AND sequence_number = $2 \
         ORDER BY id ASC",
    )
    .bind(aggregate_id)
    .bind(sequence_number)
    .fetch_all(pool)
    .await?;

    Ok(errors)
}

/// The number of commands that are neither applied nor abandoned.
pub async fn pending_command_count(pool: &SqlitePool) -> Result<i64, ScheduleError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM scheduled_commands \
         WHERE applied_time IS NULL AND final_attempt_time IS NULL",
    )
    .fetch_one(pool)
    .await?;

    Ok(count)
}
