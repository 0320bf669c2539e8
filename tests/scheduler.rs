#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use claims::{assert_none, assert_ok, assert_some};
use insta::assert_compact_json_snapshot;
use sqlx::SqlitePool;
use uuid::Uuid;

use scheduler::{
    Activity, CommandBus, CommandContext, CommandEnvelope, CommandScheduled, DeliveryFailure,
    DeliveryResult, PreconditionVerifier, Repository, ScheduleError, Scheduler, SchedulerConfig,
    command_errors, due_commands, load_command, pending_command_count, setup_database,
};

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Create an in-memory database for testing. A single connection
    /// keeps the database alive for the lifetime of the pool.
    pub(super) async fn create_pool() -> anyhow::Result<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        setup_database(&pool).await?;
        Ok(pool)
    }

    pub(super) fn create_scheduler(pool: &SqlitePool, repository: Arc<StubRepository>) -> Scheduler {
        Scheduler::new(pool.clone(), CommandBus::new(), repository)
    }

    /// A repository stub that replays scripted results, defaulting to
    /// success once the script runs out.
    #[derive(Default)]
    pub(super) struct StubRepository {
        results: Mutex<VecDeque<DeliveryResult>>,
        applied: Mutex<Vec<(i64, DateTime<Utc>)>>,
        calls: AtomicUsize,
    }

    impl StubRepository {
        pub(super) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(super) fn push_result(&self, result: DeliveryResult) {
            self.results.lock().unwrap().push_back(result);
        }

        pub(super) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// `(sequence_number, effective_time)` of successful applications,
        /// in delivery order.
        pub(super) fn applied(&self) -> Vec<(i64, DateTime<Utc>)> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Repository for StubRepository {
        async fn apply_scheduled_command(
            &self,
            ctx: &CommandContext,
            _preconditions: &dyn PreconditionVerifier,
        ) -> anyhow::Result<DeliveryResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self
                .results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(DeliveryResult::Succeeded);
            if result.succeeded() {
                self.applied
                    .lock()
                    .unwrap()
                    .push((ctx.command().sequence_number, ctx.now()));
            }
            Ok(result)
        }
    }

    /// A verifier gated on a shared flag.
    #[derive(Default)]
    pub(super) struct GatedVerifier {
        pub(super) satisfied: AtomicBool,
    }

    #[async_trait]
    impl PreconditionVerifier for GatedVerifier {
        async fn verify(&self, _command: &scheduler::schema::ScheduledCommand) -> bool {
            self.satisfied.load(Ordering::SeqCst)
        }
    }

    /// Wait for the first activity matching `matcher`, skipping others.
    pub(super) async fn await_activity(
        activity: &mut tokio::sync::broadcast::Receiver<Activity>,
        matcher: impl Fn(&Activity) -> bool,
    ) -> Activity {
        tokio::time::timeout(StdDuration::from_secs(5), async {
            loop {
                let notification = activity.recv().await.expect("activity stream closed");
                if matcher(&notification) {
                    return notification;
                }
            }
        })
        .await
        .expect("timed out waiting for activity")
    }
}

use test_utils::{GatedVerifier, StubRepository, await_activity, create_pool, create_scheduler};

fn order_event(aggregate_id: Uuid, sequence_number: i64) -> CommandScheduled {
    CommandScheduled::new(
        aggregate_id,
        sequence_number,
        "order",
        CommandEnvelope::new("deactivate"),
    )
}

fn far_future(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, hour, 0, 0).unwrap()
}

#[tokio::test]
async fn due_commands_are_applied_immediately() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    let scheduler = create_scheduler(&pool, repository.clone());
    let mut activity = scheduler.activity().subscribe();
    let aggregate_id = Uuid::new_v4();

    let command = scheduler.schedule(order_event(aggregate_id, 1)).await?;
    assert_eq!(command.sequence_number, 1);
    assert_eq!(repository.calls(), 1);

    let row = assert_some!(load_command(&pool, aggregate_id, 1).await?);
    assert_some!(row.applied_time);
    assert_none!(row.final_attempt_time);
    assert_eq!(row.attempts, 1);
    assert!(command_errors(&pool, aggregate_id, 1).await?.is_empty());

    let scheduled = activity.recv().await?;
    assert!(matches!(scheduled, Activity::Scheduled { sequence_number: 1, .. }));
    let succeeded = activity.recv().await?;
    assert!(matches!(succeeded, Activity::Succeeded { sequence_number: 1, .. }));

    Ok(())
}

#[tokio::test]
async fn future_commands_wait_for_their_clock() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    let scheduler = create_scheduler(&pool, repository.clone());
    let aggregate_id = Uuid::new_v4();
    let due = far_future(0);

    scheduler
        .schedule(order_event(aggregate_id, 1).due_at(due))
        .await?;

    assert_eq!(repository.calls(), 0);
    assert!(due_commands(&pool, "default", Utc::now()).await?.is_empty());
    assert_eq!(due_commands(&pool, "default", due).await?.len(), 1);

    scheduler.advance_clock("default", due).await?;

    assert_eq!(repository.calls(), 1);
    let row = assert_some!(load_command(&pool, aggregate_id, 1).await?);
    assert_eq!(row.applied_time, Some(due));
    assert_eq!(row.attempts, 1);

    // The aggregate observed the command's due time as "now".
    assert_eq!(repository.applied(), vec![(1, due)]);

    Ok(())
}

#[tokio::test]
async fn retryable_failures_reschedule_on_the_same_clock() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    repository.push_result(DeliveryResult::Failed(DeliveryFailure::retryable(
        "stream unavailable",
        Duration::seconds(30),
    )));
    let scheduler = create_scheduler(&pool, repository.clone());
    let aggregate_id = Uuid::new_v4();
    let due = far_future(12);

    scheduler
        .schedule(order_event(aggregate_id, 2).due_at(due))
        .await?;
    scheduler.advance_clock("default", due).await?;

    let row = assert_some!(load_command(&pool, aggregate_id, 2).await?);
    assert_none!(row.applied_time);
    assert_none!(row.final_attempt_time);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.due_time, Some(due + Duration::seconds(30)));
    assert_eq!(row.clock_name, "default");

    let errors = command_errors(&pool, aggregate_id, 2).await?;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].error.contains("stream unavailable"));

    // The next advancement past the new due time redelivers.
    scheduler
        .advance_clock("default", due + Duration::minutes(1))
        .await?;

    let row = assert_some!(load_command(&pool, aggregate_id, 2).await?);
    assert_eq!(row.applied_time, Some(due + Duration::seconds(30)));
    assert_eq!(row.attempts, 2);
    assert_eq!(command_errors(&pool, aggregate_id, 2).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn canceled_commands_are_abandoned() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    repository.push_result(DeliveryResult::Failed(DeliveryFailure::canceled(
        "order was canceled",
    )));
    let scheduler = create_scheduler(&pool, repository.clone());
    let aggregate_id = Uuid::new_v4();
    let due = far_future(6);

    scheduler
        .schedule(order_event(aggregate_id, 3).due_at(due))
        .await?;
    scheduler.advance_clock("default", due).await?;

    let row = assert_some!(load_command(&pool, aggregate_id, 3).await?);
    assert_eq!(row.final_attempt_time, Some(due));
    assert_none!(row.applied_time);
    assert_eq!(row.attempts, 1);
    assert_eq!(command_errors(&pool, aggregate_id, 3).await?.len(), 1);

    // Abandoned commands are never redelivered.
    scheduler
        .advance_clock("default", due + Duration::hours(1))
        .await?;
    assert_eq!(repository.calls(), 1);

    Ok(())
}

#[tokio::test]
async fn failures_without_retry_after_are_abandoned() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    repository.push_result(DeliveryResult::Failed(DeliveryFailure::permanent(
        "aggregate rejected the command",
    )));
    let scheduler = create_scheduler(&pool, repository.clone());
    let aggregate_id = Uuid::new_v4();

    scheduler.schedule(order_event(aggregate_id, 1)).await?;

    let row = assert_some!(load_command(&pool, aggregate_id, 1).await?);
    assert_some!(row.final_attempt_time);
    assert_none!(row.applied_time);
    assert_eq!(pending_command_count(&pool).await?, 0);

    Ok(())
}

#[tokio::test]
async fn scheduler_assigned_sequence_numbers_decrement_on_collision() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    let scheduler = create_scheduler(&pool, repository.clone());
    let aggregate_id = Uuid::new_v4();
    let due = far_future(0);

    let first = scheduler
        .schedule(order_event(aggregate_id, -1).due_at(due))
        .await?;
    let second = scheduler
        .schedule(order_event(aggregate_id, -1).due_at(due))
        .await?;

    assert_eq!(first.sequence_number, -1);
    assert_eq!(second.sequence_number, -2);

    // Equal due times are tie-broken by sequence number ascending.
    let due_rows = due_commands(&pool, "default", due).await?;
    let rows: Vec<_> = due_rows
        .iter()
        .map(|command| (command.command_name.as_str(), command.sequence_number))
        .collect();
    assert_compact_json_snapshot!(rows, @r#"[["deactivate", -2], ["deactivate", -1]]"#);

    Ok(())
}

#[tokio::test]
async fn caller_assigned_duplicates_are_rejected() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    let scheduler = create_scheduler(&pool, repository.clone());
    let aggregate_id = Uuid::new_v4();
    let due = far_future(0);

    assert_ok!(
        scheduler
            .schedule(order_event(aggregate_id, 7).due_at(due))
            .await
    );
    let error = scheduler
        .schedule(order_event(aggregate_id, 7).due_at(due))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        ScheduleError::DuplicateSchedule { sequence_number: 7, .. }
    ));

    Ok(())
}

#[tokio::test]
async fn due_non_durable_commands_skip_the_store() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    let scheduler = create_scheduler(&pool, repository.clone());
    let aggregate_id = Uuid::new_v4();

    let event = CommandScheduled::new(
        aggregate_id,
        1,
        "order",
        CommandEnvelope::new("deactivate").non_durable(),
    );
    let command = scheduler.schedule(event).await?;

    assert!(command.non_durable);
    assert_eq!(repository.calls(), 1);
    assert_none!(load_command(&pool, aggregate_id, 1).await?);
    assert_eq!(pending_command_count(&pool).await?, 0);

    Ok(())
}

#[tokio::test]
async fn deliveries_follow_due_time_order() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    let scheduler = create_scheduler(&pool, repository.clone());
    let aggregate_id = Uuid::new_v4();

    scheduler
        .schedule(order_event(aggregate_id, 1).due_at(far_future(12)))
        .await?;
    scheduler
        .schedule(order_event(aggregate_id, 2).due_at(far_future(11)))
        .await?;
    scheduler
        .schedule(order_event(aggregate_id, 3).due_at(far_future(10)))
        .await?;

    scheduler.advance_clock("default", far_future(13)).await?;

    let order: Vec<i64> = repository
        .applied()
        .into_iter()
        .map(|(sequence, _)| sequence)
        .collect();
    assert_eq!(order, vec![3, 2, 1]);

    Ok(())
}

#[tokio::test]
async fn pending_commands_survive_a_restart() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let aggregate_id = Uuid::new_v4();
    let due = far_future(0);

    {
        let repository = StubRepository::new();
        let scheduler = create_scheduler(&pool, repository.clone());
        scheduler
            .schedule(order_event(aggregate_id, 1).due_at(due))
            .await?;
        assert_eq!(repository.calls(), 0);
    }

    // A fresh scheduler over the same store picks the command up.
    let repository = StubRepository::new();
    let restarted = create_scheduler(&pool, repository.clone());
    restarted.advance_clock("default", due).await?;

    let row = assert_some!(load_command(&pool, aggregate_id, 1).await?);
    assert_eq!(row.applied_time, Some(due));
    assert_eq!(repository.calls(), 1);

    Ok(())
}

#[tokio::test]
async fn recover_redelivers_commands_left_due() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let aggregate_id = Uuid::new_v4();
    let due = far_future(0);

    {
        let repository = StubRepository::new();
        let scheduler = create_scheduler(&pool, repository.clone());
        scheduler
            .schedule(order_event(aggregate_id, 1).due_at(due))
            .await?;
    }

    // Simulate a crash after the clock advanced but before the due
    // command was delivered.
    sqlx::query("UPDATE clocks SET utc_now = $1 WHERE name = 'default'")
        .bind(due + Duration::hours(1))
        .execute(&pool)
        .await?;

    let repository = StubRepository::new();
    let restarted = create_scheduler(&pool, repository.clone());
    let recovered = restarted.recover().await?;

    assert_eq!(recovered, 1);
    let row = assert_some!(load_command(&pool, aggregate_id, 1).await?);
    assert_eq!(row.applied_time, Some(due));

    Ok(())
}

#[tokio::test]
async fn clocks_never_move_backward() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    let scheduler = create_scheduler(&pool, repository.clone());

    scheduler.advance_clock("default", far_future(12)).await?;
    let error = scheduler
        .advance_clock("default", far_future(0))
        .await
        .unwrap_err();

    assert!(matches!(error, ScheduleError::ClockMovedBackward { .. }));

    Ok(())
}

#[tokio::test]
async fn clocks_advance_independently() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    let scheduler = create_scheduler(&pool, repository.clone());
    let aggregate_id = Uuid::new_v4();
    let due = far_future(0);

    scheduler
        .schedule(order_event(aggregate_id, 1).due_at(due).on_clock("tenant-a"))
        .await?;
    scheduler
        .schedule(order_event(aggregate_id, 2).due_at(due))
        .await?;

    scheduler.advance_clock("tenant-a", due).await?;

    let first = assert_some!(load_command(&pool, aggregate_id, 1).await?);
    assert_eq!(first.clock_name, "tenant-a");
    assert_some!(first.applied_time);

    // The default clock has not moved; its command is still pending.
    let second = assert_some!(load_command(&pool, aggregate_id, 2).await?);
    assert_none!(second.applied_time);
    assert_eq!(repository.calls(), 1);

    Ok(())
}

#[tokio::test]
async fn clock_resolution_prefers_metadata_over_mappings() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    let config = SchedulerConfig::default().clock_lookup_key_resolver(Arc::new(
        |event: &CommandScheduled| event.metadata.get("tenant").cloned(),
    ));
    let scheduler = create_scheduler(&pool, repository.clone()).with_config(config);
    let aggregate_id = Uuid::new_v4();
    let due = far_future(0);

    scheduler.clocks().associate("tenant-42", "tenant-clock").await?;

    // Lookup key routes through the mapping…
    let mut event = order_event(aggregate_id, 1).due_at(due);
    event.metadata.insert("tenant".to_owned(), "tenant-42".to_owned());
    let mapped = scheduler.schedule(event).await?;
    assert_eq!(mapped.clock_name, "tenant-clock");

    // …but an explicit ClockName attribute wins…
    let mut event = order_event(aggregate_id, 2).due_at(due).on_clock("explicit");
    event.metadata.insert("tenant".to_owned(), "tenant-42".to_owned());
    let explicit = scheduler.schedule(event).await?;
    assert_eq!(explicit.clock_name, "explicit");

    // …and an unmatched event falls back to the default clock.
    let fallback = scheduler
        .schedule(order_event(aggregate_id, 3).due_at(due))
        .await?;
    assert_eq!(fallback.clock_name, "default");

    Ok(())
}

#[tokio::test]
async fn unsatisfied_preconditions_deliver_after_the_timeout() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    let verifier = Arc::new(GatedVerifier::default());
    let config = SchedulerConfig::default().precondition_timeout(StdDuration::from_millis(100));
    let scheduler = create_scheduler(&pool, repository.clone())
        .with_preconditions(verifier)
        .with_config(config);
    let mut activity = scheduler.activity().subscribe();
    let aggregate_id = Uuid::new_v4();

    scheduler.schedule(order_event(aggregate_id, 4)).await?;
    assert_eq!(repository.calls(), 0);

    await_activity(&mut activity, |notification| {
        matches!(notification, Activity::Succeeded { sequence_number: 4, .. })
    })
    .await;

    assert_eq!(repository.calls(), 1);
    let row = assert_some!(load_command(&pool, aggregate_id, 4).await?);
    assert_some!(row.applied_time);

    Ok(())
}

#[tokio::test]
async fn preconditions_are_reverified_on_bus_events() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    let verifier = Arc::new(GatedVerifier::default());
    let bus = CommandBus::new();
    let scheduler = Scheduler::new(pool.clone(), bus.clone(), repository.clone())
        .with_preconditions(verifier.clone());
    let mut activity = scheduler.activity().subscribe();
    let aggregate_id = Uuid::new_v4();

    scheduler.schedule(order_event(aggregate_id, 1)).await?;
    assert_eq!(repository.calls(), 0);

    // The prerequisite event lands on the bus; the waiter re-verifies
    // and delivers well before the 10s timeout.
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    verifier.satisfied.store(true, Ordering::SeqCst);
    bus.publish(order_event(Uuid::new_v4(), 99).due_at(far_future(0)));

    await_activity(&mut activity, |notification| {
        matches!(notification, Activity::Succeeded { sequence_number: 1, .. })
    })
    .await;

    let row = assert_some!(load_command(&pool, aggregate_id, 1).await?);
    assert_some!(row.applied_time);

    Ok(())
}

#[tokio::test]
async fn started_schedulers_consume_bus_events() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    let bus = CommandBus::new();
    let scheduler = Scheduler::new(pool.clone(), bus.clone(), repository.clone());
    let mut activity = scheduler.activity().subscribe();
    let aggregate_id = Uuid::new_v4();

    let handle = scheduler.start();
    bus.publish(order_event(aggregate_id, 1));

    await_activity(&mut activity, |notification| {
        matches!(notification, Activity::Succeeded { sequence_number: 1, .. })
    })
    .await;

    let row = assert_some!(load_command(&pool, aggregate_id, 1).await?);
    assert_some!(row.applied_time);

    handle.shutdown();
    handle.wait_for_shutdown().await;

    Ok(())
}

#[tokio::test]
async fn the_pump_delivers_wall_clock_due_commands() -> anyhow::Result<()> {
    let pool = create_pool().await?;
    let repository = StubRepository::new();
    let config = SchedulerConfig::default()
        .poll_interval(StdDuration::from_millis(20))
        .jitter(StdDuration::ZERO);
    let scheduler =
        Scheduler::new(pool.clone(), CommandBus::new(), repository.clone()).with_config(config);
    let mut activity = scheduler.activity().subscribe();
    let aggregate_id = Uuid::new_v4();

    let due = Utc::now() + Duration::milliseconds(150);
    scheduler
        .schedule(order_event(aggregate_id, 1).due_at(due))
        .await?;
    assert_eq!(repository.calls(), 0);

    let handle = scheduler.start();

    await_activity(&mut activity, |notification| {
        matches!(notification, Activity::Succeeded { sequence_number: 1, .. })
    })
    .await;
    assert_eq!(repository.calls(), 1);

    handle.shutdown();
    handle.wait_for_shutdown().await;

    Ok(())
}
