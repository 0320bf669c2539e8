//! Deferred delivery example for the scheduler library.
//!
//! This example schedules a command against the in-memory scheduler,
//! drives its virtual clock forward, and shows the retry state machine
//! in action, no database required. Run it with:
//!
//! ```bash
//! cargo run --example deferred
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use scheduler::{
    Activity, CommandContext, CommandEnvelope, CommandScheduled, DeliveryFailure, DeliveryResult,
    MemoryScheduler, PreconditionVerifier, Repository, VirtualClock,
};
use uuid::Uuid;

/// A repository that fails its first attempt and succeeds afterwards.
struct FlakyRepository {
    calls: AtomicUsize,
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn apply_scheduled_command(
        &self,
        ctx: &CommandContext,
        _preconditions: &dyn PreconditionVerifier,
    ) -> Result<DeliveryResult> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        println!(
            "applying `{}` (attempt {attempt}), aggregate sees now = {}",
            ctx.command().command_name,
            ctx.now()
        );

        if attempt == 1 {
            return Ok(DeliveryResult::Failed(DeliveryFailure::retryable(
                "event stream busy",
                Duration::seconds(30),
            )));
        }
        Ok(DeliveryResult::Succeeded)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let clock = VirtualClock::new(start);
    let repository = Arc::new(FlakyRepository {
        calls: AtomicUsize::new(0),
    });
    let scheduler = MemoryScheduler::new(clock, repository);

    let mut activity = scheduler.activity().subscribe();
    tokio::spawn(async move {
        while let Ok(notification) = activity.recv().await {
            match notification {
                Activity::Scheduled { sequence_number, clock_name, .. } => {
                    println!("scheduled #{sequence_number} on clock `{clock_name}`");
                }
                Activity::Failed { retry_at, error, .. } => {
                    println!("failed ({error}), retrying at {retry_at}");
                }
                Activity::Succeeded { applied_time, .. } => {
                    println!("succeeded at {applied_time}");
                }
                Activity::Abandoned { error, .. } => println!("abandoned ({error})"),
                Activity::ClockAdvanced { now, .. } => println!("clock is now {now}"),
            }
        }
    });

    // Ship the order five minutes from "now".
    let aggregate_id = Uuid::new_v4();
    let event = CommandScheduled::new(aggregate_id, 1, "order", CommandEnvelope::new("ship"))
        .due_at(start + Duration::minutes(5));
    scheduler.schedule(event).await?;

    println!("nothing is due yet; advancing the clock by ten minutes…");
    scheduler.advance_by(Duration::minutes(10)).await?;

    // Quiescence: by the time advance_by returns, the failed first
    // attempt has been retried and the command applied.
    if let Some(command) = scheduler.command(aggregate_id, 1) {
        println!(
            "final state: attempts = {}, applied at {:?}",
            command.attempts, command.applied_time
        );
    }

    Ok(())
}
