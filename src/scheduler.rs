use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rand::Rng;
use sqlx::SqlitePool;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, instrument, trace, warn};

use crate::activity::{Activity, ActivityStream};
use crate::bus::CommandBus;
use crate::clock::ClockRegistry;
use crate::config::SchedulerConfig;
use crate::delivery::{self, DeliveryDeps};
use crate::errors::ScheduleError;
use crate::events::CommandScheduled;
use crate::precondition::{self, AlwaysSatisfied, PreconditionVerifier};
use crate::repository::Repository;
use crate::schema::{CommandStatus, ScheduledCommand};
use crate::storage;

/// The durable command scheduler.
///
/// Accepts [`CommandScheduled`] events, persists the commands they
/// carry, and delivers each one through the repository when its clock
/// reaches its due time. Cloning is cheap; clones share the same store,
/// bus, and activity stream.
#[derive(Clone)]
pub struct Scheduler {
    pool: SqlitePool,
    bus: CommandBus,
    repository: Arc<dyn Repository>,
    preconditions: Arc<dyn PreconditionVerifier>,
    activity: ActivityStream,
    config: Arc<SchedulerConfig>,
    clocks: ClockRegistry,
    advance_locks: Arc<StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler over `pool`, subscribed to `bus`, with no
    /// preconditions and the default configuration.
    pub fn new(pool: SqlitePool, bus: CommandBus, repository: Arc<dyn Repository>) -> Self {
        let config = Arc::new(SchedulerConfig::default());
        Self {
            clocks: ClockRegistry::new(pool.clone(), config.clone()),
            pool,
            bus,
            repository,
            preconditions: Arc::new(AlwaysSatisfied),
            activity: ActivityStream::new(),
            config,
            advance_locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Replace the precondition verifier.
    pub fn with_preconditions(mut self, preconditions: Arc<dyn PreconditionVerifier>) -> Self {
        self.preconditions = preconditions;
        self
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = Arc::new(config);
        self.clocks = ClockRegistry::new(self.pool.clone(), self.config.clone());
        self
    }

    /// The scheduler's activity stream.
    pub fn activity(&self) -> &ActivityStream {
        &self.activity
    }

    /// The clock registry backing this scheduler.
    pub fn clocks(&self) -> &ClockRegistry {
        &self.clocks
    }

    /// The bus this scheduler consumes events from.
    pub fn bus(&self) -> &CommandBus {
        &self.bus
    }

    fn delivery_deps(&self) -> DeliveryDeps {
        DeliveryDeps {
            pool: self.pool.clone(),
            repository: self.repository.clone(),
            preconditions: self.preconditions.clone(),
            activity: self.activity.clone(),
        }
    }

    /// Schedule one command.
    ///
    /// Resolves the command's clock (creating it on demand), persists
    /// the command unless it is elided, and delivers it immediately
    /// when it is already due. Returns the command with any
    /// scheduler-assigned sequence number filled in.
    #[instrument(
        name = "scheduler.schedule",
        skip(self, event),
        fields(command = %event.command.command_name, aggregate = %event.aggregate_id)
    )]
    pub async fn schedule(&self, event: CommandScheduled) -> Result<ScheduledCommand, ScheduleError> {
        let clock_name = self.clocks.resolve(&event).await?;
        let clock = self.clocks.get_or_create(&clock_name).await?;

        let mut command = ScheduledCommand {
            aggregate_id: event.aggregate_id,
            sequence_number: event.sequence_number,
            aggregate_type: event.aggregate_type,
            command_name: event.command.command_name,
            serialized_command: serde_json::to_string(&event.command.payload)?,
            created_time: clock.utc_now,
            due_time: event.due_time,
            applied_time: None,
            final_attempt_time: None,
            attempts: 0,
            clock_name: clock_name.clone(),
            non_durable: false,
        };

        let due_now = command.is_due(clock.utc_now);
        // A command that is deliverable right now and declares no
        // durability requirement never touches the store.
        let durable = event.command.requires_durable_scheduling || !due_now;
        if durable {
            storage::insert_command(&self.pool, &mut command).await?;
        } else {
            command.non_durable = true;
            debug!("Eliding non-durable command from the store");
        }

        self.activity.publish(Activity::Scheduled {
            aggregate_id: command.aggregate_id,
            sequence_number: command.sequence_number,
            clock_name,
            due_time: command.due_time,
        });

        if due_now {
            self.deliver_due(command.clone(), durable).await?;
        }

        Ok(command)
    }

    /// Deliver a due command, gating on its precondition. A satisfied
    /// precondition delivers inline; an unsatisfied one arms a waiter
    /// that re-verifies on bus traffic and fires on timeout.
    async fn deliver_due(&self, command: ScheduledCommand, durable: bool) -> Result<(), ScheduleError> {
        if self.preconditions.verify(&command).await {
            delivery::deliver(&self.delivery_deps(), &command, durable).await?;
            return Ok(());
        }

        let scheduler = self.clone();
        let timeout = self.config.precondition_timeout;
        tokio::spawn(async move {
            precondition::await_precondition(
                scheduler.preconditions.as_ref(),
                &scheduler.bus,
                &command,
                timeout,
            )
            .await;
            if let Err(error) = scheduler.deliver_after_wait(command, durable).await {
                error!(%error, "Failed to deliver command after precondition wait");
            }
        });
        Ok(())
    }

    async fn deliver_after_wait(
        &self,
        command: ScheduledCommand,
        durable: bool,
    ) -> Result<(), ScheduleError> {
        if !durable {
            delivery::deliver(&self.delivery_deps(), &command, false).await?;
            return Ok(());
        }

        // Reload: the command may have reached a terminal state while
        // the waiter was armed.
        let current =
            storage::load_command(&self.pool, command.aggregate_id, command.sequence_number)
                .await?;
        if let Some(current) = current {
            if current.status() == CommandStatus::Pending {
                delivery::deliver(&self.delivery_deps(), &current, true).await?;
            }
        }
        Ok(())
    }

    /// Move the named clock forward to `target` and deliver every
    /// command that becomes due, creating the clock on demand.
    ///
    /// Advancements to the same clock are serialized; advancements to
    /// different clocks proceed in parallel. Resolves only when every
    /// dispatched delivery has completed, so on return no command on
    /// this clock is both pending and due.
    pub async fn advance_clock(
        &self,
        name: &str,
        target: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let lock = self.advance_lock(name);
        let _guard = lock.lock_owned().await;

        self.clocks.get_or_create(name).await?;
        let clock = self.clocks.advance(name, target).await?;
        self.drain_due(name, clock.utc_now).await?;

        self.activity.publish(Activity::ClockAdvanced {
            clock_name: name.to_owned(),
            now: clock.utc_now,
        });
        Ok(clock.utc_now)
    }

    /// Move the named clock forward by `duration`. See
    /// [`advance_clock`](Scheduler::advance_clock).
    pub async fn advance_clock_by(
        &self,
        name: &str,
        duration: chrono::Duration,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let clock = self.clocks.get_or_create(name).await?;
        self.advance_clock(name, clock.utc_now + duration).await
    }

    fn advance_lock(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .advance_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(name.to_owned()).or_default().clone()
    }

    /// Deliver every pending command on `name` due at or before
    /// `as_of`, repeating until the due query drains. A retryable
    /// failure may re-date a command back into the window, in which
    /// case it is picked up again on the next pass.
    async fn drain_due(&self, name: &str, as_of: DateTime<Utc>) -> Result<usize, ScheduleError> {
        let deps = self.delivery_deps();
        let mut delivered = 0;
        loop {
            let due = storage::due_commands(&self.pool, name, as_of).await?;
            if due.is_empty() {
                break;
            }
            // Commands sharing a due time may be delivered
            // concurrently; across due times the order is strict.
            for batch in due.chunk_by(|a, b| a.due_time == b.due_time) {
                let results = join_all(
                    batch
                        .iter()
                        .map(|command| delivery::deliver(&deps, command, true)),
                )
                .await;
                for result in results {
                    result?;
                    delivered += 1;
                }
            }
        }
        Ok(delivered)
    }

    /// Redeliver every command that was pending and due when the
    /// process went down. Call once on startup, after
    /// [`setup_database`](crate::setup_database).
    pub async fn recover(&self) -> Result<usize, ScheduleError> {
        let mut delivered = 0;
        for clock in self.clocks.all().await? {
            let lock = self.advance_lock(&clock.name);
            let _guard = lock.lock_owned().await;
            delivered += self.drain_due(&clock.name, clock.utc_now).await?;
        }
        if delivered > 0 {
            info!(delivered, "Recovered pending commands");
        }
        Ok(delivered)
    }

    /// Start the background workers: a bus consumer feeding
    /// [`schedule`](Scheduler::schedule) and a wall-clock pump that
    /// keeps the default clock tracking `Utc::now()`.
    pub fn start(&self) -> SchedulerHandle {
        let mut handles = Vec::new();

        // Drain the subscription into an unbounded queue so deliveries
        // that publish further events never re-enter `schedule` on
        // their own call stack, and a slow delivery cannot lag the bus.
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel();
        let mut subscription = self.bus.subscribe();
        let consumer = async move {
            loop {
                match subscription.recv().await {
                    Ok(event) => {
                        if queue_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Command bus subscription lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };
        handles.push(tokio::spawn(
            consumer.instrument(info_span!("scheduler-bus-consumer")),
        ));

        let scheduler = self.clone();
        let dispatcher = async move {
            while let Some(event) = queue_rx.recv().await {
                if let Err(error) = scheduler.schedule(event).await {
                    error!(%error, "Failed to schedule command from bus");
                }
            }
        };
        handles.push(tokio::spawn(
            dispatcher.instrument(info_span!("scheduler-dispatcher")),
        ));

        let scheduler = self.clone();
        let pump = async move { scheduler.pump().await };
        handles.push(tokio::spawn(pump.instrument(info_span!("scheduler-pump"))));

        SchedulerHandle { handles }
    }

    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.config.jitter.is_zero() {
            return self.config.poll_interval;
        }

        let jitter_millis = u64::try_from(self.config.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.config.poll_interval + Duration::from_millis(random_jitter)
    }

    async fn pump(&self) {
        loop {
            sleep(self.sleep_duration_with_jitter()).await;
            match self
                .advance_clock(&self.config.default_clock_name, Utc::now())
                .await
            {
                Ok(_) => {}
                Err(ScheduleError::ClockMovedBackward { .. }) => {
                    // The default clock has been advanced beyond the
                    // wall clock; leave it alone.
                    trace!("Default clock is ahead of wall time, skipping pump tick");
                }
                Err(error) => error!(%error, "Wall-clock pump failed"),
            }
        }
    }
}

/// Handle to a running scheduler's background tasks.
#[derive(Debug)]
pub struct SchedulerHandle {
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop the background tasks.
    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }

    /// Wait for the background tasks to finish.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                if !error.is_cancelled() {
                    warn!(%error, "Scheduler background task panicked");
                }
            }
        });
    }
}
