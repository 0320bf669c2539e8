use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::activity::{Activity, ActivityStream};
use crate::bus::CommandBus;
use crate::config::SchedulerConfig;
use crate::delivery::{self, Disposition};
use crate::errors::ScheduleError;
use crate::events::CommandScheduled;
use crate::precondition::{self, AlwaysSatisfied, PreconditionVerifier};
use crate::repository::Repository;
use crate::schema::{CommandError, CommandStatus, ScheduledCommand};
use crate::virtual_clock::VirtualClock;

const IN_MEMORY_PRECONDITION_TIMEOUT: Duration = Duration::from_secs(3);

struct MemoryState {
    commands: HashMap<(Uuid, i64), ScheduledCommand>,
    errors: Vec<CommandError>,
    next_error_id: i64,
    mappings: HashMap<String, String>,
}

/// In-memory scheduler variant, driven by a [`VirtualClock`].
///
/// Shares the durable scheduler's contract (clock resolution, elision,
/// the precondition gate, and the retry/abandonment state machine) but
/// keeps its commands in process memory and delivers them as the
/// virtual clock advances. It is the primary vehicle for tests that
/// need deterministic time.
#[derive(Clone)]
pub struct MemoryScheduler {
    clock: VirtualClock,
    bus: CommandBus,
    repository: Arc<dyn Repository>,
    preconditions: Arc<dyn PreconditionVerifier>,
    activity: ActivityStream,
    config: Arc<SchedulerConfig>,
    state: Arc<Mutex<MemoryState>>,
}

impl std::fmt::Debug for MemoryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryScheduler")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish()
    }
}

impl MemoryScheduler {
    /// Create a scheduler reading time from `clock`, with no
    /// preconditions and the in-memory defaults (3s precondition
    /// timeout).
    pub fn new(clock: VirtualClock, repository: Arc<dyn Repository>) -> Self {
        let config =
            SchedulerConfig::default().precondition_timeout(IN_MEMORY_PRECONDITION_TIMEOUT);
        Self {
            clock,
            bus: CommandBus::new(),
            repository,
            preconditions: Arc::new(AlwaysSatisfied),
            activity: ActivityStream::new(),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(MemoryState {
                commands: HashMap::new(),
                errors: Vec::new(),
                next_error_id: 0,
                mappings: HashMap::new(),
            })),
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
        self
    }

    /// Replace the bus watched by the precondition gate.
    pub fn with_bus(mut self, bus: CommandBus) -> Self {
        self.bus = bus;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The virtual clock driving this scheduler.
    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    /// The scheduler's activity stream.
    pub fn activity(&self) -> &ActivityStream {
        &self.activity
    }

    /// The bus watched by the precondition gate.
    pub fn bus(&self) -> &CommandBus {
        &self.bus
    }

    /// Associate an opaque lookup key with a clock name, mirroring the
    /// durable registry's mappings.
    pub fn associate(&self, value: impl Into<String>, clock_name: impl Into<String>) {
        self.state().mappings.insert(value.into(), clock_name.into());
    }

    fn resolve(&self, event: &CommandScheduled) -> String {
        if let Some(name) = event.clock_name_hint() {
            return name.to_owned();
        }
        if let Some(resolver) = &self.config.clock_name_resolver {
            if let Some(name) = resolver(event) {
                return name;
            }
        }
        if let Some(resolver) = &self.config.clock_lookup_key_resolver {
            if let Some(key) = resolver(event) {
                if let Some(name) = self.state().mappings.get(&key) {
                    return name.clone();
                }
            }
        }
        self.config.default_clock_name.clone()
    }

    /// Schedule one command. Due commands deliver before this returns
    /// (unless gated on a precondition); future commands deliver when
    /// the virtual clock reaches their due time.
    #[instrument(
        name = "memory_scheduler.schedule",
        skip(self, event),
        fields(command = %event.command.command_name, aggregate = %event.aggregate_id)
    )]
    pub async fn schedule(&self, event: CommandScheduled) -> Result<ScheduledCommand, ScheduleError> {
        let clock_name = self.resolve(&event);
        let now = self.clock.now();

        let mut command = ScheduledCommand {
            aggregate_id: event.aggregate_id,
            sequence_number: event.sequence_number,
            aggregate_type: event.aggregate_type,
            command_name: event.command.command_name,
            serialized_command: serde_json::to_string(&event.command.payload)?,
            created_time: now,
            due_time: event.due_time,
            applied_time: None,
            final_attempt_time: None,
            attempts: 0,
            clock_name: clock_name.clone(),
            non_durable: false,
        };

        let due_now = command.is_due(now);
        let durable = event.command.requires_durable_scheduling || !due_now;
        if durable {
            self.insert(&mut command)?;
        } else {
            command.non_durable = true;
            debug!("Eliding non-durable command");
        }

        self.activity.publish(Activity::Scheduled {
            aggregate_id: command.aggregate_id,
            sequence_number: command.sequence_number,
            clock_name,
            due_time: command.due_time,
        });

        if due_now {
            self.deliver_due(command.clone(), durable).await;
        } else if let Some(due) = command.due_time {
            self.register_timer(command.aggregate_id, command.sequence_number, due);
        }

        Ok(command)
    }

    fn insert(&self, command: &mut ScheduledCommand) -> Result<(), ScheduleError> {
        let mut state = self.state();
        loop {
            let key = (command.aggregate_id, command.sequence_number);
            if state.commands.contains_key(&key) {
                if command.sequence_number < 0 {
                    command.sequence_number -= 1;
                    continue;
                }
                return Err(ScheduleError::DuplicateSchedule {
                    aggregate_id: command.aggregate_id,
                    sequence_number: command.sequence_number,
                });
            }
            state.commands.insert(key, command.clone());
            return Ok(());
        }
    }

    fn register_timer(&self, aggregate_id: Uuid, sequence_number: i64, due: DateTime<Utc>) {
        let scheduler = self.clone();
        self.clock.schedule(due, async move {
            scheduler.deliver_stored(aggregate_id, sequence_number).await;
        });
    }

    async fn deliver_due(&self, command: ScheduledCommand, durable: bool) {
        if self.preconditions.verify(&command).await {
            self.deliver_now(command, durable).await;
            return;
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
            if durable {
                scheduler
                    .deliver_stored(command.aggregate_id, command.sequence_number)
                    .await;
            } else {
                scheduler.deliver_now(command, false).await;
            }
        });
    }

    /// Deliver a stored command if it is still pending and due. Timer
    /// actions land here; a command that reached a terminal state while
    /// its timer was pending is skipped.
    async fn deliver_stored(&self, aggregate_id: Uuid, sequence_number: i64) {
        let command = {
            let state = self.state();
            state.commands.get(&(aggregate_id, sequence_number)).cloned()
        };
        let Some(command) = command else { return };
        if command.status() != CommandStatus::Pending || !command.is_due(self.clock.now()) {
            return;
        }
        self.deliver_now(command, true).await;
    }

    async fn deliver_now(&self, command: ScheduledCommand, durable: bool) {
        let (ctx, result) = delivery::apply_via_repository(
            self.repository.as_ref(),
            self.preconditions.as_ref(),
            &command,
            self.clock.now(),
        )
        .await;
        let now = ctx.now();
        let disposition = delivery::disposition(&result, now);

        match &disposition {
            Disposition::Applied => {
                self.activity.publish(Activity::Succeeded {
                    aggregate_id: command.aggregate_id,
                    sequence_number: command.sequence_number,
                    applied_time: now,
                });
            }
            Disposition::Rescheduled { due_time, error } => {
                warn!(%error, retry_at = %due_time, "Command delivery failed, will retry");
                self.activity.publish(Activity::Failed {
                    aggregate_id: command.aggregate_id,
                    sequence_number: command.sequence_number,
                    error: error.clone(),
                    retry_at: *due_time,
                });
            }
            Disposition::Abandoned { error } => {
                warn!(%error, "Command delivery failed permanently, abandoning");
                self.activity.publish(Activity::Abandoned {
                    aggregate_id: command.aggregate_id,
                    sequence_number: command.sequence_number,
                    error: error.clone(),
                });
            }
        }

        if !durable {
            return;
        }

        let mut retry_at = None;
        {
            let mut guard = self.state();
            let state = &mut *guard;
            let Some(entry) = state
                .commands
                .get_mut(&(command.aggregate_id, command.sequence_number))
            else {
                return;
            };
            entry.attempts += 1;
            match &disposition {
                Disposition::Applied => entry.applied_time = Some(now),
                Disposition::Rescheduled { due_time, error } => {
                    entry.due_time = Some(*due_time);
                    retry_at = Some(*due_time);
                    state.next_error_id += 1;
                    state.errors.push(CommandError {
                        id: state.next_error_id,
                        aggregate_id: command.aggregate_id,
                        sequence_number: command.sequence_number,
                        error: error.clone(),
                        recorded_at: now,
                    });
                }
                Disposition::Abandoned { error } => {
                    entry.final_attempt_time = Some(now);
                    state.next_error_id += 1;
                    state.errors.push(CommandError {
                        id: state.next_error_id,
                        aggregate_id: command.aggregate_id,
                        sequence_number: command.sequence_number,
                        error: error.clone(),
                        recorded_at: now,
                    });
                }
            }
        }

        if let Some(due) = retry_at {
            self.register_timer(command.aggregate_id, command.sequence_number, due);
        }
    }

    /// Move the virtual clock forward to `target`. On return every
    /// command due at or before `target` has been fully delivered:
    /// applied, rescheduled into the future, or abandoned.
    pub async fn advance_to(&self, target: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let now = self.clock.advance_to(target).await?;
        self.activity.publish(Activity::ClockAdvanced {
            clock_name: self.config.default_clock_name.clone(),
            now,
        });
        Ok(now)
    }

    /// Move the virtual clock forward by `duration`. See
    /// [`advance_to`](MemoryScheduler::advance_to).
    pub async fn advance_by(&self, duration: chrono::Duration) -> Result<DateTime<Utc>, ScheduleError> {
        let target = self.clock.now() + duration;
        self.advance_to(target).await
    }

    /// Completes once no command is both pending and due.
    pub async fn done(&self) {
        self.clock.done().await;
    }

    /// Look up a stored command.
    pub fn command(&self, aggregate_id: Uuid, sequence_number: i64) -> Option<ScheduledCommand> {
        self.state()
            .commands
            .get(&(aggregate_id, sequence_number))
            .cloned()
    }

    /// The failure log for one command, oldest first.
    pub fn command_errors(&self, aggregate_id: Uuid, sequence_number: i64) -> Vec<CommandError> {
        self.state()
            .errors
            .iter()
            .filter(|error| {
                error.aggregate_id == aggregate_id && error.sequence_number == sequence_number
            })
            .cloned()
            .collect()
    }

    /// The number of stored commands that are neither applied nor
    /// abandoned.
    pub fn pending_command_count(&self) -> usize {
        self.state()
            .commands
            .values()
            .filter(|command| command.status() == CommandStatus::Pending)
            .count()
    }
}
