#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod activity;
mod bus;
mod clock;
mod config;
mod delivery;
mod errors;
mod events;
mod memory;
mod precondition;
mod repository;
mod scheduler;
/// Database schema definitions.
pub mod schema;
mod storage;
mod virtual_clock;

/// Notifications observable on the activity stream.
pub use self::activity::{Activity, ActivityStream};
/// In-process event bus carrying `CommandScheduled` events.
pub use self::bus::CommandBus;
/// Registry of named logical clocks.
pub use self::clock::ClockRegistry;
/// Scheduler configuration and pluggable clock resolution.
pub use self::config::{ClockLookupKeyResolver, ClockNameResolver, SchedulerConfig};
/// Error type for scheduling and clock operations.
pub use self::errors::ScheduleError;
/// The scheduling event and its command envelope.
pub use self::events::{CLOCK_NAME_KEY, CommandEnvelope, CommandScheduled};
/// The in-memory scheduler variant.
pub use self::memory::MemoryScheduler;
/// Precondition verification at the delivery gate.
pub use self::precondition::{AlwaysSatisfied, PreconditionVerifier};
/// The repository boundary and delivery results.
pub use self::repository::{CommandContext, DeliveryFailure, DeliveryResult, Repository};
/// The durable scheduler and its background-task handle.
pub use self::scheduler::{Scheduler, SchedulerHandle};
/// Store queries and database setup.
pub use self::storage::{
    command_errors, due_commands, load_command, pending_command_count, setup_database,
};
/// The deterministic test clock.
pub use self::virtual_clock::{TimerHandle, VirtualClock, VirtualClockGuard, domain_now};
