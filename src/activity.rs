use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

/// One notification on the scheduler's activity stream.
#[derive(Debug, Clone)]
pub enum Activity {
    /// A command was accepted by the scheduling front-end.
    Scheduled {
        /// Aggregate the command targets.
        aggregate_id: Uuid,
        /// Sequence number, after any scheduler assignment.
        sequence_number: i64,
        /// Clock the command was routed to.
        clock_name: String,
        /// When the command becomes due.
        due_time: Option<DateTime<Utc>>,
    },
    /// A delivery succeeded and the command is applied.
    Succeeded {
        /// Aggregate the command targets.
        aggregate_id: Uuid,
        /// Sequence number of the applied command.
        sequence_number: i64,
        /// Domain time at which the command was applied.
        applied_time: DateTime<Utc>,
    },
    /// A delivery failed but will be retried.
    Failed {
        /// Aggregate the command targets.
        aggregate_id: Uuid,
        /// Sequence number of the failed command.
        sequence_number: i64,
        /// Serialized failure description.
        error: String,
        /// When the next attempt becomes due.
        retry_at: DateTime<Utc>,
    },
    /// A delivery failed permanently; the command will not be retried.
    Abandoned {
        /// Aggregate the command targets.
        aggregate_id: Uuid,
        /// Sequence number of the abandoned command.
        sequence_number: i64,
        /// Serialized failure description.
        error: String,
    },
    /// A clock finished advancing and its due commands were drained.
    ClockAdvanced {
        /// Name of the advanced clock.
        clock_name: String,
        /// The clock's new `now`.
        now: DateTime<Utc>,
    },
}

/// Fan-out stream of scheduling and delivery notifications.
///
/// Every subscriber receives every notification published after its
/// subscription, in publication order. Slow subscribers miss the oldest
/// notifications rather than blocking the scheduler.
#[derive(Debug, Clone)]
pub struct ActivityStream {
    tx: broadcast::Sender<Activity>,
}

impl ActivityStream {
    /// Create an empty stream with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to notifications published from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<Activity> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, activity: Activity) {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(activity);
    }
}

impl Default for ActivityStream {
    fn default() -> Self {
        Self::new()
    }
}
