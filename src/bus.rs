use tokio::sync::broadcast;

use crate::events::CommandScheduled;

const CHANNEL_CAPACITY: usize = 256;

/// In-process event bus carrying [`CommandScheduled`] events.
///
/// The scheduling front-end subscribes to it, and the precondition gate
/// watches it to re-verify waiting commands whenever new events arrive.
/// Production hosts bridge their real event bus onto one of these.
#[derive(Debug, Clone)]
pub struct CommandBus {
    tx: broadcast::Sender<CommandScheduled>,
}

impl CommandBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: CommandScheduled) {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<CommandScheduled> {
        self.tx.subscribe()
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}
