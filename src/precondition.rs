use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bus::CommandBus;
use crate::schema::ScheduledCommand;

/// Answers whether a command's prerequisite event is durably observable
/// right now.
#[async_trait]
pub trait PreconditionVerifier: Send + Sync {
    /// Whether `command` is eligible for delivery.
    async fn verify(&self, command: &ScheduledCommand) -> bool;
}

/// Verifier for commands without preconditions; always eligible.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSatisfied;

#[async_trait]
impl PreconditionVerifier for AlwaysSatisfied {
    async fn verify(&self, _command: &ScheduledCommand) -> bool {
        true
    }
}

/// Wait until `command`'s precondition is observable, re-verifying on
/// every bus event, for at most `timeout`.
///
/// Returns true if the precondition turned satisfied and false on
/// timeout; either way the caller delivers the command.
pub(crate) async fn await_precondition(
    verifier: &dyn PreconditionVerifier,
    bus: &CommandBus,
    command: &ScheduledCommand,
    timeout: Duration,
) -> bool {
    if verifier.verify(command).await {
        return true;
    }

    let deadline = Instant::now() + timeout;
    let mut events = bus.subscribe();
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {
                if verifier.verify(command).await {
                    trace!(
                        command.aggregate = %command.aggregate_id,
                        command.sequence = command.sequence_number,
                        "Precondition satisfied"
                    );
                    return true;
                }
            }
            Ok(Err(RecvError::Closed)) => {
                // No more events can satisfy the precondition; wait out
                // the remaining timeout.
                tokio::time::sleep_until(deadline).await;
                break;
            }
            Err(_) => break,
        }
    }

    debug!(
        command.aggregate = %command.aggregate_id,
        command.sequence = command.sequence_number,
        "Precondition timeout elapsed, delivering anyway"
    );
    false
}
