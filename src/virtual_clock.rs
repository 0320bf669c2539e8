use std::collections::{BinaryHeap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Duration, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::errors::ScheduleError;

/// The process-wide current virtual clock, if one is installed.
static CURRENT: Mutex<Option<VirtualClock>> = Mutex::new(None);

/// The current domain time: the installed virtual clock's `now`, or the
/// wall clock when no virtual clock is installed.
pub fn domain_now() -> DateTime<Utc> {
    VirtualClock::current().map_or_else(Utc::now, |clock| clock.now())
}

struct Timer {
    due: DateTime<Utc>,
    id: u64,
    action: BoxFuture<'static, ()>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // `BinaryHeap` is a max-heap; invert so the earliest due time
        // pops first, registration order breaking ties.
        other.due.cmp(&self.due).then(other.id.cmp(&self.id))
    }
}

struct ClockState {
    now: DateTime<Utc>,
    timers: BinaryHeap<Timer>,
    next_id: u64,
    canceled: HashSet<u64>,
}

struct ClockInner {
    state: Mutex<ClockState>,
    movements: watch::Sender<DateTime<Utc>>,
}

/// A deterministic, in-process clock for tests and the in-memory
/// scheduler.
///
/// Work is registered with [`schedule`](VirtualClock::schedule) and runs
/// when [`advance_to`](VirtualClock::advance_to) or
/// [`advance_by`](VirtualClock::advance_by) moves the clock past its due
/// time. Advancement is quiescent: it returns only once every action due
/// in the window has finished running, including actions that earlier
/// actions scheduled into the same window. While an action runs, `now`
/// is pinned to the action's due time.
#[derive(Clone)]
pub struct VirtualClock {
    inner: Arc<ClockInner>,
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualClock")
            .field("now", &self.now())
            .finish()
    }
}

impl VirtualClock {
    /// Create a clock reading `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        let (movements, _) = watch::channel(start);
        Self {
            inner: Arc::new(ClockInner {
                state: Mutex::new(ClockState {
                    now: start,
                    timers: BinaryHeap::new(),
                    next_id: 0,
                    canceled: HashSet::new(),
                }),
                movements,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClockState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The clock's current time.
    pub fn now(&self) -> DateTime<Utc> {
        self.state().now
    }

    /// Register `action` to run when the clock reaches `due`.
    ///
    /// Actions with equal due times run in registration order. The
    /// returned handle cancels the action if it has not run yet.
    pub fn schedule<F>(&self, due: DateTime<Utc>, action: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.timers.push(Timer {
            due,
            id,
            action: action.boxed(),
        });
        TimerHandle {
            id,
            clock: Arc::downgrade(&self.inner),
        }
    }

    /// Move the clock forward to `target`, running every action due on
    /// the way. Returns once no action due at or before `target`
    /// remains pending.
    pub async fn advance_to(&self, target: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        {
            let state = self.state();
            if target < state.now {
                return Err(ScheduleError::ClockMovedBackward {
                    clock: "virtual".to_owned(),
                    current: state.now,
                    target,
                });
            }
        }

        self.run_due(target).await;

        {
            let mut state = self.state();
            if state.now < target {
                state.now = target;
            }
        }
        self.inner.movements.send_replace(target);
        Ok(target)
    }

    /// Move the clock forward by `duration`. See
    /// [`advance_to`](VirtualClock::advance_to).
    pub async fn advance_by(&self, duration: Duration) -> Result<DateTime<Utc>, ScheduleError> {
        let target = self.now() + duration;
        self.advance_to(target).await
    }

    /// Run every action that is due right now without moving the clock.
    /// Completes once no pending-and-due work remains.
    pub async fn done(&self) {
        let now = self.now();
        self.run_due(now).await;
    }

    async fn run_due(&self, target: DateTime<Utc>) {
        loop {
            let timer = {
                let mut state = self.state();
                loop {
                    match state.timers.pop() {
                        Some(timer) if state.canceled.remove(&timer.id) => {}
                        Some(timer) if timer.due <= target => {
                            // Pin `now` to the due time for the duration
                            // of the action.
                            state.now = state.now.max(timer.due);
                            break Some(timer);
                        }
                        Some(timer) => {
                            state.timers.push(timer);
                            break None;
                        }
                        None => break None,
                    }
                }
            };

            let Some(timer) = timer else { break };
            timer.action.await;
        }
    }

    /// Observe the new `now` after each advancement.
    pub fn movements(&self) -> watch::Receiver<DateTime<Utc>> {
        self.inner.movements.subscribe()
    }

    /// Install this clock as the process-wide current clock, so
    /// [`domain_now`] reads it. Fails with
    /// [`ScheduleError::ClockInstalled`] if another virtual clock is
    /// already installed. Dropping the guard restores the ambient
    /// clock.
    pub fn install(&self) -> Result<VirtualClockGuard, ScheduleError> {
        let mut current = CURRENT.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return Err(ScheduleError::ClockInstalled);
        }
        *current = Some(self.clone());
        Ok(VirtualClockGuard { _private: () })
    }

    /// The currently installed virtual clock, if any.
    pub fn current() -> Option<VirtualClock> {
        CURRENT
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Cancels a scheduled action when the action has not run yet.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    clock: Weak<ClockInner>,
}

impl TimerHandle {
    /// Cancel the action. Has no effect if it already ran.
    pub fn cancel(&self) {
        if let Some(inner) = self.clock.upgrade() {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.canceled.insert(self.id);
        }
    }
}

/// Keeps a virtual clock installed as the process-wide current clock.
/// Dropping it restores the ambient clock.
#[derive(Debug)]
pub struct VirtualClockGuard {
    _private: (),
}

impl Drop for VirtualClockGuard {
    fn drop(&mut self) {
        CURRENT
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
