use std::sync::Arc;
use std::time::Duration;

use crate::events::CommandScheduled;

/// Resolves a clock name directly from an event.
pub type ClockNameResolver = Arc<dyn Fn(&CommandScheduled) -> Option<String> + Send + Sync>;

/// Derives a lookup key from an event; the key is matched against the
/// registry's clock mappings.
pub type ClockLookupKeyResolver = Arc<dyn Fn(&CommandScheduled) -> Option<String> + Send + Sync>;

const DEFAULT_CLOCK_NAME: &str = "default";
const DEFAULT_PRECONDITION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Configuration for a scheduler instance.
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Clock used when no resolver or metadata names one. Defaults to
    /// `"default"`.
    pub default_clock_name: String,
    /// How long a due command waits for its precondition before being
    /// delivered anyway. Defaults to 10s for the durable scheduler; the
    /// in-memory scheduler overrides this to 3s.
    pub precondition_timeout: Duration,
    /// How often the wall-clock pump advances the default clock.
    pub poll_interval: Duration,
    /// Maximum random jitter added to each poll interval.
    ///
    /// Jitter spreads out polls when several scheduler processes share
    /// a store.
    pub jitter: Duration,
    /// Pluggable event → clock name resolution, consulted after the
    /// `ClockName` metadata attribute.
    pub clock_name_resolver: Option<ClockNameResolver>,
    /// Pluggable event → mapping lookup key resolution, consulted after
    /// the name resolver.
    pub clock_lookup_key_resolver: Option<ClockLookupKeyResolver>,
}

impl SchedulerConfig {
    /// Replace the default clock name.
    pub fn default_clock_name(mut self, name: impl Into<String>) -> Self {
        self.default_clock_name = name.into();
        self
    }

    /// Replace the precondition timeout.
    pub fn precondition_timeout(mut self, timeout: Duration) -> Self {
        self.precondition_timeout = timeout;
        self
    }

    /// Replace the wall-clock pump interval.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Replace the maximum poll jitter.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Install a clock name resolver.
    pub fn clock_name_resolver(mut self, resolver: ClockNameResolver) -> Self {
        self.clock_name_resolver = Some(resolver);
        self
    }

    /// Install a clock lookup key resolver.
    pub fn clock_lookup_key_resolver(mut self, resolver: ClockLookupKeyResolver) -> Self {
        self.clock_lookup_key_resolver = Some(resolver);
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_clock_name: DEFAULT_CLOCK_NAME.to_owned(),
            precondition_timeout: DEFAULT_PRECONDITION_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            clock_name_resolver: None,
            clock_lookup_key_resolver: None,
        }
    }
}

impl std::fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("default_clock_name", &self.default_clock_name)
            .field("precondition_timeout", &self.precondition_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .field(
                "clock_name_resolver",
                &self.clock_name_resolver.as_ref().map(|_| "<function>"),
            )
            .field(
                "clock_lookup_key_resolver",
                &self.clock_lookup_key_resolver.as_ref().map(|_| "<function>"),
            )
            .finish()
    }
}
