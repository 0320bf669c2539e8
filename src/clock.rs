use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::SchedulerConfig;
use crate::errors::ScheduleError;
use crate::events::CommandScheduled;
use crate::schema::Clock;
use crate::virtual_clock::domain_now;

/// Registry of named logical clocks and their lookup mappings.
///
/// Clocks are created on first reference and never destroyed; their
/// `now` only moves forward. The registry is the sole writer of the
/// `clocks` and `clock_mappings` tables.
#[derive(Debug, Clone)]
pub struct ClockRegistry {
    pool: SqlitePool,
    config: Arc<SchedulerConfig>,
}

impl ClockRegistry {
    /// Create a registry over `pool`.
    pub fn new(pool: SqlitePool, config: Arc<SchedulerConfig>) -> Self {
        Self { pool, config }
    }

    /// Look up a clock by name.
    pub async fn get(&self, name: &str) -> Result<Option<Clock>, ScheduleError> {
        let clock = sqlx::query_as::<_, Clock>(
            "SELECT name, utc_now, start_time FROM clocks WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(clock)
    }

    /// Every clock in the registry.
    pub async fn all(&self) -> Result<Vec<Clock>, ScheduleError> {
        let clocks = sqlx::query_as::<_, Clock>(
            "SELECT name, utc_now, start_time FROM clocks ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(clocks)
    }

    /// Return the named clock, creating it at the current domain time if
    /// it does not exist yet.
    pub async fn get_or_create(&self, name: &str) -> Result<Clock, ScheduleError> {
        let now = domain_now();
        sqlx::query(
            "INSERT INTO clocks (name, utc_now, start_time) VALUES ($1, $2, $2) \
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(name)
            .await?
            .ok_or_else(|| ScheduleError::UnknownClock(name.to_owned()))
    }

    /// Move the named clock's `now` forward to `target`, atomically with
    /// respect to concurrent advances. Fails with
    /// [`ScheduleError::ClockMovedBackward`] when `target` lies before
    /// the clock's current time.
    #[instrument(name = "clocks.advance", skip(self))]
    pub async fn advance(&self, name: &str, target: DateTime<Utc>) -> Result<Clock, ScheduleError> {
        let updated = sqlx::query(
            "UPDATE clocks SET utc_now = $2 WHERE name = $1 AND utc_now <= $2",
        )
        .bind(name)
        .bind(target)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return match self.get(name).await? {
                Some(clock) => Err(ScheduleError::ClockMovedBackward {
                    clock: name.to_owned(),
                    current: clock.utc_now,
                    target,
                }),
                None => Err(ScheduleError::UnknownClock(name.to_owned())),
            };
        }

        debug!(clock.name = name, clock.now = %target, "Clock advanced");
        self.get(name)
            .await?
            .ok_or_else(|| ScheduleError::UnknownClock(name.to_owned()))
    }

    /// Associate an opaque lookup key with a clock, so events can be
    /// routed to it without carrying the clock name. Creates the clock
    /// on demand and replaces any previous association for `value`.
    pub async fn associate(&self, value: &str, clock_name: &str) -> Result<(), ScheduleError> {
        self.get_or_create(clock_name).await?;
        sqlx::query("INSERT OR REPLACE INTO clock_mappings (value, clock_name) VALUES ($1, $2)")
            .bind(value)
            .bind(clock_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mapped_clock(&self, value: &str) -> Result<Option<String>, ScheduleError> {
        let name = sqlx::query_scalar::<_, String>(
            "SELECT clock_name FROM clock_mappings WHERE value = $1",
        )
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;

        Ok(name)
    }

    /// Resolve the clock an event rides on, in priority order: the
    /// `ClockName` metadata attribute, the configured name resolver, a
    /// mapping matched by the configured lookup-key resolver, and
    /// finally the default clock name.
    pub async fn resolve(&self, event: &CommandScheduled) -> Result<String, ScheduleError> {
        if let Some(name) = event.clock_name_hint() {
            return Ok(name.to_owned());
        }

        if let Some(resolver) = &self.config.clock_name_resolver {
            if let Some(name) = resolver(event) {
                return Ok(name);
            }
        }

        if let Some(resolver) = &self.config.clock_lookup_key_resolver {
            if let Some(key) = resolver(event) {
                if let Some(name) = self.mapped_clock(&key).await? {
                    return Ok(name);
                }
            }
        }

        Ok(self.config.default_clock_name.clone())
    }
}
