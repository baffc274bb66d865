//! Two-phase expiry of stored messages.
//!
//! Every record moves `FRESH -> WARNED -> DELETED` by age alone. A sweep
//! first warns (marks and notifies) records that are within `warn_before` of
//! deletion, then deletes records older than `delete_after`. Warn runs first
//! so a record is never deleted in a sweep without having been offered a
//! warning in an earlier or the same sweep.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use murmur_db::StoreError;

use crate::dispatcher::Dispatcher;
use crate::error::ConfigError;

/// Longest accepted retention window, roughly a century.
const MAX_RETENTION: Duration = Duration::from_secs(36_500 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    delete_after: TimeDelta,
    warn_before: TimeDelta,
    sweep_interval: Duration,
}

impl RetentionPolicy {
    /// Rejects `warn_before == 0`, `delete_after <= warn_before`, windows
    /// longer than a century and a zero sweep interval.
    pub fn new(
        delete_after: Duration,
        warn_before: Duration,
        sweep_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if warn_before.is_zero() {
            return Err(ConfigError::Retention("warning lead time must be positive".into()));
        }
        if delete_after <= warn_before {
            return Err(ConfigError::Retention(format!(
                "retention window ({}s) must exceed warning lead time ({}s)",
                delete_after.as_secs(),
                warn_before.as_secs()
            )));
        }
        if delete_after > MAX_RETENTION {
            return Err(ConfigError::Retention(format!(
                "retention window ({}s) exceeds the maximum of {} days",
                delete_after.as_secs(),
                MAX_RETENTION.as_secs() / (24 * 60 * 60)
            )));
        }
        if sweep_interval.is_zero() {
            return Err(ConfigError::Retention("sweep interval must be positive".into()));
        }

        let to_delta = |d: Duration| {
            TimeDelta::from_std(d).map_err(|e| ConfigError::Retention(e.to_string()))
        };
        Ok(Self {
            delete_after: to_delta(delete_after)?,
            warn_before: to_delta(warn_before)?,
            sweep_interval,
        })
    }

    /// Convenience for whole-day windows.
    pub fn from_days(
        delete_after_days: u64,
        warn_before_days: u64,
        sweep_interval: Duration,
    ) -> Result<Self, ConfigError> {
        const DAY: u64 = 24 * 60 * 60;
        Self::new(
            Duration::from_secs(delete_after_days.saturating_mul(DAY)),
            Duration::from_secs(warn_before_days.saturating_mul(DAY)),
            sweep_interval,
        )
    }

    pub fn delete_after(&self) -> TimeDelta {
        self.delete_after
    }

    pub fn warn_before(&self) -> TimeDelta {
        self.warn_before
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Records created at or before this instant are due a warning.
    /// Saturates at the earliest representable instant.
    pub fn warn_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.delete_after - self.warn_before)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Records created at or before this instant are deleted.
    /// Saturates at the earliest representable instant.
    pub fn delete_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.delete_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn delete_at(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at
            .checked_add_signed(self.delete_after)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records that moved FRESH -> WARNED.
    pub warned: usize,
    /// Users that received a warning on at least one connection.
    pub notified: usize,
    pub deleted: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.warned == 0 && self.deleted == 0
    }
}

pub struct RetentionScheduler {
    policy: RetentionPolicy,
    dispatcher: Dispatcher,
    sweep_lock: Mutex<()>,
}

impl RetentionScheduler {
    pub fn new(policy: RetentionPolicy, dispatcher: Dispatcher) -> Self {
        Self {
            policy,
            dispatcher,
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Sweep on every tick until the task is dropped. The first sweep runs
    /// immediately. Overrunning sweeps cause ticks to be skipped, not queued.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.policy.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.policy.sweep_interval.as_secs(),
            retention_days = self.policy.delete_after.num_days(),
            warn_days = self.policy.warn_before.num_days(),
            "Retention sweep loop started"
        );

        loop {
            interval.tick().await;

            match self.sweep(Utc::now()).await {
                Ok(Some(report)) if !report.is_empty() => {
                    info!(
                        warned = report.warned,
                        notified = report.notified,
                        deleted = report.deleted,
                        "Retention: sweep complete"
                    );
                }
                Ok(Some(_)) => debug!("Retention: nothing to do"),
                Ok(None) => debug!("Retention: previous sweep still running, skipping"),
                Err(e) => warn!(error = %e, "Retention: sweep failed, retrying next period"),
            }
        }
    }

    /// Run one sweep as of `now`. Returns `None` without doing anything if
    /// another sweep is in flight.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Option<SweepReport>, StoreError> {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            return Ok(None);
        };

        let (warned, notified) = self.warn_phase(now).await?;
        let deleted = self.delete_phase(now).await?;

        Ok(Some(SweepReport {
            warned,
            notified,
            deleted,
        }))
    }

    async fn warn_phase(&self, now: DateTime<Utc>) -> Result<(usize, usize), StoreError> {
        let store = self.dispatcher.store();
        let due = store.due_for_warning(self.policy.warn_cutoff(now)).await?;
        if due.is_empty() {
            return Ok((0, 0));
        }

        let warned = store
            .mark_warned(due.iter().map(|row| row.id).collect())
            .await?;

        // user -> (affected messages, earliest deletion)
        let mut affected: BTreeMap<&str, (u64, DateTime<Utc>)> = BTreeMap::new();
        for row in &due {
            let delete_at = self.policy.delete_at(row.created_at);
            let parties = std::iter::once(row.sender.as_str()).chain(
                row.recipient
                    .as_deref()
                    .filter(|recipient| *recipient != row.sender),
            );
            for user in parties {
                let entry = affected.entry(user).or_insert((0, delete_at));
                entry.0 += 1;
                entry.1 = entry.1.min(delete_at);
            }
        }

        let mut notified = 0;
        for (user, (count, delete_at)) in affected {
            if self.dispatcher.notify_retention(user, count, delete_at).await > 0 {
                notified += 1;
            } else {
                debug!(username = user, count, "Retention warning dropped, user offline");
            }
        }

        Ok((warned, notified))
    }

    async fn delete_phase(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.dispatcher
            .store()
            .delete_older_than(self.policy.delete_cutoff(now))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_crypto::KeyRing;
    use murmur_db::MessageStore;
    use murmur_db::testing::TempDatabase;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn scheduler() -> (RetentionScheduler, TempDatabase) {
        let db = TempDatabase::new("retention_test").unwrap();
        let dispatcher = Dispatcher::new(MessageStore::new(db.db()), KeyRing::new([5u8; 32]));
        let policy = RetentionPolicy::from_days(60, 7, DAY).unwrap();
        (RetentionScheduler::new(policy, dispatcher), db)
    }

    #[test]
    fn policy_validation() {
        assert!(RetentionPolicy::from_days(60, 7, DAY).is_ok());
        assert!(RetentionPolicy::from_days(7, 7, DAY).is_err());
        assert!(RetentionPolicy::from_days(7, 8, DAY).is_err());
        assert!(RetentionPolicy::from_days(60, 0, DAY).is_err());
        assert!(RetentionPolicy::from_days(60, 7, Duration::ZERO).is_err());
    }

    #[test]
    fn oversized_windows_are_rejected() {
        assert!(RetentionPolicy::from_days(36_500, 7, DAY).is_ok());
        assert!(matches!(
            RetentionPolicy::from_days(36_501, 7, DAY),
            Err(ConfigError::Retention(_))
        ));
        assert!(RetentionPolicy::from_days(100_000_000, 7, DAY).is_err());
        assert!(RetentionPolicy::from_days(u64::MAX, 7, DAY).is_err());
    }

    #[test]
    fn cutoffs_saturate_at_the_edges_of_time() {
        let policy = RetentionPolicy::from_days(36_500, 7, DAY).unwrap();
        let early = DateTime::<Utc>::MIN_UTC + TimeDelta::days(1);
        assert_eq!(policy.warn_cutoff(early), DateTime::<Utc>::MIN_UTC);
        assert_eq!(policy.delete_cutoff(early), DateTime::<Utc>::MIN_UTC);
        assert_eq!(
            policy.delete_at(DateTime::<Utc>::MAX_UTC - TimeDelta::days(1)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn cutoffs() {
        let policy = RetentionPolicy::from_days(60, 7, DAY).unwrap();
        let now = Utc::now();
        assert_eq!(policy.warn_cutoff(now), now - TimeDelta::days(53));
        assert_eq!(policy.delete_cutoff(now), now - TimeDelta::days(60));
        assert!(policy.warn_cutoff(now) > policy.delete_cutoff(now));
        assert_eq!(policy.delete_at(now), now + TimeDelta::days(60));
    }

    #[tokio::test]
    async fn overlapping_sweep_is_skipped() {
        let (scheduler, _db) = scheduler();
        let now = Utc::now();

        let in_flight = scheduler.sweep_lock.lock().await;
        assert_eq!(scheduler.sweep(now).await.unwrap(), None);
        drop(in_flight);

        assert_eq!(scheduler.sweep(now).await.unwrap(), Some(SweepReport::default()));
    }

    #[tokio::test]
    async fn failed_sweep_releases_the_lock() {
        let (scheduler, db) = scheduler();
        db.with_conn_mut(|conn| Ok(conn.execute_batch("DROP TABLE messages")?))
            .unwrap();

        assert!(scheduler.sweep(Utc::now()).await.is_err());
        assert!(scheduler.sweep_lock.try_lock().is_ok());
    }
}
