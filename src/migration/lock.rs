//! Cluster-wide migration lock built on lightweight transactions
//!
//! A single well-known row in `<table>_lock` names the process allowed to run
//! migrations. It is claimed with `INSERT ... IF NOT EXISTS`, refreshed while migrations
//! run, and released with a conditional delete on the owner. A row whose `acquired_at`
//! has not been refreshed within the staleness window belongs to a crashed holder and is
//! taken over with a compare-and-set, so a dead process can never block migrations
//! forever.

use crate::migration::MigrationError;
use crate::session::{CqlSession, CqlValue, SessionError};
use chrono::{DateTime, TimeDelta, Utc};
use crossbeam_channel::RecvTimeoutError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Key of the single lock row
pub const LOCK_ID: &str = "migration";

/// Contents of the lock row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRow {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

/// Outcome of a conditional insert of the lock row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// The row was absent and now belongs to the caller
    Acquired,
    /// The row exists and is held by someone (possibly the caller)
    HeldBy(LockRow),
    /// The insert lost a race but the holder could not be read; try again
    Retry,
}

/// Conditional-write primitives the lock is built on
pub trait LockStore: Send + Sync {
    fn ensure_initialized(&self) -> Result<(), SessionError>;

    /// Insert `row` only if no lock row exists
    fn insert_if_absent(&self, row: &LockRow) -> Result<LockAttempt, SessionError>;

    /// Replace the lock row only if it still equals `expected`
    fn replace_if(&self, expected: &LockRow, replacement: &LockRow) -> Result<bool, SessionError>;

    /// Move `acquired_at` forward only if `owner` still holds the lock
    fn refresh(&self, owner: &str, at: DateTime<Utc>) -> Result<bool, SessionError>;

    /// Delete the lock row only if `owner` holds it
    fn delete_if_owner(&self, owner: &str) -> Result<bool, SessionError>;

    fn current(&self) -> Result<Option<LockRow>, SessionError>;
}

impl<T: LockStore + ?Sized> LockStore for &T {
    fn ensure_initialized(&self) -> Result<(), SessionError> {
        (**self).ensure_initialized()
    }

    fn insert_if_absent(&self, row: &LockRow) -> Result<LockAttempt, SessionError> {
        (**self).insert_if_absent(row)
    }

    fn replace_if(&self, expected: &LockRow, replacement: &LockRow) -> Result<bool, SessionError> {
        (**self).replace_if(expected, replacement)
    }

    fn refresh(&self, owner: &str, at: DateTime<Utc>) -> Result<bool, SessionError> {
        (**self).refresh(owner, at)
    }

    fn delete_if_owner(&self, owner: &str) -> Result<bool, SessionError> {
        (**self).delete_if_owner(owner)
    }

    fn current(&self) -> Result<Option<LockRow>, SessionError> {
        (**self).current()
    }
}

/// Lock table stored next to the schema history table
///
/// All writes are lightweight transactions; sessions should read with `SERIAL`
/// consistency so `current` observes in-flight Paxos rounds.
pub struct CqlLockStore<'a> {
    session: &'a dyn CqlSession,
    table: String,
}

impl<'a> CqlLockStore<'a> {
    pub fn new(session: &'a dyn CqlSession, keyspace: &str, history_table: &str) -> Self {
        Self {
            session,
            table: format!("{keyspace}.{history_table}_lock"),
        }
    }

    fn holder_from(row: Option<&crate::session::Row>) -> Result<Option<LockRow>, SessionError> {
        let Some(row) = row else {
            return Ok(None);
        };
        let owner: Option<String> = row.get("owner")?;
        let acquired_at: Option<DateTime<Utc>> = row.get("acquired_at")?;
        Ok(owner
            .zip(acquired_at)
            .map(|(owner, acquired_at)| LockRow { owner, acquired_at }))
    }
}

impl LockStore for CqlLockStore<'_> {
    fn ensure_initialized(&self) -> Result<(), SessionError> {
        self.session.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (id text PRIMARY KEY, owner text, acquired_at timestamp)",
                self.table
            ),
            &[],
        )?;
        Ok(())
    }

    fn insert_if_absent(&self, row: &LockRow) -> Result<LockAttempt, SessionError> {
        let result = self.session.execute(
            &format!(
                "INSERT INTO {} (id, owner, acquired_at) VALUES (?, ?, ?) IF NOT EXISTS",
                self.table
            ),
            &[LOCK_ID.into(), row.owner.clone().into(), row.acquired_at.into()],
        )?;
        if result.was_applied()? {
            return Ok(LockAttempt::Acquired);
        }
        // A rejected LWT returns the existing row alongside [applied]
        let holder = match Self::holder_from(result.first())? {
            Some(holder) => Some(holder),
            None => self.current()?,
        };
        Ok(holder.map_or(LockAttempt::Retry, LockAttempt::HeldBy))
    }

    fn replace_if(&self, expected: &LockRow, replacement: &LockRow) -> Result<bool, SessionError> {
        self.session
            .execute(
                &format!(
                    "UPDATE {} SET owner = ?, acquired_at = ? WHERE id = ? IF owner = ? AND acquired_at = ?",
                    self.table
                ),
                &[
                    replacement.owner.clone().into(),
                    replacement.acquired_at.into(),
                    LOCK_ID.into(),
                    expected.owner.clone().into(),
                    expected.acquired_at.into(),
                ],
            )?
            .was_applied()
    }

    fn refresh(&self, owner: &str, at: DateTime<Utc>) -> Result<bool, SessionError> {
        self.session
            .execute(
                &format!("UPDATE {} SET acquired_at = ? WHERE id = ? IF owner = ?", self.table),
                &[at.into(), LOCK_ID.into(), owner.into()],
            )?
            .was_applied()
    }

    fn delete_if_owner(&self, owner: &str) -> Result<bool, SessionError> {
        self.session
            .execute(
                &format!("DELETE FROM {} WHERE id = ? IF owner = ?", self.table),
                &[LOCK_ID.into(), owner.into()],
            )?
            .was_applied()
    }

    fn current(&self) -> Result<Option<LockRow>, SessionError> {
        let result = self.session.execute(
            &format!("SELECT owner, acquired_at FROM {} WHERE id = ?", self.table),
            &[CqlValue::from(LOCK_ID)],
        )?;
        Self::holder_from(result.first())
    }
}

/// Cluster-wide mutual exclusion for migration runs
///
/// The staleness window never drops below [`MIN_STALE_POLLS`] poll intervals, so a
/// holder whose heartbeat is running is never mistaken for a crashed one.
pub struct DistributedLock<'a> {
    store: &'a dyn LockStore,
    owner: String,
    stale_after: Duration,
    poll_interval: Duration,
}

/// Smallest staleness window, in poll intervals
pub const MIN_STALE_POLLS: u32 = 3;

impl<'a> DistributedLock<'a> {
    pub fn new(store: &'a dyn LockStore, owner: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            store,
            owner: owner.into(),
            stale_after,
            poll_interval: Duration::from_millis(100),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Age after which a lock row counts as abandoned
    pub fn stale_after(&self) -> Duration {
        self.stale_after.max(self.poll_interval * MIN_STALE_POLLS)
    }

    fn is_stale(&self, holder: &LockRow, now: DateTime<Utc>) -> bool {
        let window = TimeDelta::from_std(self.stale_after()).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(holder.acquired_at) > window
    }

    /// Block until the lock is held, stealing it from an abandoned holder if necessary
    ///
    /// A zero `timeout` makes a single attempt.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockTimeout` if another owner still holds the lock when
    /// the timeout elapses, and `MigrationError::Lock` if the lock table cannot be used.
    pub fn acquire(&self, timeout: Duration) -> Result<(), MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("migration_lock_acquire", owner = %self.owner).entered();

        let start = Instant::now();
        let mut last_holder = String::from("<unknown>");

        loop {
            let now = Utc::now();
            let mine = LockRow {
                owner: self.owner.clone(),
                acquired_at: now,
            };

            match self.store.insert_if_absent(&mine).map_err(lock_error("acquire"))? {
                LockAttempt::Acquired => {
                    self.acquired(start, false);
                    return Ok(());
                }
                LockAttempt::HeldBy(holder) if holder.owner == self.owner => {
                    // Already ours, e.g. a retried insert whose first response was lost
                    if self
                        .store
                        .refresh(&self.owner, now)
                        .map_err(lock_error("refresh"))?
                    {
                        self.acquired(start, false);
                        return Ok(());
                    }
                    // The row changed hands between the insert and the refresh
                    last_holder = self
                        .store
                        .current()
                        .map_err(lock_error("read"))?
                        .map_or(last_holder, |row| row.owner);
                }
                LockAttempt::HeldBy(holder) if self.is_stale(&holder, now) => {
                    if self
                        .store
                        .replace_if(&holder, &mine)
                        .map_err(lock_error("take over"))?
                    {
                        log::warn!(
                            "Took over migration lock abandoned by '{}' (last refreshed {})",
                            holder.owner,
                            holder.acquired_at
                        );
                        self.acquired(start, true);
                        return Ok(());
                    }
                    // Someone else changed the row first
                    last_holder = holder.owner;
                }
                LockAttempt::HeldBy(holder) => last_holder = holder.owner,
                LockAttempt::Retry => {}
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(MigrationError::LockTimeout {
                    holder: last_holder,
                    waited,
                });
            }
            log::debug!("Migration lock held by '{last_holder}', waiting");
            std::thread::sleep(self.poll_interval.min(timeout - waited));
        }
    }

    fn acquired(&self, start: Instant, stolen: bool) {
        log::debug!("Migration lock acquired by '{}'", self.owner);
        #[cfg(feature = "metrics")]
        METRICS.observe_lock_wait(start.elapsed(), stolen);
        #[cfg(not(feature = "metrics"))]
        let _ = (start, stolen);
    }

    /// Acquire the lock and return a guard that releases it on drop
    ///
    /// # Errors
    ///
    /// See [`DistributedLock::acquire`].
    pub fn lock(&self, timeout: Duration) -> Result<LockGuard<'_>, MigrationError> {
        self.acquire(timeout)?;
        Ok(LockGuard {
            lock: self,
            released: false,
        })
    }

    /// Release the lock if this owner holds it
    ///
    /// Returns whether a row was deleted; releasing a lock that is not held is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Lock` if the lock table cannot be written.
    pub fn release(&self) -> Result<bool, MigrationError> {
        let released = self
            .store
            .delete_if_owner(&self.owner)
            .map_err(lock_error("release"))?;
        if released {
            log::debug!("Migration lock released by '{}'", self.owner);
        }
        Ok(released)
    }

    /// Move `acquired_at` forward; `false` means the lock is no longer ours
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Lock` if the lock table cannot be written.
    pub fn refresh(&self) -> Result<bool, MigrationError> {
        self.store
            .refresh(&self.owner, Utc::now())
            .map_err(lock_error("refresh"))
    }

    /// Run `work` while a background thread keeps the lock fresh
    ///
    /// The refresh interval is a third of the staleness window. `work` receives a flag
    /// that becomes `true` once a refresh finds the lock taken by someone else.
    pub fn while_held<T>(&self, work: impl FnOnce(&AtomicBool) -> T) -> T {
        let interval = self.stale_after() / 3;
        let lost = AtomicBool::new(false);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        std::thread::scope(|scope| {
            scope.spawn(|| loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match self.refresh() {
                        Ok(true) => {}
                        Ok(false) => {
                            log::error!(
                                "Migration lock of '{}' was taken over by another process",
                                self.owner
                            );
                            lost.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => log::warn!("Failed to refresh migration lock: {e}"),
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

            let result = work(&lost);
            drop(stop_tx);
            result
        })
    }
}

fn lock_error(operation: &'static str) -> impl Fn(SessionError) -> MigrationError {
    move |e| MigrationError::Lock(format!("failed to {operation} migration lock: {e}"))
}

/// Holds the migration lock until released or dropped
pub struct LockGuard<'a> {
    lock: &'a DistributedLock<'a>,
    released: bool,
}

impl<'a> LockGuard<'a> {
    pub fn lock(&self) -> &'a DistributedLock<'a> {
        self.lock
    }

    /// Release explicitly so the caller can observe failures
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Lock` if the lock row cannot be deleted.
    pub fn release(mut self) -> Result<(), MigrationError> {
        self.released = true;
        self.lock.release().map(|_| ())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock.release() {
                log::warn!("Failed to release migration lock: {e}");
            }
        }
    }
}
