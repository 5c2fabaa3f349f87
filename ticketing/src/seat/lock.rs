//! Time-limited exclusive seat holds.
//!
//! A [`SeatLock`] past its `expires_at` is logically absent even while its row
//! still exists (soft expiry): reads treat it as free and the next `lock`
//! replaces it. The reaper ([`SeatLockManager::unlock_expired`]) deletes such
//! rows and returns their seats to AVAILABLE.
//!
//! A RESERVED seat belongs to its reservation, not to the lock: its lock is
//! never swept nor replaced, and only [`SeatLockManager::release_reserved`]
//! (the reservation's own compensation) or a sale frees it.

use crate::error::{Result, TicketingError};
use crate::metrics;
use crate::ports::{LockAcquisition, SeatLockStore};
use crate::seat::{Seat, SeatLedger, SeatStatus};
use crate::sweeper::SweepReport;
use crate::types::{LockId, SeatId, UserId};
use box_office_core::environment::Clock;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// An exclusive, time-limited hold of one seat by one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatLock {
    /// Lock id
    pub id: LockId,
    /// Held seat (unique across locks)
    pub seat_id: SeatId,
    /// Holder
    pub user_id: UserId,
    /// When the lock was taken
    pub locked_at: DateTime<Utc>,
    /// When the lock stops counting
    pub expires_at: DateTime<Utc>,
}

impl SeatLock {
    /// A fresh lock valid for `ttl` from `now`.
    #[must_use]
    pub fn new(seat_id: SeatId, user_id: UserId, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: LockId::new(),
            seat_id,
            user_id,
            locked_at: now,
            expires_at: now + ttl,
        }
    }

    /// Whether the lock has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether `user_id` holds the lock.
    #[must_use]
    pub fn is_held_by(&self, user_id: &UserId) -> bool {
        &self.user_id == user_id
    }

    /// Time left before expiry (zero once expired).
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

fn ttl_from_minutes(ttl_minutes: u32) -> Result<Duration> {
    if ttl_minutes == 0 {
        return Err(TicketingError::Validation(
            "lock ttl must be at least one minute".to_string(),
        ));
    }
    Ok(Duration::minutes(i64::from(ttl_minutes)))
}

/// Grants, extends and releases seat locks on top of the [`SeatLedger`].
#[derive(Clone)]
pub struct SeatLockManager {
    locks: Arc<dyn SeatLockStore>,
    ledger: SeatLedger,
    clock: Arc<dyn Clock>,
}

impl SeatLockManager {
    /// Create a lock manager.
    #[must_use]
    pub fn new(locks: Arc<dyn SeatLockStore>, ledger: SeatLedger, clock: Arc<dyn Clock>) -> Self {
        Self {
            locks,
            ledger,
            clock,
        }
    }

    /// The ledger this manager drives.
    #[must_use]
    pub const fn ledger(&self) -> &SeatLedger {
        &self.ledger
    }

    /// Hold `seat_id` for `user_id` during `ttl_minutes` and mark it SELECTED.
    ///
    /// Re-locking a seat the user already holds returns the existing lock with
    /// its original expiry. An expired lock, whoever held it, is replaced,
    /// unless its seat has been reserved or sold.
    ///
    /// # Errors
    ///
    /// - `Validation` if `ttl_minutes` is zero
    /// - `AlreadyLocked` if another user holds an unexpired lock
    /// - `StateConflict` if the seat is RESERVED or SOLD
    /// - `NotFound` for an unknown seat
    #[instrument(skip(self), fields(seat_id = %seat_id, user_id = %user_id))]
    pub async fn lock(&self, seat_id: SeatId, user_id: &UserId, ttl_minutes: u32) -> Result<SeatLock> {
        let ttl = ttl_from_minutes(ttl_minutes)?;
        // Fail fast before a lock row is written.
        let seat = self.ledger.find(seat_id).await?;
        if matches!(seat.status, SeatStatus::Reserved | SeatStatus::Sold) {
            return Err(TicketingError::StateConflict(format!(
                "seat {seat_id} is {}, it cannot be selected",
                seat.status
            )));
        }

        let now = self.clock.now();
        let candidate = SeatLock::new(seat_id, user_id.clone(), now, ttl);

        let (lock, replaced) = match self.locks.acquire(candidate, now).await? {
            LockAcquisition::AlreadyHeld(existing) => {
                debug!(lock_id = %existing.id, "Seat already held by this user");
                return Ok(existing);
            }
            LockAcquisition::HeldByOther(existing) => {
                debug!(holder = %existing.user_id, "Seat held by another user");
                metrics::record_seat_lock_rejected();
                return Err(TicketingError::AlreadyLocked { seat_id });
            }
            LockAcquisition::Acquired { lock, replaced } => (lock, replaced),
        };

        if let Some(stale) = replaced {
            debug!(stale_lock_id = %stale.id, stale_holder = %stale.user_id, "Replaced expired lock");
            // A seat reserved since the listing keeps its status; the select below then fails.
            match self.ledger.reset_if(seat_id, SeatStatus::Selected).await {
                Ok(true) => {}
                Ok(false) => debug!("Seat behind expired lock was not SELECTED"),
                Err(e) => warn!(error = %e, "Seat behind expired lock could not be reset"),
            }
        }

        if let Err(e) = self.ledger.select(seat_id, user_id).await {
            // Only remove our own row; a concurrent acquirer may have replaced it.
            if let Err(cleanup) = self.locks.delete_lock_if(seat_id, lock.id).await {
                error!(error = %cleanup, "Failed to remove lock after select failure");
            }
            return Err(e);
        }

        info!(lock_id = %lock.id, expires_at = %lock.expires_at, "Seat locked");
        metrics::record_seat_locked();
        Ok(lock)
    }

    /// Push the holder's lock expiry out by `ttl_minutes`.
    ///
    /// # Errors
    ///
    /// - `Validation` if `ttl_minutes` is zero
    /// - `NotFound` if the seat has no lock
    /// - `OwnershipViolation` if someone else holds it
    /// - `Expired` if the lock is past its expiry
    #[instrument(skip(self), fields(seat_id = %seat_id, user_id = %user_id))]
    pub async fn extend(&self, seat_id: SeatId, user_id: &UserId, ttl_minutes: u32) -> Result<SeatLock> {
        let ttl = ttl_from_minutes(ttl_minutes)?;
        let lock = self.held_lock(seat_id, user_id).await?;

        let now = self.clock.now();
        if lock.is_expired(now) {
            return Err(TicketingError::Expired(format!(
                "lock on seat {seat_id} expired at {}",
                lock.expires_at
            )));
        }

        let expires_at = lock.expires_at + ttl;
        let extended = self
            .locks
            .update_expiry(seat_id, lock.id, expires_at)
            .await?
            .ok_or_else(|| TicketingError::not_found("seat lock", seat_id))?;

        debug!(expires_at = %extended.expires_at, "Seat lock extended");
        Ok(extended)
    }

    /// Release the seat's lock and return the seat to AVAILABLE, whatever
    /// its status short of SOLD (administrative release).
    ///
    /// A seat without a lock is left alone. A SOLD seat stays SOLD.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    #[instrument(skip(self), fields(seat_id = %seat_id))]
    pub async fn unlock(&self, seat_id: SeatId) -> Result<()> {
        let Some(lock) = self.locks.find_lock(seat_id).await? else {
            debug!("No lock to release");
            return Ok(());
        };
        self.release(&lock).await?;
        Ok(())
    }

    /// Whether the seat's lock has expired.
    ///
    /// # Errors
    ///
    /// `NotFound` if the seat has no lock.
    pub async fn is_expired(&self, seat_id: SeatId) -> Result<bool> {
        let lock = self
            .locks
            .find_lock(seat_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("seat lock", seat_id))?;
        Ok(lock.is_expired(self.clock.now()))
    }

    /// Whether `user_id` holds an unexpired lock on the seat.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    pub async fn is_locked_by_user(&self, seat_id: SeatId, user_id: &UserId) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .locks
            .find_lock(seat_id)
            .await?
            .is_some_and(|lock| lock.is_held_by(user_id) && !lock.is_expired(now)))
    }

    /// The seat's lock row, expired or not.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    pub async fn current_lock(&self, seat_id: SeatId) -> Result<Option<SeatLock>> {
        self.locks.find_lock(seat_id).await
    }

    /// The holder gives the seat back.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the seat has no lock
    /// - `OwnershipViolation` if someone else holds it
    /// - `StateConflict` if the seat is RESERVED; the reservation must be cancelled instead
    #[instrument(skip(self), fields(seat_id = %seat_id, user_id = %user_id))]
    pub async fn cancel(&self, seat_id: SeatId, user_id: &UserId) -> Result<()> {
        let lock = self.held_lock(seat_id, user_id).await?;
        if self.ledger.find(seat_id).await?.status == SeatStatus::Reserved {
            return Err(TicketingError::StateConflict(format!(
                "seat {seat_id} is reserved, cancel the reservation instead"
            )));
        }
        self.release(&lock).await?;
        Ok(())
    }

    /// The holder completes the purchase: the seat is sold and the lock consumed.
    ///
    /// # Errors
    ///
    /// - `NotFound` / `OwnershipViolation` as for [`Self::cancel`]
    /// - `Expired` if the lock is past its expiry
    /// - `StateConflict` if the seat is not RESERVED
    #[instrument(skip(self), fields(seat_id = %seat_id, user_id = %user_id))]
    pub async fn confirm(&self, seat_id: SeatId, user_id: &UserId) -> Result<Seat> {
        let lock = self.held_lock(seat_id, user_id).await?;
        if lock.is_expired(self.clock.now()) {
            return Err(TicketingError::Expired(format!(
                "lock on seat {seat_id} expired at {}",
                lock.expires_at
            )));
        }
        let seat = self.ledger.sell(seat_id).await?;
        self.locks.delete_lock_if(seat_id, lock.id).await?;
        info!(lock_id = %lock.id, "Seat purchase confirmed");
        Ok(seat)
    }

    /// Release a seat regardless of who holds it (saga compensation).
    ///
    /// Returns the lock that was removed, if any. SOLD seats stay SOLD.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown seat, `Storage` on adapter failure.
    #[instrument(skip(self), fields(seat_id = %seat_id))]
    pub async fn release_by_authority(&self, seat_id: SeatId) -> Result<Option<SeatLock>> {
        let removed = self.remove_current_lock(seat_id).await?;
        self.reset_unless_sold(seat_id).await?;
        Ok(removed)
    }

    /// Release a RESERVED seat of a failed, cancelled or abandoned reservation.
    ///
    /// The seat's lock is removed by authority whoever holds it, and the seat
    /// returns to AVAILABLE. A seat that is no longer RESERVED has left the
    /// reservation already and is not touched. Returns the removed lock.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown seat, `Storage` on adapter failure.
    #[instrument(skip(self), fields(seat_id = %seat_id))]
    pub async fn release_reserved(&self, seat_id: SeatId) -> Result<Option<SeatLock>> {
        let seat = self.ledger.find(seat_id).await?;
        if seat.status != SeatStatus::Reserved {
            debug!(status = %seat.status, "Seat no longer reserved, left as is");
            return Ok(None);
        }
        let removed = self.remove_current_lock(seat_id).await?;
        if !self.ledger.reset_if(seat_id, SeatStatus::Reserved).await? {
            warn!("Reserved seat changed while being released");
        }
        Ok(removed)
    }

    /// Sell the seat and drop its lock (saga completion).
    ///
    /// Returns the lock that was dropped, if any.
    ///
    /// # Errors
    ///
    /// `StateConflict` if the seat is not RESERVED.
    #[instrument(skip(self), fields(seat_id = %seat_id))]
    pub async fn settle(&self, seat_id: SeatId) -> Result<Option<SeatLock>> {
        self.ledger.sell(seat_id).await?;
        match self.locks.find_lock(seat_id).await? {
            Some(lock) if self.locks.delete_lock_if(seat_id, lock.id).await? => Ok(Some(lock)),
            _ => Ok(None),
        }
    }

    /// Release every expired lock.
    ///
    /// Each lock is removed with a conditional delete on its id, so a lock that
    /// was re-acquired since the listing is left alone. Locks on RESERVED seats
    /// are kept and counted as skipped. Failures are counted and logged per
    /// seat; they never abort the sweep.
    ///
    /// # Errors
    ///
    /// `Storage` if the expired locks cannot be listed.
    pub async fn unlock_expired(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let expired = self.locks.expired_locks(now).await?;
        let mut report = SweepReport::default();

        for lock in expired {
            match self.release_expired(&lock).await {
                Ok(true) => report.released += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(seat_id = %lock.seat_id, error = %e, "Failed to release expired lock");
                    report.failed += 1;
                }
            }
        }

        if !report.is_empty() {
            info!(
                released = report.released,
                skipped = report.skipped,
                failed = report.failed,
                "Expired seat locks swept"
            );
        }
        metrics::record_locks_reaped(report.released);
        Ok(report)
    }

    async fn held_lock(&self, seat_id: SeatId, user_id: &UserId) -> Result<SeatLock> {
        let lock = self
            .locks
            .find_lock(seat_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("seat lock", seat_id))?;
        if !lock.is_held_by(user_id) {
            return Err(TicketingError::OwnershipViolation(format!(
                "seat {seat_id} is not held by {user_id}"
            )));
        }
        Ok(lock)
    }

    async fn remove_current_lock(&self, seat_id: SeatId) -> Result<Option<SeatLock>> {
        match self.locks.find_lock(seat_id).await? {
            Some(lock) if self.locks.delete_lock_if(seat_id, lock.id).await? => Ok(Some(lock)),
            _ => Ok(None),
        }
    }

    /// Drop an expired lock and reset its SELECTED seat. Returns `false` for a
    /// RESERVED seat or a lock that is already gone.
    async fn release_expired(&self, lock: &SeatLock) -> Result<bool> {
        let seat = self.ledger.find(lock.seat_id).await?;
        if seat.status == SeatStatus::Reserved {
            debug!(seat_id = %lock.seat_id, lock_id = %lock.id, "Expired lock kept on reserved seat");
            return Ok(false);
        }
        if !self.locks.delete_lock_if(lock.seat_id, lock.id).await? {
            debug!(seat_id = %lock.seat_id, lock_id = %lock.id, "Lock already released");
            return Ok(false);
        }
        self.ledger.reset_if(lock.seat_id, SeatStatus::Selected).await?;
        debug!(seat_id = %lock.seat_id, lock_id = %lock.id, "Expired seat lock released");
        Ok(true)
    }

    /// Delete `lock` if it is still current, then reset its seat.
    ///
    /// Returns `false` when the lock was already gone or replaced.
    async fn release(&self, lock: &SeatLock) -> Result<bool> {
        if !self.locks.delete_lock_if(lock.seat_id, lock.id).await? {
            debug!(seat_id = %lock.seat_id, lock_id = %lock.id, "Lock already released");
            return Ok(false);
        }
        self.reset_unless_sold(lock.seat_id).await?;
        debug!(seat_id = %lock.seat_id, lock_id = %lock.id, "Seat lock released");
        Ok(true)
    }

    async fn reset_unless_sold(&self, seat_id: SeatId) -> Result<()> {
        match self.ledger.reset(seat_id).await {
            Ok(_) => Ok(()),
            Err(TicketingError::StateConflict(reason)) => {
                warn!(seat_id = %seat_id, %reason, "Seat left as is");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
