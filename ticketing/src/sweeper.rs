//! Periodic reapers for expired seat locks, abandoned reservations and stale
//! queue admissions.
//!
//! Each runs as an independent [`PeriodicTask`] and stop on the shared shutdown
//! signal. A sweep that hits an entity another request already moved on
//! counts it as skipped; it is never an error.

use crate::queue::AdmissionController;
use crate::reservation::ReservationService;
use crate::seat::SeatLockManager;
use box_office_runtime::{PeriodicTask, ShutdownSignal};
use serde::Serialize;
use std::ops::AddAssign;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Outcome of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Entities released or expired by this sweep
    pub released: u64,
    /// Entities that changed concurrently and were left alone
    pub skipped: u64,
    /// Entities whose release failed
    pub failed: u64,
}

impl SweepReport {
    /// Whether the sweep touched nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.released == 0 && self.skipped == 0 && self.failed == 0
    }
}

impl AddAssign for SweepReport {
    fn add_assign(&mut self, other: Self) {
        self.released += other.released;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Handles of the running reapers.
#[derive(Debug)]
pub struct Reapers {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Reapers {
    /// Spawn the seat-lock, reservation and queue-expiry reapers.
    ///
    /// The reservation reaper shares the seat-lock interval.
    #[must_use]
    pub fn spawn(
        locks: SeatLockManager,
        reservations: ReservationService,
        queue: AdmissionController,
        lock_interval: Duration,
        queue_interval: Duration,
        shutdown: &ShutdownSignal,
    ) -> Self {
        let lock_reaper = PeriodicTask::new("seat-lock-reaper", lock_interval).spawn(shutdown.clone(), move || {
            let locks = locks.clone();
            async move {
                if let Err(e) = locks.unlock_expired().await {
                    error!(error = %e, "Seat lock sweep failed");
                }
            }
        });

        let reservation_reaper =
            PeriodicTask::new("reservation-reaper", lock_interval).spawn(shutdown.clone(), move || {
                let reservations = reservations.clone();
                async move {
                    if let Err(e) = reservations.expire_abandoned().await {
                        error!(error = %e, "Abandoned reservation sweep failed");
                    }
                }
            });

        let queue_reaper = PeriodicTask::new("queue-expiry-reaper", queue_interval).spawn(shutdown.clone(), move || {
            let queue = queue.clone();
            async move {
                if let Err(e) = queue.expire_stale().await {
                    error!(error = %e, "Queue expiry sweep failed");
                }
            }
        });

        info!("Reapers started");
        Self {
            handles: vec![
                ("seat-lock-reaper", lock_reaper),
                ("reservation-reaper", reservation_reaper),
                ("queue-expiry-reaper", queue_reaper),
            ],
        }
    }

    /// Wait for the reapers to stop after shutdown was triggered.
    pub async fn join(self, timeout: Duration) {
        for (name, handle) in self.handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(task = name, error = %e, "Reaper panicked"),
                Err(_) => warn!(task = name, "Reaper did not stop within timeout"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_accumulate() {
        let mut total = SweepReport::default();
        assert!(total.is_empty());

        total += SweepReport {
            released: 2,
            skipped: 1,
            failed: 0,
        };
        total += SweepReport {
            released: 1,
            skipped: 0,
            failed: 1,
        };

        assert_eq!(
            total,
            SweepReport {
                released: 3,
                skipped: 1,
                failed: 1
            }
        );
    }
}
