//! Waiting-queue admission control.
//!
//! Users register per concert and receive strictly increasing positions from a
//! per-concert sequence owned by the store. Batches of the lowest WAITING
//! positions are admitted; an admitted user has a fixed window to enter seat
//! selection before the expiry reaper moves the entry to EXPIRED.
//!
//! ```text
//! WAITING ──admit──▶ ADMITTED ──enter──▶ ENTERED
//!    │                  │                   │
//!    └──expire──────────┴──▶ EXPIRED        │
//!    └──cancel──────────┴───────────────────┴──▶ CANCELLED
//! ```

use crate::error::{Result, TicketingError};
use crate::messages::{self, QueueAdmitted, QueueEntered, QueueEntryMessage, QueueRegistered};
use crate::metrics;
use crate::ports::{Conditional, WaitingQueueStore};
use crate::sweeper::SweepReport;
use crate::types::{ConcertId, QueueEntryId, UserId};
use box_office_core::environment::Clock;
use box_office_core::message_bus::MessageBus;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Status of a waiting-queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    /// In line
    Waiting,
    /// Admitted, allowed to enter seat selection
    #[serde(rename = "PROCESSING")]
    Admitted,
    /// Entered seat selection
    Entered,
    /// Admission window lapsed
    Expired,
    /// Left the queue
    Cancelled,
}

/// A waiting-queue state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueTransition {
    /// `WAITING → ADMITTED`
    Admit,
    /// `ADMITTED → ENTERED`
    Enter,
    /// `WAITING | ADMITTED → EXPIRED`
    Expire,
    /// any active status → `CANCELLED`
    Cancel,
}

impl QueueTransition {
    /// Statuses the transition may start from.
    #[must_use]
    pub const fn allowed_from(self) -> &'static [QueueStatus] {
        match self {
            Self::Admit => &[QueueStatus::Waiting],
            Self::Enter => &[QueueStatus::Admitted],
            Self::Expire => &[QueueStatus::Waiting, QueueStatus::Admitted],
            Self::Cancel => &[QueueStatus::Waiting, QueueStatus::Admitted, QueueStatus::Entered],
        }
    }

    /// Status after the transition.
    #[must_use]
    pub const fn target(self) -> QueueStatus {
        match self {
            Self::Admit => QueueStatus::Admitted,
            Self::Enter => QueueStatus::Entered,
            Self::Expire => QueueStatus::Expired,
            Self::Cancel => QueueStatus::Cancelled,
        }
    }
}

impl QueueStatus {
    /// Apply a transition.
    ///
    /// # Errors
    ///
    /// [`TicketingError::StateConflict`] if the transition is not legal from `self`.
    pub fn apply(self, transition: QueueTransition) -> Result<Self> {
        if transition.allowed_from().contains(&self) {
            Ok(transition.target())
        } else {
            Err(TicketingError::StateConflict(format!(
                "queue entry is {self}, cannot {transition:?}"
            )))
        }
    }

    /// WAITING, ADMITTED or ENTERED.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Waiting | Self::Admitted | Self::Entered)
    }

    /// Stable string form, used for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Admitted => "PROCESSING",
            Self::Entered => "ENTERED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = TicketingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "WAITING" => Ok(Self::Waiting),
            "PROCESSING" => Ok(Self::Admitted),
            "ENTERED" => Ok(Self::Entered),
            "EXPIRED" => Ok(Self::Expired),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(TicketingError::Storage(format!("unknown queue status: {other}"))),
        }
    }
}

/// A user's place in a concert's waiting queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingQueueEntry {
    /// Entry id
    pub id: QueueEntryId,
    /// Concert
    pub concert_id: ConcertId,
    /// User
    pub user_id: UserId,
    /// Position, strictly increasing per concert and never reused
    pub queue_position: u64,
    /// Current status
    pub status: QueueStatus,
    /// When the user registered
    pub registered_at: DateTime<Utc>,
    /// When the entry was admitted
    pub admitted_at: Option<DateTime<Utc>>,
    /// When the user entered seat selection
    pub entered_at: Option<DateTime<Utc>>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl WaitingQueueEntry {
    /// A new WAITING entry.
    #[must_use]
    pub fn new(concert_id: ConcertId, user_id: UserId, queue_position: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: QueueEntryId::new(),
            concert_id,
            user_id,
            queue_position,
            status: QueueStatus::Waiting,
            registered_at: now,
            admitted_at: None,
            entered_at: None,
            updated_at: now,
        }
    }

    /// Whether the admission window has lapsed at `now`.
    #[must_use]
    pub fn admission_lapsed(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Admitted
            && self.admitted_at.is_some_and(|admitted_at| admitted_at + window <= now)
    }

    fn message(&self, timestamp: DateTime<Utc>) -> QueueEntryMessage {
        QueueEntryMessage {
            entry_id: self.id,
            concert_id: self.concert_id,
            user_id: self.user_id.clone(),
            queue_position: self.queue_position,
            timestamp,
        }
    }
}

/// What a user sees while waiting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueuePosition {
    /// The user's entry
    pub entry: WaitingQueueEntry,
    /// WAITING entries ahead of the user
    pub ahead: u64,
    /// Estimated time until admission
    pub estimated_wait: std::time::Duration,
}

/// Estimated wait for `ahead` users when `batch_size` users are admitted every `interval`.
///
/// `ceil(ahead / batch_size) * interval`. A zero batch size is treated as one.
#[must_use]
pub fn estimated_wait(ahead: u64, batch_size: u32, interval: std::time::Duration) -> std::time::Duration {
    let batches = ahead.div_ceil(u64::from(batch_size.max(1)));
    interval.saturating_mul(u32::try_from(batches).unwrap_or(u32::MAX))
}

/// Admission controller settings.
#[derive(Clone, Copy, Debug)]
pub struct AdmissionSettings {
    /// Time an admitted user has to enter
    pub admission_window: Duration,
    /// Batch size used when none is given
    pub default_batch_size: u32,
    /// How often a batch is admitted (for wait estimates)
    pub admission_interval: std::time::Duration,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            admission_window: Duration::minutes(5),
            default_batch_size: 100,
            admission_interval: std::time::Duration::from_secs(10),
        }
    }
}

/// Gates seat selection behind a FIFO waiting queue.
#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn WaitingQueueStore>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    settings: AdmissionSettings,
}

impl AdmissionController {
    /// Create an admission controller.
    #[must_use]
    pub fn new(
        store: Arc<dyn WaitingQueueStore>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
        settings: AdmissionSettings,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            settings,
        }
    }

    /// Controller settings.
    #[must_use]
    pub const fn settings(&self) -> &AdmissionSettings {
        &self.settings
    }

    /// Put the user at the back of the concert's queue.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if the user has an active entry for the concert.
    #[instrument(skip(self), fields(concert_id = %concert_id, user_id = %user_id))]
    pub async fn register(&self, concert_id: ConcertId, user_id: &UserId) -> Result<WaitingQueueEntry> {
        let now = self.clock.now();
        let entry = self.store.register_next(concert_id, user_id, now).await?;

        info!(position = entry.queue_position, "User registered in waiting queue");
        metrics::record_queue_transition("registered", 1);
        messages::publish(self.bus.as_ref(), &QueueRegistered(entry.message(now))).await;
        Ok(entry)
    }

    /// Admit up to `batch_size` of the lowest WAITING positions.
    ///
    /// Entries that change concurrently are skipped, so fewer than
    /// `batch_size` entries may be returned.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    #[instrument(skip(self), fields(concert_id = %concert_id))]
    pub async fn admit_next_batch(&self, concert_id: ConcertId, batch_size: u32) -> Result<Vec<WaitingQueueEntry>> {
        let limit = usize::try_from(batch_size).unwrap_or(usize::MAX);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let candidates = self.store.lowest_waiting(concert_id, limit).await?;
        let mut admitted = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            match self.transition(candidate.id, QueueTransition::Admit).await? {
                Conditional::Updated(entry) => {
                    self.publish_admitted(&entry).await;
                    admitted.push(entry);
                }
                Conditional::Conflict(entry) => {
                    debug!(entry_id = %entry.id, status = %entry.status, "Entry changed before admission");
                }
                Conditional::Missing => {
                    debug!(entry_id = %candidate.id, "Entry vanished before admission");
                }
            }
        }

        if !admitted.is_empty() {
            info!(count = admitted.len(), "Admitted waiting-queue batch");
        }
        metrics::record_queue_transition("admitted", admitted.len() as u64);
        Ok(admitted)
    }

    /// Admit the next batch using the configured default size.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    pub async fn admit_next_default_batch(&self, concert_id: ConcertId) -> Result<Vec<WaitingQueueEntry>> {
        self.admit_next_batch(concert_id, self.settings.default_batch_size).await
    }

    /// Admit one specific entry.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown entry, `StateConflict` if it is not WAITING
    /// (including a second admit of the same entry).
    #[instrument(skip(self), fields(entry_id = %entry_id))]
    pub async fn admit(&self, entry_id: QueueEntryId) -> Result<WaitingQueueEntry> {
        match self.transition(entry_id, QueueTransition::Admit).await? {
            Conditional::Updated(entry) => {
                self.publish_admitted(&entry).await;
                metrics::record_queue_transition("admitted", 1);
                Ok(entry)
            }
            Conditional::Conflict(entry) => Err(rejection(&entry, QueueTransition::Admit)),
            Conditional::Missing => Err(TicketingError::not_found("queue entry", entry_id)),
        }
    }

    /// Convert the user's admission into entry to seat selection.
    ///
    /// Entering twice returns the ENTERED entry unchanged.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the user has no active entry
    /// - `StateConflict` if the user is still WAITING
    /// - `Expired` if the admission window lapsed (the entry is expired on the way out)
    #[instrument(skip(self), fields(concert_id = %concert_id, user_id = %user_id))]
    pub async fn enter(&self, concert_id: ConcertId, user_id: &UserId) -> Result<WaitingQueueEntry> {
        let entry = self.active_entry(concert_id, user_id).await?;
        let now = self.clock.now();

        match entry.status {
            QueueStatus::Entered => return Ok(entry),
            QueueStatus::Admitted if entry.admission_lapsed(self.settings.admission_window, now) => {
                if self.transition(entry.id, QueueTransition::Expire).await?.is_updated() {
                    metrics::record_queue_transition("expired", 1);
                }
                return Err(TicketingError::Expired(format!(
                    "admission for concert {concert_id} lapsed"
                )));
            }
            _ => {}
        }

        match self.transition(entry.id, QueueTransition::Enter).await? {
            Conditional::Updated(entry) => {
                info!(position = entry.queue_position, "User entered seat selection");
                metrics::record_queue_transition("entered", 1);
                messages::publish(self.bus.as_ref(), &QueueEntered(entry.message(now))).await;
                Ok(entry)
            }
            Conditional::Conflict(entry) if entry.status == QueueStatus::Entered => Ok(entry),
            Conditional::Conflict(entry) if entry.status == QueueStatus::Expired => Err(
                TicketingError::Expired(format!("admission for concert {concert_id} lapsed")),
            ),
            Conditional::Conflict(entry) => Err(rejection(&entry, QueueTransition::Enter)),
            Conditional::Missing => Err(TicketingError::not_found("queue entry", entry.id)),
        }
    }

    /// Leave the queue.
    ///
    /// # Errors
    ///
    /// `NotFound` if the user has no active entry.
    #[instrument(skip(self), fields(concert_id = %concert_id, user_id = %user_id))]
    pub async fn cancel(&self, concert_id: ConcertId, user_id: &UserId) -> Result<WaitingQueueEntry> {
        let entry = self.active_entry(concert_id, user_id).await?;
        match self.transition(entry.id, QueueTransition::Cancel).await? {
            Conditional::Updated(entry) => {
                info!("User left the waiting queue");
                metrics::record_queue_transition("cancelled", 1);
                Ok(entry)
            }
            Conditional::Conflict(entry) => Err(rejection(&entry, QueueTransition::Cancel)),
            Conditional::Missing => Err(TicketingError::not_found("queue entry", entry.id)),
        }
    }

    /// WAITING entries with a position strictly below `position`.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    pub async fn count_queue_ahead(&self, concert_id: ConcertId, position: u64) -> Result<u64> {
        self.store.count_waiting_before(concert_id, position).await
    }

    /// The user's entry with the number of users ahead and an estimated wait.
    ///
    /// # Errors
    ///
    /// `NotFound` if the user has no active entry.
    pub async fn status(&self, concert_id: ConcertId, user_id: &UserId) -> Result<QueuePosition> {
        let entry = self.active_entry(concert_id, user_id).await?;
        let ahead = if entry.status == QueueStatus::Waiting {
            self.count_queue_ahead(concert_id, entry.queue_position).await?
        } else {
            0
        };
        let estimated_wait = estimated_wait(
            ahead,
            self.settings.default_batch_size,
            self.settings.admission_interval,
        );

        Ok(QueuePosition {
            entry,
            ahead,
            estimated_wait,
        })
    }

    /// Gate for seat selection: the user must have ENTERED.
    ///
    /// # Errors
    ///
    /// `NotFound` without an active entry, `Expired` if the admission lapsed,
    /// `StateConflict` for any other status.
    pub async fn ensure_entered(&self, concert_id: ConcertId, user_id: &UserId) -> Result<()> {
        let entry = self.active_entry(concert_id, user_id).await?;
        match entry.status {
            QueueStatus::Entered => Ok(()),
            QueueStatus::Admitted if entry.admission_lapsed(self.settings.admission_window, self.clock.now()) => {
                Err(TicketingError::Expired(format!("admission for concert {concert_id} lapsed")))
            }
            status => Err(TicketingError::StateConflict(format!(
                "user {user_id} has not entered concert {concert_id} (status {status})"
            ))),
        }
    }

    /// Expire ADMITTED entries whose admission window has lapsed.
    ///
    /// # Errors
    ///
    /// `Storage` if the stale entries cannot be listed.
    pub async fn expire_stale(&self) -> Result<SweepReport> {
        let cutoff = self.clock.now() - self.settings.admission_window;
        let stale = self.store.admitted_before(cutoff).await?;
        let mut report = SweepReport::default();

        for entry in stale {
            match self.transition(entry.id, QueueTransition::Expire).await {
                Ok(Conditional::Updated(_)) => report.released += 1,
                Ok(Conditional::Conflict(_) | Conditional::Missing) => report.skipped += 1,
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "Failed to expire queue entry");
                    report.failed += 1;
                }
            }
        }

        if !report.is_empty() {
            info!(
                expired = report.released,
                skipped = report.skipped,
                failed = report.failed,
                "Stale queue admissions swept"
            );
        }
        metrics::record_queue_transition("expired", report.released);
        Ok(report)
    }

    async fn active_entry(&self, concert_id: ConcertId, user_id: &UserId) -> Result<WaitingQueueEntry> {
        self.store
            .find_active_entry(concert_id, user_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("queue entry", format!("{concert_id}/{user_id}")))
    }

    async fn transition(
        &self,
        entry_id: QueueEntryId,
        transition: QueueTransition,
    ) -> Result<Conditional<WaitingQueueEntry>> {
        self.store
            .transition_entry(entry_id, transition.allowed_from(), transition.target(), self.clock.now())
            .await
    }

    async fn publish_admitted(&self, entry: &WaitingQueueEntry) {
        let timestamp = entry.admitted_at.unwrap_or_else(|| self.clock.now());
        messages::publish(self.bus.as_ref(), &QueueAdmitted(entry.message(timestamp))).await;
    }
}

fn rejection(entry: &WaitingQueueEntry, transition: QueueTransition) -> TicketingError {
    entry
        .status
        .apply(transition)
        .err()
        .unwrap_or_else(|| TicketingError::StateConflict(format!("queue entry {} changed concurrently", entry.id)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn estimated_wait_rounds_batches_up() {
        let interval = StdDuration::from_secs(10);
        assert_eq!(estimated_wait(0, 100, interval), StdDuration::ZERO);
        assert_eq!(estimated_wait(1, 100, interval), interval);
        assert_eq!(estimated_wait(100, 100, interval), interval);
        assert_eq!(estimated_wait(101, 100, interval), interval * 2);
        assert_eq!(estimated_wait(5, 0, interval), interval * 5);
    }

    #[test]
    fn admitted_serializes_as_processing() {
        assert_eq!(serde_json::to_string(&QueueStatus::Admitted).unwrap(), "\"PROCESSING\"");
        assert_eq!("PROCESSING".parse::<QueueStatus>(), Ok(QueueStatus::Admitted));
    }

    #[test]
    fn terminal_statuses_are_inactive() {
        assert!(QueueStatus::Entered.is_active());
        assert!(!QueueStatus::Expired.is_active());
        assert!(!QueueStatus::Cancelled.is_active());
        assert!(QueueStatus::Expired.apply(QueueTransition::Cancel).is_err());
        assert!(QueueStatus::Entered.apply(QueueTransition::Expire).is_err());
    }

    #[test]
    fn admission_lapses_at_window_end() {
        let now = chrono::Utc::now();
        let mut entry = WaitingQueueEntry::new(ConcertId::new(), UserId::from("u"), 1, now);
        entry.status = QueueStatus::Admitted;
        entry.admitted_at = Some(now);

        let window = Duration::minutes(5);
        assert!(!entry.admission_lapsed(window, now + Duration::minutes(4)));
        assert!(entry.admission_lapsed(window, now + window));
    }
}
