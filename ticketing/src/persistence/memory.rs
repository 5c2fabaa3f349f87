//! In-memory adapter for every store port.
//!
//! Each table sits behind its own mutex and every port call takes exactly one
//! guard, so a conditional update's check and write happen under the same
//! guard. Used by tests and the demo binary.

use crate::error::{Result, TicketingError};
use crate::payment::{Payment, PaymentStatus};
use crate::ports::{
    Conditional, GradeStore, LockAcquisition, PaymentStore, ReservationStore, SeatLockStore, SeatStore,
    WaitingQueueStore,
};
use crate::queue::{QueueStatus, WaitingQueueEntry};
use crate::reservation::{Reservation, ReservationStatus};
use crate::seat::{Grade, Seat, SeatLock, SeatStatus};
use crate::types::{ConcertId, GradeId, LockId, PaymentId, QueueEntryId, ReservationId, SeatId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct QueueTable {
    entries: HashMap<QueueEntryId, WaitingQueueEntry>,
    sequences: HashMap<ConcertId, u64>,
}

#[derive(Debug, Default)]
struct ReservationTable {
    rows: HashMap<ReservationId, (u64, Reservation)>,
    next_seq: u64,
}

/// All tables in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    seats: Mutex<HashMap<SeatId, Seat>>,
    grades: Mutex<HashMap<GradeId, Grade>>,
    locks: Mutex<HashMap<SeatId, SeatLock>>,
    queue: Mutex<QueueTable>,
    reservations: Mutex<ReservationTable>,
    payments: Mutex<HashMap<PaymentId, Payment>>,
}

impl InMemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn table<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| TicketingError::Storage("in-memory table lock poisoned".to_string()))
}

#[async_trait]
impl SeatStore for InMemoryStore {
    async fn insert_seat(&self, seat: Seat) -> Result<()> {
        table(&self.seats)?.insert(seat.id, seat);
        Ok(())
    }

    async fn find_seat(&self, seat_id: SeatId) -> Result<Option<Seat>> {
        Ok(table(&self.seats)?.get(&seat_id).cloned())
    }

    async fn compare_and_set_seat(
        &self,
        seat_id: SeatId,
        expected: &[SeatStatus],
        next: SeatStatus,
    ) -> Result<Conditional<Seat>> {
        let mut seats = table(&self.seats)?;
        Ok(match seats.get_mut(&seat_id) {
            Some(seat) if expected.contains(&seat.status) => {
                seat.status = next;
                Conditional::Updated(seat.clone())
            }
            Some(seat) => Conditional::Conflict(seat.clone()),
            None => Conditional::Missing,
        })
    }

    async fn seats_of_concert(&self, concert_id: ConcertId) -> Result<Vec<Seat>> {
        Ok(sorted_seats(&*table(&self.seats)?, |seat| seat.concert_id == concert_id))
    }

    async fn seats_of_grade(&self, grade_id: GradeId) -> Result<Vec<Seat>> {
        Ok(sorted_seats(&*table(&self.seats)?, |seat| seat.grade_id == grade_id))
    }

    async fn seats_by_status(&self, concert_id: ConcertId, status: SeatStatus) -> Result<Vec<Seat>> {
        Ok(sorted_seats(&*table(&self.seats)?, |seat| {
            seat.concert_id == concert_id && seat.status == status
        }))
    }
}

fn sorted_seats(seats: &HashMap<SeatId, Seat>, keep: impl Fn(&Seat) -> bool) -> Vec<Seat> {
    let mut matching: Vec<Seat> = seats.values().filter(|seat| keep(seat)).cloned().collect();
    matching.sort_by(|a, b| a.label.cmp(&b.label));
    matching
}

#[async_trait]
impl GradeStore for InMemoryStore {
    async fn insert_grade(&self, grade: Grade) -> Result<()> {
        table(&self.grades)?.insert(grade.id, grade);
        Ok(())
    }

    async fn find_grade(&self, grade_id: GradeId) -> Result<Option<Grade>> {
        Ok(table(&self.grades)?.get(&grade_id).cloned())
    }
}

#[async_trait]
impl SeatLockStore for InMemoryStore {
    async fn acquire(&self, candidate: SeatLock, now: DateTime<Utc>) -> Result<LockAcquisition> {
        let mut locks = table(&self.locks)?;
        if let Some(existing) = locks.get(&candidate.seat_id) {
            if !existing.is_expired(now) {
                return Ok(if existing.is_held_by(&candidate.user_id) {
                    LockAcquisition::AlreadyHeld(existing.clone())
                } else {
                    LockAcquisition::HeldByOther(existing.clone())
                });
            }
        }
        let replaced = locks.insert(candidate.seat_id, candidate.clone());
        Ok(LockAcquisition::Acquired {
            lock: candidate,
            replaced,
        })
    }

    async fn find_lock(&self, seat_id: SeatId) -> Result<Option<SeatLock>> {
        Ok(table(&self.locks)?.get(&seat_id).cloned())
    }

    async fn update_expiry(
        &self,
        seat_id: SeatId,
        lock_id: LockId,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<SeatLock>> {
        let mut locks = table(&self.locks)?;
        Ok(locks.get_mut(&seat_id).filter(|lock| lock.id == lock_id).map(|lock| {
            lock.expires_at = expires_at;
            lock.clone()
        }))
    }

    async fn delete_lock_if(&self, seat_id: SeatId, lock_id: LockId) -> Result<bool> {
        let mut locks = table(&self.locks)?;
        if locks.get(&seat_id).is_some_and(|lock| lock.id == lock_id) {
            locks.remove(&seat_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<SeatLock>> {
        Ok(table(&self.locks)?
            .values()
            .filter(|lock| lock.is_expired(now))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WaitingQueueStore for InMemoryStore {
    async fn register_next(
        &self,
        concert_id: ConcertId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<WaitingQueueEntry> {
        let mut queue = table(&self.queue)?;
        let already_active = queue
            .entries
            .values()
            .any(|entry| entry.concert_id == concert_id && &entry.user_id == user_id && entry.status.is_active());
        if already_active {
            return Err(TicketingError::AlreadyRegistered {
                concert_id,
                user_id: user_id.clone(),
            });
        }

        let sequence = queue.sequences.entry(concert_id).or_insert(0);
        *sequence += 1;
        let entry = WaitingQueueEntry::new(concert_id, user_id.clone(), *sequence, now);
        queue.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn find_entry(&self, entry_id: QueueEntryId) -> Result<Option<WaitingQueueEntry>> {
        Ok(table(&self.queue)?.entries.get(&entry_id).cloned())
    }

    async fn find_active_entry(
        &self,
        concert_id: ConcertId,
        user_id: &UserId,
    ) -> Result<Option<WaitingQueueEntry>> {
        Ok(table(&self.queue)?
            .entries
            .values()
            .find(|entry| entry.concert_id == concert_id && &entry.user_id == user_id && entry.status.is_active())
            .cloned())
    }

    async fn transition_entry(
        &self,
        entry_id: QueueEntryId,
        expected: &[QueueStatus],
        next: QueueStatus,
        now: DateTime<Utc>,
    ) -> Result<Conditional<WaitingQueueEntry>> {
        let mut queue = table(&self.queue)?;
        Ok(match queue.entries.get_mut(&entry_id) {
            Some(entry) if expected.contains(&entry.status) => {
                entry.status = next;
                entry.updated_at = now;
                match next {
                    QueueStatus::Admitted => entry.admitted_at = Some(now),
                    QueueStatus::Entered => entry.entered_at = Some(now),
                    _ => {}
                }
                Conditional::Updated(entry.clone())
            }
            Some(entry) => Conditional::Conflict(entry.clone()),
            None => Conditional::Missing,
        })
    }

    async fn lowest_waiting(&self, concert_id: ConcertId, limit: usize) -> Result<Vec<WaitingQueueEntry>> {
        let queue = table(&self.queue)?;
        let mut waiting: Vec<WaitingQueueEntry> = queue
            .entries
            .values()
            .filter(|entry| entry.concert_id == concert_id && entry.status == QueueStatus::Waiting)
            .cloned()
            .collect();
        waiting.sort_by_key(|entry| entry.queue_position);
        waiting.truncate(limit);
        Ok(waiting)
    }

    async fn count_waiting_before(&self, concert_id: ConcertId, position: u64) -> Result<u64> {
        let queue = table(&self.queue)?;
        let ahead = queue
            .entries
            .values()
            .filter(|entry| {
                entry.concert_id == concert_id
                    && entry.status == QueueStatus::Waiting
                    && entry.queue_position < position
            })
            .count();
        Ok(ahead as u64)
    }

    async fn admitted_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<WaitingQueueEntry>> {
        Ok(table(&self.queue)?
            .entries
            .values()
            .filter(|entry| {
                entry.status == QueueStatus::Admitted && entry.admitted_at.is_some_and(|at| at <= cutoff)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    async fn insert_reservation(&self, reservation: Reservation) -> Result<()> {
        let mut reservations = table(&self.reservations)?;
        if reservations.rows.contains_key(&reservation.id) {
            return Err(TicketingError::StateConflict(format!(
                "reservation {} already exists",
                reservation.id
            )));
        }
        reservations.next_seq += 1;
        let seq = reservations.next_seq;
        reservations.rows.insert(reservation.id, (seq, reservation));
        Ok(())
    }

    async fn find_reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>> {
        Ok(table(&self.reservations)?
            .rows
            .get(&reservation_id)
            .map(|(_, reservation)| reservation.clone()))
    }

    async fn reservations_of_user(&self, user_id: &UserId) -> Result<Vec<Reservation>> {
        let reservations = table(&self.reservations)?;
        let mut owned: Vec<&(u64, Reservation)> = reservations
            .rows
            .values()
            .filter(|(_, reservation)| &reservation.user_id == user_id)
            .collect();
        owned.sort_by(|(seq_a, a), (seq_b, b)| b.created_at.cmp(&a.created_at).then(seq_b.cmp(seq_a)));
        Ok(owned.into_iter().map(|(_, reservation)| reservation.clone()).collect())
    }

    async fn pending_reservations(&self) -> Result<Vec<Reservation>> {
        let reservations = table(&self.reservations)?;
        let mut pending: Vec<&(u64, Reservation)> = reservations
            .rows
            .values()
            .filter(|(_, reservation)| reservation.status == ReservationStatus::Pending)
            .collect();
        pending.sort_by(|(seq_a, a), (seq_b, b)| a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b)));
        Ok(pending.into_iter().map(|(_, reservation)| reservation.clone()).collect())
    }

    async fn transition_reservation(
        &self,
        reservation_id: ReservationId,
        expected: &[ReservationStatus],
        next: ReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<Conditional<Reservation>> {
        let mut reservations = table(&self.reservations)?;
        Ok(match reservations.rows.get_mut(&reservation_id) {
            Some((_, reservation)) if expected.contains(&reservation.status) => {
                reservation.status = next;
                reservation.updated_at = now;
                Conditional::Updated(reservation.clone())
            }
            Some((_, reservation)) => Conditional::Conflict(reservation.clone()),
            None => Conditional::Missing,
        })
    }
}

#[async_trait]
impl PaymentStore for InMemoryStore {
    async fn insert_payment(&self, payment: Payment) -> Result<()> {
        let mut payments = table(&self.payments)?;
        if let Some(existing) = payments
            .values()
            .find(|existing| existing.reservation_id == payment.reservation_id)
        {
            return Err(TicketingError::StateConflict(format!(
                "reservation {} already has payment {}",
                payment.reservation_id, existing.id
            )));
        }
        payments.insert(payment.id, payment);
        Ok(())
    }

    async fn find_payment(&self, payment_id: PaymentId) -> Result<Option<Payment>> {
        Ok(table(&self.payments)?.get(&payment_id).cloned())
    }

    async fn find_payment_by_reservation(&self, reservation_id: ReservationId) -> Result<Option<Payment>> {
        Ok(table(&self.payments)?
            .values()
            .find(|payment| payment.reservation_id == reservation_id)
            .cloned())
    }

    async fn find_payment_by_gateway_id(&self, gateway_payment_id: &str) -> Result<Option<Payment>> {
        Ok(table(&self.payments)?
            .values()
            .find(|payment| payment.gateway_payment_id.as_deref() == Some(gateway_payment_id))
            .cloned())
    }

    async fn pending_payments(&self) -> Result<Vec<Payment>> {
        let payments = table(&self.payments)?;
        let mut pending: Vec<Payment> = payments
            .values()
            .filter(|payment| payment.status == PaymentStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|payment| payment.created_at);
        Ok(pending)
    }

    async fn record_attempt(
        &self,
        payment_id: PaymentId,
        gateway_payment_id: Option<&str>,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<Conditional<Payment>> {
        let mut payments = table(&self.payments)?;
        Ok(match payments.get_mut(&payment_id) {
            Some(payment) if payment.status == PaymentStatus::Pending => {
                payment.gateway_payment_id = gateway_payment_id.map(str::to_string);
                payment.retry_count = retry_count;
                payment.updated_at = now;
                Conditional::Updated(payment.clone())
            }
            Some(payment) => Conditional::Conflict(payment.clone()),
            None => Conditional::Missing,
        })
    }

    async fn transition_payment(
        &self,
        payment_id: PaymentId,
        expected: &[PaymentStatus],
        next: PaymentStatus,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Conditional<Payment>> {
        let mut payments = table(&self.payments)?;
        Ok(match payments.get_mut(&payment_id) {
            Some(payment) if expected.contains(&payment.status) => {
                payment.status = next;
                if failure_reason.is_some() {
                    payment.failure_reason = failure_reason;
                }
                payment.updated_at = now;
                Conditional::Updated(payment.clone())
            }
            Some(payment) => Conditional::Conflict(payment.clone()),
            None => Conditional::Missing,
        })
    }
}
