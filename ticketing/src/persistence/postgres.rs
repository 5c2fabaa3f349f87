//! `PostgreSQL` adapter for every store port.
//!
//! Conditional updates are single `UPDATE ... WHERE status = ANY($n) RETURNING`
//! statements. Lock acquisition and queue registration need a read and a write
//! to agree, so they run in a transaction that first takes a row lock
//! (`SELECT ... FOR UPDATE` on the lock row, an upsert on the concert's
//! `queue_sequences` row).

use crate::config::DatabaseConfig;
use crate::error::{Result, TicketingError};
use crate::payment::{Payment, PaymentStatus};
use crate::ports::{
    Conditional, GradeStore, LockAcquisition, PaymentStore, ReservationStore, SeatLockStore, SeatStore,
    WaitingQueueStore,
};
use crate::queue::{QueueStatus, WaitingQueueEntry};
use crate::reservation::{Reservation, ReservationDetail, ReservationStatus};
use crate::seat::{Grade, Seat, SeatLock, SeatStatus};
use crate::types::{
    ConcertId, GradeId, LockId, Money, PaymentId, QueueEntryId, ReservationId, SeatId, UserId,
};
use async_trait::async_trait;
use box_office_runtime::RetryPolicy;
use box_office_runtime::retry::retry_with_backoff;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

macro_rules! seat_columns {
    () => {
        "id, concert_id, grade_id, label, status"
    };
}

macro_rules! lock_columns {
    () => {
        "id, seat_id, user_id, locked_at, expires_at"
    };
}

macro_rules! entry_columns {
    () => {
        "id, concert_id, user_id, queue_position, status, registered_at, admitted_at, entered_at, updated_at"
    };
}

macro_rules! reservation_columns {
    () => {
        "id, user_id, concert_id, total_amount_cents, status, created_at, updated_at"
    };
}

macro_rules! payment_columns {
    () => {
        "id, reservation_id, user_id, amount_cents, method, status, gateway_payment_id, \
         retry_count, failure_reason, created_at, updated_at"
    };
}

/// All tables in `PostgreSQL`.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with retries, as the database may still be starting.
    ///
    /// # Errors
    ///
    /// `Validation` if no URL is configured, `Storage` once every attempt failed.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| TicketingError::Validation("DATABASE_URL is not set".to_string()))?;

        let policy = RetryPolicy::builder()
            .max_attempts(config.connect_attempts)
            .initial_delay(Duration::from_millis(500))
            .max_delay(Duration::from_secs(10))
            .build();

        let pool = retry_with_backoff(&policy, || {
            PgPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(Duration::from_secs(config.connect_timeout))
                .connect(url)
        })
        .await?;

        tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns error if migrations fail.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| TicketingError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_details(&self, reservation_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<ReservationDetail>>> {
        let rows = sqlx::query(
            r"
            SELECT reservation_id, seat_id, price_cents
            FROM reservation_details
            WHERE reservation_id = ANY($1)
            ORDER BY reservation_id, line
            ",
        )
        .bind(reservation_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut details: HashMap<Uuid, Vec<ReservationDetail>> = HashMap::new();
        for row in &rows {
            let reservation_id: Uuid = row.try_get("reservation_id")?;
            details.entry(reservation_id).or_default().push(ReservationDetail {
                seat_id: SeatId::from_uuid(row.try_get("seat_id")?),
                price: money_from_db(row.try_get("price_cents")?)?,
            });
        }
        Ok(details)
    }

    async fn reservations_from_rows(&self, rows: &[PgRow]) -> Result<Vec<Reservation>> {
        let ids = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut details = self.load_details(&ids).await?;
        rows.iter()
            .map(|row| {
                let id: Uuid = row.try_get("id")?;
                reservation_from_row(row, details.remove(&id).unwrap_or_default())
            })
            .collect()
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn to_db(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| TicketingError::Storage(format!("{what} out of range: {value}")))
}

fn from_db(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| TicketingError::Storage(format!("negative {what}: {value}")))
}

fn money_from_db(cents: i64) -> Result<Money> {
    from_db(cents, "amount").map(Money::from_cents)
}

fn statuses<S: Copy>(expected: &[S], as_str: fn(&S) -> &'static str) -> Vec<String> {
    expected.iter().map(|status| as_str(status).to_string()).collect()
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn seat_from_row(row: &PgRow) -> Result<Seat> {
    Ok(Seat {
        id: SeatId::from_uuid(row.try_get("id")?),
        concert_id: ConcertId::from_uuid(row.try_get("concert_id")?),
        grade_id: GradeId::from_uuid(row.try_get("grade_id")?),
        label: row.try_get("label")?,
        status: row.try_get::<String, _>("status")?.parse()?,
    })
}

fn lock_from_row(row: &PgRow) -> Result<SeatLock> {
    Ok(SeatLock {
        id: LockId::from_uuid(row.try_get("id")?),
        seat_id: SeatId::from_uuid(row.try_get("seat_id")?),
        user_id: UserId::new(row.try_get::<String, _>("user_id")?),
        locked_at: row.try_get("locked_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<WaitingQueueEntry> {
    Ok(WaitingQueueEntry {
        id: QueueEntryId::from_uuid(row.try_get("id")?),
        concert_id: ConcertId::from_uuid(row.try_get("concert_id")?),
        user_id: UserId::new(row.try_get::<String, _>("user_id")?),
        queue_position: from_db(row.try_get("queue_position")?, "queue position")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        registered_at: row.try_get("registered_at")?,
        admitted_at: row.try_get("admitted_at")?,
        entered_at: row.try_get("entered_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn reservation_from_row(row: &PgRow, details: Vec<ReservationDetail>) -> Result<Reservation> {
    Ok(Reservation {
        id: ReservationId::from_uuid(row.try_get("id")?),
        user_id: UserId::new(row.try_get::<String, _>("user_id")?),
        concert_id: ConcertId::from_uuid(row.try_get("concert_id")?),
        details,
        total_amount: money_from_db(row.try_get("total_amount_cents")?)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment> {
    let retry_count: i32 = row.try_get("retry_count")?;
    Ok(Payment {
        id: PaymentId::from_uuid(row.try_get("id")?),
        reservation_id: ReservationId::from_uuid(row.try_get("reservation_id")?),
        user_id: UserId::new(row.try_get::<String, _>("user_id")?),
        amount: money_from_db(row.try_get("amount_cents")?)?,
        method: row
            .try_get::<String, _>("method")?
            .parse()
            .map_err(TicketingError::Storage)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        gateway_payment_id: row.try_get("gateway_payment_id")?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| TicketingError::Storage(format!("negative retry count: {retry_count}")))?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ============================================================================
// Seats and grades
// ============================================================================

#[async_trait]
impl SeatStore for PostgresStore {
    async fn insert_seat(&self, seat: Seat) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO seats (id, concert_id, grade_id, label, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET concert_id = EXCLUDED.concert_id, grade_id = EXCLUDED.grade_id,
                label = EXCLUDED.label, status = EXCLUDED.status
            ",
        )
        .bind(*seat.id.as_uuid())
        .bind(*seat.concert_id.as_uuid())
        .bind(*seat.grade_id.as_uuid())
        .bind(&seat.label)
        .bind(seat.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_seat(&self, seat_id: SeatId) -> Result<Option<Seat>> {
        sqlx::query(concat!("SELECT ", seat_columns!(), " FROM seats WHERE id = $1"))
            .bind(*seat_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(seat_from_row)
            .transpose()
    }

    async fn compare_and_set_seat(
        &self,
        seat_id: SeatId,
        expected: &[SeatStatus],
        next: SeatStatus,
    ) -> Result<Conditional<Seat>> {
        let updated = sqlx::query(concat!(
            "UPDATE seats SET status = $3 WHERE id = $1 AND status = ANY($2) RETURNING ",
            seat_columns!()
        ))
        .bind(*seat_id.as_uuid())
        .bind(statuses(expected, SeatStatus::as_str))
        .bind(next.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(row) => Ok(Conditional::Updated(seat_from_row(&row)?)),
            None => Ok(self
                .find_seat(seat_id)
                .await?
                .map_or(Conditional::Missing, Conditional::Conflict)),
        }
    }

    async fn seats_of_concert(&self, concert_id: ConcertId) -> Result<Vec<Seat>> {
        sqlx::query(concat!("SELECT ", seat_columns!(), " FROM seats WHERE concert_id = $1 ORDER BY label"))
            .bind(*concert_id.as_uuid())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(seat_from_row)
            .collect()
    }

    async fn seats_of_grade(&self, grade_id: GradeId) -> Result<Vec<Seat>> {
        sqlx::query(concat!("SELECT ", seat_columns!(), " FROM seats WHERE grade_id = $1 ORDER BY label"))
            .bind(*grade_id.as_uuid())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(seat_from_row)
            .collect()
    }

    async fn seats_by_status(&self, concert_id: ConcertId, status: SeatStatus) -> Result<Vec<Seat>> {
        sqlx::query(concat!(
            "SELECT ",
            seat_columns!(),
            " FROM seats WHERE concert_id = $1 AND status = $2 ORDER BY label"
        ))
        .bind(*concert_id.as_uuid())
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(seat_from_row)
        .collect()
    }
}

#[async_trait]
impl GradeStore for PostgresStore {
    async fn insert_grade(&self, grade: Grade) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO grades (id, concert_id, name, price_cents)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET concert_id = EXCLUDED.concert_id, name = EXCLUDED.name, price_cents = EXCLUDED.price_cents
            ",
        )
        .bind(*grade.id.as_uuid())
        .bind(*grade.concert_id.as_uuid())
        .bind(&grade.name)
        .bind(to_db(grade.price.cents(), "price")?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_grade(&self, grade_id: GradeId) -> Result<Option<Grade>> {
        let row = sqlx::query("SELECT id, concert_id, name, price_cents FROM grades WHERE id = $1")
            .bind(*grade_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(Grade {
                id: GradeId::from_uuid(row.try_get("id")?),
                concert_id: ConcertId::from_uuid(row.try_get("concert_id")?),
                name: row.try_get("name")?,
                price: money_from_db(row.try_get("price_cents")?)?,
            })
        })
        .transpose()
    }
}

// ============================================================================
// Seat locks
// ============================================================================

#[async_trait]
impl SeatLockStore for PostgresStore {
    async fn acquire(&self, candidate: SeatLock, now: DateTime<Utc>) -> Result<LockAcquisition> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(concat!(
            "SELECT ",
            lock_columns!(),
            " FROM seat_locks WHERE seat_id = $1 FOR UPDATE"
        ))
        .bind(*candidate.seat_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(lock_from_row)
        .transpose()?;

        let replaced = match existing {
            Some(lock) if !lock.is_expired(now) => {
                tx.rollback().await?;
                return Ok(if lock.is_held_by(&candidate.user_id) {
                    LockAcquisition::AlreadyHeld(lock)
                } else {
                    LockAcquisition::HeldByOther(lock)
                });
            }
            Some(stale) => {
                sqlx::query("DELETE FROM seat_locks WHERE id = $1")
                    .bind(*stale.id.as_uuid())
                    .execute(&mut *tx)
                    .await?;
                Some(stale)
            }
            None => None,
        };

        let inserted = sqlx::query(
            r"
            INSERT INTO seat_locks (id, seat_id, user_id, locked_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (seat_id) DO NOTHING
            ",
        )
        .bind(*candidate.id.as_uuid())
        .bind(*candidate.seat_id.as_uuid())
        .bind(candidate.user_id.as_str())
        .bind(candidate.locked_at)
        .bind(candidate.expires_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // A concurrent acquirer inserted the first lock row for this seat.
            tx.rollback().await?;
            let winner = self
                .find_lock(candidate.seat_id)
                .await?
                .ok_or_else(|| TicketingError::Storage("seat lock vanished during acquire".to_string()))?;
            return Ok(if winner.is_held_by(&candidate.user_id) {
                LockAcquisition::AlreadyHeld(winner)
            } else {
                LockAcquisition::HeldByOther(winner)
            });
        }

        tx.commit().await?;
        Ok(LockAcquisition::Acquired {
            lock: candidate,
            replaced,
        })
    }

    async fn find_lock(&self, seat_id: SeatId) -> Result<Option<SeatLock>> {
        sqlx::query(concat!("SELECT ", lock_columns!(), " FROM seat_locks WHERE seat_id = $1"))
            .bind(*seat_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(lock_from_row)
            .transpose()
    }

    async fn update_expiry(
        &self,
        seat_id: SeatId,
        lock_id: LockId,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<SeatLock>> {
        sqlx::query(concat!(
            "UPDATE seat_locks SET expires_at = $3 WHERE seat_id = $1 AND id = $2 RETURNING ",
            lock_columns!()
        ))
        .bind(*seat_id.as_uuid())
        .bind(*lock_id.as_uuid())
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(lock_from_row)
        .transpose()
    }

    async fn delete_lock_if(&self, seat_id: SeatId, lock_id: LockId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM seat_locks WHERE seat_id = $1 AND id = $2")
            .bind(*seat_id.as_uuid())
            .bind(*lock_id.as_uuid())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<SeatLock>> {
        sqlx::query(concat!(
            "SELECT ",
            lock_columns!(),
            " FROM seat_locks WHERE expires_at <= $1 ORDER BY expires_at"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(lock_from_row)
        .collect()
    }
}

// ============================================================================
// Waiting queue
// ============================================================================

#[async_trait]
impl WaitingQueueStore for PostgresStore {
    async fn register_next(
        &self,
        concert_id: ConcertId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<WaitingQueueEntry> {
        let already_registered = || TicketingError::AlreadyRegistered {
            concert_id,
            user_id: user_id.clone(),
        };
        let mut tx = self.pool.begin().await?;

        // Row-locks the concert's sequence until commit: one registration per concert at a time.
        let (position,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO queue_sequences (concert_id, last_position)
            VALUES ($1, 1)
            ON CONFLICT (concert_id) DO UPDATE
            SET last_position = queue_sequences.last_position + 1
            RETURNING last_position
            ",
        )
        .bind(*concert_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        let (active,): (bool,) = sqlx::query_as(
            r"
            SELECT EXISTS (
                SELECT 1 FROM waiting_queue_entries
                WHERE concert_id = $1 AND user_id = $2
                  AND status IN ('WAITING', 'PROCESSING', 'ENTERED')
            )
            ",
        )
        .bind(*concert_id.as_uuid())
        .bind(user_id.as_str())
        .fetch_one(&mut *tx)
        .await?;
        if active {
            tx.rollback().await?;
            return Err(already_registered());
        }

        let entry = WaitingQueueEntry::new(concert_id, user_id.clone(), from_db(position, "queue position")?, now);
        let inserted = sqlx::query(
            r"
            INSERT INTO waiting_queue_entries
                (id, concert_id, user_id, queue_position, status, registered_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ",
        )
        .bind(*entry.id.as_uuid())
        .bind(*concert_id.as_uuid())
        .bind(user_id.as_str())
        .bind(position)
        .bind(entry.status.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(already_registered()),
            Err(e) => return Err(e.into()),
        }
        tx.commit().await?;
        Ok(entry)
    }

    async fn find_entry(&self, entry_id: QueueEntryId) -> Result<Option<WaitingQueueEntry>> {
        sqlx::query(concat!("SELECT ", entry_columns!(), " FROM waiting_queue_entries WHERE id = $1"))
            .bind(*entry_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(entry_from_row)
            .transpose()
    }

    async fn find_active_entry(
        &self,
        concert_id: ConcertId,
        user_id: &UserId,
    ) -> Result<Option<WaitingQueueEntry>> {
        sqlx::query(concat!(
            "SELECT ",
            entry_columns!(),
            " FROM waiting_queue_entries WHERE concert_id = $1 AND user_id = $2 \
             AND status IN ('WAITING', 'PROCESSING', 'ENTERED')"
        ))
        .bind(*concert_id.as_uuid())
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(entry_from_row)
        .transpose()
    }

    async fn transition_entry(
        &self,
        entry_id: QueueEntryId,
        expected: &[QueueStatus],
        next: QueueStatus,
        now: DateTime<Utc>,
    ) -> Result<Conditional<WaitingQueueEntry>> {
        let updated = sqlx::query(concat!(
            "UPDATE waiting_queue_entries SET status = $3, updated_at = $4, \
             admitted_at = CASE WHEN $3 = 'PROCESSING' THEN $4 ELSE admitted_at END, \
             entered_at = CASE WHEN $3 = 'ENTERED' THEN $4 ELSE entered_at END \
             WHERE id = $1 AND status = ANY($2) RETURNING ",
            entry_columns!()
        ))
        .bind(*entry_id.as_uuid())
        .bind(statuses(expected, QueueStatus::as_str))
        .bind(next.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(row) => Ok(Conditional::Updated(entry_from_row(&row)?)),
            None => Ok(self
                .find_entry(entry_id)
                .await?
                .map_or(Conditional::Missing, Conditional::Conflict)),
        }
    }

    async fn lowest_waiting(&self, concert_id: ConcertId, limit: usize) -> Result<Vec<WaitingQueueEntry>> {
        sqlx::query(concat!(
            "SELECT ",
            entry_columns!(),
            " FROM waiting_queue_entries WHERE concert_id = $1 AND status = 'WAITING' \
             ORDER BY queue_position LIMIT $2"
        ))
        .bind(*concert_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(entry_from_row)
        .collect()
    }

    async fn count_waiting_before(&self, concert_id: ConcertId, position: u64) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM waiting_queue_entries
            WHERE concert_id = $1 AND status = 'WAITING' AND queue_position < $2
            ",
        )
        .bind(*concert_id.as_uuid())
        .bind(to_db(position, "queue position")?)
        .fetch_one(&self.pool)
        .await?;
        from_db(count, "count")
    }

    async fn admitted_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<WaitingQueueEntry>> {
        sqlx::query(concat!(
            "SELECT ",
            entry_columns!(),
            " FROM waiting_queue_entries WHERE status = 'PROCESSING' AND admitted_at <= $1 \
             ORDER BY admitted_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(entry_from_row)
        .collect()
    }
}

// ============================================================================
// Reservations
// ============================================================================

#[async_trait]
impl ReservationStore for PostgresStore {
    async fn insert_reservation(&self, reservation: Reservation) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO reservations (id, user_id, concert_id, total_amount_cents, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(*reservation.id.as_uuid())
        .bind(reservation.user_id.as_str())
        .bind(*reservation.concert_id.as_uuid())
        .bind(to_db(reservation.total_amount.cents(), "total")?)
        .bind(reservation.status.as_str())
        .bind(reservation.created_at)
        .bind(reservation.updated_at)
        .execute(&mut *tx)
        .await?;

        for (line, detail) in reservation.details.iter().enumerate() {
            sqlx::query(
                r"
                INSERT INTO reservation_details (reservation_id, seat_id, price_cents, line)
                VALUES ($1, $2, $3, $4)
                ",
            )
            .bind(*reservation.id.as_uuid())
            .bind(*detail.seat_id.as_uuid())
            .bind(to_db(detail.price.cents(), "price")?)
            .bind(i32::try_from(line).unwrap_or(i32::MAX))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>> {
        let row = sqlx::query(concat!("SELECT ", reservation_columns!(), " FROM reservations WHERE id = $1"))
            .bind(*reservation_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(self.reservations_from_rows(&[row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn reservations_of_user(&self, user_id: &UserId) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            reservation_columns!(),
            " FROM reservations WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        self.reservations_from_rows(&rows).await
    }

    async fn pending_reservations(&self) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            reservation_columns!(),
            " FROM reservations WHERE status = $1 ORDER BY created_at"
        ))
        .bind(ReservationStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;
        self.reservations_from_rows(&rows).await
    }

    async fn transition_reservation(
        &self,
        reservation_id: ReservationId,
        expected: &[ReservationStatus],
        next: ReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<Conditional<Reservation>> {
        let updated = sqlx::query(
            "UPDATE reservations SET status = $3, updated_at = $4 WHERE id = $1 AND status = ANY($2)",
        )
        .bind(*reservation_id.as_uuid())
        .bind(statuses(expected, ReservationStatus::as_str))
        .bind(next.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let current = self.find_reservation(reservation_id).await?;
        Ok(match current {
            Some(reservation) if updated > 0 => Conditional::Updated(reservation),
            Some(reservation) => Conditional::Conflict(reservation),
            None => Conditional::Missing,
        })
    }
}

// ============================================================================
// Payments
// ============================================================================

#[async_trait]
impl PaymentStore for PostgresStore {
    async fn insert_payment(&self, payment: Payment) -> Result<()> {
        let inserted = sqlx::query(
            r"
            INSERT INTO payments (
                id, reservation_id, user_id, amount_cents, method, status,
                gateway_payment_id, retry_count, failure_reason, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(*payment.id.as_uuid())
        .bind(*payment.reservation_id.as_uuid())
        .bind(payment.user_id.as_str())
        .bind(to_db(payment.amount.cents(), "amount")?)
        .bind(payment.method.as_str())
        .bind(payment.status.as_str())
        .bind(payment.gateway_payment_id.as_deref())
        .bind(i32::try_from(payment.retry_count).unwrap_or(i32::MAX))
        .bind(payment.failure_reason.as_deref())
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(TicketingError::StateConflict(format!(
                "reservation {} already has a payment",
                payment.reservation_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_payment(&self, payment_id: PaymentId) -> Result<Option<Payment>> {
        sqlx::query(concat!("SELECT ", payment_columns!(), " FROM payments WHERE id = $1"))
            .bind(*payment_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(payment_from_row)
            .transpose()
    }

    async fn find_payment_by_reservation(&self, reservation_id: ReservationId) -> Result<Option<Payment>> {
        sqlx::query(concat!("SELECT ", payment_columns!(), " FROM payments WHERE reservation_id = $1"))
            .bind(*reservation_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(payment_from_row)
            .transpose()
    }

    async fn find_payment_by_gateway_id(&self, gateway_payment_id: &str) -> Result<Option<Payment>> {
        sqlx::query(concat!("SELECT ", payment_columns!(), " FROM payments WHERE gateway_payment_id = $1"))
            .bind(gateway_payment_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(payment_from_row)
            .transpose()
    }

    async fn pending_payments(&self) -> Result<Vec<Payment>> {
        sqlx::query(concat!(
            "SELECT ",
            payment_columns!(),
            " FROM payments WHERE status = 'PENDING' ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(payment_from_row)
        .collect()
    }

    async fn record_attempt(
        &self,
        payment_id: PaymentId,
        gateway_payment_id: Option<&str>,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<Conditional<Payment>> {
        let updated = sqlx::query(concat!(
            "UPDATE payments SET gateway_payment_id = $2, retry_count = $3, updated_at = $4 \
             WHERE id = $1 AND status = 'PENDING' RETURNING ",
            payment_columns!()
        ))
        .bind(*payment_id.as_uuid())
        .bind(gateway_payment_id)
        .bind(i32::try_from(retry_count).unwrap_or(i32::MAX))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(row) => Ok(Conditional::Updated(payment_from_row(&row)?)),
            None => Ok(self
                .find_payment(payment_id)
                .await?
                .map_or(Conditional::Missing, Conditional::Conflict)),
        }
    }

    async fn transition_payment(
        &self,
        payment_id: PaymentId,
        expected: &[PaymentStatus],
        next: PaymentStatus,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Conditional<Payment>> {
        let updated = sqlx::query(concat!(
            "UPDATE payments SET status = $3, failure_reason = COALESCE($4, failure_reason), updated_at = $5 \
             WHERE id = $1 AND status = ANY($2) RETURNING ",
            payment_columns!()
        ))
        .bind(*payment_id.as_uuid())
        .bind(statuses(expected, PaymentStatus::as_str))
        .bind(next.as_str())
        .bind(failure_reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(row) => Ok(Conditional::Updated(payment_from_row(&row)?)),
            None => Ok(self
                .find_payment(payment_id)
                .await?
                .map_or(Conditional::Missing, Conditional::Conflict)),
        }
    }
}
