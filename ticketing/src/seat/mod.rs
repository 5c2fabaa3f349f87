//! Seats, grades and seat locks.
//!
//! A seat moves `AVAILABLE → SELECTED → RESERVED → SOLD`. The only way back is
//! `reset` to AVAILABLE, which is legal from every status except SOLD. The
//! [`SeatLedger`] applies these transitions as compare-and-set writes; the
//! [`SeatLockManager`] layers time-limited exclusive holds on top.

pub mod ledger;
pub mod lock;

pub use ledger::SeatLedger;
pub use lock::{SeatLock, SeatLockManager};

use crate::error::{Result, TicketingError};
use crate::types::{ConcertId, GradeId, Money, SeatId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a seat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    /// Free to select
    Available,
    /// Held by a user's seat lock
    Selected,
    /// Part of a reservation awaiting payment
    Reserved,
    /// Paid for; terminal
    Sold,
}

/// A seat state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeatTransition {
    /// `AVAILABLE → SELECTED`
    Select,
    /// `SELECTED | AVAILABLE → RESERVED`
    Reserve,
    /// `RESERVED → SOLD`
    Sell,
    /// `RESERVED → SELECTED`, undoing a reserve that never became a reservation
    Unreserve,
    /// anything but `SOLD` → `AVAILABLE`
    Reset,
}

impl SeatTransition {
    /// Statuses the transition may start from.
    #[must_use]
    pub const fn allowed_from(self) -> &'static [SeatStatus] {
        match self {
            Self::Select => &[SeatStatus::Available],
            Self::Reserve => &[SeatStatus::Selected, SeatStatus::Available],
            Self::Sell | Self::Unreserve => &[SeatStatus::Reserved],
            Self::Reset => &[SeatStatus::Available, SeatStatus::Selected, SeatStatus::Reserved],
        }
    }

    /// Status after the transition.
    #[must_use]
    pub const fn target(self) -> SeatStatus {
        match self {
            Self::Select => SeatStatus::Selected,
            Self::Reserve => SeatStatus::Reserved,
            Self::Sell => SeatStatus::Sold,
            Self::Unreserve => SeatStatus::Selected,
            Self::Reset => SeatStatus::Available,
        }
    }

    const fn verb(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Reserve => "reserve",
            Self::Sell => "sell",
            Self::Unreserve => "unreserve",
            Self::Reset => "reset",
        }
    }
}

impl SeatStatus {
    /// Apply a transition.
    ///
    /// # Errors
    ///
    /// [`TicketingError::StateConflict`] if the transition is not legal from `self`.
    pub fn apply(self, transition: SeatTransition) -> Result<Self> {
        if transition.allowed_from().contains(&self) {
            Ok(transition.target())
        } else {
            Err(TicketingError::StateConflict(format!(
                "cannot {} a seat that is {self}",
                transition.verb()
            )))
        }
    }

    /// Stable string form, used for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Selected => "SELECTED",
            Self::Reserved => "RESERVED",
            Self::Sold => "SOLD",
        }
    }
}

impl fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeatStatus {
    type Err = TicketingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AVAILABLE" => Ok(Self::Available),
            "SELECTED" => Ok(Self::Selected),
            "RESERVED" => Ok(Self::Reserved),
            "SOLD" => Ok(Self::Sold),
            other => Err(TicketingError::Storage(format!("unknown seat status: {other}"))),
        }
    }
}

/// A seat of a concert.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    /// Seat id
    pub id: SeatId,
    /// Concert the seat belongs to
    pub concert_id: ConcertId,
    /// Price tier
    pub grade_id: GradeId,
    /// Human-readable label ("A-12")
    pub label: String,
    /// Current status
    pub status: SeatStatus,
}

impl Seat {
    /// A new AVAILABLE seat.
    #[must_use]
    pub fn new(concert_id: ConcertId, grade_id: GradeId, label: impl Into<String>) -> Self {
        Self {
            id: SeatId::new(),
            concert_id,
            grade_id,
            label: label.into(),
            status: SeatStatus::Available,
        }
    }
}

/// A price tier of a concert.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grade {
    /// Grade id
    pub id: GradeId,
    /// Concert the grade belongs to
    pub concert_id: ConcertId,
    /// Display name ("VIP", "R", ...)
    pub name: String,
    /// Price of one seat
    pub price: Money,
}

impl Grade {
    /// A new grade.
    #[must_use]
    pub fn new(concert_id: ConcertId, name: impl Into<String>, price: Money) -> Self {
        Self {
            id: GradeId::new(),
            concert_id,
            name: name.into(),
            price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SeatStatus; 4] = [
        SeatStatus::Available,
        SeatStatus::Selected,
        SeatStatus::Reserved,
        SeatStatus::Sold,
    ];

    #[test]
    fn forward_path_reaches_sold() {
        let status = SeatStatus::Available
            .apply(SeatTransition::Select)
            .and_then(|s| s.apply(SeatTransition::Reserve))
            .and_then(|s| s.apply(SeatTransition::Sell));
        assert_eq!(status, Ok(SeatStatus::Sold));
    }

    #[test]
    fn sold_is_terminal() {
        for transition in [
            SeatTransition::Select,
            SeatTransition::Reserve,
            SeatTransition::Sell,
            SeatTransition::Unreserve,
            SeatTransition::Reset,
        ] {
            assert!(SeatStatus::Sold.apply(transition).is_err());
        }
    }

    #[test]
    fn sell_requires_reserved() {
        for status in ALL {
            let result = status.apply(SeatTransition::Sell);
            assert_eq!(result.is_ok(), status == SeatStatus::Reserved);
        }
    }

    #[test]
    fn reserve_accepts_selected_or_available() {
        assert_eq!(SeatStatus::Available.apply(SeatTransition::Reserve), Ok(SeatStatus::Reserved));
        assert_eq!(SeatStatus::Selected.apply(SeatTransition::Reserve), Ok(SeatStatus::Reserved));
        assert!(SeatStatus::Reserved.apply(SeatTransition::Reserve).is_err());
    }

    #[test]
    fn unreserve_only_undoes_a_reserve() {
        assert_eq!(SeatStatus::Reserved.apply(SeatTransition::Unreserve), Ok(SeatStatus::Selected));
        assert!(SeatStatus::Available.apply(SeatTransition::Unreserve).is_err());
        assert!(SeatStatus::Selected.apply(SeatTransition::Unreserve).is_err());
    }

    #[test]
    fn status_string_form_matches_serde() {
        for status in ALL {
            let json = serde_json::to_string(&status).unwrap_or_default();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<SeatStatus>(), Ok(status));
        }
    }
}
