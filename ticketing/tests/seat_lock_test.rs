//! Seat hold scenarios: contention, expiry, sweeping and sale.

#![allow(clippy::unwrap_used)]

mod common;

use common::Harness;
use futures::future::join_all;
use ticketing::payment::ScriptedPaymentGateway;
use ticketing::{SeatStatus, TicketingError, UserId};

#[tokio::test]
async fn expired_hold_is_swept_and_the_seat_can_be_taken() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");
    let seat = h.seats[0].id;
    let locks = h.office.locks();

    let held = locks.lock(seat, &alice, 10).await.unwrap();
    assert_eq!(h.office.ledger().find(seat).await.unwrap().status, SeatStatus::Selected);

    let err = locks.lock(seat, &bob, 10).await.unwrap_err();
    assert_eq!(err, TicketingError::AlreadyLocked { seat_id: seat });

    h.clock.advance(chrono::Duration::minutes(11));
    assert!(locks.is_expired(seat).await.unwrap());

    let report = locks.unlock_expired().await.unwrap();
    assert_eq!(report.released, 1);
    assert!(locks.current_lock(seat).await.unwrap().is_none());
    assert_eq!(h.office.ledger().find(seat).await.unwrap().status, SeatStatus::Available);

    let taken = locks.lock(seat, &bob, 10).await.unwrap();
    assert_ne!(taken.id, held.id);
    assert!(locks.is_locked_by_user(seat, &bob).await.unwrap());
    assert!(!locks.is_locked_by_user(seat, &alice).await.unwrap());
}

#[tokio::test]
async fn sweep_leaves_live_holds_alone() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    let alice = UserId::from("alice");
    let locks = h.office.locks();

    locks.lock(h.seats[0].id, &alice, 5).await.unwrap();
    locks.lock(h.seats[1].id, &alice, 30).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(6));

    let report = locks.unlock_expired().await.unwrap();
    assert_eq!(report.released, 1);
    assert!(locks.current_lock(h.seats[0].id).await.unwrap().is_none());
    assert!(locks.is_locked_by_user(h.seats[1].id, &alice).await.unwrap());
}

#[tokio::test]
async fn confirmed_seat_is_sold_for_good() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");
    let seat = h.seats[0].id;
    let locks = h.office.locks();

    locks.lock(seat, &alice, 10).await.unwrap();
    let err = locks.confirm(seat, &bob).await.unwrap_err();
    assert!(matches!(err, TicketingError::OwnershipViolation(_)));
    let err = locks.confirm(seat, &alice).await.unwrap_err();
    assert!(matches!(err, TicketingError::StateConflict(_)));

    h.office.ledger().reserve(seat).await.unwrap();
    let sold = locks.confirm(seat, &alice).await.unwrap();
    assert_eq!(sold.status, SeatStatus::Sold);
    assert!(locks.current_lock(seat).await.unwrap().is_none());

    let err = locks.lock(seat, &bob, 10).await.unwrap_err();
    assert!(matches!(err, TicketingError::StateConflict(_)));
    locks.release_by_authority(seat).await.unwrap();
    assert_eq!(h.office.ledger().find(seat).await.unwrap().status, SeatStatus::Sold);
}

#[tokio::test]
async fn confirm_after_expiry_is_refused() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    let alice = UserId::from("alice");
    let seat = h.seats[0].id;

    h.office.locks().lock(seat, &alice, 10).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(10));

    let err = h.office.locks().confirm(seat, &alice).await.unwrap_err();
    assert!(matches!(err, TicketingError::Expired(_)));
    assert_ne!(h.office.ledger().find(seat).await.unwrap().status, SeatStatus::Sold);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_holds_on_one_seat_have_a_single_winner() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    let seat = h.seats[0].id;

    let attempts = (0..32).map(|n| {
        let locks = h.office.locks().clone();
        let user = UserId::new(format!("user-{n}"));
        tokio::spawn(async move { locks.lock(seat, &user, 10).await })
    });
    let results: Vec<_> = join_all(attempts).await.into_iter().map(Result::unwrap).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| *e == TicketingError::AlreadyLocked { seat_id: seat })
    );

    let holder = h.office.locks().current_lock(seat).await.unwrap().unwrap();
    assert_eq!(holder.id, winners[0].id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirmations_sell_each_seat_once() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    let alice = UserId::from("alice");
    let seat = h.seats[0].id;
    h.office.locks().lock(seat, &alice, 10).await.unwrap();
    h.office.ledger().reserve(seat).await.unwrap();

    let confirmations = (0..8).map(|_| {
        let locks = h.office.locks().clone();
        let alice = alice.clone();
        tokio::spawn(async move { locks.confirm(seat, &alice).await })
    });
    let sold = join_all(confirmations)
        .await
        .into_iter()
        .map(Result::unwrap)
        .filter(Result::is_ok)
        .count();

    assert_eq!(sold, 1);
    assert_eq!(h.office.ledger().find(seat).await.unwrap().status, SeatStatus::Sold);
}

#[tokio::test]
async fn unlocking_twice_matches_unlocking_once() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    let seat = h.seats[0].id;
    let locks = h.office.locks();

    locks.lock(seat, &UserId::from("alice"), 10).await.unwrap();
    locks.unlock(seat).await.unwrap();
    let once = h.office.ledger().find(seat).await.unwrap();

    locks.unlock(seat).await.unwrap();
    assert_eq!(h.office.ledger().find(seat).await.unwrap(), once);
    assert_eq!(once.status, SeatStatus::Available);
    assert!(locks.current_lock(seat).await.unwrap().is_none());
}
