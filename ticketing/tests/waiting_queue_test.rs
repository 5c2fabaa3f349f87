//! Waiting-queue scenarios: ordering, admission, entry windows and sweeping.

#![allow(clippy::unwrap_used)]

mod common;

use common::Harness;
use futures::future::join_all;
use std::collections::HashSet;
use std::time::Duration;
use ticketing::messages::topics;
use ticketing::payment::ScriptedPaymentGateway;
use ticketing::{QueueStatus, TicketingError, UserId};

fn users(count: usize) -> Vec<UserId> {
    (1..=count).map(|n| UserId::new(format!("fan-{n}"))).collect()
}

#[tokio::test]
async fn batches_are_admitted_in_position_order() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    let fans = users(5);
    for fan in &fans {
        h.office.register_queue(h.concert, fan).await.unwrap();
    }

    let status = h.office.queue_status(h.concert, &fans[4]).await.unwrap();
    assert_eq!(status.ahead, 4);
    assert_eq!(status.entry.queue_position, 5);
    assert_eq!(status.estimated_wait, Duration::from_secs(10));

    let first = h.office.admit_next(h.concert, Some(2)).await.unwrap();
    let positions: Vec<_> = first.iter().map(|entry| entry.queue_position).collect();
    assert_eq!(positions, vec![1, 2]);
    assert!(first.iter().all(|entry| entry.status == QueueStatus::Admitted));

    let second = h.office.admit_next(h.concert, Some(2)).await.unwrap();
    let positions: Vec<_> = second.iter().map(|entry| entry.queue_position).collect();
    assert_eq!(positions, vec![3, 4]);

    let status = h.office.queue_status(h.concert, &fans[4]).await.unwrap();
    assert_eq!(status.ahead, 0);
    assert_eq!(status.entry.status, QueueStatus::Waiting);

    assert_eq!(h.bus.count_of(topics::QUEUE_REGISTER), 5);
    assert_eq!(h.bus.count_of(topics::QUEUE_PROCESS), 4);
}

#[tokio::test]
async fn duplicate_registration_is_refused_until_the_entry_ends() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    let alice = UserId::from("alice");

    let first = h.office.register_queue(h.concert, &alice).await.unwrap();
    let err = h.office.register_queue(h.concert, &alice).await.unwrap_err();
    assert!(matches!(err, TicketingError::AlreadyRegistered { .. }));

    h.office.leave_queue(h.concert, &alice).await.unwrap();
    let again = h.office.register_queue(h.concert, &alice).await.unwrap();
    assert!(again.queue_position > first.queue_position);
}

#[tokio::test]
async fn admitted_user_must_enter_within_the_window() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");
    h.office.register_queue(h.concert, &alice).await.unwrap();
    h.office.register_queue(h.concert, &bob).await.unwrap();

    let err = h.office.enter_queue(h.concert, &alice).await.unwrap_err();
    assert!(matches!(err, TicketingError::StateConflict(_)));

    h.office.admit_next(h.concert, None).await.unwrap();
    let entered = h.office.enter_queue(h.concert, &alice).await.unwrap();
    assert_eq!(entered.status, QueueStatus::Entered);
    assert!(entered.entered_at.is_some());
    // Entering twice is harmless.
    assert_eq!(h.office.enter_queue(h.concert, &alice).await.unwrap().id, entered.id);

    h.clock.advance(chrono::Duration::minutes(5));
    let err = h.office.enter_queue(h.concert, &bob).await.unwrap_err();
    assert!(matches!(err, TicketingError::Expired(_)));
    let err = h.office.queue_status(h.concert, &bob).await.unwrap_err();
    assert!(matches!(err, TicketingError::NotFound { .. }));

    assert_eq!(h.bus.count_of(topics::QUEUE_ENTER), 1);
}

#[tokio::test]
async fn stale_admissions_are_swept() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    let fans = users(3);
    for fan in &fans {
        h.office.register_queue(h.concert, fan).await.unwrap();
    }
    h.office.admit_next(h.concert, Some(2)).await.unwrap();
    h.office.enter_queue(h.concert, &fans[0]).await.unwrap();

    h.clock.advance(chrono::Duration::minutes(4));
    assert!(h.office.queue().expire_stale().await.unwrap().is_empty());

    h.clock.advance(chrono::Duration::minutes(1));
    let report = h.office.queue().expire_stale().await.unwrap();
    assert_eq!(report.released, 1);

    assert_eq!(
        h.office.queue_status(h.concert, &fans[0]).await.unwrap().entry.status,
        QueueStatus::Entered
    );
    assert!(h.office.queue_status(h.concert, &fans[1]).await.is_err());
    assert_eq!(
        h.office.queue_status(h.concert, &fans[2]).await.unwrap().entry.status,
        QueueStatus::Waiting
    );

    // Expired users may queue again, at the back.
    let rejoined = h.office.register_queue(h.concert, &fans[1]).await.unwrap();
    assert_eq!(rejoined.queue_position, 4);
}

#[tokio::test]
async fn entry_is_admitted_only_once() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    let alice = UserId::from("alice");
    let entry = h.office.register_queue(h.concert, &alice).await.unwrap();

    h.office.queue().admit(entry.id).await.unwrap();
    let err = h.office.queue().admit(entry.id).await.unwrap_err();
    assert!(matches!(err, TicketingError::StateConflict(_)));
    assert!(h.office.admit_next(h.concert, None).await.unwrap().is_empty());
    assert_eq!(h.bus.count_of(topics::QUEUE_PROCESS), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_get_distinct_consecutive_positions() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    let queue = h.office.queue().clone();
    let fans = users(50);

    let registrations = fans.iter().cloned().map(|fan| {
        let queue = queue.clone();
        let concert = h.concert;
        tokio::spawn(async move { queue.register(concert, &fan).await })
    });
    let positions: HashSet<u64> = join_all(registrations)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().queue_position)
        .collect();

    assert_eq!(positions, (1..=50).collect());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_admit_each_entry_once() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    for fan in &users(30) {
        h.office.register_queue(h.concert, fan).await.unwrap();
    }

    let batches = (0..6).map(|_| {
        let queue = h.office.queue().clone();
        let concert = h.concert;
        tokio::spawn(async move { queue.admit_next_batch(concert, 10).await })
    });
    let admitted: Vec<_> = join_all(batches)
        .await
        .into_iter()
        .flat_map(|joined| joined.unwrap().unwrap())
        .map(|entry| entry.id)
        .collect();

    // Batches racing for the same entries skip them, so some may come back short.
    let unique: HashSet<_> = admitted.iter().collect();
    assert_eq!(unique.len(), admitted.len());
    assert_eq!(h.bus.count_of(topics::QUEUE_PROCESS), admitted.len());

    let rest = h.office.admit_next(h.concert, Some(30)).await.unwrap();
    assert_eq!(admitted.len() + rest.len(), 30);
    assert!(rest.iter().all(|entry| !unique.contains(&entry.id)));
}

#[tokio::test]
async fn only_waiting_entries_count_as_ahead() {
    let h = Harness::new(ScriptedPaymentGateway::new()).await;
    for fan in &users(3) {
        h.office.register_queue(h.concert, fan).await.unwrap();
    }
    let queue = h.office.queue();
    assert_eq!(queue.count_queue_ahead(h.concert, 3).await.unwrap(), 2);

    let admitted = queue.admit_next_batch(h.concert, 2).await.unwrap();
    assert_eq!(admitted.len(), 2);
    assert_eq!(queue.count_queue_ahead(h.concert, 3).await.unwrap(), 0);
    assert_eq!(queue.count_queue_ahead(h.concert, 4).await.unwrap(), 1);
}
