//! Property tests for the seat and payment state machines and lock extension.

#![allow(clippy::unwrap_used)]

mod common;

use common::Harness;
use proptest::prelude::*;
use ticketing::payment::{PaymentStatus, PaymentTransition, ScriptedPaymentGateway};
use ticketing::seat::SeatTransition;
use ticketing::{SeatStatus, UserId};

fn seat_transition() -> impl Strategy<Value = SeatTransition> {
    prop_oneof![
        Just(SeatTransition::Select),
        Just(SeatTransition::Reserve),
        Just(SeatTransition::Sell),
        Just(SeatTransition::Unreserve),
        Just(SeatTransition::Reset),
    ]
}

fn payment_transition() -> impl Strategy<Value = PaymentTransition> {
    prop_oneof![
        Just(PaymentTransition::Complete),
        Just(PaymentTransition::Fail),
        Just(PaymentTransition::Cancel),
    ]
}

proptest! {
    #[test]
    fn sold_seats_never_change(transitions in prop::collection::vec(seat_transition(), 1..40)) {
        let mut status = SeatStatus::Available;
        let mut sold = false;
        for transition in transitions {
            match status.apply(transition) {
                Ok(next) => {
                    prop_assert!(!sold, "{transition:?} moved a sold seat to {next}");
                    if next == SeatStatus::Sold {
                        prop_assert_eq!(status, SeatStatus::Reserved);
                    }
                    status = next;
                }
                Err(_) => prop_assert!(transition.allowed_from().iter().all(|from| *from != status)),
            }
            sold |= status == SeatStatus::Sold;
        }
        prop_assert_eq!(sold, status == SeatStatus::Sold);
    }

    #[test]
    fn failed_and_cancelled_payments_are_final(
        transitions in prop::collection::vec(payment_transition(), 1..20)
    ) {
        let mut status = PaymentStatus::Pending;
        for transition in transitions {
            let finished = matches!(status, PaymentStatus::Failed | PaymentStatus::Cancelled);
            match status.apply(transition) {
                Ok(next) => {
                    prop_assert!(!finished);
                    status = next;
                }
                Err(_) => prop_assert!(finished || !transition.allowed_from().contains(&status)),
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn extending_a_hold_only_pushes_expiry_forward(
        extensions in prop::collection::vec(1u32..=60, 1..8)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let h = Harness::new(ScriptedPaymentGateway::new()).await;
            let alice = UserId::from("alice");
            let seat = h.seats[0].id;
            let mut lock = h.office.locks().lock(seat, &alice, 10).await.unwrap();

            for minutes in extensions {
                let extended = h.office.locks().extend(seat, &alice, minutes).await.unwrap();
                prop_assert_eq!(extended.id, lock.id);
                prop_assert_eq!(
                    extended.expires_at - lock.expires_at,
                    chrono::Duration::minutes(i64::from(minutes))
                );
                lock = extended;
            }
            Ok(())
        })?;
    }
}
