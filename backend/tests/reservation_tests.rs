//! Reservation engine tests
//!
//! Tests for reservations including:
//! - Capacity is ledger minus active reservations
//! - Lifecycle transitions and no-op releases
//! - Expiry sweeps
//! - Fulfillment through an outbound movement

use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

use shared::{
    CreateReservationRequest, LedgerDirection, ReservationStatus, StockFilter, Triplet,
};
use stockroom::services::{LedgerService, MovementService, ReservationService};
use stockroom::store::{MemoryStore, Store};
use stockroom::AppError;

// Helper to create Decimal from string
fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    store: MemoryStore,
    key: Triplet,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: MemoryStore::with_default_catalog(),
            key: Triplet::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()),
        }
    }

    fn shared_store(&self) -> Arc<dyn Store> {
        Arc::new(self.store.clone())
    }

    fn reservations(&self) -> ReservationService {
        ReservationService::new(self.shared_store())
    }

    fn ledger(&self) -> LedgerService {
        LedgerService::new(self.shared_store())
    }

    async fn stock(&self, quantity: &str) {
        self.ledger()
            .apply_delta(self.key, dec(quantity), LedgerDirection::Increase, None)
            .await
            .unwrap();
    }

    async fn on_hand(&self) -> Decimal {
        self.ledger()
            .list(&StockFilter::default())
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.triplet() == self.key)
            .map(|r| r.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    fn request(&self, quantity: &str) -> CreateReservationRequest {
        CreateReservationRequest {
            product_id: self.key.product_id,
            batch_id: self.key.batch_id,
            location_id: self.key.location_id,
            quantity: dec(quantity),
            reserved_until: None,
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod unit_tests {
    use super::*;

    /// Ledger 100 with 60 reserved leaves room for 40, not 50
    #[tokio::test]
    async fn test_capacity_subtracts_active_reservations() {
        let fx = Fixture::new();
        fx.stock("100").await;
        let service = fx.reservations();

        let first = service.create(fx.request("60"), None).await.unwrap();
        assert_eq!(first.status, ReservationStatus::Active);

        let err = service.create(fx.request("50"), None).await.unwrap_err();
        match err {
            AppError::InsufficientStock {
                available,
                requested,
            } => {
                assert_eq!(available, dec("40"));
                assert_eq!(requested, dec("50"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(service.list(None).await.unwrap().len(), 1);
        assert_eq!(fx.on_hand().await, dec("100"));
    }

    #[tokio::test]
    async fn test_validate_reservation_writes_nothing() {
        let fx = Fixture::new();
        fx.stock("100").await;
        let service = fx.reservations();
        service.create(fx.request("60"), None).await.unwrap();

        let remaining = service.validate_reservation(fx.key, dec("25")).await.unwrap();
        assert_eq!(remaining, dec("15"));
        assert!(service.validate_reservation(fx.key, dec("41")).await.is_err());
        assert_eq!(service.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reserve_without_ledger_row() {
        let fx = Fixture::new();

        let err = fx.reservations().create(fx.request("1"), None).await.unwrap_err();

        assert!(matches!(err, AppError::InsufficientStock { .. }));
    }

    #[tokio::test]
    async fn test_window_must_end_in_future() {
        let fx = Fixture::new();
        fx.stock("10").await;
        let mut request = fx.request("1");
        request.reserved_until = Some(Utc::now() - Duration::hours(1));

        let err = fx.reservations().create(request, None).await.unwrap_err();

        assert!(matches!(err, AppError::Validation { ref field, .. } if field == "reserved_until"));
    }

    #[tokio::test]
    async fn test_non_positive_quantity_rejected() {
        let fx = Fixture::new();
        fx.stock("10").await;

        let err = fx.reservations().create(fx.request("0"), None).await.unwrap_err();

        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_release_frees_capacity() {
        let fx = Fixture::new();
        fx.stock("100").await;
        let service = fx.reservations();
        let held = service.create(fx.request("80"), None).await.unwrap();

        let released = service.release(held.id, None).await.unwrap();
        assert_eq!(released.status, ReservationStatus::Released);

        // The full ledger is free again
        service.create(fx.request("100"), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_of_finished_reservation_is_noop() {
        let fx = Fixture::new();
        fx.stock("100").await;
        let service = fx.reservations();
        let held = service.create(fx.request("10"), None).await.unwrap();
        service.fulfill_with_movement(held.id, None).await.unwrap();

        let again = service.release(held.id, None).await.unwrap();

        assert_eq!(again.status, ReservationStatus::Fulfilled);
    }

    #[tokio::test]
    async fn test_unknown_reservation() {
        let fx = Fixture::new();
        let service = fx.reservations();

        assert!(matches!(
            service.get(Uuid::new_v4()).await.unwrap_err(),
            AppError::NotFound(_)
        ));
        assert!(matches!(
            service.release(Uuid::new_v4(), None).await.unwrap_err(),
            AppError::NotFound(_)
        ));
        assert!(matches!(
            service.fulfill_with_movement(Uuid::new_v4(), None).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_expiry_sweep_only_touches_overdue() {
        let fx = Fixture::new();
        fx.stock("100").await;
        let service = fx.reservations();
        let now = Utc::now();

        let mut short = fx.request("10");
        short.reserved_until = Some(now + Duration::hours(1));
        let short = service.create(short, None).await.unwrap();
        let mut long = fx.request("10");
        long.reserved_until = Some(now + Duration::days(7));
        let long = service.create(long, None).await.unwrap();
        let open = service.create(fx.request("10"), None).await.unwrap();

        let sweep = service
            .expire_reservations_at(now + Duration::hours(2))
            .await
            .unwrap();

        assert_eq!(sweep.expired, 1);
        assert_eq!(service.get(short.id).await.unwrap().status, ReservationStatus::Expired);
        assert_eq!(service.get(long.id).await.unwrap().status, ReservationStatus::Active);
        assert_eq!(service.get(open.id).await.unwrap().status, ReservationStatus::Active);

        let active = service.list(Some(ReservationStatus::Active)).await.unwrap();
        assert_eq!(active.len(), 2);
    }

    /// Ledger 100, reserve 30, fulfill: 70 left and one outbound of 30
    #[tokio::test]
    async fn test_fulfill_records_outbound_movement() {
        let fx = Fixture::new();
        fx.stock("100").await;
        let service = fx.reservations();
        let user = Uuid::new_v4();
        let held = service.create(fx.request("30"), None).await.unwrap();

        let fulfillment = service.fulfill_with_movement(held.id, Some(user)).await.unwrap();

        assert_eq!(fulfillment.reservation.status, ReservationStatus::Fulfilled);
        assert_eq!(fulfillment.movement.movement_type, "outbound");
        assert_eq!(fulfillment.movement.reason, "reservation_fulfillment");
        assert_eq!(fulfillment.movement.quantity, dec("30"));
        assert_eq!(fulfillment.movement.from_location_id, Some(fx.key.location_id));
        assert_eq!(fulfillment.movement.executed_by, Some(user));
        assert_eq!(fulfillment.movement.code, format!("RES-{}", held.id.simple()));
        assert_eq!(fx.on_hand().await, dec("70"));

        let movements = MovementService::new(fx.shared_store())
            .list(&StockFilter::default())
            .await
            .unwrap();
        assert_eq!(movements.len(), 1);
    }

    #[tokio::test]
    async fn test_fulfill_twice_is_rejected() {
        let fx = Fixture::new();
        fx.stock("100").await;
        let service = fx.reservations();
        let held = service.create(fx.request("30"), None).await.unwrap();
        service.fulfill_with_movement(held.id, None).await.unwrap();

        let err = service.fulfill_with_movement(held.id, None).await.unwrap_err();

        assert!(matches!(err, AppError::InvalidStateTransition(_)));
        assert_eq!(fx.on_hand().await, dec("70"));
    }

    #[tokio::test]
    async fn test_fulfill_with_short_ledger_rolls_back() {
        let fx = Fixture::new();
        fx.stock("100").await;
        let service = fx.reservations();
        let held = service.create(fx.request("30"), None).await.unwrap();
        // Stock taken out around the reservation
        fx.ledger()
            .apply_delta(fx.key, dec("80"), LedgerDirection::Decrease, None)
            .await
            .unwrap();

        let err = service.fulfill_with_movement(held.id, None).await.unwrap_err();

        assert!(matches!(err, AppError::InsufficientStock { .. }));
        assert_eq!(service.get(held.id).await.unwrap().status, ReservationStatus::Active);
        assert_eq!(fx.on_hand().await, dec("20"));
    }

    #[tokio::test]
    async fn test_fulfill_without_outbound_type() {
        let fx = Fixture::new();
        fx.stock("100").await;
        let service = fx.reservations();
        let held = service.create(fx.request("30"), None).await.unwrap();
        fx.store.remove_movement_type("outbound").await;

        let err = service.fulfill_with_movement(held.id, None).await.unwrap_err();

        assert!(matches!(err, AppError::Configuration(_)));
        assert_eq!(service.get(held.id).await.unwrap().status, ReservationStatus::Active);
        assert_eq!(fx.on_hand().await, dec("100"));
    }

    #[tokio::test]
    async fn test_fulfill_falls_back_to_any_reason() {
        let fx = Fixture::new();
        fx.stock("100").await;
        let service = fx.reservations();
        let held = service.create(fx.request("5"), None).await.unwrap();
        fx.store.remove_movement_reasons().await;
        fx.store.add_movement_reason("manual", false).await;

        let fulfillment = service.fulfill_with_movement(held.id, None).await.unwrap();

        assert_eq!(fulfillment.movement.reason, "manual");
    }

    #[tokio::test]
    async fn test_fulfill_without_any_reason() {
        let fx = Fixture::new();
        fx.stock("100").await;
        let service = fx.reservations();
        let held = service.create(fx.request("5"), None).await.unwrap();
        fx.store.remove_movement_reasons().await;

        let err = service.fulfill_with_movement(held.id, None).await.unwrap_err();

        assert!(matches!(err, AppError::Configuration(_)));
        assert_eq!(service.get(held.id).await.unwrap().status, ReservationStatus::Active);
    }
}

// ============================================================================
// Property-Based Tests
// ============================================================================

#[cfg(test)]
mod property_tests {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// Active reservations never add up to more than the ledger holds
        #[test]
        fn prop_active_reservations_fit_ledger(
            stock in 1i64..1_000,
            requests in prop::collection::vec(1i64..300, 1..20),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let fx = Fixture::new();
                fx.stock(&stock.to_string()).await;
                let service = fx.reservations();

                for qty in requests {
                    let _ = service.create(fx.request(&qty.to_string()), None).await;
                }

                let reserved: Decimal = service
                    .list(Some(ReservationStatus::Active))
                    .await
                    .unwrap()
                    .iter()
                    .map(|r| r.quantity)
                    .sum();
                prop_assert!(reserved <= Decimal::from(stock));
                Ok(())
            })?;
        }
    }
}
