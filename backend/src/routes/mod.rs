//! Route definitions for the stockroom API

use axum::{
    routing::{get, post},
    Router,
};

use crate::{handlers, AppState};

/// Create API routes
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/inventory", get(handlers::list_inventory))
        .nest("/movements", movement_routes())
        .nest("/reservations", reservation_routes())
        .nest("/reports", report_routes())
        .nest("/alerts", alert_routes())
        .route("/audit", get(handlers::list_audit))
}

/// Movement routes
fn movement_routes() -> Router<AppState> {
    Router::new().route(
        "/",
        get(handlers::list_movements).post(handlers::create_movement),
    )
}

/// Reservation routes
fn reservation_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(handlers::list_reservations).post(handlers::create_reservation),
        )
        .route("/expire", post(handlers::expire_reservations))
        .route("/:id", get(handlers::get_reservation))
        .route("/:id/release", post(handlers::release_reservation))
        .route(
            "/:id/fulfill_with_movement",
            post(handlers::fulfill_reservation),
        )
}

/// Reporting routes
fn report_routes() -> Router<AppState> {
    Router::new()
        .route("/stock_summary", get(handlers::stock_summary))
        .route("/stock_history", get(handlers::stock_history))
        .route("/stock_forecast", get(handlers::stock_forecast))
}

/// Alert routes
fn alert_routes() -> Router<AppState> {
    Router::new()
        .route("/stock", get(handlers::check_stock_alerts))
        .route("/stock/notify", post(handlers::notify_stock_alerts))
}
