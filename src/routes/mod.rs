use axum::{routing::get, Router};

use crate::state::AppState;

pub mod audit_logs;
pub mod documents;
pub mod feedback;
pub mod health;
pub mod identity;
pub mod invoices;
pub mod lease_charges;
pub mod leases;
pub mod metrics;
pub mod notifications;
pub mod payments;
pub mod portfolios;
pub mod properties;
pub mod tenants;
pub mod units;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(metrics::metrics))
        .route("/me", get(identity::me))
        .merge(portfolios::router())
        .merge(properties::router())
        .merge(units::router())
        .merge(tenants::router())
        .merge(leases::router())
        .merge(lease_charges::router())
        .merge(invoices::router())
        .merge(payments::router())
        .merge(documents::router())
        .merge(notifications::router())
        .merge(feedback::router())
        .merge(audit_logs::router())
}
