use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;

use crate::metrics::render;

/// Prometheus text exposition. Unauthenticated, same as `/health`; keep it
/// off the public internet via TRUSTED_HOSTS or the scrape network.
pub async fn metrics() -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(),
    )
}
