use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry, Encoder,
    IntCounter, IntCounterVec, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "rentfolio_http_requests_total",
        "HTTP requests handled, by method and status class",
        &["method", "status"],
        REGISTRY
    )
    .expect("http request counter registers")
});

pub static INVOICES_GENERATED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter_with_registry!(
        "rentfolio_invoices_generated_total",
        "Invoices created by the recurring generation job",
        REGISTRY
    )
    .expect("invoice counter registers")
});

pub static INVOICES_SKIPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter_with_registry!(
        "rentfolio_invoices_skipped_existing_total",
        "Generation runs skipped because the lease already had an invoice for the month",
        REGISTRY
    )
    .expect("skip counter registers")
});

pub static INVOICES_MARKED_OVERDUE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter_with_registry!(
        "rentfolio_invoices_marked_overdue_total",
        "Invoices flipped to overdue by the daily scan",
        REGISTRY
    )
    .expect("overdue counter registers")
});

pub static PAYMENT_APPLICATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter_with_registry!(
        "rentfolio_payment_applications_total",
        "Payment amounts applied to invoices",
        REGISTRY
    )
    .expect("payment application counter registers")
});

/// Render the registry in Prometheus text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %error, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{render, INVOICES_GENERATED_TOTAL};

    #[test]
    fn renders_registered_counters() {
        INVOICES_GENERATED_TOTAL.inc();
        let output = render();
        assert!(output.contains("rentfolio_invoices_generated_total"));
    }
}
