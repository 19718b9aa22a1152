//! Prometheus counters for stock mutations and outbox delivery.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::errors::ServiceError;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MUTATIONS: IntCounterVec = register(IntCounterVec::new(
        Opts::new(
            "inventory_mutations_total",
            "Committed stock mutations by kind"
        ),
        &["kind"]
    )
    .expect("metric can be created"));
    pub static ref MUTATION_FAILURES: IntCounterVec = register(IntCounterVec::new(
        Opts::new(
            "inventory_mutation_failures_total",
            "Rejected or failed stock mutations by error code"
        ),
        &["code"]
    )
    .expect("metric can be created"));
    pub static ref OUTBOX_DISPATCHED: IntCounter = register(IntCounter::new(
        "inventory_outbox_dispatched_total",
        "Outbox events handed to the in-process event bus"
    )
    .expect("metric can be created"));
}

fn register<M>(metric: M) -> M
where
    M: prometheus::core::Collector + Clone + 'static,
{
    if let Err(e) = REGISTRY.register(Box::new(metric.clone())) {
        tracing::warn!("metric registration failed: {}", e);
    }
    metric
}

pub fn record_mutation(kind: &str) {
    MUTATIONS.with_label_values(&[kind]).inc();
}

pub fn record_failure(error: &ServiceError) {
    MUTATION_FAILURES.with_label_values(&[error.code()]).inc();
}

/// Text exposition of every registered counter.
pub fn render() -> Result<String, ServiceError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| ServiceError::InternalError(format!("metrics encoding failed: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| ServiceError::InternalError(format!("metrics are not utf-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_rendered_output() {
        record_mutation("stock_in");
        record_failure(&ServiceError::InsufficientStock("x".into()));
        OUTBOX_DISPATCHED.inc();

        let text = render().unwrap();
        assert!(text.contains("inventory_mutations_total{kind=\"stock_in\"}"));
        assert!(text.contains("inventory_mutation_failures_total{code=\"insufficient_stock\"}"));
        assert!(text.contains("inventory_outbox_dispatched_total"));
    }
}
