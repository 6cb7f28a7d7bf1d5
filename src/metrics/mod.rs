//! Prometheus metrics for the Drowse operator
//!
//! Exports counters for:
//! - Informer handler outcomes (per governed service and watch key)
//! - Target scale attempts driven by the control RPC path

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

/// Label value used when a handler or scale attempt succeeded
pub const OUTCOME_SUCCESS: &str = "success";

/// Informer handler invocations, labelled with the governed service, the
/// informer key, and `success` or the error kind
pub static INFORMER_HANDLER_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "drowse_informer_handler_total",
        "Informer handler invocations by outcome",
        &["service", "key", "error"]
    )
    .unwrap()
});

/// Scale attempts made on behalf of the resolver, labelled with the governed
/// service, the target reference, and the outcome
pub static TARGET_SCALE_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "drowse_target_scale_total",
        "Request-driven scale attempts by outcome",
        &["service", "target_ref", "outcome"]
    )
    .unwrap()
});

/// Encode all registered metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
