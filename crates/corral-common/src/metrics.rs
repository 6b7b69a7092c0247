//! OpenTelemetry metrics for reconciles and cloud operations
//!
//! Instruments are created lazily against the global meter, so recording is a
//! no-op until a meter provider is installed by [`crate::telemetry`].

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("corral"));

/// Histogram of reconcile duration
///
/// Labels:
/// - `kind`: Cluster, Machine
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("corral_reconcile_duration_seconds")
        .with_description("Duration of reconcile passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed reconciles
///
/// Labels:
/// - `kind`: Cluster, Machine
/// - `error_class`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("corral_reconcile_errors_total")
        .with_description("Total number of failed reconcile passes")
        .with_unit("{errors}")
        .build()
});

/// Counter of actuator verbs dispatched
///
/// Labels:
/// - `kind`: Cluster, Machine
/// - `verb`: create, update, delete
pub static ACTUATOR_CALLS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("corral_actuator_calls_total")
        .with_description("Actuator verbs dispatched by the controllers")
        .with_unit("{calls}")
        .build()
});

/// Histogram of time spent waiting for long-running cloud operations
///
/// Labels:
/// - `scope`: zone, global
/// - `result`: done, failed, timeout, cancelled
pub static CLOUD_OPERATION_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("corral_cloud_operation_wait_seconds")
        .with_description("Time spent polling cloud operations until completion")
        .with_unit("s")
        .build()
});

/// Times one reconcile pass
pub struct ReconcileTimer {
    kind: &'static str,
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing a reconcile of the given resource kind
    pub fn start(kind: &'static str) -> Self {
        Self {
            kind,
            start: Instant::now(),
        }
    }

    /// Record a successful pass
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record a failed pass with its error class
    pub fn error(self, error_class: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("result", "error"),
            ],
        );
        record_reconcile_error(self.kind, error_class);
    }
}

/// Count a failed reconcile, including permanent failures the pass absorbed
pub fn record_reconcile_error(kind: &'static str, error_class: &'static str) {
    RECONCILE_ERRORS.add(
        1,
        &[
            KeyValue::new("kind", kind),
            KeyValue::new("error_class", error_class),
        ],
    );
}

/// Count one actuator verb
pub fn record_actuator_call(kind: &'static str, verb: &'static str) {
    ACTUATOR_CALLS.add(
        1,
        &[KeyValue::new("kind", kind), KeyValue::new("verb", verb)],
    );
}

/// Record how long a cloud operation was polled
pub fn record_operation_wait(scope: &'static str, result: &'static str, started: Instant) {
    CLOUD_OPERATION_DURATION.record(
        started.elapsed().as_secs_f64(),
        &[KeyValue::new("scope", scope), KeyValue::new("result", result)],
    );
}
