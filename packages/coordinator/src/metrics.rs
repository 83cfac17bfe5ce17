//! Prometheus metrics for the HTLC coordinator
//!
//! Collected into a private [`Registry`] and served on `/metrics`.

use htlc_core::{BreakerStatus, ErrorKind};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

pub struct Metrics {
    pub swaps_initiated_total: IntCounter,
    pub swaps_claimed_total: IntCounter,
    pub swaps_refunded_total: IntCounter,
    /// Attestations applied, by chain and outcome
    pub attestations_total: IntCounterVec,
    /// Attestations the ingestor could not apply
    pub attestation_ingest_errors_total: IntCounter,
    /// Rejected API operations, by operation and error kind
    pub rejections_total: IntCounterVec,
    /// Poll tasks currently running
    pub polls_in_flight: IntGauge,
    pub breaker_active: IntGauge,
    pub emergency_pause: IntGauge,
    pub breaker_transitions_total: IntCounterVec,
    pub registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let swaps_initiated_total = IntCounter::new(
            "htlc_swaps_initiated_total",
            "Total number of swaps initiated",
        )
        .expect("constant metric name is valid");

        let swaps_claimed_total =
            IntCounter::new("htlc_swaps_claimed_total", "Total number of swaps claimed")
                .expect("constant metric name is valid");

        let swaps_refunded_total =
            IntCounter::new("htlc_swaps_refunded_total", "Total number of swaps refunded")
                .expect("constant metric name is valid");

        let attestations_total = IntCounterVec::new(
            Opts::new(
                "htlc_attestations_total",
                "Attestations applied to consensus records",
            ),
            &["chain", "outcome"],
        )
        .expect("constant metric name is valid");

        let attestation_ingest_errors_total = IntCounter::new(
            "htlc_attestation_ingest_errors_total",
            "Attestation events that could not be applied",
        )
        .expect("constant metric name is valid");

        let rejections_total = IntCounterVec::new(
            Opts::new("htlc_rejections_total", "Rejected operations by error kind"),
            &["operation", "kind"],
        )
        .expect("constant metric name is valid");

        let polls_in_flight = IntGauge::new(
            "htlc_attestation_polls_in_flight",
            "Attestation poll tasks currently running",
        )
        .expect("constant metric name is valid");

        let breaker_active = IntGauge::new(
            "htlc_circuit_breaker_active",
            "1 while the automatic circuit breaker is tripped",
        )
        .expect("constant metric name is valid");

        let emergency_pause = IntGauge::new(
            "htlc_emergency_pause",
            "1 while the council emergency pause is engaged",
        )
        .expect("constant metric name is valid");

        let breaker_transitions_total = IntCounterVec::new(
            Opts::new(
                "htlc_circuit_breaker_transitions_total",
                "Circuit breaker trips and recoveries",
            ),
            &["transition"],
        )
        .expect("constant metric name is valid");

        // Names are unique constants and registration runs once per Metrics
        registry
            .register(Box::new(swaps_initiated_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(swaps_claimed_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(swaps_refunded_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(attestations_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(attestation_ingest_errors_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(rejections_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(polls_in_flight.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(breaker_active.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(emergency_pause.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(breaker_transitions_total.clone()))
            .expect("metric registration must not be called twice");

        Self {
            swaps_initiated_total,
            swaps_claimed_total,
            swaps_refunded_total,
            attestations_total,
            attestation_ingest_errors_total,
            rejections_total,
            polls_in_flight,
            breaker_active,
            emergency_pause,
            breaker_transitions_total,
            registry,
        }
    }

    pub fn record_rejection(&self, operation: &str, kind: ErrorKind) {
        self.rejections_total
            .with_label_values(&[operation, kind.as_str()])
            .inc();
    }

    /// Mirror breaker state into the gauges
    pub fn observe_breaker(&self, status: &BreakerStatus) {
        self.breaker_active.set(i64::from(status.active));
        self.emergency_pause.set(i64::from(status.emergency_pause));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_metrics_encode() {
        let metrics = Metrics::new();
        metrics.swaps_initiated_total.inc();
        metrics.record_rejection("claim", ErrorKind::InvalidPreimage);
        metrics
            .attestations_total
            .with_label_values(&["arbitrum", "signed"])
            .inc();

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("htlc_swaps_initiated_total 1"));
        assert!(text.contains("kind=\"invalid_preimage\""));
        assert!(text.contains("chain=\"arbitrum\""));
    }

    #[test]
    fn test_separate_instances_do_not_collide() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.swaps_claimed_total.inc();
        assert_eq!(b.swaps_claimed_total.get(), 0);
    }
}
