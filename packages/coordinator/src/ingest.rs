//! Background tasks feeding the coordinator
//!
//! - [`AttestationIngestor`] drains the adapter event stream into
//!   `on_chain_attestation`.
//! - [`PollingDispatcher`] starts one poll task per configured chain adapter
//!   for every new swap, bounded by the swap deadline.
//! - [`BreakerMonitor`] ticks the circuit breaker so auto-recovery and policy
//!   evaluation happen without traffic.
//!
//! All three stop when the shutdown channel flips to `true`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use htlc_core::{
    poll_until_decided, AttestationEvent, AttestationSink, AttestationSource, BreakerTransition,
    OperationId, PollSchedule, SwapCoordinator,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

/// Resolves once shutdown is signalled or the sender is gone
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

// ============================================================================
// Ingestor
// ============================================================================

pub struct AttestationIngestor {
    coordinator: Arc<SwapCoordinator>,
    metrics: Arc<Metrics>,
}

impl AttestationIngestor {
    pub fn new(coordinator: Arc<SwapCoordinator>, metrics: Arc<Metrics>) -> Self {
        Self {
            coordinator,
            metrics,
        }
    }

    /// Consume events until the stream closes or shutdown is signalled
    pub async fn run(
        self,
        mut events: mpsc::Receiver<AttestationEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Attestation ingestor started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.apply(event).await;
                    }
                    None => break,
                },
            }
        }
        info!("Attestation ingestor stopped");
    }

    /// Apply one event; failures are logged and counted, never fatal
    pub async fn apply(&self, event: AttestationEvent) -> bool {
        match self
            .coordinator
            .on_chain_attestation(&event.operation_id, &event.chain, event.outcome)
            .await
        {
            Ok(ack) => {
                self.metrics
                    .attestations_total
                    .with_label_values(&[event.chain.as_str(), event.outcome.as_str()])
                    .inc();
                debug!(
                    operation_id = %event.operation_id,
                    chain = %event.chain,
                    outcome = %event.outcome,
                    signed = ack.signed_count,
                    status = %ack.status,
                    "Attestation event applied"
                );
                true
            }
            Err(e) => {
                self.metrics.attestation_ingest_errors_total.inc();
                warn!(
                    operation_id = %event.operation_id,
                    chain = %event.chain,
                    kind = %e.kind(),
                    error = %e,
                    "Attestation event rejected"
                );
                false
            }
        }
    }
}

// ============================================================================
// Polling dispatcher
// ============================================================================

pub struct PollingDispatcher {
    sources: Vec<Arc<dyn AttestationSource>>,
    sink: AttestationSink,
    schedule: PollSchedule,
    timeout: Duration,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
}

impl PollingDispatcher {
    pub fn new(
        sources: Vec<Arc<dyn AttestationSource>>,
        sink: AttestationSink,
        schedule: PollSchedule,
        timeout: Duration,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sources,
            sink,
            schedule,
            timeout,
            metrics,
            shutdown,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Poll every adapter for `operation_id` until `deadline` (or the
    /// configured timeout, whichever is sooner); returns tasks started
    pub fn dispatch(
        &self,
        operation_id: OperationId,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> usize {
        if *self.shutdown.borrow() {
            return 0;
        }
        let Ok(remaining) = (deadline - now).to_std() else {
            debug!(operation_id = %operation_id, "Swap already expired, not polling");
            return 0;
        };
        let bound = remaining.min(self.timeout);
        if bound.is_zero() {
            return 0;
        }

        for source in &self.sources {
            let source = source.clone();
            let sink = self.sink.clone();
            let schedule = self.schedule.clone();
            let metrics = self.metrics.clone();
            let mut shutdown = self.shutdown.clone();

            metrics.polls_in_flight.inc();
            tokio::spawn(async move {
                tokio::select! {
                    event = poll_until_decided(source.as_ref(), operation_id, bound, &schedule) => {
                        if !sink.report(event).await {
                            warn!(operation_id = %operation_id, "Ingestor gone, attestation dropped");
                        }
                    }
                    _ = shutdown_requested(&mut shutdown) => {
                        debug!(operation_id = %operation_id, chain = %source.chain(), "Poll cancelled by shutdown");
                    }
                }
                metrics.polls_in_flight.dec();
            });
        }
        self.sources.len()
    }
}

// ============================================================================
// Breaker monitor
// ============================================================================

pub struct BreakerMonitor {
    coordinator: Arc<SwapCoordinator>,
    metrics: Arc<Metrics>,
    interval: Duration,
}

impl BreakerMonitor {
    pub fn new(coordinator: Arc<SwapCoordinator>, metrics: Arc<Metrics>, interval: Duration) -> Self {
        Self {
            coordinator,
            metrics,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Breaker monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("Breaker monitor stopped");
    }

    /// One evaluation pass
    pub async fn tick(&self) -> BreakerTransition {
        let breaker = self.coordinator.breaker();
        let transition = breaker.tick(self.coordinator.now()).await;
        match &transition {
            BreakerTransition::Tripped { reason } => {
                self.metrics
                    .breaker_transitions_total
                    .with_label_values(&["tripped"])
                    .inc();
                warn!(reason = %reason, "Breaker tripped during scheduled evaluation");
            }
            BreakerTransition::Recovered => {
                self.metrics
                    .breaker_transitions_total
                    .with_label_values(&["recovered"])
                    .inc();
                info!("Breaker recovered");
            }
            BreakerTransition::Unchanged => {}
        }
        let status = self.coordinator.breaker_status().await;
        self.metrics.observe_breaker(&status);
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htlc_core::testing::{ScriptedSource, TestHarness};
    use htlc_core::{Attestation, BreakerThresholds, ChainId, InitiateRequest, SwapStatus};

    fn chain(name: &str) -> ChainId {
        ChainId::new(name).unwrap()
    }

    async fn wait_for_status(harness: &TestHarness, swap_id: &htlc_core::SwapId, want: SwapStatus) {
        for _ in 0..200 {
            let status = harness.coordinator.status(swap_id).await.unwrap().summary.status;
            if status == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("swap never reached {}", want);
    }

    #[tokio::test]
    async fn test_ingestor_counts_rejections() {
        let harness = TestHarness::new();
        let metrics = Arc::new(Metrics::new());
        let ingestor = AttestationIngestor::new(harness.coordinator.clone(), metrics.clone());

        let applied = ingestor
            .apply(AttestationEvent {
                operation_id: OperationId([3; 32]),
                chain: chain("chaina"),
                outcome: Attestation::Signed,
                observed_at: Utc::now(),
            })
            .await;
        assert!(!applied);
        assert_eq!(metrics.attestation_ingest_errors_total.get(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_polls_into_ingestor() {
        let harness = TestHarness::new();
        let metrics = Arc::new(Metrics::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (sink, events) = AttestationSink::channel(16);

        let sources: Vec<Arc<dyn AttestationSource>> = vec![
            Arc::new(ScriptedSource::new(
                chain("chaina"),
                vec![Ok(None), Ok(Some(Attestation::Signed))],
            )),
            Arc::new(ScriptedSource::decided(chain("chainb"), Attestation::Signed)),
            Arc::new(ScriptedSource::decided(chain("chainc"), Attestation::Failed)),
        ];
        let schedule = PollSchedule {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            multiplier: 2.0,
            max_consecutive_errors: 3,
        };
        let dispatcher = PollingDispatcher::new(
            sources,
            sink,
            schedule,
            Duration::from_secs(30),
            metrics.clone(),
            shutdown_rx.clone(),
        );
        let ingestor = AttestationIngestor::new(harness.coordinator.clone(), metrics.clone());
        let ingest_task = tokio::spawn(ingestor.run(events, shutdown_rx));

        let receipt = harness
            .coordinator
            .initiate(InitiateRequest::new("chaina", "chainb", 10, "addr1", None))
            .await
            .unwrap();
        let started = dispatcher.dispatch(
            receipt.operation_id,
            receipt.timelock_deadline,
            harness.coordinator.now(),
        );
        assert_eq!(started, 3);

        wait_for_status(&harness, &receipt.swap_id, SwapStatus::ConsensusReached).await;

        shutdown_tx.send(true).unwrap();
        ingest_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_skips_expired_swap() {
        let harness = TestHarness::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (sink, _events) = AttestationSink::channel(4);
        let source: Arc<dyn AttestationSource> =
            Arc::new(ScriptedSource::new(chain("chaina"), vec![]));
        let dispatcher = PollingDispatcher::new(
            vec![source],
            sink,
            PollSchedule::default(),
            Duration::from_secs(30),
            Arc::new(Metrics::new()),
            shutdown_rx,
        );
        let now = harness.coordinator.now();
        assert_eq!(dispatcher.dispatch(OperationId([1; 32]), now, now), 0);
        assert_eq!(
            dispatcher.dispatch(OperationId([1; 32]), now - chrono::Duration::seconds(5), now),
            0
        );
    }

    #[tokio::test]
    async fn test_breaker_monitor_recovers_and_updates_gauges() {
        let harness = TestHarness::with(
            htlc_core::testing::test_config(),
            BreakerThresholds {
                auto_recovery_delay_seconds: 60,
                ..BreakerThresholds::default()
            },
            htlc_core::EmergencyCouncil::disabled(),
        );
        let metrics = Arc::new(Metrics::new());
        let monitor = BreakerMonitor::new(
            harness.coordinator.clone(),
            metrics.clone(),
            Duration::from_millis(10),
        );

        harness.breaker.trigger("test", harness.coordinator.now()).await;
        assert_eq!(monitor.tick().await, BreakerTransition::Unchanged);
        assert_eq!(metrics.breaker_active.get(), 1);

        harness.clock.advance_secs(60);
        assert_eq!(monitor.tick().await, BreakerTransition::Recovered);
        assert_eq!(metrics.breaker_active.get(), 0);
        assert_eq!(
            metrics
                .breaker_transitions_total
                .with_label_values(&["recovered"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let harness = TestHarness::new();
        let monitor = BreakerMonitor::new(
            harness.coordinator.clone(),
            Arc::new(Metrics::new()),
            Duration::from_millis(5),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(monitor.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
