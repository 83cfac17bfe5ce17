//! Chain attestation adapter interface
//!
//! Adapters report per-chain outcomes for an operation. Push-style adapters
//! send [`AttestationEvent`]s straight into an [`AttestationSink`];
//! poll-style adapters implement [`AttestationSource`] and are driven by
//! [`poll_until_decided`], which turns a timeout or persistent errors into a
//! `Failed` attestation rather than an error.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{Attestation, ChainId, OperationId};

/// One chain's outcome for one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationEvent {
    pub operation_id: OperationId,
    pub chain: ChainId,
    pub outcome: Attestation,
    pub observed_at: DateTime<Utc>,
}

/// Cloneable sender half of the attestation stream
#[derive(Debug, Clone)]
pub struct AttestationSink {
    tx: mpsc::Sender<AttestationEvent>,
}

impl AttestationSink {
    /// Bounded channel; adapters wait when the ingestor falls behind
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AttestationEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns false once the ingestor has stopped
    pub async fn report(&self, event: AttestationEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Poll-style adapter for one chain
#[async_trait]
pub trait AttestationSource: Send + Sync {
    fn chain(&self) -> &ChainId;

    /// `Ok(None)` while the chain has not decided yet
    async fn poll(&self, operation_id: &OperationId) -> eyre::Result<Option<Attestation>>;
}

/// Backoff schedule for [`poll_until_decided`]
#[derive(Debug, Clone)]
pub struct PollSchedule {
    /// Delay after the first undecided poll
    pub initial_interval: Duration,
    /// Cap on the delay between polls
    pub max_interval: Duration,
    /// Backoff multiplier for exponential growth
    pub multiplier: f64,
    /// Consecutive poll errors tolerated before reporting `Failed`
    pub max_consecutive_errors: u32,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
            max_consecutive_errors: 5,
        }
    }
}

impl PollSchedule {
    /// Delay before poll number `attempt + 1` (0-indexed)
    pub fn interval_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.initial_interval.as_secs_f64()
            * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = secs.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Poll `source` until it decides or `timeout` passes
///
/// Always yields an event: a timeout or `max_consecutive_errors` failed polls
/// in a row become `Attestation::Failed`.
pub async fn poll_until_decided(
    source: &dyn AttestationSource,
    operation_id: OperationId,
    timeout: Duration,
    schedule: &PollSchedule,
) -> AttestationEvent {
    let chain = source.chain().clone();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut attempt: u32 = 0;
    let mut consecutive_errors: u32 = 0;

    let outcome = loop {
        match tokio::time::timeout_at(deadline, source.poll(&operation_id)).await {
            Err(_) => {
                warn!(chain = %chain, operation_id = %operation_id, "Attestation poll timed out");
                break Attestation::Failed;
            }
            Ok(Ok(Some(outcome))) => break outcome,
            Ok(Ok(None)) => {
                consecutive_errors = 0;
            }
            Ok(Err(e)) => {
                consecutive_errors += 1;
                warn!(
                    chain = %chain,
                    operation_id = %operation_id,
                    error = %e,
                    consecutive_errors,
                    "Attestation poll failed"
                );
                if consecutive_errors >= schedule.max_consecutive_errors {
                    break Attestation::Failed;
                }
            }
        }

        let wait = schedule.interval_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        if tokio::time::Instant::now() + wait >= deadline {
            tokio::time::sleep_until(deadline).await;
            warn!(chain = %chain, operation_id = %operation_id, "Attestation undecided at deadline");
            break Attestation::Failed;
        }
        tokio::time::sleep(wait).await;
    };

    debug!(
        chain = %chain,
        operation_id = %operation_id,
        outcome = %outcome,
        attempts = attempt + 1,
        "Attestation decided"
    );
    AttestationEvent {
        operation_id,
        chain,
        outcome,
        observed_at: Utc::now(),
    }
}
