//! Circuit breaker and emergency pause
//!
//! The breaker watches process-wide activity (swap initiations and attestation
//! outcomes) over a trailing window and trips when any [`TriggerPolicy`]
//! fires. A tripped breaker clears itself once `autoRecoveryDelay` has
//! elapsed. The emergency pause is separate: it is engaged and lifted only by
//! an [`EmergencyCouncil`] quorum and never expires on its own.
//!
//! The coordinator reads [`CircuitBreaker::status`] / [`CircuitBreaker::halted`]
//! and feeds observations in; it never trips, clears or pauses the breaker.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::clock::add_seconds;
use crate::error::SwapError;
use crate::types::Attestation;

/// Upper bound on samples retained per window
const MAX_WINDOW_SAMPLES: usize = 100_000;

// ============================================================================
// Thresholds
// ============================================================================

/// Breaker tuning
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerThresholds {
    /// Operations per window above which the breaker trips
    pub volume_threshold: u64,
    /// Trailing window length for volume and failure-rate sampling
    pub window_seconds: u64,
    /// Failed/total attestation ratio above which the breaker trips
    pub failure_rate_limit: f64,
    /// Attestations needed in the window before the failure rate is trusted
    pub min_attestation_sample: u64,
    /// Time after a trip at which the breaker clears itself
    pub auto_recovery_delay_seconds: u64,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            volume_threshold: 500,
            window_seconds: 3600,
            failure_rate_limit: 0.2,
            min_attestation_sample: 10,
            auto_recovery_delay_seconds: 4 * 3600,
        }
    }
}

impl BreakerThresholds {
    pub fn validate(&self) -> Result<(), SwapError> {
        if self.volume_threshold == 0 {
            return Err(SwapError::invalid("breaker volume threshold must be > 0"));
        }
        if self.window_seconds == 0 {
            return Err(SwapError::invalid("breaker window must be > 0 seconds"));
        }
        if !(self.failure_rate_limit > 0.0 && self.failure_rate_limit <= 1.0) {
            return Err(SwapError::invalid(
                "breaker failure rate limit must be in (0, 1]",
            ));
        }
        if self.auto_recovery_delay_seconds == 0 {
            return Err(SwapError::invalid(
                "breaker auto-recovery delay must be > 0 seconds",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Trigger policies
// ============================================================================

/// Activity counted over the trailing window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStats {
    pub operations: u64,
    pub attestations: u64,
    pub failed_attestations: u64,
}

impl WindowStats {
    pub fn failure_rate(&self) -> f64 {
        if self.attestations == 0 {
            0.0
        } else {
            self.failed_attestations as f64 / self.attestations as f64
        }
    }
}

/// Pluggable anomaly check
pub trait TriggerPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reason to trip, or `None` if the window looks healthy
    fn evaluate(&self, stats: &WindowStats) -> Option<String>;
}

/// Trips when operation volume in the window exceeds the threshold
#[derive(Debug, Clone)]
pub struct VolumePolicy {
    pub threshold: u64,
}

impl TriggerPolicy for VolumePolicy {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn evaluate(&self, stats: &WindowStats) -> Option<String> {
        (stats.operations > self.threshold).then(|| {
            format!(
                "operation volume {} exceeds threshold {}",
                stats.operations, self.threshold
            )
        })
    }
}

/// Trips when the failed attestation ratio exceeds the limit
#[derive(Debug, Clone)]
pub struct FailureRatePolicy {
    pub limit: f64,
    pub min_sample: u64,
}

impl TriggerPolicy for FailureRatePolicy {
    fn name(&self) -> &'static str {
        "failure_rate"
    }

    fn evaluate(&self, stats: &WindowStats) -> Option<String> {
        if stats.attestations < self.min_sample.max(1) {
            return None;
        }
        let rate = stats.failure_rate();
        (rate > self.limit).then(|| {
            format!(
                "attestation failure rate {:.2} exceeds limit {:.2} ({} of {} failed)",
                rate, self.limit, stats.failed_attestations, stats.attestations
            )
        })
    }
}

/// Default policy set for a threshold configuration
pub fn default_policies(thresholds: &BreakerThresholds) -> Vec<Box<dyn TriggerPolicy>> {
    vec![
        Box::new(VolumePolicy {
            threshold: thresholds.volume_threshold,
        }),
        Box::new(FailureRatePolicy {
            limit: thresholds.failure_rate_limit,
            min_sample: thresholds.min_attestation_sample,
        }),
    ]
}

// ============================================================================
// Rolling window
// ============================================================================

/// Timestamped samples inside a trailing window, bounded in size
#[derive(Debug)]
struct RollingWindow<T> {
    samples: VecDeque<(DateTime<Utc>, T)>,
    span_seconds: u64,
    max_samples: usize,
}

impl<T> RollingWindow<T> {
    fn new(span_seconds: u64, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            span_seconds,
            max_samples,
        }
    }

    fn in_window(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        add_seconds(at, self.span_seconds) > now
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some((at, _)) = self.samples.front() {
            if self.in_window(*at, now) {
                break;
            }
            self.samples.pop_front();
        }
    }

    fn push(&mut self, now: DateTime<Utc>, value: T) {
        self.prune(now);
        while self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back((now, value));
    }

    /// Samples still inside the window at `now`, without pruning
    fn live(&self, now: DateTime<Utc>) -> impl Iterator<Item = &T> {
        self.samples
            .iter()
            .filter(move |(at, _)| self.in_window(*at, now))
            .map(|(_, v)| v)
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

// ============================================================================
// Emergency council
// ============================================================================

/// Council decision kinds; each collects approvals independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyAction {
    Engage,
    Lift,
}

impl EmergencyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyAction::Engage => "engage",
            EmergencyAction::Lift => "lift",
        }
    }
}

impl fmt::Display for EmergencyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multi-party group allowed to engage and lift the emergency pause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyCouncil {
    members: BTreeSet<String>,
    threshold: usize,
}

impl EmergencyCouncil {
    /// Council of `members` needing `threshold` approvals (2 ≤ threshold ≤ members)
    pub fn new(
        members: impl IntoIterator<Item = String>,
        threshold: usize,
    ) -> Result<Self, SwapError> {
        let members: BTreeSet<String> = members
            .into_iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if threshold < 2 {
            return Err(SwapError::invalid(
                "emergency threshold must require at least 2 approvals",
            ));
        }
        if threshold > members.len() {
            return Err(SwapError::invalid(format!(
                "emergency threshold {} exceeds council size {}",
                threshold,
                members.len()
            )));
        }
        Ok(Self { members, threshold })
    }

    /// Council with no members; every approval is rejected
    pub fn disabled() -> Self {
        Self {
            members: BTreeSet::new(),
            threshold: 2,
        }
    }

    pub fn is_member(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Outcome of one council approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyVote {
    pub action: EmergencyAction,
    pub approvals: usize,
    pub threshold: usize,
    pub executed: bool,
    pub emergency_pause: bool,
}

// ============================================================================
// Breaker
// ============================================================================

/// Externally visible breaker state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub active: bool,
    pub emergency_pause: bool,
    pub triggered_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub recovers_at: Option<DateTime<Utc>>,
    pub emergency_engaged_at: Option<DateTime<Utc>>,
    pub thresholds: BreakerThresholds,
    pub window: WindowStats,
    pub pending_approvals: BTreeMap<EmergencyAction, usize>,
}

impl BreakerStatus {
    /// True while either the automatic breaker or the emergency pause holds
    pub fn halted(&self) -> bool {
        self.active || self.emergency_pause
    }

    /// Human-readable reason for a halt
    pub fn halt_reason(&self) -> String {
        match (self.emergency_pause, &self.reason) {
            (true, _) => "emergency pause engaged".to_string(),
            (false, Some(reason)) => format!("circuit breaker active: {}", reason),
            (false, None) => "circuit breaker active".to_string(),
        }
    }
}

/// State change produced by an observation or tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerTransition {
    Unchanged,
    Tripped { reason: String },
    Recovered,
}

#[derive(Debug)]
struct BreakerState {
    active: bool,
    emergency_pause: bool,
    triggered_at: Option<DateTime<Utc>>,
    reason: Option<String>,
    emergency_engaged_at: Option<DateTime<Utc>>,
    operations: RollingWindow<()>,
    attestations: RollingWindow<bool>,
    approvals: BTreeMap<EmergencyAction, BTreeSet<String>>,
}

/// Process-wide circuit breaker
pub struct CircuitBreaker {
    thresholds: BreakerThresholds,
    policies: Vec<Box<dyn TriggerPolicy>>,
    council: EmergencyCouncil,
    state: RwLock<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(thresholds: BreakerThresholds, council: EmergencyCouncil) -> Self {
        let policies = default_policies(&thresholds);
        Self::with_policies(thresholds, council, policies)
    }

    pub fn with_policies(
        thresholds: BreakerThresholds,
        council: EmergencyCouncil,
        policies: Vec<Box<dyn TriggerPolicy>>,
    ) -> Self {
        let state = BreakerState {
            active: false,
            emergency_pause: false,
            triggered_at: None,
            reason: None,
            emergency_engaged_at: None,
            operations: RollingWindow::new(thresholds.window_seconds, MAX_WINDOW_SAMPLES),
            attestations: RollingWindow::new(thresholds.window_seconds, MAX_WINDOW_SAMPLES),
            approvals: BTreeMap::new(),
        };
        Self {
            thresholds,
            policies,
            council,
            state: RwLock::new(state),
        }
    }

    pub fn thresholds(&self) -> &BreakerThresholds {
        &self.thresholds
    }

    pub fn council(&self) -> &EmergencyCouncil {
        &self.council
    }

    /// Effective status at `now`
    ///
    /// An automatic trip whose recovery delay has elapsed reads as inactive
    /// even before [`CircuitBreaker::tick`] writes the recovery back.
    pub async fn status(&self, now: DateTime<Utc>) -> BreakerStatus {
        let state = self.state.read().await;
        let active = state.active && !self.recovery_due(&state, now);
        BreakerStatus {
            active,
            emergency_pause: state.emergency_pause,
            triggered_at: if active { state.triggered_at } else { None },
            reason: if active { state.reason.clone() } else { None },
            recovers_at: if active && !state.emergency_pause {
                self.recovers_at(&state)
            } else {
                None
            },
            emergency_engaged_at: state.emergency_engaged_at,
            thresholds: self.thresholds.clone(),
            window: self.window_stats(&state, now),
            pending_approvals: state
                .approvals
                .iter()
                .filter(|(_, members)| !members.is_empty())
                .map(|(action, members)| (*action, members.len()))
                .collect(),
        }
    }

    pub async fn halted(&self, now: DateTime<Utc>) -> bool {
        self.status(now).await.halted()
    }

    /// Count one swap initiation
    pub async fn observe_operation(&self, now: DateTime<Utc>) -> BreakerTransition {
        let mut state = self.state.write().await;
        let recovered = self.recover_if_due(&mut state, now);
        state.operations.push(now, ());
        self.evaluate(&mut state, now, recovered)
    }

    /// Count one attestation outcome
    pub async fn observe_attestation(
        &self,
        outcome: Attestation,
        now: DateTime<Utc>,
    ) -> BreakerTransition {
        let mut state = self.state.write().await;
        let recovered = self.recover_if_due(&mut state, now);
        state
            .attestations
            .push(now, outcome == Attestation::Failed);
        self.evaluate(&mut state, now, recovered)
    }

    /// Apply auto-recovery and re-evaluate policies
    pub async fn tick(&self, now: DateTime<Utc>) -> BreakerTransition {
        let mut state = self.state.write().await;
        let recovered = self.recover_if_due(&mut state, now);
        state.operations.prune(now);
        state.attestations.prune(now);
        self.evaluate(&mut state, now, recovered)
    }

    /// Trip the breaker manually; returns false if it was already active
    pub async fn trigger(&self, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        let mut state = self.state.write().await;
        self.recover_if_due(&mut state, now);
        if state.active {
            return false;
        }
        self.trip(&mut state, reason.into(), now);
        true
    }

    /// Clear an automatic trip; the emergency pause is unaffected
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        if state.active {
            info!("Circuit breaker cleared manually");
        }
        Self::reset(&mut state);
    }

    /// Record a council member's approval for `action`
    ///
    /// Engage and Lift are separate proposals; each executes once its own
    /// approval count reaches the council threshold, after which both
    /// proposals start over.
    pub async fn approve_emergency(
        &self,
        action: EmergencyAction,
        member: &str,
        now: DateTime<Utc>,
    ) -> Result<EmergencyVote, SwapError> {
        let member = member.trim();
        if !self.council.is_member(member) {
            warn!(member = %member, action = %action, "Emergency approval from non-member rejected");
            return Err(SwapError::Unauthorized {
                member: member.to_string(),
            });
        }

        let mut state = self.state.write().await;
        let already = match action {
            EmergencyAction::Engage => state.emergency_pause,
            EmergencyAction::Lift => !state.emergency_pause,
        };
        if already {
            return Err(SwapError::invalid(match action {
                EmergencyAction::Engage => "emergency pause is already engaged",
                EmergencyAction::Lift => "emergency pause is not engaged",
            }));
        }

        let approvals = {
            let set = state.approvals.entry(action).or_default();
            set.insert(member.to_string());
            set.len()
        };
        let threshold = self.council.threshold();
        let executed = approvals >= threshold;

        if executed {
            match action {
                EmergencyAction::Engage => {
                    state.emergency_pause = true;
                    state.emergency_engaged_at = Some(now);
                    error!(approvals, threshold, "EMERGENCY PAUSE ENGAGED by council quorum");
                }
                EmergencyAction::Lift => {
                    state.emergency_pause = false;
                    state.emergency_engaged_at = None;
                    warn!(approvals, threshold, "Emergency pause lifted by council quorum");
                }
            }
            state.approvals.clear();
        } else {
            info!(
                member = %member,
                action = %action,
                approvals,
                threshold,
                "Emergency approval recorded"
            );
        }

        Ok(EmergencyVote {
            action,
            approvals,
            threshold,
            executed,
            emergency_pause: state.emergency_pause,
        })
    }

    fn recovers_at(&self, state: &BreakerState) -> Option<DateTime<Utc>> {
        state
            .triggered_at
            .map(|t| add_seconds(t, self.thresholds.auto_recovery_delay_seconds))
    }

    fn recovery_due(&self, state: &BreakerState, now: DateTime<Utc>) -> bool {
        state.active
            && !state.emergency_pause
            && self.recovers_at(state).is_some_and(|at| now >= at)
    }

    fn recover_if_due(&self, state: &mut BreakerState, now: DateTime<Utc>) -> bool {
        if !self.recovery_due(state, now) {
            return false;
        }
        info!(
            triggered_at = ?state.triggered_at,
            reason = ?state.reason,
            "Circuit breaker auto-recovered"
        );
        Self::reset(state);
        true
    }

    fn reset(state: &mut BreakerState) {
        state.active = false;
        state.triggered_at = None;
        state.reason = None;
        state.operations.clear();
        state.attestations.clear();
    }

    fn trip(&self, state: &mut BreakerState, reason: String, now: DateTime<Utc>) {
        warn!(reason = %reason, "Circuit breaker tripped");
        state.active = true;
        state.triggered_at = Some(now);
        state.reason = Some(reason);
    }

    fn window_stats(&self, state: &BreakerState, now: DateTime<Utc>) -> WindowStats {
        let mut stats = WindowStats {
            operations: state.operations.live(now).count() as u64,
            ..WindowStats::default()
        };
        for failed in state.attestations.live(now) {
            stats.attestations += 1;
            if *failed {
                stats.failed_attestations += 1;
            }
        }
        stats
    }

    fn evaluate(
        &self,
        state: &mut BreakerState,
        now: DateTime<Utc>,
        recovered: bool,
    ) -> BreakerTransition {
        if !state.active {
            let stats = self.window_stats(state, now);
            let fired = self
                .policies
                .iter()
                .find_map(|p| p.evaluate(&stats).map(|r| format!("{}: {}", p.name(), r)));
            if let Some(reason) = fired {
                self.trip(state, reason.clone(), now);
                return BreakerTransition::Tripped { reason };
            }
        }
        if recovered {
            BreakerTransition::Recovered
        } else {
            BreakerTransition::Unchanged
        }
    }
}
