//! Swap coordinator
//!
//! Orchestrates the swap lifecycle over the store, the consensus verifier,
//! the circuit breaker and the initiation rate limiter. Every mutation runs
//! under the store's per-swap guard; consensus and breaker are re-read as the
//! final checks before a claim commits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::breaker::{
    BreakerStatus, BreakerTransition, CircuitBreaker, EmergencyAction, EmergencyVote,
};
use crate::clock::Clock;
use crate::consensus::{
    ConsensusRecord, ConsensusSnapshot, ConsensusVerifier, CONSENSUS_CHAINS, REQUIRED_QUORUM,
};
use crate::error::SwapError;
use crate::hash::{HashLock, Secret};
use crate::rate_limit::{InitiationLimiter, RateLimitConfig};
use crate::store::{SwapFilter, SwapGuard, SwapStore};
use crate::swap::{Swap, SwapSummary, SwapTerms, SwapView};
use crate::types::{Attestation, ChainId, OperationId, SwapId, SwapStatus};

/// Maximum recipient address length
pub const MAX_RECIPIENT_LEN: usize = 128;

/// Hard cap on a single list page
pub const MAX_LIST_LIMIT: usize = 500;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// The three chains attesting every operation
    pub consensus_chains: Vec<ChainId>,
    /// Chains accepted as swap source or destination
    pub supported_chains: Vec<ChainId>,
    pub default_timelock_seconds: u64,
    pub min_timelock_seconds: u64,
    pub max_timelock_seconds: u64,
    pub min_amount: u128,
    pub max_amount: Option<u128>,
    /// Page size for `list` when the caller gives none
    pub list_limit: usize,
    pub rate_limit: RateLimitConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let consensus_chains = ChainId::parse_list("arbitrum,solana,ton").unwrap_or_default();
        let mut supported_chains = consensus_chains.clone();
        supported_chains.extend(ChainId::new("ethereum").ok());
        Self {
            consensus_chains,
            supported_chains,
            default_timelock_seconds: 7 * 24 * 3600,
            min_timelock_seconds: 3600,
            max_timelock_seconds: 30 * 24 * 3600,
            min_amount: 1,
            max_amount: None,
            list_limit: 50,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), SwapError> {
        // Constructing a record checks the chain count and distinctness
        ConsensusRecord::new(OperationId([0; 32]), &self.consensus_chains)?;

        if self.supported_chains.is_empty() {
            return Err(SwapError::invalid("at least one supported chain is required"));
        }
        if self.min_timelock_seconds == 0 {
            return Err(SwapError::invalid("minimum timelock must be > 0 seconds"));
        }
        if self.min_timelock_seconds > self.max_timelock_seconds {
            return Err(SwapError::invalid(format!(
                "minimum timelock {}s exceeds maximum {}s",
                self.min_timelock_seconds, self.max_timelock_seconds
            )));
        }
        if !(self.min_timelock_seconds..=self.max_timelock_seconds)
            .contains(&self.default_timelock_seconds)
        {
            return Err(SwapError::invalid(format!(
                "default timelock {}s outside [{}, {}]",
                self.default_timelock_seconds, self.min_timelock_seconds, self.max_timelock_seconds
            )));
        }
        if self.min_amount == 0 {
            return Err(SwapError::invalid("minimum amount must be > 0"));
        }
        if let Some(max) = self.max_amount {
            if max < self.min_amount {
                return Err(SwapError::invalid(format!(
                    "maximum amount {} is below minimum {}",
                    max, self.min_amount
                )));
            }
        }
        if self.list_limit == 0 {
            return Err(SwapError::invalid("list limit must be > 0"));
        }
        if self.rate_limit.max_per_window == 0 || self.rate_limit.window_seconds == 0 {
            return Err(SwapError::invalid(
                "rate limit needs a non-zero count and window",
            ));
        }
        Ok(())
    }

    fn is_supported(&self, chain: &ChainId) -> bool {
        self.supported_chains.contains(chain)
    }
}

// ============================================================================
// Requests and receipts
// ============================================================================

/// Amount as sent by a client: a JSON number or a decimal string
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum AmountInput {
    Number(u64),
    Text(String),
}

impl AmountInput {
    fn parse(&self) -> Result<u128, SwapError> {
        match self {
            AmountInput::Number(n) => Ok(u128::from(*n)),
            AmountInput::Text(text) => {
                let text = text.trim();
                if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(SwapError::invalid(format!(
                        "amount must be a positive integer, got {:?}",
                        text
                    )));
                }
                text.parse::<u128>()
                    .map_err(|_| SwapError::invalid("amount is out of range"))
            }
        }
    }
}

impl From<u64> for AmountInput {
    fn from(n: u64) -> Self {
        AmountInput::Number(n)
    }
}

/// Initiation parameters; every field but the timelock is required
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub source_chain: Option<String>,
    pub destination_chain: Option<String>,
    pub amount: Option<AmountInput>,
    #[serde(alias = "recipientAddress")]
    pub recipient: Option<String>,
    pub timelock_seconds: Option<u64>,
}

impl InitiateRequest {
    pub fn new(
        source_chain: &str,
        destination_chain: &str,
        amount: u64,
        recipient: &str,
        timelock_seconds: Option<u64>,
    ) -> Self {
        Self {
            source_chain: Some(source_chain.to_string()),
            destination_chain: Some(destination_chain.to_string()),
            amount: Some(amount.into()),
            recipient: Some(recipient.to_string()),
            timelock_seconds,
        }
    }
}

/// List page and filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub recipient: Option<String>,
    /// Source or destination chain
    pub chain: Option<String>,
}

impl ListQuery {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

/// Returned to the initiator only; the one place the secret leaves the service
/// before it is revealed by a claim
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateReceipt {
    pub swap_id: SwapId,
    pub operation_id: OperationId,
    pub hash_lock: HashLock,
    pub secret: Secret,
    pub timelock_deadline: DateTime<Utc>,
    pub status: SwapStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReceipt {
    pub swap_id: SwapId,
    pub status: SwapStatus,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundReceipt {
    pub swap_id: SwapId,
    pub status: SwapStatus,
    pub refunded_at: DateTime<Utc>,
}

/// Result of one adapter report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationAck {
    pub operation_id: OperationId,
    pub swap_id: SwapId,
    pub chain: ChainId,
    pub outcome: Attestation,
    pub signed_count: usize,
    pub required: usize,
    pub consensus_reached: bool,
    pub status: SwapStatus,
    /// Status moved because of this report
    pub transitioned: bool,
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct SwapCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn SwapStore>,
    verifier: ConsensusVerifier,
    breaker: Arc<CircuitBreaker>,
    limiter: InitiationLimiter,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
}

impl SwapCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn SwapStore>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SwapError> {
        config.validate()?;
        Ok(Self {
            limiter: InitiationLimiter::new(config.rate_limit.clone()),
            config,
            store,
            verifier: ConsensusVerifier::new(),
            breaker,
            clock,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn verifier(&self) -> &ConsensusVerifier {
        &self.verifier
    }

    pub fn store(&self) -> &Arc<dyn SwapStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create a `Pending` swap with a fresh secret and consensus record
    pub async fn initiate(&self, request: InitiateRequest) -> Result<InitiateReceipt, SwapError> {
        let terms = self.validate_request(request)?;
        let now = self.clock.now();

        self.ensure_running(now).await?;
        self.limiter.try_acquire(&terms.recipient, now).await?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let swap = Swap::new(terms, Secret::generate(), now, sequence);

        self.verifier
            .register(swap.operation_id, &self.config.consensus_chains)
            .await?;
        if let Err(e) = self.store.insert(swap.clone()).await {
            self.verifier.remove(&swap.operation_id).await;
            warn!(swap_id = %swap.id, error = %e, "Swap initiation rolled back");
            return Err(e);
        }

        if let BreakerTransition::Tripped { reason } = self.breaker.observe_operation(now).await {
            warn!(swap_id = %swap.id, reason = %reason, "Breaker tripped by initiation volume");
        }

        info!(
            swap_id = %swap.id,
            operation_id = %swap.operation_id,
            source_chain = %swap.source_chain,
            destination_chain = %swap.destination_chain,
            amount = %swap.amount,
            timelock_deadline = %swap.timelock_deadline,
            status = %swap.status,
            "Swap initiated"
        );

        Ok(InitiateReceipt {
            swap_id: swap.id,
            operation_id: swap.operation_id,
            hash_lock: swap.hash_lock,
            secret: swap.sealed_secret().clone(),
            timelock_deadline: swap.timelock_deadline,
            status: swap.status,
        })
    }

    /// Adapter callback: record one chain's outcome and advance the swap
    ///
    /// Reports on swaps that already reached consensus or finished are
    /// recorded by the verifier without moving the swap.
    pub async fn on_chain_attestation(
        &self,
        operation_id: &OperationId,
        chain: &ChainId,
        outcome: Attestation,
    ) -> Result<AttestationAck, SwapError> {
        let swap_id = self
            .store
            .find_by_operation(operation_id)
            .await?
            .ok_or_else(|| SwapError::UnknownOperation {
                operation_id: operation_id.to_hex(),
            })?;
        let guard = self.lock(&swap_id).await?;
        let now = self.clock.now();

        // Records are per process; a swap created by another instance or
        // before a restart is registered on first sight.
        self.verifier
            .register(*operation_id, &self.config.consensus_chains)
            .await?;
        let report = self
            .verifier
            .report_attestation(operation_id, chain, outcome)
            .await?;

        let mut next = guard.swap().clone();
        let transition = next.advance_consensus(report.signed_count, report.reached, now);
        let status = next.status;
        if let Some(status) = transition {
            if let Err(e) = guard.commit(next).await {
                self.verifier.revert(&report).await;
                warn!(
                    swap_id = %swap_id,
                    chain = %chain,
                    error = %e,
                    "Attestation reverted after failed commit"
                );
                return Err(e);
            }
            info!(
                swap_id = %swap_id,
                operation_id = %operation_id,
                chain = %chain,
                signed = report.signed_count,
                status = %status,
                "Swap advanced on attestation"
            );
        } else if report.changed() && status.is_terminal() {
            debug!(
                swap_id = %swap_id,
                chain = %chain,
                outcome = %outcome,
                status = %status,
                "Late attestation recorded for finished swap"
            );
        }

        // A repeated outcome is not a new sample
        if report.changed() {
            if let BreakerTransition::Tripped { reason } =
                self.breaker.observe_attestation(outcome, now).await
            {
                warn!(
                    operation_id = %operation_id,
                    reason = %reason,
                    "Breaker tripped by attestation failures"
                );
            }
        }

        Ok(AttestationAck {
            operation_id: *operation_id,
            swap_id,
            chain: chain.clone(),
            outcome,
            signed_count: report.signed_count,
            required: REQUIRED_QUORUM,
            consensus_reached: report.reached,
            status,
            transitioned: transition.is_some(),
        })
    }

    /// Reveal the preimage and finalize the swap
    pub async fn claim(&self, swap_id: &SwapId, preimage: &str) -> Result<ClaimReceipt, SwapError> {
        let guard = self.lock(swap_id).await?;
        let now = self.clock.now();
        let swap = guard.swap().clone();

        swap.check_claimable(now)?;
        let secret = Secret::from_hex(preimage)
            .map_err(|e| SwapError::invalid(format!("preimage: {}", e)))?;
        swap.check_claim(&secret, now)?;

        // Final reads, as close to the commit as possible
        self.verifier
            .register(swap.operation_id, &self.config.consensus_chains)
            .await?;
        if !self.verifier.is_consensus_reached(&swap.operation_id).await? {
            let signed = self.verifier.quorum_count(&swap.operation_id).await?;
            return Err(SwapError::NotReady {
                reason: format!(
                    "consensus lost: {} of {} chains signed, {} required",
                    signed, CONSENSUS_CHAINS, REQUIRED_QUORUM
                ),
            });
        }
        self.ensure_running(self.clock.now()).await?;

        let mut next = swap.clone();
        next.mark_claimed(secret, now)?;
        guard.commit(next).await?;

        info!(
            swap_id = %swap_id,
            operation_id = %swap.operation_id,
            status = %SwapStatus::Claimed,
            "Swap claimed"
        );
        Ok(ClaimReceipt {
            swap_id: *swap_id,
            status: SwapStatus::Claimed,
            claimed_at: now,
        })
    }

    /// Return funds after the deadline; not gated by the breaker
    pub async fn refund(&self, swap_id: &SwapId) -> Result<RefundReceipt, SwapError> {
        let guard = self.lock(swap_id).await?;
        let now = self.clock.now();

        let mut next = guard.swap().clone();
        next.mark_refunded(now)?;
        let operation_id = next.operation_id;
        guard.commit(next).await?;

        info!(
            swap_id = %swap_id,
            operation_id = %operation_id,
            status = %SwapStatus::Refunded,
            "Swap refunded"
        );
        Ok(RefundReceipt {
            swap_id: *swap_id,
            status: SwapStatus::Refunded,
            refunded_at: now,
        })
    }

    /// Swap fields plus its consensus record; never waits on a swap guard
    pub async fn status(&self, swap_id: &SwapId) -> Result<SwapView, SwapError> {
        let swap = self
            .store
            .get(swap_id)
            .await?
            .ok_or_else(|| unknown_swap(swap_id))?;
        let consensus = self.consensus_snapshot(&swap).await?;
        Ok(swap.view(consensus))
    }

    /// Newest swaps first, optionally narrowed to one recipient or chain
    pub async fn list(&self, query: ListQuery) -> Result<Vec<SwapSummary>, SwapError> {
        let filter = SwapFilter {
            recipient: query
                .recipient
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
            chain: query
                .chain
                .filter(|c| !c.trim().is_empty())
                .map(|c| ChainId::new(&c))
                .transpose()?,
            limit: query
                .limit
                .unwrap_or(self.config.list_limit)
                .clamp(1, MAX_LIST_LIMIT),
        };
        let swaps = self.store.list(&filter).await?;

        let mut summaries = Vec::with_capacity(swaps.len());
        for swap in &swaps {
            let signed = match self.verifier.quorum_count(&swap.operation_id).await {
                Ok(signed) => signed,
                Err(SwapError::UnknownOperation { .. }) => 0,
                Err(e) => return Err(e),
            };
            summaries.push(swap.summary(signed));
        }
        Ok(summaries)
    }

    pub async fn breaker_status(&self) -> BreakerStatus {
        self.breaker.status(self.clock.now()).await
    }

    pub async fn approve_emergency(
        &self,
        action: EmergencyAction,
        member: &str,
    ) -> Result<EmergencyVote, SwapError> {
        self.breaker
            .approve_emergency(action, member, self.clock.now())
            .await
    }

    /// Re-register consensus records for every open stored swap
    pub async fn recover(&self) -> Result<usize, SwapError> {
        let open = self.store.non_terminal().await?;
        for swap in &open {
            self.verifier
                .register(swap.operation_id, &self.config.consensus_chains)
                .await?;
        }
        info!(open_swaps = open.len(), "Consensus records recovered");
        Ok(open.len())
    }

    fn validate_request(&self, request: InitiateRequest) -> Result<SwapTerms, SwapError> {
        let source_chain = self.parse_chain("sourceChain", request.source_chain)?;
        let destination_chain = self.parse_chain("destinationChain", request.destination_chain)?;
        if source_chain == destination_chain {
            return Err(SwapError::invalid(
                "sourceChain and destinationChain must differ",
            ));
        }

        let amount = request
            .amount
            .ok_or_else(|| SwapError::invalid("amount is required"))?
            .parse()?;
        if amount == 0 {
            return Err(SwapError::invalid("amount must be greater than zero"));
        }
        if amount < self.config.min_amount {
            return Err(SwapError::invalid(format!(
                "amount {} is below minimum {}",
                amount, self.config.min_amount
            )));
        }
        if let Some(max) = self.config.max_amount {
            if amount > max {
                return Err(SwapError::invalid(format!(
                    "amount {} exceeds maximum {}",
                    amount, max
                )));
            }
        }

        let recipient = request
            .recipient
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .ok_or_else(|| SwapError::invalid("recipient is required"))?;
        if recipient.len() > MAX_RECIPIENT_LEN {
            return Err(SwapError::invalid(format!(
                "recipient exceeds {} characters",
                MAX_RECIPIENT_LEN
            )));
        }

        let timelock_seconds = request
            .timelock_seconds
            .unwrap_or(self.config.default_timelock_seconds);
        if !(self.config.min_timelock_seconds..=self.config.max_timelock_seconds)
            .contains(&timelock_seconds)
        {
            return Err(SwapError::invalid(format!(
                "timelockSeconds {} outside [{}, {}]",
                timelock_seconds, self.config.min_timelock_seconds, self.config.max_timelock_seconds
            )));
        }

        Ok(SwapTerms {
            source_chain,
            destination_chain,
            amount,
            recipient,
            timelock_seconds,
        })
    }

    fn parse_chain(&self, field: &str, value: Option<String>) -> Result<ChainId, SwapError> {
        let value = value.ok_or_else(|| SwapError::invalid(format!("{} is required", field)))?;
        let chain = ChainId::new(&value)?;
        if !self.config.is_supported(&chain) {
            return Err(SwapError::invalid(format!(
                "{} {} is not supported",
                field, chain
            )));
        }
        Ok(chain)
    }

    async fn ensure_running(&self, now: DateTime<Utc>) -> Result<(), SwapError> {
        let status = self.breaker.status(now).await;
        if status.halted() {
            return Err(SwapError::OperationPaused {
                reason: status.halt_reason(),
            });
        }
        Ok(())
    }

    async fn lock(&self, swap_id: &SwapId) -> Result<Box<dyn SwapGuard>, SwapError> {
        self.store
            .lock(swap_id)
            .await?
            .ok_or_else(|| unknown_swap(swap_id))
    }

    async fn consensus_snapshot(&self, swap: &Swap) -> Result<ConsensusSnapshot, SwapError> {
        match self.verifier.snapshot(&swap.operation_id).await {
            Ok(snapshot) => Ok(snapshot),
            // Finished swaps are not re-registered after a restart
            Err(SwapError::UnknownOperation { .. }) => {
                Ok(ConsensusRecord::new(swap.operation_id, &self.config.consensus_chains)?.snapshot())
            }
            Err(e) => Err(e),
        }
    }
}

fn unknown_swap(swap_id: &SwapId) -> SwapError {
    SwapError::UnknownSwap {
        swap_id: swap_id.to_hex(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerThresholds, EmergencyCouncil};
    use crate::clock::ManualClock;
    use crate::store::{MemorySwapStore, SwapFilter};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// Memory store whose commits can be switched to fail
    #[derive(Default)]
    struct FlakyStore {
        inner: MemorySwapStore,
        fail_commits: Arc<AtomicBool>,
    }

    struct FlakyGuard {
        inner: Box<dyn SwapGuard>,
        fail: bool,
    }

    #[async_trait]
    impl SwapGuard for FlakyGuard {
        fn swap(&self) -> &Swap {
            self.inner.swap()
        }

        async fn commit(self: Box<Self>, swap: Swap) -> Result<(), SwapError> {
            if self.fail {
                return Err(SwapError::storage("connection reset"));
            }
            self.inner.commit(swap).await
        }
    }

    #[async_trait]
    impl SwapStore for FlakyStore {
        async fn insert(&self, swap: Swap) -> Result<(), SwapError> {
            self.inner.insert(swap).await
        }

        async fn get(&self, id: &SwapId) -> Result<Option<Swap>, SwapError> {
            self.inner.get(id).await
        }

        async fn lock(&self, id: &SwapId) -> Result<Option<Box<dyn SwapGuard>>, SwapError> {
            let fail = self.fail_commits.load(Ordering::SeqCst);
            Ok(self.inner.lock(id).await?.map(|inner| {
                Box::new(FlakyGuard { inner, fail }) as Box<dyn SwapGuard>
            }))
        }

        async fn find_by_operation(
            &self,
            operation_id: &OperationId,
        ) -> Result<Option<SwapId>, SwapError> {
            self.inner.find_by_operation(operation_id).await
        }

        async fn list(&self, filter: &SwapFilter) -> Result<Vec<Swap>, SwapError> {
            self.inner.list(filter).await
        }

        async fn non_terminal(&self) -> Result<Vec<Swap>, SwapError> {
            self.inner.non_terminal().await
        }
    }

    fn chain(name: &str) -> ChainId {
        ChainId::new(name).unwrap()
    }

    fn config() -> CoordinatorConfig {
        let chains = ChainId::parse_list("chaina,chainb,chainc").unwrap();
        CoordinatorConfig {
            supported_chains: chains.clone(),
            consensus_chains: chains,
            ..CoordinatorConfig::default()
        }
    }

    fn coordinator(config: CoordinatorConfig) -> (SwapCoordinator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch());
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerThresholds::default(),
            EmergencyCouncil::disabled(),
        ));
        let coordinator =
            SwapCoordinator::new(config, Arc::new(MemorySwapStore::new()), breaker, clock.clone())
                .unwrap();
        (coordinator, clock)
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = CoordinatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.consensus_chains.len(), 3);
        assert!(config.supported_chains.contains(&chain("ethereum")));
        assert_eq!(config.default_timelock_seconds, 604_800);
    }

    #[test]
    fn test_config_rejects_duplicate_consensus_chains() {
        let config = CoordinatorConfig {
            consensus_chains: ChainId::parse_list("chaina,chaina,chainb").unwrap(),
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_default_timelock_out_of_range() {
        let config = CoordinatorConfig {
            default_timelock_seconds: 60,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_amount_input_parsing() {
        let text: InitiateRequest =
            serde_json::from_str(r#"{"amount": "340282366920938463463374607431768211455"}"#).unwrap();
        assert_eq!(text.amount.unwrap().parse().unwrap(), u128::MAX);

        let number: InitiateRequest = serde_json::from_str(r#"{"amount": 10}"#).unwrap();
        assert_eq!(number.amount.unwrap().parse().unwrap(), 10);

        assert!(AmountInput::Text("-5".into()).parse().is_err());
        assert!(AmountInput::Text("1.5".into()).parse().is_err());
        assert!(AmountInput::Text("".into()).parse().is_err());
        assert!(serde_json::from_str::<InitiateRequest>(r#"{"amount": -1}"#).is_err());
    }

    #[test]
    fn test_recipient_address_alias() {
        let request: InitiateRequest =
            serde_json::from_str(r#"{"recipientAddress": "addr1"}"#).unwrap();
        assert_eq!(request.recipient.as_deref(), Some("addr1"));
    }

    #[tokio::test]
    async fn test_initiate_validation_errors() {
        let (coordinator, _) = coordinator(config());

        let cases = vec![
            InitiateRequest {
                source_chain: None,
                ..InitiateRequest::new("chaina", "chainb", 10, "addr1", None)
            },
            InitiateRequest::new("chaina", "chaina", 10, "addr1", None),
            InitiateRequest::new("chaina", "unknown", 10, "addr1", None),
            InitiateRequest::new("chaina", "chainb", 0, "addr1", None),
            InitiateRequest::new("chaina", "chainb", 10, "   ", None),
            InitiateRequest::new("chaina", "chainb", 10, &"x".repeat(129), None),
            InitiateRequest::new("chaina", "chainb", 10, "addr1", Some(0)),
            InitiateRequest::new("chaina", "chainb", 10, "addr1", Some(31 * 24 * 3600)),
        ];
        for request in cases {
            let err = coordinator.initiate(request.clone()).await.unwrap_err();
            assert!(
                matches!(err, SwapError::InvalidParameters { .. }),
                "expected InvalidParameters for {:?}, got {:?}",
                request,
                err
            );
        }
        assert!(coordinator.list(ListQuery::default()).await.unwrap().is_empty());
        assert!(coordinator.verifier().is_empty().await);
    }

    #[tokio::test]
    async fn test_initiate_uses_default_timelock() {
        let (coordinator, clock) = coordinator(config());
        let receipt = coordinator
            .initiate(InitiateRequest::new("chainA", "chainB", 10, "addr1", None))
            .await
            .unwrap();
        assert_eq!(
            receipt.timelock_deadline,
            clock.now() + chrono::Duration::days(7)
        );
        assert!(receipt.hash_lock.verify(&receipt.secret));
        assert_eq!(receipt.status, SwapStatus::Pending);
    }

    #[tokio::test]
    async fn test_max_amount_enforced() {
        let (coordinator, _) = coordinator(CoordinatorConfig {
            max_amount: Some(100),
            ..config()
        });
        let err = coordinator
            .initiate(InitiateRequest::new("chaina", "chainb", 101, "addr1", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidParameters { .. }));
    }

    #[tokio::test]
    async fn test_rate_limit_per_recipient() {
        let (coordinator, _) = coordinator(CoordinatorConfig {
            rate_limit: RateLimitConfig {
                max_per_window: 2,
                window_seconds: 3600,
            },
            ..config()
        });
        for _ in 0..2 {
            coordinator
                .initiate(InitiateRequest::new("chaina", "chainb", 10, "addr1", None))
                .await
                .unwrap();
        }
        let err = coordinator
            .initiate(InitiateRequest::new("chaina", "chainb", 10, "addr1", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::RateLimitExceeded { .. }));

        coordinator
            .initiate(InitiateRequest::new("chaina", "chainb", 10, "addr2", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_attestation_from_foreign_chain_rejected() {
        let (coordinator, _) = coordinator(config());
        let receipt = coordinator
            .initiate(InitiateRequest::new("chaina", "chainb", 10, "addr1", None))
            .await
            .unwrap();
        let err = coordinator
            .on_chain_attestation(&receipt.operation_id, &chain("chaind"), Attestation::Signed)
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidParameters { .. }));
    }

    #[tokio::test]
    async fn test_malformed_preimage_is_invalid_parameters() {
        let (coordinator, _) = coordinator(config());
        let receipt = coordinator
            .initiate(InitiateRequest::new("chaina", "chainb", 10, "addr1", None))
            .await
            .unwrap();
        for c in ["chaina", "chainb"] {
            coordinator
                .on_chain_attestation(&receipt.operation_id, &chain(c), Attestation::Signed)
                .await
                .unwrap();
        }
        let err = coordinator.claim(&receipt.swap_id, "0x1234").await.unwrap_err();
        assert!(matches!(err, SwapError::InvalidParameters { .. }));
    }

    #[tokio::test]
    async fn test_malformed_preimage_before_consensus_is_not_ready() {
        let (coordinator, _) = coordinator(config());
        let receipt = coordinator
            .initiate(InitiateRequest::new("chaina", "chainb", 10, "addr1", None))
            .await
            .unwrap();
        let err = coordinator.claim(&receipt.swap_id, "garbage").await.unwrap_err();
        assert!(matches!(err, SwapError::NotReady { .. }));
    }

    #[tokio::test]
    async fn test_claim_rechecks_live_consensus() {
        let (coordinator, _) = coordinator(config());
        let receipt = coordinator
            .initiate(InitiateRequest::new("chaina", "chainb", 10, "addr1", None))
            .await
            .unwrap();
        for c in ["chaina", "chainb"] {
            coordinator
                .on_chain_attestation(&receipt.operation_id, &chain(c), Attestation::Signed)
                .await
                .unwrap();
        }
        // chainb retracts: the swap keeps ConsensusReached but quorum is gone
        let ack = coordinator
            .on_chain_attestation(&receipt.operation_id, &chain("chainb"), Attestation::Failed)
            .await
            .unwrap();
        assert_eq!(ack.status, SwapStatus::ConsensusReached);
        assert!(!ack.consensus_reached);

        let err = coordinator
            .claim(&receipt.swap_id, &receipt.secret.to_hex())
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::NotReady { .. }));
        assert_eq!(
            coordinator.status(&receipt.swap_id).await.unwrap().summary.status,
            SwapStatus::ConsensusReached
        );
    }

    #[tokio::test]
    async fn test_failed_commit_reverts_attestation() {
        let store = FlakyStore::default();
        let fail_commits = store.fail_commits.clone();
        let clock = Arc::new(ManualClock::at_epoch());
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerThresholds::default(),
            EmergencyCouncil::disabled(),
        ));
        let coordinator =
            SwapCoordinator::new(config(), Arc::new(store), breaker, clock).unwrap();
        let receipt = coordinator
            .initiate(InitiateRequest::new("chaina", "chainb", 10, "addr1", None))
            .await
            .unwrap();
        coordinator
            .on_chain_attestation(&receipt.operation_id, &chain("chaina"), Attestation::Signed)
            .await
            .unwrap();

        fail_commits.store(true, Ordering::SeqCst);
        let err = coordinator
            .on_chain_attestation(&receipt.operation_id, &chain("chainb"), Attestation::Signed)
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::Storage { .. }));

        // Consensus did not move ahead of the stored status
        let view = coordinator.status(&receipt.swap_id).await.unwrap();
        assert_eq!(view.summary.status, SwapStatus::ConsensusPending);
        assert_eq!(view.consensus.signed_count, 1);
        assert!(!coordinator
            .verifier()
            .is_consensus_reached(&receipt.operation_id)
            .await
            .unwrap());

        // The adapter's retry lands normally
        fail_commits.store(false, Ordering::SeqCst);
        let ack = coordinator
            .on_chain_attestation(&receipt.operation_id, &chain("chainb"), Attestation::Signed)
            .await
            .unwrap();
        assert!(ack.transitioned);
        assert_eq!(ack.status, SwapStatus::ConsensusReached);
    }

    #[tokio::test]
    async fn test_recover_reregisters_open_swaps() {
        let clock = Arc::new(ManualClock::at_epoch());
        let store: Arc<dyn SwapStore> = Arc::new(MemorySwapStore::new());
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerThresholds::default(),
            EmergencyCouncil::disabled(),
        ));

        let first =
            SwapCoordinator::new(config(), store.clone(), breaker.clone(), clock.clone()).unwrap();
        let open = first
            .initiate(InitiateRequest::new("chaina", "chainb", 10, "addr1", None))
            .await
            .unwrap();
        let done = first
            .initiate(InitiateRequest::new("chaina", "chainb", 10, "addr2", Some(3600)))
            .await
            .unwrap();
        clock.advance_secs(3600);
        first.refund(&done.swap_id).await.unwrap();

        let restarted = SwapCoordinator::new(config(), store, breaker, clock).unwrap();
        assert_eq!(restarted.recover().await.unwrap(), 1);
        assert_eq!(restarted.verifier().len().await, 1);
        assert_eq!(
            restarted.verifier().quorum_count(&open.operation_id).await.unwrap(),
            0
        );
        // Finished swap still has a readable status
        let view = restarted.status(&done.swap_id).await.unwrap();
        assert_eq!(view.summary.status, SwapStatus::Refunded);
    }
}
