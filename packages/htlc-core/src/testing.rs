//! Test fixtures: scripted adapters and a coordinator on a manual clock

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::adapter::AttestationSource;
use crate::breaker::{BreakerThresholds, CircuitBreaker, EmergencyCouncil};
use crate::clock::ManualClock;
use crate::coordinator::{CoordinatorConfig, SwapCoordinator};
use crate::store::{MemorySwapStore, SwapStore};
use crate::types::{Attestation, ChainId, OperationId};

/// Poll source that replays a fixed script, then reports undecided forever
///
/// `Err` entries in the script are returned as poll errors carrying that
/// message.
pub struct ScriptedSource {
    chain: ChainId,
    script: Mutex<VecDeque<Result<Option<Attestation>, String>>>,
    polls: AtomicU32,
}

impl ScriptedSource {
    pub fn new(chain: ChainId, script: Vec<Result<Option<Attestation>, String>>) -> Self {
        Self {
            chain,
            script: Mutex::new(script.into()),
            polls: AtomicU32::new(0),
        }
    }

    /// Source that decides on its first poll
    pub fn decided(chain: ChainId, outcome: Attestation) -> Self {
        Self::new(chain, vec![Ok(Some(outcome))])
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttestationSource for ScriptedSource {
    fn chain(&self) -> &ChainId {
        &self.chain
    }

    async fn poll(&self, _operation_id: &OperationId) -> eyre::Result<Option<Attestation>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = match self.script.lock() {
            Ok(mut script) => script.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        match next {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(eyre::eyre!(message)),
            None => Ok(None),
        }
    }
}

/// Chains `chaina`, `chainb`, `chainc`
pub fn test_chains() -> Vec<ChainId> {
    ["chaina", "chainb", "chainc"]
        .into_iter()
        .filter_map(|name| ChainId::new(name).ok())
        .collect()
}

/// Coordinator config over [`test_chains`]
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        consensus_chains: test_chains(),
        supported_chains: test_chains(),
        ..CoordinatorConfig::default()
    }
}

/// Coordinator wired to an in-memory store and a manual clock
pub struct TestHarness {
    pub coordinator: Arc<SwapCoordinator>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemorySwapStore>,
    pub breaker: Arc<CircuitBreaker>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with(test_config(), BreakerThresholds::default(), EmergencyCouncil::disabled())
    }

    /// # Panics
    ///
    /// If `config` or `thresholds` fail validation.
    pub fn with(
        config: CoordinatorConfig,
        thresholds: BreakerThresholds,
        council: EmergencyCouncil,
    ) -> Self {
        thresholds.validate().expect("valid breaker thresholds");
        let clock = Arc::new(ManualClock::at_epoch());
        let store = Arc::new(MemorySwapStore::new());
        let breaker = Arc::new(CircuitBreaker::new(thresholds, council));
        let coordinator = SwapCoordinator::new(
            config,
            store.clone() as Arc<dyn SwapStore>,
            breaker.clone(),
            clock.clone(),
        )
        .expect("valid coordinator config");
        Self {
            coordinator: Arc::new(coordinator),
            clock,
            store,
            breaker,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
