//! Consensus verifier (2-of-3 cross-chain quorum)
//!
//! Each swap links to one consensus record keyed by its operation id. Every
//! participating chain holds a tagged [`ChainStatus`]; reports overwrite the
//! chain's slot (last write wins), and the signed count is always derived
//! from the slots. This keeps aggregation commutative and replay-safe: any
//! arrival order of the same final per-chain outcomes yields the same quorum
//! decision.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::SwapError;
use crate::types::{Attestation, ChainId, ChainStatus, OperationId};

/// Signed attestations required before a swap may finalize
pub const REQUIRED_QUORUM: usize = 2;

/// Number of independent chains attesting each operation
pub const CONSENSUS_CHAINS: usize = 3;

/// Per-operation attestation state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusRecord {
    operation_id: OperationId,
    per_chain: BTreeMap<ChainId, ChainStatus>,
}

impl ConsensusRecord {
    /// New record with every chain `Pending`
    ///
    /// Requires exactly [`CONSENSUS_CHAINS`] distinct chains.
    pub fn new(operation_id: OperationId, chains: &[ChainId]) -> Result<Self, SwapError> {
        let per_chain: BTreeMap<ChainId, ChainStatus> = chains
            .iter()
            .map(|c| (c.clone(), ChainStatus::Pending))
            .collect();
        if chains.len() != CONSENSUS_CHAINS || per_chain.len() != CONSENSUS_CHAINS {
            return Err(SwapError::invalid(format!(
                "consensus requires exactly {} distinct chains, got {:?}",
                CONSENSUS_CHAINS,
                chains.iter().map(|c| c.as_str()).collect::<Vec<_>>()
            )));
        }
        Ok(Self {
            operation_id,
            per_chain,
        })
    }

    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    pub fn status_of(&self, chain: &ChainId) -> Option<ChainStatus> {
        self.per_chain.get(chain).copied()
    }

    pub fn chains(&self) -> impl Iterator<Item = &ChainId> {
        self.per_chain.keys()
    }

    pub fn signed_count(&self) -> usize {
        self.count(ChainStatus::Signed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(ChainStatus::Failed)
    }

    pub fn is_reached(&self) -> bool {
        self.signed_count() >= REQUIRED_QUORUM
    }

    fn count(&self, status: ChainStatus) -> usize {
        self.per_chain.values().filter(|s| **s == status).count()
    }

    /// Overwrite one chain's slot
    fn apply(&mut self, chain: &ChainId, outcome: Attestation) -> Result<AttestationReport, SwapError> {
        let slot = self.per_chain.get_mut(chain).ok_or_else(|| {
            SwapError::invalid(format!(
                "chain {} does not attest operation {}",
                chain, self.operation_id
            ))
        })?;
        let previous = *slot;
        let current = ChainStatus::from(outcome);
        *slot = current;

        Ok(AttestationReport {
            operation_id: self.operation_id,
            chain: chain.clone(),
            previous,
            current,
            signed_count: self.signed_count(),
            failed_count: self.failed_count(),
            reached: self.is_reached(),
        })
    }

    pub fn snapshot(&self) -> ConsensusSnapshot {
        ConsensusSnapshot {
            per_chain: self.per_chain.clone(),
            signed_count: self.signed_count(),
            failed_count: self.failed_count(),
            required: REQUIRED_QUORUM,
            reached: self.is_reached(),
        }
    }
}

/// Read-only view of a consensus record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusSnapshot {
    pub per_chain: BTreeMap<ChainId, ChainStatus>,
    pub signed_count: usize,
    pub failed_count: usize,
    pub required: usize,
    pub reached: bool,
}

/// Result of applying one attestation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationReport {
    pub operation_id: OperationId,
    pub chain: ChainId,
    pub previous: ChainStatus,
    pub current: ChainStatus,
    pub signed_count: usize,
    pub failed_count: usize,
    pub reached: bool,
}

impl AttestationReport {
    /// False for a repeated identical report
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Owner of all consensus records
#[derive(Debug, Default)]
pub struct ConsensusVerifier {
    records: RwLock<HashMap<OperationId, ConsensusRecord>>,
}

impl ConsensusVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation with all chains `Pending`
    ///
    /// Registering an operation that already exists keeps the existing
    /// record, so replaying registrations after a restart is harmless.
    pub async fn register(
        &self,
        operation_id: OperationId,
        chains: &[ChainId],
    ) -> Result<(), SwapError> {
        let record = ConsensusRecord::new(operation_id, chains)?;
        let mut records = self.records.write().await;
        records.entry(operation_id).or_insert(record);
        Ok(())
    }

    /// Drop a record whose swap never got persisted
    pub async fn remove(&self, operation_id: &OperationId) {
        self.records.write().await.remove(operation_id);
    }

    /// Record one chain's outcome; idempotent per `(operation, chain)`
    pub async fn report_attestation(
        &self,
        operation_id: &OperationId,
        chain: &ChainId,
        outcome: Attestation,
    ) -> Result<AttestationReport, SwapError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(operation_id)
            .ok_or_else(|| unknown_operation(operation_id))?;
        let report = record.apply(chain, outcome)?;

        debug!(
            operation_id = %operation_id,
            chain = %chain,
            previous = %report.previous,
            current = %report.current,
            signed = report.signed_count,
            reached = report.reached,
            "Attestation recorded"
        );
        Ok(report)
    }

    /// Put the reported chain's slot back to `report.previous`
    ///
    /// Used when the swap update that followed a report failed to persist.
    pub async fn revert(&self, report: &AttestationReport) {
        let mut records = self.records.write().await;
        if let Some(slot) = records
            .get_mut(&report.operation_id)
            .and_then(|record| record.per_chain.get_mut(&report.chain))
        {
            *slot = report.previous;
        }
        debug!(
            operation_id = %report.operation_id,
            chain = %report.chain,
            restored = %report.previous,
            "Attestation reverted"
        );
    }

    pub async fn is_consensus_reached(&self, operation_id: &OperationId) -> Result<bool, SwapError> {
        self.with_record(operation_id, ConsensusRecord::is_reached).await
    }

    /// Number of chains currently `Signed`
    pub async fn quorum_count(&self, operation_id: &OperationId) -> Result<usize, SwapError> {
        self.with_record(operation_id, ConsensusRecord::signed_count).await
    }

    pub async fn snapshot(&self, operation_id: &OperationId) -> Result<ConsensusSnapshot, SwapError> {
        self.with_record(operation_id, ConsensusRecord::snapshot).await
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn with_record<T>(
        &self,
        operation_id: &OperationId,
        f: impl FnOnce(&ConsensusRecord) -> T,
    ) -> Result<T, SwapError> {
        let records = self.records.read().await;
        records
            .get(operation_id)
            .map(f)
            .ok_or_else(|| unknown_operation(operation_id))
    }
}

fn unknown_operation(operation_id: &OperationId) -> SwapError {
    SwapError::UnknownOperation {
        operation_id: operation_id.to_hex(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chains() -> Vec<ChainId> {
        ["chaina", "chainb", "chainc"]
            .iter()
            .map(|c| ChainId::new(c).unwrap())
            .collect()
    }

    fn op(n: u8) -> OperationId {
        OperationId([n; 32])
    }

    /// Every ordering of three items
    fn permutations<T: Clone>(items: &[T; 3]) -> Vec<Vec<T>> {
        const ORDERS: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        ORDERS
            .iter()
            .map(|order| order.iter().map(|i| items[*i].clone()).collect())
            .collect()
    }

    #[test]
    fn test_record_requires_three_distinct_chains() {
        let c = chains();
        assert!(ConsensusRecord::new(op(1), &c[..2]).is_err());
        let dup = vec![c[0].clone(), c[0].clone(), c[1].clone()];
        assert!(ConsensusRecord::new(op(1), &dup).is_err());
        assert!(ConsensusRecord::new(op(1), &c).is_ok());
    }

    #[tokio::test]
    async fn test_quorum_reached_with_two_signed() {
        let verifier = ConsensusVerifier::new();
        let c = chains();
        verifier.register(op(1), &c).await.unwrap();

        verifier
            .report_attestation(&op(1), &c[0], Attestation::Signed)
            .await
            .unwrap();
        assert!(!verifier.is_consensus_reached(&op(1)).await.unwrap());

        let report = verifier
            .report_attestation(&op(1), &c[1], Attestation::Signed)
            .await
            .unwrap();
        assert!(report.reached);
        assert_eq!(verifier.quorum_count(&op(1)).await.unwrap(), 2);
        assert!(verifier.is_consensus_reached(&op(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_chain_does_not_block_quorum() {
        let verifier = ConsensusVerifier::new();
        let c = chains();
        verifier.register(op(1), &c).await.unwrap();

        verifier.report_attestation(&op(1), &c[2], Attestation::Failed).await.unwrap();
        verifier.report_attestation(&op(1), &c[0], Attestation::Signed).await.unwrap();
        verifier.report_attestation(&op(1), &c[1], Attestation::Signed).await.unwrap();

        let snapshot = verifier.snapshot(&op(1)).await.unwrap();
        assert_eq!(snapshot.signed_count, 2);
        assert_eq!(snapshot.failed_count, 1);
        assert!(snapshot.reached);
    }

    #[tokio::test]
    async fn test_two_failed_prevents_quorum() {
        let verifier = ConsensusVerifier::new();
        let c = chains();
        verifier.register(op(1), &c).await.unwrap();

        verifier.report_attestation(&op(1), &c[0], Attestation::Failed).await.unwrap();
        verifier.report_attestation(&op(1), &c[1], Attestation::Failed).await.unwrap();
        verifier.report_attestation(&op(1), &c[2], Attestation::Signed).await.unwrap();

        assert!(!verifier.is_consensus_reached(&op(1)).await.unwrap());
        assert_eq!(verifier.quorum_count(&op(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_arrival_order_does_not_matter() {
        let c = chains();
        let reports = [
            (c[0].clone(), Attestation::Signed),
            (c[1].clone(), Attestation::Signed),
            (c[2].clone(), Attestation::Failed),
        ];

        let mut finals = Vec::new();
        for order in permutations(&reports) {
            let verifier = ConsensusVerifier::new();
            verifier.register(op(9), &c).await.unwrap();
            for (chain, outcome) in order {
                verifier.report_attestation(&op(9), &chain, outcome).await.unwrap();
            }
            finals.push(verifier.snapshot(&op(9)).await.unwrap());
        }

        assert_eq!(finals.len(), 6);
        assert!(finals.iter().all(|s| s == &finals[0]));
        assert!(finals[0].reached);
        assert_eq!(finals[0].signed_count, 2);
    }

    #[tokio::test]
    async fn test_repeated_report_is_idempotent() {
        let verifier = ConsensusVerifier::new();
        let c = chains();
        verifier.register(op(1), &c).await.unwrap();

        let first = verifier
            .report_attestation(&op(1), &c[0], Attestation::Signed)
            .await
            .unwrap();
        let second = verifier
            .report_attestation(&op(1), &c[0], Attestation::Signed)
            .await
            .unwrap();

        assert!(first.changed());
        assert!(!second.changed());
        assert_eq!(second.signed_count, 1);
        assert!(!verifier.is_consensus_reached(&op(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_signed_then_failed_overwrites() {
        let verifier = ConsensusVerifier::new();
        let c = chains();
        verifier.register(op(1), &c).await.unwrap();

        verifier.report_attestation(&op(1), &c[0], Attestation::Signed).await.unwrap();
        verifier.report_attestation(&op(1), &c[1], Attestation::Signed).await.unwrap();
        assert!(verifier.is_consensus_reached(&op(1)).await.unwrap());

        let report = verifier
            .report_attestation(&op(1), &c[0], Attestation::Failed)
            .await
            .unwrap();
        assert_eq!(report.previous, ChainStatus::Signed);
        assert_eq!(report.current, ChainStatus::Failed);
        assert_eq!(report.signed_count, 1);
        assert!(!verifier.is_consensus_reached(&op(1)).await.unwrap());

        let snapshot = verifier.snapshot(&op(1)).await.unwrap();
        assert_eq!(snapshot.per_chain.get(&c[0]), Some(&ChainStatus::Failed));
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let verifier = ConsensusVerifier::new();
        let c = chains();
        let err = verifier
            .report_attestation(&op(7), &c[0], Attestation::Signed)
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::UnknownOperation { .. }));
        assert!(matches!(
            verifier.is_consensus_reached(&op(7)).await,
            Err(SwapError::UnknownOperation { .. })
        ));
    }

    #[tokio::test]
    async fn test_report_from_foreign_chain_rejected() {
        let verifier = ConsensusVerifier::new();
        verifier.register(op(1), &chains()).await.unwrap();
        let outsider = ChainId::new("ethereum").unwrap();
        let err = verifier
            .report_attestation(&op(1), &outsider, Attestation::Signed)
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidParameters { .. }));
        assert_eq!(verifier.quorum_count(&op(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reregister_keeps_existing_record() {
        let verifier = ConsensusVerifier::new();
        let c = chains();
        verifier.register(op(1), &c).await.unwrap();
        verifier.report_attestation(&op(1), &c[0], Attestation::Signed).await.unwrap();

        verifier.register(op(1), &c).await.unwrap();
        assert_eq!(verifier.quorum_count(&op(1)).await.unwrap(), 1);
        assert_eq!(verifier.len().await, 1);

        verifier.remove(&op(1)).await;
        assert!(verifier.is_empty().await);
    }
}
