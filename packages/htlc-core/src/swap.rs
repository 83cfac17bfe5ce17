//! Swap record and lifecycle transitions
//!
//! A [`Swap`] only changes through the transition methods below, each of
//! which checks its guard before touching any field. A failed transition
//! leaves the record exactly as it was.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::consensus::{ConsensusSnapshot, REQUIRED_QUORUM};
use crate::error::SwapError;
use crate::hash::{
    compute_swap_id, is_expired, remaining_seconds, timelock_deadline, HashLock, Secret,
};
use crate::types::{amount_string, ChainId, OperationId, SwapId, SwapStatus};

/// Validated parameters for a new swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapTerms {
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    pub amount: u128,
    pub recipient: String,
    pub timelock_seconds: u64,
}

/// HTLC swap record
///
/// The sealed secret is kept server-side for the initiator and never appears
/// in [`SwapSummary`] or [`SwapView`]; `revealed_secret` is set by a claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Swap {
    pub id: SwapId,
    pub operation_id: OperationId,
    pub hash_lock: HashLock,
    pub(crate) sealed_secret: Secret,
    pub revealed_secret: Option<Secret>,
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    pub amount: u128,
    pub recipient: String,
    pub timelock_seconds: u64,
    pub timelock_deadline: DateTime<Utc>,
    pub status: SwapStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl Swap {
    /// New `Pending` swap locked by `secret`
    pub fn new(terms: SwapTerms, secret: Secret, created_at: DateTime<Utc>, sequence: u64) -> Self {
        let hash_lock = secret.hash_lock();
        let id = SwapId(compute_swap_id(
            terms.source_chain.as_str(),
            terms.destination_chain.as_str(),
            &terms.recipient,
            terms.amount,
            &hash_lock,
            created_at,
            sequence,
        ));
        Self {
            id,
            operation_id: id.operation_id(),
            hash_lock,
            sealed_secret: secret,
            revealed_secret: None,
            source_chain: terms.source_chain,
            destination_chain: terms.destination_chain,
            amount: terms.amount,
            recipient: terms.recipient,
            timelock_seconds: terms.timelock_seconds,
            timelock_deadline: timelock_deadline(created_at, terms.timelock_seconds),
            status: SwapStatus::Pending,
            created_at,
            updated_at: created_at,
            claimed_at: None,
            refunded_at: None,
        }
    }

    /// Server-retained secret, handed back to the initiator only
    pub fn sealed_secret(&self) -> &Secret {
        &self.sealed_secret
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.timelock_deadline, now)
    }

    /// Advance on consensus progress
    ///
    /// Returns the new status if a transition happened. Swaps already at
    /// `ConsensusReached` or terminal keep their status; later reports are
    /// recorded by the verifier only.
    pub fn advance_consensus(
        &mut self,
        signed_count: usize,
        reached: bool,
        now: DateTime<Utc>,
    ) -> Option<SwapStatus> {
        let next = if reached {
            SwapStatus::ConsensusReached
        } else if signed_count >= 1 {
            SwapStatus::ConsensusPending
        } else {
            return None;
        };
        if !self.status.can_transition_to(next) {
            return None;
        }
        self.status = next;
        self.updated_at = now;
        Some(next)
    }

    /// Claim guard, excluding the live consensus and breaker re-check
    ///
    /// Order: terminal, deadline, status, preimage.
    pub fn check_claim(&self, preimage: &Secret, now: DateTime<Utc>) -> Result<(), SwapError> {
        self.check_claimable(now)?;
        if !self.hash_lock.verify(preimage) {
            return Err(SwapError::InvalidPreimage);
        }
        Ok(())
    }

    /// Claim guard up to, but not including, the preimage
    pub fn check_claimable(&self, now: DateTime<Utc>) -> Result<(), SwapError> {
        if self.status.is_terminal() {
            return Err(SwapError::StateConflict {
                status: self.status,
            });
        }
        if self.is_expired(now) {
            return Err(SwapError::TimelockExpired {
                deadline: self.timelock_deadline,
            });
        }
        if self.status != SwapStatus::ConsensusReached {
            return Err(SwapError::NotReady {
                reason: format!(
                    "swap is {}, {} of 3 chain attestations required",
                    self.status, REQUIRED_QUORUM
                ),
            });
        }
        Ok(())
    }

    /// Finalize a claim whose guard already passed
    pub fn mark_claimed(&mut self, preimage: Secret, now: DateTime<Utc>) -> Result<(), SwapError> {
        self.check_claim(&preimage, now)?;
        self.status = SwapStatus::Claimed;
        self.revealed_secret = Some(preimage);
        self.claimed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Refund guard: not terminal and the time lock has expired
    pub fn check_refund(&self, now: DateTime<Utc>) -> Result<(), SwapError> {
        if self.status.is_terminal() {
            return Err(SwapError::StateConflict {
                status: self.status,
            });
        }
        if !self.is_expired(now) {
            return Err(SwapError::TimelockNotExpired {
                remaining_seconds: remaining_seconds(self.timelock_deadline, now),
            });
        }
        Ok(())
    }

    pub fn mark_refunded(&mut self, now: DateTime<Utc>) -> Result<(), SwapError> {
        self.check_refund(now)?;
        self.status = SwapStatus::Refunded;
        self.refunded_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// List row with the operation's current signed count
    pub fn summary(&self, consensus_count: usize) -> SwapSummary {
        SwapSummary {
            swap_id: self.id,
            operation_id: self.operation_id,
            status: self.status,
            source_chain: self.source_chain.clone(),
            destination_chain: self.destination_chain.clone(),
            amount: self.amount,
            recipient: self.recipient.clone(),
            hash_lock: self.hash_lock,
            timelock_deadline: self.timelock_deadline,
            created_at: self.created_at,
            consensus_count,
        }
    }

    pub fn view(&self, consensus: ConsensusSnapshot) -> SwapView {
        SwapView {
            summary: self.summary(consensus.signed_count),
            secret: self.revealed_secret.clone(),
            timelock_seconds: self.timelock_seconds,
            updated_at: self.updated_at,
            claimed_at: self.claimed_at,
            refunded_at: self.refunded_at,
            consensus_required: consensus.required,
            consensus,
        }
    }
}

/// List row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapSummary {
    pub swap_id: SwapId,
    pub operation_id: OperationId,
    pub status: SwapStatus,
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    #[serde(with = "amount_string")]
    pub amount: u128,
    pub recipient: String,
    pub hash_lock: HashLock,
    pub timelock_deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Chains currently `Signed`
    pub consensus_count: usize,
}

/// Status response: swap fields plus its consensus record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapView {
    #[serde(flatten)]
    pub summary: SwapSummary,
    /// Present only after a claim revealed it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<Secret>,
    pub timelock_seconds: u64,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub consensus: ConsensusSnapshot,
    pub consensus_required: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn terms() -> SwapTerms {
        SwapTerms {
            source_chain: ChainId::new("chaina").unwrap(),
            destination_chain: ChainId::new("chainb").unwrap(),
            amount: 10,
            recipient: "addr1".to_string(),
            timelock_seconds: 86_400,
        }
    }

    fn reached_swap(secret: &Secret) -> Swap {
        let mut swap = Swap::new(terms(), secret.clone(), t0(), 1);
        swap.advance_consensus(2, true, t0());
        swap
    }

    #[test]
    fn test_new_swap_is_pending_and_locked() {
        let secret = Secret::generate();
        let swap = Swap::new(terms(), secret.clone(), t0(), 1);
        assert_eq!(swap.status, SwapStatus::Pending);
        assert!(swap.hash_lock.verify(&secret));
        assert_eq!(swap.operation_id, swap.id.operation_id());
        assert_eq!(swap.timelock_deadline, t0() + Duration::days(1));
        assert!(swap.revealed_secret.is_none());
    }

    #[test]
    fn test_consensus_progression() {
        let mut swap = Swap::new(terms(), Secret::generate(), t0(), 1);
        assert_eq!(swap.advance_consensus(0, false, t0()), None);
        assert_eq!(
            swap.advance_consensus(1, false, t0()),
            Some(SwapStatus::ConsensusPending)
        );
        // Repeated progress without quorum is not a transition
        assert_eq!(swap.advance_consensus(1, false, t0()), None);
        assert_eq!(
            swap.advance_consensus(2, true, t0()),
            Some(SwapStatus::ConsensusReached)
        );
        // Late report after quorum: recorded elsewhere, no transition here
        assert_eq!(swap.advance_consensus(3, true, t0()), None);
        // Quorum loss never moves the status backwards
        assert_eq!(swap.advance_consensus(1, false, t0()), None);
        assert_eq!(swap.status, SwapStatus::ConsensusReached);
    }

    #[test]
    fn test_claim_requires_consensus() {
        let secret = Secret::generate();
        let swap = Swap::new(terms(), secret.clone(), t0(), 1);
        let err = swap.check_claim(&secret, t0()).unwrap_err();
        assert!(matches!(err, SwapError::NotReady { .. }));
    }

    #[test]
    fn test_claim_with_wrong_preimage_leaves_state() {
        let secret = Secret::generate();
        let mut swap = reached_swap(&secret);
        let before = swap.clone();
        let err = swap.mark_claimed(Secret::generate(), t0()).unwrap_err();
        assert_eq!(err, SwapError::InvalidPreimage);
        assert_eq!(swap, before);
    }

    #[test]
    fn test_claim_success_reveals_secret() {
        let secret = Secret::generate();
        let mut swap = reached_swap(&secret);
        swap.mark_claimed(secret.clone(), t0() + Duration::hours(1)).unwrap();
        assert_eq!(swap.status, SwapStatus::Claimed);
        assert_eq!(swap.revealed_secret, Some(secret.clone()));
        assert_eq!(swap.claimed_at, Some(t0() + Duration::hours(1)));

        let again = swap.mark_claimed(secret, t0()).unwrap_err();
        assert_eq!(
            again,
            SwapError::StateConflict {
                status: SwapStatus::Claimed
            }
        );
    }

    #[test]
    fn test_claim_after_deadline_expired() {
        let secret = Secret::generate();
        let swap = reached_swap(&secret);
        let err = swap.check_claim(&secret, t0() + Duration::days(1)).unwrap_err();
        assert!(matches!(err, SwapError::TimelockExpired { .. }));
    }

    #[test]
    fn test_refund_before_deadline_rejected() {
        let mut swap = Swap::new(terms(), Secret::generate(), t0(), 1);
        let err = swap.mark_refunded(t0() + Duration::hours(23)).unwrap_err();
        assert_eq!(
            err,
            SwapError::TimelockNotExpired {
                remaining_seconds: 3600
            }
        );
        assert_eq!(swap.status, SwapStatus::Pending);
    }

    #[test]
    fn test_refund_from_any_non_terminal_state() {
        for signed in [0usize, 1, 2] {
            let mut swap = Swap::new(terms(), Secret::generate(), t0(), 1);
            swap.advance_consensus(signed, signed >= 2, t0());
            swap.mark_refunded(t0() + Duration::days(1)).unwrap();
            assert_eq!(swap.status, SwapStatus::Refunded);
        }
    }

    #[test]
    fn test_refund_after_claim_conflicts() {
        let secret = Secret::generate();
        let mut swap = reached_swap(&secret);
        swap.mark_claimed(secret, t0()).unwrap();
        let err = swap.mark_refunded(t0() + Duration::days(2)).unwrap_err();
        assert_eq!(
            err,
            SwapError::StateConflict {
                status: SwapStatus::Claimed
            }
        );
    }

    #[test]
    fn test_views_hide_sealed_secret() {
        let secret = Secret::generate();
        let swap = Swap::new(terms(), secret.clone(), t0(), 1);
        let snapshot = ConsensusSnapshot {
            per_chain: Default::default(),
            signed_count: 1,
            failed_count: 0,
            required: REQUIRED_QUORUM,
            reached: false,
        };
        let json = serde_json::to_string(&swap.view(snapshot)).unwrap();
        assert!(!json.contains(&secret.to_hex()[2..]));
        assert!(json.contains("\"amount\":\"10\""));
        assert!(json.contains("\"consensusRequired\":2"));
        assert_eq!(json.matches("\"consensusCount\":1").count(), 1);
        assert!(json.contains("\"status\":\"pending\""));
    }
}
