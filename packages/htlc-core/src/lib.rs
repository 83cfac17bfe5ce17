//! HTLC-Core: Consensus-Gated Atomic Swap Engine
//!
//! This crate holds the engine behind the HTLC coordinator service:
//!
//! - **Hash/Time Lock Primitives** - Secret generation, keccak256 commitments, expiry checks
//! - **Types** - Chain names, swap/operation ids, swap and attestation status enums
//! - **Consensus Verifier** - Per-chain attestation aggregation with a 2-of-3 quorum
//! - **Circuit Breaker** - Volume/failure-rate trip wire with auto-recovery and a
//!   council-gated emergency pause
//! - **Swap State Machine** - Swap record, guarded transitions and API views
//! - **Store** - Lockable swap repository (in-memory, PostgreSQL behind `postgres`)
//! - **Adapter** - Attestation event stream and poll-until-decided driver
//! - **Coordinator** - Lifecycle orchestration over all of the above
//!
//! ## Feature Flags
//!
//! - `postgres` - Enable the sqlx-backed [`store::PgSwapStore`]
//! - `testing` - Enable scripted adapters for integration tests
//! - `full` - Enable all features

pub mod adapter;
pub mod breaker;
pub mod clock;
pub mod consensus;
pub mod coordinator;
pub mod error;
pub mod hash;
pub mod rate_limit;
pub mod store;
pub mod swap;
pub mod types;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use adapter::{
    poll_until_decided, AttestationEvent, AttestationSink, AttestationSource, PollSchedule,
};
pub use breaker::{
    BreakerStatus, BreakerThresholds, BreakerTransition, CircuitBreaker, EmergencyAction,
    EmergencyCouncil, EmergencyVote, TriggerPolicy,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use consensus::{ConsensusSnapshot, ConsensusVerifier, CONSENSUS_CHAINS, REQUIRED_QUORUM};
pub use coordinator::{
    AttestationAck, ClaimReceipt, CoordinatorConfig, InitiateReceipt, InitiateRequest,
    ListQuery, RefundReceipt, SwapCoordinator,
};
pub use error::{ErrorKind, SwapError};
pub use hash::{keccak256, HashLock, Secret};
pub use store::{MemorySwapStore, SwapFilter, SwapGuard, SwapStore};
pub use swap::{Swap, SwapSummary, SwapView};
pub use types::{Attestation, ChainId, ChainStatus, OperationId, SwapId, SwapStatus};
