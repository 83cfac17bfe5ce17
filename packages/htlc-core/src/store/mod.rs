//! Swap repository
//!
//! The coordinator never holds swap records itself. It goes through a
//! [`SwapStore`], which hands out one exclusive [`SwapGuard`] per swap at a
//! time. All mutation happens through `guard.commit(..)`, so per-swap
//! transitions are serialized by whichever backend owns the records: an
//! in-process mutex for [`MemorySwapStore`], a row lock for `PgSwapStore`.

use async_trait::async_trait;

use crate::error::SwapError;
use crate::swap::Swap;
use crate::types::{ChainId, OperationId, SwapId};

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemorySwapStore;

#[cfg(feature = "postgres")]
pub use postgres::PgSwapStore;

/// Which swaps `list` returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapFilter {
    /// Exact recipient address
    pub recipient: Option<String>,
    /// Matches the source or the destination chain
    pub chain: Option<ChainId>,
    pub limit: usize,
}

impl SwapFilter {
    /// Newest `limit` swaps, unfiltered
    pub fn latest(limit: usize) -> Self {
        Self {
            recipient: None,
            chain: None,
            limit,
        }
    }

    pub fn matches(&self, swap: &Swap) -> bool {
        let recipient_ok = self
            .recipient
            .as_deref()
            .map_or(true, |r| swap.recipient == r);
        let chain_ok = self
            .chain
            .as_ref()
            .map_or(true, |c| swap.source_chain == *c || swap.destination_chain == *c);
        recipient_ok && chain_ok
    }
}

/// Exclusive hold on one swap record
///
/// Dropping the guard without committing releases the lock and leaves the
/// stored record untouched.
#[async_trait]
pub trait SwapGuard: Send {
    /// Record as it was when the lock was taken
    fn swap(&self) -> &Swap;

    /// Persist `swap` and release the lock
    async fn commit(self: Box<Self>, swap: Swap) -> Result<(), SwapError>;
}

#[async_trait]
pub trait SwapStore: Send + Sync {
    /// Store a new swap; its id and operation id must be unused
    async fn insert(&self, swap: Swap) -> Result<(), SwapError>;

    /// Latest committed record; never waits for a held guard
    async fn get(&self, id: &SwapId) -> Result<Option<Swap>, SwapError>;

    /// Wait for exclusive access to one swap
    async fn lock(&self, id: &SwapId) -> Result<Option<Box<dyn SwapGuard>>, SwapError>;

    async fn find_by_operation(&self, operation_id: &OperationId)
        -> Result<Option<SwapId>, SwapError>;

    /// Swaps matching `filter`, newest first, at most `filter.limit`
    async fn list(&self, filter: &SwapFilter) -> Result<Vec<Swap>, SwapError>;

    /// Swaps not yet claimed or refunded
    async fn non_terminal(&self) -> Result<Vec<Swap>, SwapError>;
}

/// Commits must not change a swap's identity
pub(crate) fn check_identity(current: &Swap, next: &Swap) -> Result<(), SwapError> {
    if current.id != next.id || current.operation_id != next.operation_id {
        return Err(SwapError::storage(format!(
            "commit for {} attempted to replace identity with {}",
            current.id, next.id
        )));
    }
    if current.amount != next.amount || current.hash_lock != next.hash_lock {
        return Err(SwapError::storage(format!(
            "commit for {} attempted to change immutable terms",
            current.id
        )));
    }
    Ok(())
}
