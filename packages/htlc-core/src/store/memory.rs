//! In-process swap store

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{check_identity, SwapFilter, SwapGuard, SwapStore};
use crate::error::SwapError;
use crate::swap::Swap;
use crate::types::{OperationId, SwapId};

/// One swap: a gate serializing mutators, and the committed record
///
/// Readers only touch `record`, so `get` is never held up by a guard.
#[derive(Clone)]
struct Entry {
    gate: Arc<Mutex<()>>,
    record: Arc<RwLock<Swap>>,
}

#[derive(Default)]
pub struct MemorySwapStore {
    swaps: RwLock<HashMap<SwapId, Entry>>,
    by_operation: RwLock<HashMap<OperationId, SwapId>>,
}

impl MemorySwapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.swaps.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.swaps.read().await.is_empty()
    }

    async fn snapshot_all(&self) -> Vec<Swap> {
        let entries: Vec<Entry> = self.swaps.read().await.values().cloned().collect();
        let mut swaps = Vec::with_capacity(entries.len());
        for entry in entries {
            swaps.push(entry.record.read().await.clone());
        }
        swaps
    }
}

struct MemoryGuard {
    _permit: OwnedMutexGuard<()>,
    current: Swap,
    record: Arc<RwLock<Swap>>,
}

#[async_trait]
impl SwapGuard for MemoryGuard {
    fn swap(&self) -> &Swap {
        &self.current
    }

    async fn commit(self: Box<Self>, swap: Swap) -> Result<(), SwapError> {
        check_identity(&self.current, &swap)?;
        *self.record.write().await = swap;
        Ok(())
    }
}

#[async_trait]
impl SwapStore for MemorySwapStore {
    async fn insert(&self, swap: Swap) -> Result<(), SwapError> {
        let mut swaps = self.swaps.write().await;
        let mut by_operation = self.by_operation.write().await;
        if swaps.contains_key(&swap.id) || by_operation.contains_key(&swap.operation_id) {
            return Err(SwapError::storage(format!("swap {} already exists", swap.id)));
        }
        by_operation.insert(swap.operation_id, swap.id);
        swaps.insert(
            swap.id,
            Entry {
                gate: Arc::new(Mutex::new(())),
                record: Arc::new(RwLock::new(swap)),
            },
        );
        Ok(())
    }

    async fn get(&self, id: &SwapId) -> Result<Option<Swap>, SwapError> {
        let entry = self.swaps.read().await.get(id).cloned();
        match entry {
            Some(entry) => Ok(Some(entry.record.read().await.clone())),
            None => Ok(None),
        }
    }

    async fn lock(&self, id: &SwapId) -> Result<Option<Box<dyn SwapGuard>>, SwapError> {
        let Some(entry) = self.swaps.read().await.get(id).cloned() else {
            return Ok(None);
        };
        let permit = entry.gate.lock_owned().await;
        // Read after acquiring the gate so the guard sees the last commit
        let current = entry.record.read().await.clone();
        Ok(Some(Box::new(MemoryGuard {
            _permit: permit,
            current,
            record: entry.record,
        })))
    }

    async fn find_by_operation(
        &self,
        operation_id: &OperationId,
    ) -> Result<Option<SwapId>, SwapError> {
        Ok(self.by_operation.read().await.get(operation_id).copied())
    }

    async fn list(&self, filter: &SwapFilter) -> Result<Vec<Swap>, SwapError> {
        let mut swaps = self.snapshot_all().await;
        swaps.retain(|s| filter.matches(s));
        swaps.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        swaps.truncate(filter.limit);
        Ok(swaps)
    }

    async fn non_terminal(&self) -> Result<Vec<Swap>, SwapError> {
        let mut swaps = self.snapshot_all().await;
        swaps.retain(|s| !s.status.is_terminal());
        swaps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(swaps)
    }
}
