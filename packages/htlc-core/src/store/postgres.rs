//! PostgreSQL swap store
//!
//! Guards are `SELECT ... FOR UPDATE` row locks held inside a transaction, so
//! mutual exclusion holds across every coordinator instance sharing the
//! database. Committing a guard writes the row and commits; dropping it rolls
//! the transaction back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::{error, info};

use super::{check_identity, SwapFilter, SwapGuard, SwapStore};
use crate::error::SwapError;
use crate::hash::{HashLock, Secret};
use crate::swap::Swap;
use crate::types::{ChainId, OperationId, SwapId};

// Amounts are NUMERIC(78,0) in the database. We bind text and cast with
// `$n::NUMERIC` on insert and read back `amount::TEXT`.
#[derive(Debug, Clone, FromRow)]
struct SwapRow {
    swap_id: String,
    operation_id: String,
    hash_lock: String,
    sealed_secret: String,
    revealed_secret: Option<String>,
    source_chain: String,
    destination_chain: String,
    amount: String,
    recipient: String,
    timelock_seconds: i64,
    timelock_deadline: DateTime<Utc>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    refunded_at: Option<DateTime<Utc>>,
}

impl TryFrom<SwapRow> for Swap {
    type Error = SwapError;

    fn try_from(row: SwapRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, e: String| {
            SwapError::storage(format!("corrupt {} in swap {}: {}", field, row.swap_id, e))
        };
        Ok(Swap {
            id: SwapId::from_hex(&row.swap_id).map_err(|e| corrupt("swap_id", e.to_string()))?,
            operation_id: OperationId::from_hex(&row.operation_id)
                .map_err(|e| corrupt("operation_id", e.to_string()))?,
            hash_lock: HashLock::from_hex(&row.hash_lock).map_err(|e| corrupt("hash_lock", e))?,
            sealed_secret: Secret::from_hex(&row.sealed_secret)
                .map_err(|e| corrupt("sealed_secret", e))?,
            revealed_secret: row
                .revealed_secret
                .as_deref()
                .map(Secret::from_hex)
                .transpose()
                .map_err(|e| corrupt("revealed_secret", e))?,
            source_chain: ChainId::new(&row.source_chain)
                .map_err(|e| corrupt("source_chain", e.to_string()))?,
            destination_chain: ChainId::new(&row.destination_chain)
                .map_err(|e| corrupt("destination_chain", e.to_string()))?,
            amount: row
                .amount
                .parse()
                .map_err(|e: std::num::ParseIntError| corrupt("amount", e.to_string()))?,
            recipient: row.recipient.clone(),
            timelock_seconds: u64::try_from(row.timelock_seconds)
                .map_err(|e| corrupt("timelock_seconds", e.to_string()))?,
            timelock_deadline: row.timelock_deadline,
            status: row
                .status
                .parse()
                .map_err(|e: SwapError| corrupt("status", e.to_string()))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            claimed_at: row.claimed_at,
            refunded_at: row.refunded_at,
        })
    }
}

fn db_error(context: &str, e: sqlx::Error) -> SwapError {
    error!("SQL error {}: {:?}", context, e);
    SwapError::storage(format!("{}: {}", context, e))
}

/// Swap store backed by PostgreSQL
#[derive(Clone)]
pub struct PgSwapStore {
    pool: PgPool,
}

impl PgSwapStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run pending migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, SwapError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| db_error("connecting to database", e))?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Run pending migrations (uses the migration files in migrations/)
    pub async fn migrate(&self) -> Result<(), SwapError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SwapError::storage(format!("running migrations: {}", e)))?;
        info!("Swap store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

struct PgGuard {
    tx: Transaction<'static, Postgres>,
    current: Swap,
}

#[async_trait]
impl SwapGuard for PgGuard {
    fn swap(&self) -> &Swap {
        &self.current
    }

    async fn commit(self: Box<Self>, swap: Swap) -> Result<(), SwapError> {
        let PgGuard { mut tx, current } = *self;
        check_identity(&current, &swap)?;

        sqlx::query(
            r#"
            UPDATE swaps
            SET revealed_secret = $2, status = $3, updated_at = $4,
                claimed_at = $5, refunded_at = $6
            WHERE swap_id = $1
            "#,
        )
        .bind(swap.id.to_hex())
        .bind(swap.revealed_secret.as_ref().map(Secret::to_hex))
        .bind(swap.status.as_str())
        .bind(swap.updated_at)
        .bind(swap.claimed_at)
        .bind(swap.refunded_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("updating swap", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("committing swap update", e))
    }
}

#[async_trait]
impl SwapStore for PgSwapStore {
    async fn insert(&self, swap: Swap) -> Result<(), SwapError> {
        let timelock_seconds = i64::try_from(swap.timelock_seconds)
            .map_err(|_| SwapError::invalid("timelock_seconds out of range"))?;

        sqlx::query(
            r#"
            INSERT INTO swaps (swap_id, operation_id, hash_lock, sealed_secret, revealed_secret,
                source_chain, destination_chain, amount, recipient, timelock_seconds,
                timelock_deadline, status, created_at, updated_at, claimed_at, refunded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8::NUMERIC, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(swap.id.to_hex())
        .bind(swap.operation_id.to_hex())
        .bind(swap.hash_lock.to_hex())
        .bind(swap.sealed_secret.to_hex())
        .bind(swap.revealed_secret.as_ref().map(Secret::to_hex))
        .bind(swap.source_chain.as_str())
        .bind(swap.destination_chain.as_str())
        .bind(swap.amount.to_string())
        .bind(&swap.recipient)
        .bind(timelock_seconds)
        .bind(swap.timelock_deadline)
        .bind(swap.status.as_str())
        .bind(swap.created_at)
        .bind(swap.updated_at)
        .bind(swap.claimed_at)
        .bind(swap.refunded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("inserting swap", e))?;

        Ok(())
    }

    async fn get(&self, id: &SwapId) -> Result<Option<Swap>, SwapError> {
        let row = sqlx::query_as::<_, SwapRow>(
            r#"SELECT swap_id, operation_id, hash_lock, sealed_secret, revealed_secret,
                      source_chain, destination_chain, amount::TEXT AS amount, recipient,
                      timelock_seconds, timelock_deadline, status, created_at, updated_at,
                      claimed_at, refunded_at
               FROM swaps WHERE swap_id = $1"#,
        )
        .bind(id.to_hex())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("loading swap", e))?;

        row.map(Swap::try_from).transpose()
    }

    async fn lock(&self, id: &SwapId) -> Result<Option<Box<dyn SwapGuard>>, SwapError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("starting transaction", e))?;

        let row = sqlx::query_as::<_, SwapRow>(
            r#"SELECT swap_id, operation_id, hash_lock, sealed_secret, revealed_secret,
                      source_chain, destination_chain, amount::TEXT AS amount, recipient,
                      timelock_seconds, timelock_deadline, status, created_at, updated_at,
                      claimed_at, refunded_at
               FROM swaps WHERE swap_id = $1 FOR UPDATE"#,
        )
        .bind(id.to_hex())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("locking swap", e))?;

        match row {
            Some(row) => Ok(Some(Box::new(PgGuard {
                tx,
                current: Swap::try_from(row)?,
            }))),
            None => {
                tx.rollback()
                    .await
                    .map_err(|e| db_error("rolling back lock", e))?;
                Ok(None)
            }
        }
    }

    async fn find_by_operation(
        &self,
        operation_id: &OperationId,
    ) -> Result<Option<SwapId>, SwapError> {
        let row = sqlx::query_as::<_, (String,)>(
            r#"SELECT swap_id FROM swaps WHERE operation_id = $1"#,
        )
        .bind(operation_id.to_hex())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("finding swap by operation", e))?;

        row.map(|(id,)| SwapId::from_hex(&id)).transpose()
    }

    async fn list(&self, filter: &SwapFilter) -> Result<Vec<Swap>, SwapError> {
        let limit = i64::try_from(filter.limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, SwapRow>(
            r#"SELECT swap_id, operation_id, hash_lock, sealed_secret, revealed_secret,
                      source_chain, destination_chain, amount::TEXT AS amount, recipient,
                      timelock_seconds, timelock_deadline, status, created_at, updated_at,
                      claimed_at, refunded_at
               FROM swaps
               WHERE ($1::TEXT IS NULL OR recipient = $1)
                 AND ($2::TEXT IS NULL OR source_chain = $2 OR destination_chain = $2)
               ORDER BY created_at DESC, swap_id ASC LIMIT $3"#,
        )
        .bind(filter.recipient.as_deref())
        .bind(filter.chain.as_ref().map(|c| c.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("listing swaps", e))?;

        rows.into_iter().map(Swap::try_from).collect()
    }

    async fn non_terminal(&self) -> Result<Vec<Swap>, SwapError> {
        let rows = sqlx::query_as::<_, SwapRow>(
            r#"SELECT swap_id, operation_id, hash_lock, sealed_secret, revealed_secret,
                      source_chain, destination_chain, amount::TEXT AS amount, recipient,
                      timelock_seconds, timelock_deadline, status, created_at, updated_at,
                      claimed_at, refunded_at
               FROM swaps WHERE status NOT IN ('claimed', 'refunded')
               ORDER BY created_at ASC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("listing open swaps", e))?;

        rows.into_iter().map(Swap::try_from).collect()
    }
}
