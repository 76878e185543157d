//! Per-account generation counters.
//!
//! Counters only ever move through an atomic add, so concurrent completions
//! for the same account cannot lose an increment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use sitegen_core::AccountId;

use crate::requests::StoreError;
use crate::requests::postgres::map_sqlx_error;

#[async_trait]
pub trait UsageLedger: Send + Sync + 'static {
    /// Count one successful generation; returns the new total.
    async fn increment(&self, account_id: AccountId) -> Result<u64, StoreError>;

    async fn generations(&self, account_id: AccountId) -> Result<u64, StoreError>;
}

/// In-memory usage ledger for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryUsageLedger {
    counters: RwLock<HashMap<AccountId, Arc<AtomicU64>>>,
}

impl InMemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, account_id: AccountId) -> Result<Arc<AtomicU64>, StoreError> {
        if let Some(counter) = self
            .counters
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?
            .get(&account_id)
        {
            return Ok(counter.clone());
        }
        let mut counters = self
            .counters
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        Ok(counters.entry(account_id).or_default().clone())
    }
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    async fn increment(&self, account_id: AccountId) -> Result<u64, StoreError> {
        Ok(self.counter(account_id)?.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn generations(&self, account_id: AccountId) -> Result<u64, StoreError> {
        Ok(self.counter(account_id)?.load(Ordering::SeqCst))
    }
}

/// Postgres-backed usage ledger (`account_usage`).
#[derive(Debug, Clone)]
pub struct PostgresUsageLedger {
    pool: Arc<PgPool>,
}

impl PostgresUsageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl UsageLedger for PostgresUsageLedger {
    async fn increment(&self, account_id: AccountId) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO account_usage (account_id, generations, updated_at)
            VALUES ($1, 1, now())
            ON CONFLICT (account_id) DO UPDATE SET
                generations = account_usage.generations + 1,
                updated_at = now()
            RETURNING generations
            "#,
        )
        .bind(account_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("usage_increment", e))?;

        let total: i64 = row
            .try_get("generations")
            .map_err(|e| map_sqlx_error("usage_increment", e))?;
        Ok(total as u64)
    }

    async fn generations(&self, account_id: AccountId) -> Result<u64, StoreError> {
        let total: Option<i64> =
            sqlx::query_scalar("SELECT generations FROM account_usage WHERE account_id = $1")
                .bind(account_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("usage_get", e))?;
        Ok(total.unwrap_or(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let ledger = Arc::new(InMemoryUsageLedger::new());
        let account = AccountId::new();

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move { ledger.increment(account).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(ledger.generations(account).await.unwrap(), 50);
        assert_eq!(ledger.generations(AccountId::new()).await.unwrap(), 0);
    }
}
