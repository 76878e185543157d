//! Wiring of stores, version chain, rollback, dispatcher and site service.

use std::sync::Arc;

use sqlx::PgPool;

use sitegen_ai::GenerationBackend;

use crate::artifacts::{ArtifactStore, InMemoryArtifactStore, PostgresArtifactStore};
use crate::config::PipelineConfig;
use crate::jobs::{InMemoryJobQueue, JobDispatcher, JobQueue, JobReceiver};
use crate::requests::{InMemoryRequestStore, PostgresRequestStore, RequestStore, StoreError};
use crate::rollback::RollbackController;
use crate::sites::SiteService;
use crate::usage::{InMemoryUsageLedger, PostgresUsageLedger, UsageLedger};
use crate::versioning::VersionChain;

/// A fully assembled pipeline sharing one set of stores.
#[derive(Clone)]
pub struct Pipeline {
    pub chain: VersionChain,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub usage: Arc<dyn UsageLedger>,
    pub rollback: RollbackController,
    pub dispatcher: JobDispatcher,
    pub sites: SiteService,
}

impl Pipeline {
    /// Everything in memory (tests/dev).
    pub fn in_memory(
        backend: Arc<dyn GenerationBackend>,
        config: &PipelineConfig,
    ) -> (Self, JobReceiver) {
        Self::assemble(
            Arc::new(InMemoryRequestStore::new()),
            Arc::new(InMemoryArtifactStore::new()),
            Arc::new(InMemoryUsageLedger::new()),
            backend,
            config,
        )
    }

    /// Postgres-backed stores; runs the schema migration first.
    pub async fn postgres(
        pool: PgPool,
        backend: Arc<dyn GenerationBackend>,
        config: &PipelineConfig,
    ) -> Result<(Self, JobReceiver), StoreError> {
        PostgresRequestStore::migrate(&pool).await?;
        Ok(Self::assemble(
            Arc::new(PostgresRequestStore::new(pool.clone())),
            Arc::new(PostgresArtifactStore::new(pool.clone())),
            Arc::new(PostgresUsageLedger::new(pool)),
            backend,
            config,
        ))
    }

    fn assemble(
        store: Arc<dyn RequestStore>,
        artifacts: Arc<dyn ArtifactStore>,
        usage: Arc<dyn UsageLedger>,
        backend: Arc<dyn GenerationBackend>,
        config: &PipelineConfig,
    ) -> (Self, JobReceiver) {
        let (queue, receiver) = InMemoryJobQueue::new();
        let queue: Arc<dyn JobQueue> = Arc::new(queue);

        let chain = VersionChain::new(store);
        let rollback = RollbackController::new(chain.clone(), queue.clone())
            .with_max_consecutive_restorations(config.max_consecutive_restorations);
        let dispatcher = JobDispatcher::new(
            chain.clone(),
            artifacts.clone(),
            backend,
            usage.clone(),
            queue.clone(),
            rollback.clone(),
        )
        .with_policy(config.retry_policy())
        .with_generation_timeout(config.generation_timeout);
        let sites = SiteService::new(chain.clone(), queue);

        let pipeline = Self {
            chain,
            artifacts,
            usage,
            rollback,
            dispatcher,
            sites,
        };
        (pipeline, receiver)
    }
}
