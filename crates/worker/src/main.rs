use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use sitegen_ai::{GenerationBackend, HttpBackendConfig, HttpGenerationBackend};
use sitegen_infra::{Pipeline, PipelineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sitegen_observability::init();

    let config = PipelineConfig::from_env();

    let endpoint = config
        .backend_url
        .clone()
        .context("SITEGEN_BACKEND_URL must be set")?;
    let mut backend_config =
        HttpBackendConfig::new(endpoint).with_timeout(config.generation_timeout);
    match &config.backend_api_key {
        Some(key) => backend_config = backend_config.with_api_key(key.clone()),
        None => tracing::warn!("SITEGEN_BACKEND_API_KEY not set; calling backend without auth"),
    }
    let backend: Arc<dyn GenerationBackend> = Arc::new(
        HttpGenerationBackend::new(backend_config).context("failed to build generation backend")?,
    );

    let (pipeline, receiver) = match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("failed to connect to Postgres")?;
            Pipeline::postgres(pool, backend, &config)
                .await
                .context("failed to prepare Postgres stores")?
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores (state is lost on exit)");
            Pipeline::in_memory(backend, &config)
        }
    };

    let handle = pipeline
        .dispatcher
        .spawn(receiver, config.dispatcher_config().with_name("sitegen-worker"));
    pipeline
        .dispatcher
        .recover_pending()
        .await
        .context("failed to republish pending requests")?;

    tracing::info!(
        max_concurrent_jobs = config.max_concurrent_jobs,
        "sitegen worker running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, waiting for in-flight jobs");
    handle.shutdown().await;

    Ok(())
}
