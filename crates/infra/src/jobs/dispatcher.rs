//! Job dispatcher: turns queued request ids into generation attempts.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use sitegen_ai::{BackendError, GenerationBackend};
use sitegen_core::{FileBundle, Request, RequestId, RequestStatus};

use super::queue::{JobQueue, JobReceiver};
use super::types::RetryPolicy;
use crate::artifacts::{self, ArtifactError, ArtifactStore};
use crate::error::{PipelineError, TerminalGenerationError};
use crate::rollback::RollbackController;
use crate::usage::UsageLedger;
use crate::versioning::VersionChain;

/// Default bound on a single backend call.
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Dispatcher worker pool configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    /// Maximum concurrent jobs
    pub max_concurrent: usize,
    /// How often to republish pending requests from the store; `None` disables
    /// polling, so only queued deliveries are processed.
    pub poll_interval: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "job-dispatcher".to_string(),
            max_concurrent: 4,
            poll_interval: None,
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatcherStats {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub restorations: u64,
    /// Jobs that ended with a store, artifact or queue error (request left pending)
    pub errors: u64,
    /// Deliveries dropped because the same request was already in flight
    pub duplicates: u64,
    pub running: usize,
}

/// Result of processing one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed {
        request_id: RequestId,
        version: u32,
        files: FileBundle,
    },
    Failed {
        request_id: RequestId,
        error: TerminalGenerationError,
        /// Restoration request spawned by the rollback controller
        restoration: Option<RequestId>,
    },
    /// The request was not pending (already processed, or processed concurrently).
    Skipped {
        request_id: RequestId,
        status: RequestStatus,
    },
}

/// Handle to control a running dispatcher.
///
/// Dropping the handle without calling [`DispatcherHandle::shutdown`] also
/// stops the dispatcher, but nothing waits for in-flight jobs.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Stop accepting deliveries and wait for in-flight jobs to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "dispatcher loop panicked");
            }
        }
    }

    /// Get current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        lock_stats(&self.stats).clone()
    }
}

fn lock_stats(stats: &Mutex<DispatcherStats>) -> MutexGuard<'_, DispatcherStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs generation jobs: backend call under the retry policy, then the
/// resulting state transition, then rollback on terminal failure.
///
/// Backend errors never escape [`JobDispatcher::process`]; they become
/// request state. Store, artifact and queue errors do escape and leave the
/// request pending for [`JobDispatcher::recover_pending`].
#[derive(Clone)]
pub struct JobDispatcher {
    chain: VersionChain,
    artifacts: Arc<dyn ArtifactStore>,
    backend: Arc<dyn GenerationBackend>,
    usage: Arc<dyn UsageLedger>,
    queue: Arc<dyn JobQueue>,
    rollback: RollbackController,
    policy: RetryPolicy,
    generation_timeout: Duration,
}

impl JobDispatcher {
    pub fn new(
        chain: VersionChain,
        artifacts: Arc<dyn ArtifactStore>,
        backend: Arc<dyn GenerationBackend>,
        usage: Arc<dyn UsageLedger>,
        queue: Arc<dyn JobQueue>,
        rollback: RollbackController,
    ) -> Self {
        Self {
            chain,
            artifacts,
            backend,
            usage,
            queue,
            rollback,
            policy: RetryPolicy::reference(),
            generation_timeout: DEFAULT_GENERATION_TIMEOUT,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    /// Publish `request_id` for processing without waiting for it.
    #[instrument(skip(self), err)]
    pub async fn enqueue(&self, request_id: RequestId) -> Result<(), PipelineError> {
        let request = self.chain.get(request_id).await?;
        self.queue.publish(request.id)?;
        debug!(website_id = %request.website_id, "request enqueued");
        Ok(())
    }

    /// Republish every pending request. Returns how many were published.
    pub async fn recover_pending(&self) -> Result<usize, PipelineError> {
        let pending = self
            .chain
            .store()
            .list_by_status(RequestStatus::Pending, usize::MAX)
            .await?;
        for request in &pending {
            self.queue.publish(request.id)?;
        }
        if pending.is_empty() {
            debug!("no pending requests to republish");
        } else {
            info!(count = pending.len(), "republished pending requests");
        }
        Ok(pending.len())
    }

    /// Process one delivery of `request_id`. Safe to call any number of
    /// times: only a pending request is generated, and only one completion
    /// per request is ever recorded.
    #[instrument(skip(self), fields(request_id = %request_id), err)]
    pub async fn process(&self, request_id: RequestId) -> Result<ProcessOutcome, PipelineError> {
        let request = self.chain.get(request_id).await?;
        if !request.is_pending() {
            debug!(status = %request.status, "request not pending, skipping");
            return Ok(ProcessOutcome::Skipped {
                request_id,
                status: request.status,
            });
        }

        let existing = self.resolve_existing_files(&request).await?;
        let started = Instant::now();
        match self.generate(&request, existing.as_ref()).await {
            Ok(incoming) => {
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    files = incoming.len(),
                    "generation succeeded"
                );
                self.finish_success(request, existing, incoming).await
            }
            Err(failure) => self.finish_failure(request, failure).await,
        }
    }

    /// Files the backend edits: seeded files of a restoration, else the
    /// parent's files for a modification, else none.
    async fn resolve_existing_files(
        &self,
        request: &Request,
    ) -> Result<Option<FileBundle>, PipelineError> {
        if let Some(seeded) = &request.generated_files {
            return Ok(Some(seeded.clone()));
        }
        if !request.is_modification() {
            return Ok(None);
        }
        let Some(parent_id) = request.original_request else {
            return Ok(None);
        };

        match self.artifacts.get(parent_id).await {
            Ok(files) => Ok(Some(files)),
            Err(ArtifactError::NotFound(_)) => {
                let parent = self.chain.store().get(parent_id).await?;
                Ok(parent.and_then(|p| p.generated_files))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn generate(
        &self,
        request: &Request,
        existing: Option<&FileBundle>,
    ) -> Result<FileBundle, TerminalGenerationError> {
        let backend = &self.backend;
        let prompt = request.prompt_text();
        let timeout = self.generation_timeout;

        self.policy
            .execute(move |attempt| async move {
                debug!(attempt, backend = backend.name(), "calling generation backend");
                match tokio::time::timeout(timeout, backend.generate(prompt, existing)).await {
                    Ok(Ok(files)) if files.is_empty() => Err(BackendError::EmptyResult),
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout(timeout)),
                }
            })
            .await
            .map_err(TerminalGenerationError::from)
    }

    async fn finish_success(
        &self,
        request: Request,
        existing: Option<FileBundle>,
        incoming: FileBundle,
    ) -> Result<ProcessOutcome, PipelineError> {
        let files = match existing {
            Some(existing) => artifacts::merge(&existing, &incoming),
            None => incoming,
        };

        // Only the run that wins the promotion writes the artifact.
        let Some(completed) = self.chain.promote(request.id, files.clone()).await? else {
            let current = self.chain.get(request.id).await?;
            debug!(status = %current.status, "completed concurrently, discarding result");
            return Ok(ProcessOutcome::Skipped {
                request_id: request.id,
                status: current.status,
            });
        };

        self.artifacts.save(completed.id, &files).await?;

        match self.usage.increment(completed.account_id).await {
            Ok(total) => debug!(account_id = %completed.account_id, total, "usage recorded"),
            Err(err) => warn!(
                account_id = %completed.account_id,
                error = %err,
                "failed to record usage"
            ),
        }

        info!(
            website_id = %completed.website_id,
            version = completed.version,
            files = files.len(),
            "request completed"
        );
        Ok(ProcessOutcome::Completed {
            request_id: completed.id,
            version: completed.version,
            files,
        })
    }

    async fn finish_failure(
        &self,
        request: Request,
        failure: TerminalGenerationError,
    ) -> Result<ProcessOutcome, PipelineError> {
        warn!(
            website_id = %request.website_id,
            attempts = failure.attempts,
            exhausted = failure.exhausted,
            error = %failure.source,
            "generation failed"
        );

        let Some(failed) = self.chain.fail(request.id, &failure.to_string()).await? else {
            let current = self.chain.get(request.id).await?;
            return Ok(ProcessOutcome::Skipped {
                request_id: request.id,
                status: current.status,
            });
        };

        let restoration = match self.rollback.restore(&failed).await {
            Ok(restoration) => restoration.map(|r| r.id),
            Err(err) => {
                warn!(error = %err, "rollback failed, request stays in error");
                None
            }
        };

        Ok(ProcessOutcome::Failed {
            request_id: failed.id,
            error: failure,
            restoration,
        })
    }

    /// Run the worker pool over `receiver` on the current tokio runtime.
    pub fn spawn(&self, receiver: JobReceiver, config: DispatcherConfig) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));

        let join = tokio::spawn(dispatch_loop(
            self.clone(),
            receiver,
            config,
            shutdown_rx,
            stats.clone(),
        ));

        DispatcherHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
            stats,
        }
    }
}

/// Removes a request id from the in-flight set when its task ends.
struct InFlight {
    ids: Arc<Mutex<HashSet<RequestId>>>,
    request_id: RequestId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.request_id);
    }
}

async fn dispatch_loop(
    dispatcher: JobDispatcher,
    mut receiver: JobReceiver,
    config: DispatcherConfig,
    mut shutdown_rx: oneshot::Receiver<()>,
    stats: Arc<Mutex<DispatcherStats>>,
) {
    info!(
        dispatcher = %config.name,
        max_concurrent = config.max_concurrent,
        poll_interval_ms = config.poll_interval.map(|p| p.as_millis() as u64),
        "job dispatcher started"
    );

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
    let in_flight: Arc<Mutex<HashSet<RequestId>>> = Arc::default();
    let mut tasks = JoinSet::new();
    let mut poll = config.poll_interval.map(|period| {
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = next_poll(&mut poll) => {
                if semaphore.available_permits() == 0 {
                    debug!(dispatcher = %config.name, "all workers busy, skipping poll");
                    continue;
                }
                if let Err(err) = dispatcher.recover_pending().await {
                    warn!(dispatcher = %config.name, error = %err, "polling for pending requests failed");
                }
            }
            Some(joined) = tasks.join_next() => {
                if let Err(err) = joined {
                    error!(dispatcher = %config.name, error = %err, "job task panicked");
                }
            }
            delivery = receiver.recv() => {
                let Some(request_id) = delivery else {
                    info!(dispatcher = %config.name, "job queue closed");
                    break;
                };

                let fresh = in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(request_id);
                if !fresh {
                    lock_stats(&stats).duplicates += 1;
                    debug!(dispatcher = %config.name, request_id = %request_id, "already in flight, dropping delivery");
                    continue;
                }
                let guard = InFlight { ids: in_flight.clone(), request_id };

                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                lock_stats(&stats).running += 1;

                let dispatcher = dispatcher.clone();
                let stats = stats.clone();
                let name = config.name.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let _guard = guard;
                    let result = dispatcher.process(request_id).await;
                    if let Err(err) = &result {
                        error!(dispatcher = %name, request_id = %request_id, error = %err, "job processing failed");
                    }
                    record(&stats, &result);
                });
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(dispatcher = %config.name, error = %err, "job task panicked");
        }
    }
    info!(dispatcher = %config.name, "job dispatcher stopped");
}

async fn next_poll(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn record(stats: &Mutex<DispatcherStats>, result: &Result<ProcessOutcome, PipelineError>) {
    let mut s = lock_stats(stats);
    s.running = s.running.saturating_sub(1);
    s.processed += 1;
    match result {
        Ok(ProcessOutcome::Completed { .. }) => s.completed += 1,
        Ok(ProcessOutcome::Failed { restoration, .. }) => {
            s.failed += 1;
            if restoration.is_some() {
                s.restorations += 1;
            }
        }
        Ok(ProcessOutcome::Skipped { .. }) => s.skipped += 1,
        Err(_) => s.errors += 1,
    }
}
