//! Task dispatch with credential failover and bounded concurrency.
//!
//! [`Dispatcher::execute_with_failover`] runs one service call, rotating
//! across pool credentials by error category: transient failures back off
//! and retry, rate limits rotate immediately without waiting, content
//! blocks are terminal for the task. Each credential is tried at most once
//! per call, bounding worst-case latency when many credentials are
//! unhealthy.
//!
//! [`Dispatcher::distribute`] fans independent tasks out across a bounded
//! worker set, writing outcomes into an index-addressed buffer so the final
//! result is deterministic regardless of completion order.

mod retry;

pub use retry::RetryPolicy;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::analyzer::JobContext;
use crate::credentials::CredentialPool;
use crate::error::ErrorKind;
use crate::models::{AnalysisTask, ChunkDescriptor, TaskOutcome};
use crate::progress::ProgressTracker;
use crate::service::{ContentAnalysisService, DocumentBlob};

/// Dispatch tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Unique credentials tried per call before giving up.
    pub max_attempts: u32,
    /// How long one call may wait for a selectable credential.
    pub select_wait: Duration,
    /// Bounded deadline for a single service invocation.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            select_wait: Duration::from_secs(60),
            call_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    /// Apply `ANALYSIS_MAX_ATTEMPTS` environment override.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = std::env::var("ANALYSIS_MAX_ATTEMPTS") {
            if let Ok(n) = val.parse::<u32>() {
                config.max_attempts = n.max(1);
            }
        }
        config
    }
}

/// Prompt plus document payloads for one service call.
#[derive(Debug, Clone)]
pub struct RequestPayload {
    pub prompt: String,
    pub documents: Vec<DocumentBlob>,
}

/// Terminal failure of one dispatched call.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("content blocked by the analysis service after {attempts} attempts: {reason}")]
    ContentBlocked { reason: String, attempts: u32 },
    #[error("no credential available within {waited:?}")]
    PoolExhausted { waited: Duration, attempts: u32 },
    #[error("all {attempts} credential attempts failed (last error: {last})")]
    AllAttemptsFailed { attempts: u32, last: ErrorKind },
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::ContentBlocked { .. } => ErrorKind::ContentBlocked,
            DispatchError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            DispatchError::AllAttemptsFailed { last, .. } => *last,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DispatchError::ContentBlocked { attempts, .. }
            | DispatchError::PoolExhausted { attempts, .. }
            | DispatchError::AllAttemptsFailed { attempts, .. } => *attempts,
        }
    }
}

/// Runs service calls against the credential pool.
///
/// Holds one independent client per credential, index-aligned with the
/// pool, so tasks never share client state.
pub struct Dispatcher {
    pool: Arc<CredentialPool>,
    clients: Vec<Arc<dyn ContentAnalysisService>>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<CredentialPool>,
        clients: Vec<Arc<dyn ContentAnalysisService>>,
        config: DispatchConfig,
    ) -> Self {
        debug_assert_eq!(pool.len(), clients.len());
        Self {
            pool,
            clients,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Execute one call with failover across credentials.
    ///
    /// Returns the raw response text and the number of credentials tried.
    pub async fn execute_with_failover(
        &self,
        label: &str,
        payload: &RequestPayload,
    ) -> Result<(String, u32), DispatchError> {
        let pool_size = self.pool.len();
        let max_unique = (self.config.max_attempts as usize).min(pool_size);
        let mut tried: HashSet<usize> = HashSet::new();
        let mut transient_attempts = 0u32;
        let mut last_error: Option<ErrorKind> = None;

        while tried.len() < max_unique {
            let Some(idx) = self.pool.select(&tried, self.config.select_wait).await else {
                tracing::warn!("No credential available for {} after waiting", label);
                return Err(match last_error {
                    None => DispatchError::PoolExhausted {
                        waited: self.config.select_wait,
                        attempts: tried.len() as u32,
                    },
                    Some(last) => DispatchError::AllAttemptsFailed {
                        attempts: tried.len() as u32,
                        last,
                    },
                });
            };
            tried.insert(idx);
            let attempts = tried.len() as u32;

            let client = self.clients[idx].clone();
            let call = client.invoke(&payload.prompt, &payload.documents);
            let result = match tokio::time::timeout(self.config.call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(crate::service::ServiceError::Timeout(
                    self.config.call_timeout,
                )),
            };

            match result {
                Ok(text) => {
                    self.pool.mark_success(idx);
                    self.pool.release(idx);
                    tracing::debug!("{} succeeded on credential {}", label, idx);
                    return Ok((text, attempts));
                }
                Err(err) => {
                    let kind = err.kind();
                    self.pool.mark_failure(idx, kind);
                    self.pool.release(idx);
                    last_error = Some(kind);
                    tracing::warn!("{} failed on credential {}: {}", label, idx, err);

                    match kind {
                        ErrorKind::ContentBlocked => {
                            // Depends on the input; no credential can help.
                            return Err(DispatchError::ContentBlocked {
                                reason: err.to_string(),
                                attempts,
                            });
                        }
                        ErrorKind::RateLimited => {
                            // The pool already cooled the credential; move
                            // straight to the next one.
                        }
                        _ => {
                            transient_attempts += 1;
                            let delay = self.config.retry.backoff(transient_attempts);
                            tracing::debug!("Backing off {:?} before retrying {}", delay, label);
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        Err(DispatchError::AllAttemptsFailed {
            attempts: tried.len() as u32,
            last: last_error.unwrap_or(ErrorKind::PoolExhausted),
        })
    }

    /// Run tasks concurrently, bounded by `max_workers` on top of the
    /// pool's per-credential gating.
    ///
    /// Outcomes land in a pre-sized buffer slot chosen by `task_index`, and
    /// the progress tracker ticks exactly once per completed task whether
    /// it succeeded or failed. Cancellation is honored at task boundaries:
    /// no new task starts once the flag is set, while in-flight tasks run
    /// to completion.
    pub async fn distribute<F, Fut>(
        &self,
        tasks: Vec<AnalysisTask>,
        max_workers: usize,
        ctx: Arc<dyn JobContext>,
        progress: Arc<ProgressTracker>,
        run: F,
    ) -> Vec<TaskOutcome>
    where
        F: Fn(AnalysisTask) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskOutcome> + Send + 'static,
    {
        let total = tasks.len();
        let chunks: Vec<ChunkDescriptor> = tasks.iter().map(|t| t.chunk.clone()).collect();
        let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
        let run = Arc::new(run);
        let mut join_set = JoinSet::new();

        for task in tasks {
            if ctx.is_cancelled() {
                tracing::info!("Cancellation requested, not dispatching remaining tasks");
                break;
            }
            let semaphore = semaphore.clone();
            let run = run.clone();
            let ctx = ctx.clone();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return cancelled_outcome(task.task_index, task.chunk),
                };
                if ctx.is_cancelled() {
                    return cancelled_outcome(task.task_index, task.chunk);
                }
                (*run)(task).await
            });
        }

        let mut results: Vec<Option<TaskOutcome>> = (0..total).map(|_| None).collect();
        let mut completed = 0usize;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => {
                    completed += 1;
                    let message = match outcome.error {
                        None => format!("chunk {}/{} analyzed", completed, total),
                        Some(kind) => format!("chunk {}/{} failed: {}", completed, total, kind),
                    };
                    progress.increment_one(Some(message));
                    let idx = outcome.task_index;
                    if idx < total && results[idx].is_none() {
                        results[idx] = Some(outcome);
                    } else {
                        tracing::error!("Duplicate or out-of-range task index {}", idx);
                    }
                }
                Err(join_err) => {
                    completed += 1;
                    tracing::error!("Analysis task aborted: {}", join_err);
                    progress.increment_one(None);
                }
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| cancelled_outcome(i, chunks[i].clone()))
            })
            .collect()
    }
}

fn cancelled_outcome(task_index: usize, chunk: ChunkDescriptor) -> TaskOutcome {
    TaskOutcome {
        task_index,
        chunk,
        records: None,
        is_partial: false,
        error: Some(ErrorKind::Cancelled),
        attempts_used: 0,
    }
}
