//! Top-level orchestration: plan chunks, dispatch analysis tasks across the
//! credential pool, parse and repair responses, merge the results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::chunk;
use crate::credentials::{Credential, CredentialPool, CredentialStatus, PoolConfig};
use crate::dispatch::{DispatchConfig, Dispatcher, RequestPayload};
use crate::documents::DocumentStore;
use crate::error::{AnalysisError, ErrorKind};
use crate::merge::{self, MergeContext};
use crate::models::{AnalysisMode, AnalysisTask, MergedResult, TaskOutcome};
use crate::parse::{self, PageBounds, ScoreGrid};
use crate::progress::{NullSink, ProgressSink, ProgressSnapshot, ProgressTracker};
use crate::service::gemini::{GeminiClient, GeminiConfig};
use crate::service::{prompts, ContentAnalysisService, DocumentBlob};

/// Cooperative cancellation, polled at task boundaries only.
pub trait JobContext: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// Context for jobs that can never be cancelled.
pub struct NeverCancelled;

impl JobContext for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Shared flag for caller-driven cancellation.
#[derive(Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl JobContext for CancelFlag {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-job options.
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub mode: AnalysisMode,
    pub max_pages_per_chunk: u32,
    pub min_relevance_score: u32,
    /// Connections kept per group after score filtering.
    pub max_connections_per_group: usize,
    pub max_workers: usize,
    /// Override for the built-in prompt template.
    pub prompt_template: Option<String>,
    pub score_grid: ScoreGrid,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            mode: AnalysisMode::default(),
            max_pages_per_chunk: 40,
            min_relevance_score: 70,
            max_connections_per_group: 2,
            max_workers: 3,
            prompt_template: None,
            score_grid: ScoreGrid::default(),
        }
    }
}

/// Orchestrates analysis jobs against a fixed set of credentials.
pub struct Analyzer {
    store: Arc<dyn DocumentStore>,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<dyn ProgressSink>,
    current: Mutex<Option<Arc<ProgressTracker>>>,
}

impl std::fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyzer").finish_non_exhaustive()
    }
}

impl Analyzer {
    /// Build an analyzer from pre-constructed service clients.
    ///
    /// `clients` must be index-aligned with `credential_ids`; each client
    /// owns its credential outright, so nothing is shared across tasks.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clients: Vec<Arc<dyn ContentAnalysisService>>,
        credential_ids: Vec<String>,
        pool_config: PoolConfig,
        dispatch_config: DispatchConfig,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, AnalysisError> {
        if clients.is_empty() || credential_ids.is_empty() {
            return Err(AnalysisError::NoCredentials);
        }
        let pool = Arc::new(CredentialPool::new(credential_ids, pool_config));
        let dispatcher = Arc::new(Dispatcher::new(pool, clients, dispatch_config));
        Ok(Self {
            store,
            dispatcher,
            sink,
            current: Mutex::new(None),
        })
    }

    /// Convenience constructor wiring one Gemini client per credential.
    pub fn with_gemini(
        store: Arc<dyn DocumentStore>,
        credentials: &[Credential],
        gemini_config: GeminiConfig,
        pool_config: PoolConfig,
        dispatch_config: DispatchConfig,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Result<Self, AnalysisError> {
        let clients: Vec<Arc<dyn ContentAnalysisService>> = credentials
            .iter()
            .map(|c| {
                Arc::new(GeminiClient::new(
                    gemini_config.clone(),
                    c.secret.clone(),
                    c.id.clone(),
                )) as Arc<dyn ContentAnalysisService>
            })
            .collect();
        let ids = credentials.iter().map(|c| c.id.clone()).collect();
        Self::new(
            store,
            clients,
            ids,
            pool_config,
            dispatch_config,
            sink.unwrap_or_else(|| Arc::new(NullSink)),
        )
    }

    /// Current state of every credential.
    pub fn credential_report(&self) -> Vec<CredentialStatus> {
        self.dispatcher.pool().status_report()
    }

    /// Progress of the running (or last finished) job.
    pub fn progress_snapshot(&self) -> Option<ProgressSnapshot> {
        let guard = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_ref().map(|tracker| tracker.snapshot())
    }

    /// Analyze `primary` against each partner document.
    ///
    /// Partial success is preferred over total failure: chunks that fail
    /// terminally contribute nothing but do not abort the job, and the
    /// failure count travels on the merged result.
    pub async fn analyze(
        &self,
        primary: &str,
        partners: &[String],
        options: &AnalyzeOptions,
        ctx: Arc<dyn JobContext>,
    ) -> Result<MergedResult, AnalysisError> {
        let primary_pages = self.store.page_count(primary).await?;

        let partner_counts: Vec<u32> = futures::future::try_join_all(
            partners.iter().map(|p| self.store.page_count(p)),
        )
        .await?;

        let mut page_counts = HashMap::new();
        let mut tasks = Vec::new();
        for (partner, &pages) in partners.iter().zip(partner_counts.iter()) {
            page_counts.insert(partner.clone(), pages);
            for descriptor in chunk::plan(partner, pages, options.max_pages_per_chunk)? {
                tasks.push(AnalysisTask::new(tasks.len(), descriptor));
            }
        }
        tracing::info!(
            "Analyzing {} ({} pages) against {} partner documents in {} chunks",
            primary,
            primary_pages,
            partners.len(),
            tasks.len()
        );

        let progress = Arc::new(ProgressTracker::new(tasks.len(), self.sink.clone()));
        {
            let mut guard = match self.current.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Some(progress.clone());
        }

        let primary_blob = Arc::new(self.store.load(primary).await?);

        let dispatcher = self.dispatcher.clone();
        let store = self.store.clone();
        let run_options = options.clone();
        let primary_name = primary.to_string();
        let run = move |task: AnalysisTask| {
            let dispatcher = dispatcher.clone();
            let store = store.clone();
            let options = run_options.clone();
            let primary_name = primary_name.clone();
            let primary_blob = primary_blob.clone();
            async move {
                run_task(
                    dispatcher,
                    store,
                    primary_blob,
                    primary_name,
                    primary_pages,
                    options,
                    task,
                )
                .await
            }
        };

        let outcomes = self
            .dispatcher
            .distribute(tasks, options.max_workers, ctx.clone(), progress.clone(), run)
            .await;

        if ctx.is_cancelled() {
            // In-flight work was allowed to finish; its results are dropped.
            tracing::info!("Job cancelled, discarding {} outcomes", outcomes.len());
            return Err(AnalysisError::Cancelled);
        }

        let merged = merge::merge_chunk_results(
            &outcomes,
            &MergeContext {
                mode: options.mode,
                primary_doc: primary.to_string(),
                partner_page_counts: page_counts,
                min_score: options.min_relevance_score,
                max_per_group: options.max_connections_per_group,
            },
        );
        progress.finalize();
        Ok(merged)
    }
}

/// Run a single chunk task end to end: extract the chunk, call the service
/// with failover, parse with repair, and regenerate once if the output
/// looks suspicious.
async fn run_task(
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn DocumentStore>,
    primary_blob: Arc<DocumentBlob>,
    primary_name: String,
    primary_pages: u32,
    options: AnalyzeOptions,
    mut task: AnalysisTask,
) -> TaskOutcome {
    let label = format!(
        "chunk {}-{} of {}",
        task.chunk.start_page, task.chunk.end_page, task.chunk.doc_id
    );

    let chunk_blob = match store
        .extract_pages(&task.chunk.doc_id, task.chunk.start_page, task.chunk.end_page)
        .await
    {
        Ok(blob) => blob,
        Err(err) => {
            tracing::warn!("Could not extract {}: {}", label, err);
            return TaskOutcome::failed(&task, ErrorKind::Store, 0);
        }
    };

    let payload = RequestPayload {
        prompt: prompts::build_prompt(
            options.mode,
            options.prompt_template.as_deref(),
            &primary_name,
            &task.chunk,
        ),
        documents: vec![(*primary_blob).clone(), chunk_blob],
    };
    let bounds = PageBounds {
        primary_pages,
        chunk_pages: task.chunk.page_span(),
    };
    let partner_doc = task.chunk.doc_id.clone();

    let first = invoke_and_parse(&dispatcher, &label, &payload, &options, &bounds, &partner_doc)
        .await;
    task.attempts_used += first.attempts;

    // A suspicious or unparsable response earns exactly one regeneration.
    // Terminal failures (content blocks, pool exhaustion) do not.
    let low_quality = match &first.parsed {
        Some(parsed) => parse::is_suspicious(&parsed.records),
        None => first.error == Some(ErrorKind::Parse),
    };
    let best = if low_quality {
        tracing::info!("Low-quality response for {}, regenerating once", label);
        let second =
            invoke_and_parse(&dispatcher, &label, &payload, &options, &bounds, &partner_doc)
                .await;
        task.attempts_used += second.attempts;
        pick_better(first, second)
    } else {
        first
    };

    match best.parsed {
        Some(parsed) => TaskOutcome {
            task_index: task.task_index,
            chunk: task.chunk.clone(),
            records: Some(parsed.records),
            is_partial: parsed.is_partial,
            error: None,
            attempts_used: task.attempts_used,
        },
        None => TaskOutcome::failed(
            &task,
            best.error.unwrap_or(ErrorKind::Parse),
            task.attempts_used,
        ),
    }
}

struct AttemptResult {
    parsed: Option<parse::Parsed>,
    error: Option<ErrorKind>,
    attempts: u32,
}

async fn invoke_and_parse(
    dispatcher: &Dispatcher,
    label: &str,
    payload: &RequestPayload,
    options: &AnalyzeOptions,
    bounds: &PageBounds,
    partner_doc: &str,
) -> AttemptResult {
    match dispatcher.execute_with_failover(label, payload).await {
        Ok((text, attempts)) => match parse::parse(
            &text,
            options.mode,
            bounds,
            &options.score_grid,
            Some(partner_doc),
        ) {
            Ok(parsed) => AttemptResult {
                parsed: Some(parsed),
                error: None,
                attempts,
            },
            Err(err) => {
                tracing::warn!("Unparsable response for {}: {}", label, err);
                AttemptResult {
                    parsed: None,
                    error: Some(ErrorKind::Parse),
                    attempts,
                }
            }
        },
        Err(err) => {
            tracing::warn!("{} failed: {}", label, err);
            AttemptResult {
                parsed: None,
                error: Some(err.kind()),
                attempts: err.attempts(),
            }
        }
    }
}

/// Prefer a non-suspicious result; otherwise whichever carries more records.
fn pick_better(first: AttemptResult, second: AttemptResult) -> AttemptResult {
    match (&first.parsed, &second.parsed) {
        (_, Some(parsed)) if !parse::is_suspicious(&parsed.records) => second,
        (Some(a), Some(b)) => {
            if b.records.record_count() > a.records.record_count() {
                second
            } else {
                first
            }
        }
        (Some(_), None) => first,
        _ => second,
    }
}
