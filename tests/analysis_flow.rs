//! End-to-end orchestration tests against a scripted service and an
//! in-memory document store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use pagelink::analyzer::{AnalyzeOptions, Analyzer, CancelFlag, NeverCancelled};
use pagelink::credentials::PoolConfig;
use pagelink::dispatch::DispatchConfig;
use pagelink::documents::DocumentStore;
use pagelink::error::AnalysisError;
use pagelink::progress::{NullSink, ProgressSink, ProgressSnapshot};
use pagelink::service::{ContentAnalysisService, DocumentBlob, ServiceError};

/// Store with fixed page counts and synthetic blobs.
struct MemoryStore {
    page_counts: HashMap<String, u32>,
}

impl MemoryStore {
    fn new(page_counts: &[(&str, u32)]) -> Arc<Self> {
        Arc::new(Self {
            page_counts: page_counts
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        })
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn page_count(&self, doc_id: &str) -> Result<u32, AnalysisError> {
        self.page_counts
            .get(doc_id)
            .copied()
            .ok_or_else(|| AnalysisError::invalid_document(doc_id, "unknown document"))
    }

    async fn extract_pages(
        &self,
        doc_id: &str,
        start: u32,
        end: u32,
    ) -> Result<DocumentBlob, AnalysisError> {
        Ok(DocumentBlob::pdf(
            format!("{} p{}-{}", doc_id, start, end),
            vec![0u8; 16],
        ))
    }

    async fn load(&self, doc_id: &str) -> Result<DocumentBlob, AnalysisError> {
        Ok(DocumentBlob::pdf(doc_id.to_string(), vec![0u8; 64]))
    }
}

type Behavior =
    dyn Fn(usize, usize, &str) -> Result<String, ServiceError> + Send + Sync + 'static;

/// Service client whose behavior is decided by a shared closure receiving
/// the client index, the per-client call number, and the prompt.
struct MockClient {
    index: usize,
    calls: AtomicUsize,
    behavior: Arc<Behavior>,
}

#[async_trait]
impl ContentAnalysisService for MockClient {
    async fn invoke(
        &self,
        prompt: &str,
        _documents: &[DocumentBlob],
    ) -> Result<String, ServiceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.behavior)(self.index, call, prompt)
    }
}

fn mock_clients(n: usize, behavior: Arc<Behavior>) -> Vec<Arc<dyn ContentAnalysisService>> {
    (0..n)
        .map(|index| {
            Arc::new(MockClient {
                index,
                calls: AtomicUsize::new(0),
                behavior: behavior.clone(),
            }) as Arc<dyn ContentAnalysisService>
        })
        .collect()
}

fn analyzer_with(
    store: Arc<dyn DocumentStore>,
    clients: Vec<Arc<dyn ContentAnalysisService>>,
    sink: Arc<dyn ProgressSink>,
) -> Analyzer {
    let ids = (0..clients.len()).map(|i| format!("k{}", i + 1)).collect();
    Analyzer::new(
        store,
        clients,
        ids,
        PoolConfig::default(),
        DispatchConfig::default(),
        sink,
    )
    .unwrap()
}

/// The partner chunk's starting page, parsed back out of the prompt text.
fn chunk_start(prompt: &str) -> u32 {
    let tail = prompt.split("pages ").nth(1).unwrap();
    tail.split('-').next().unwrap().trim().parse().unwrap()
}

fn good_response(start: u32) -> String {
    format!(
        r#"{{"pages": [{{"primary_page": 1, "findings": [{{"label": "Q{start}", "excerpt": "question covering topic {start}", "summary": "matches the partner slide", "connections": [{{"doc": "partner.pdf", "page": 1, "reason": "same derivation", "score": 90}}]}}]}}]}}"#
    )
}

fn options() -> AnalyzeOptions {
    AnalyzeOptions {
        min_relevance_score: 70,
        max_workers: 1,
        ..AnalyzeOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limited_chunk_fails_over_and_all_chunks_merge() {
    let store = MemoryStore::new(&[("primary.pdf", 10), ("partner.pdf", 100)]);
    // Credential 0 is rate limited on its first call; everything else works.
    let behavior: Arc<Behavior> = Arc::new(|client, call, prompt| {
        if client == 0 && call == 0 {
            Err(ServiceError::RateLimited("quota exceeded".into()))
        } else {
            Ok(good_response(chunk_start(prompt)))
        }
    });
    let analyzer = analyzer_with(store, mock_clients(2, behavior), Arc::new(NullSink));

    let result = analyzer
        .analyze(
            "primary.pdf",
            &["partner.pdf".to_string()],
            &options(),
            Arc::new(NeverCancelled),
        )
        .await
        .unwrap();

    // Three chunks of a 100-page partner, all present after the failover.
    assert_eq!(result.failed_chunks, 0);
    assert_eq!(result.pages.len(), 1);
    let labels: Vec<&str> = result.pages[0]
        .findings
        .iter()
        .map(|f| f.label.as_str())
        .collect();
    assert_eq!(labels, vec!["Q1", "Q41", "Q81"]);
    let connection_pages: Vec<u32> = result.pages[0]
        .findings
        .iter()
        .flat_map(|f| f.connections.iter().map(|c| c.page))
        .collect();
    assert_eq!(connection_pages, vec![1, 41, 81]);

    // The rate-limited credential is cooling; the other absorbed the work.
    let report = analyzer.credential_report();
    assert!(!report[0].available);
    assert!(report[0].cooldown_remaining_secs.is_some());
    assert_eq!(report[0].success_count, 0);
    assert!(report[1].success_count >= 1);
}

#[tokio::test(start_paused = true)]
async fn scrambled_completion_order_still_merges_deterministically() {
    let store = MemoryStore::new(&[("primary.pdf", 10), ("partner.pdf", 320)]);
    // Later chunks answer faster, so completion order is reversed.
    let behavior: Arc<Behavior> = Arc::new(|_client, _call, prompt| {
        let start = chunk_start(prompt);
        std::thread::yield_now();
        Ok(good_response(start))
    });
    let analyzer = analyzer_with(store, mock_clients(4, behavior), Arc::new(NullSink));

    let result = analyzer
        .analyze(
            "primary.pdf",
            &["partner.pdf".to_string()],
            &AnalyzeOptions {
                max_workers: 4,
                ..options()
            },
            Arc::new(NeverCancelled),
        )
        .await
        .unwrap();

    let labels: Vec<&str> = result.pages[0]
        .findings
        .iter()
        .map(|f| f.label.as_str())
        .collect();
    // Eight chunks, reassembled in page order regardless of completion order.
    assert_eq!(
        labels,
        vec!["Q1", "Q121", "Q161", "Q201", "Q241", "Q281", "Q41", "Q81"]
    );
    let connection_pages: Vec<u32> = result.pages[0]
        .findings
        .iter()
        .flat_map(|f| f.connections.iter().map(|c| c.page))
        .collect();
    let mut sorted = connection_pages.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![1, 41, 81, 121, 161, 201, 241, 281]);
}

struct RecordingSink {
    percents: Mutex<Vec<u8>>,
}

impl ProgressSink for RecordingSink {
    fn publish(&self, snapshot: &ProgressSnapshot) {
        self.percents.lock().unwrap().push(snapshot.percent);
    }
}

#[tokio::test(start_paused = true)]
async fn progress_stays_below_100_until_finalized() {
    let store = MemoryStore::new(&[("primary.pdf", 10), ("partner.pdf", 120)]);
    let behavior: Arc<Behavior> =
        Arc::new(|_client, _call, prompt| Ok(good_response(chunk_start(prompt))));
    let sink = Arc::new(RecordingSink {
        percents: Mutex::new(Vec::new()),
    });
    let analyzer = analyzer_with(store, mock_clients(2, behavior), sink.clone());

    analyzer
        .analyze(
            "primary.pdf",
            &["partner.pdf".to_string()],
            &options(),
            Arc::new(NeverCancelled),
        )
        .await
        .unwrap();

    let percents = sink.percents.lock().unwrap().clone();
    let (last, running) = percents.split_last().unwrap();
    assert_eq!(*last, 100);
    assert!(running.iter().all(|p| *p < 100));
    assert_eq!(analyzer.progress_snapshot().unwrap().percent, 100);
}

#[tokio::test(start_paused = true)]
async fn cancelled_jobs_discard_results() {
    let store = MemoryStore::new(&[("primary.pdf", 10), ("partner.pdf", 100)]);
    let behavior: Arc<Behavior> =
        Arc::new(|_client, _call, prompt| Ok(good_response(chunk_start(prompt))));
    let analyzer = analyzer_with(store, mock_clients(2, behavior), Arc::new(NullSink));

    let flag = Arc::new(CancelFlag::default());
    flag.cancel();
    let err = analyzer
        .analyze(
            "primary.pdf",
            &["partner.pdf".to_string()],
            &options(),
            flag,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn bad_responses_degrade_to_partial_results() {
    let store = MemoryStore::new(&[("primary.pdf", 10), ("partner.pdf", 100)]);
    // Chunk at page 41 always returns prose; chunk at 81 returns a response
    // truncated inside its second record; chunk at 1 is clean.
    let behavior: Arc<Behavior> = Arc::new(|_client, _call, prompt| {
        let start = chunk_start(prompt);
        match start {
            41 => Ok("I could not produce structured output, sorry.".to_string()),
            81 => Ok(format!(
                r#"{{"pages": [{{"primary_page": 2, "findings": [{{"label": "Q81", "excerpt": "complete question", "summary": "matches", "connections": [{{"doc": "partner.pdf", "page": 3, "reason": "same figure", "score": 110}}]}}]}}, {{"primary_page": 5, "findings": [{{"label": "Q82", "exce"#
            )),
            _ => Ok(good_response(start)),
        }
    });
    let analyzer = analyzer_with(store, mock_clients(2, behavior), Arc::new(NullSink));

    let result = analyzer
        .analyze(
            "primary.pdf",
            &["partner.pdf".to_string()],
            &options(),
            Arc::new(NeverCancelled),
        )
        .await
        .unwrap();

    assert_eq!(result.failed_chunks, 1);
    assert_eq!(result.partial_chunks, 1);

    // Page 1 from the clean chunk, page 2 from the salvaged chunk.
    let pages: Vec<u32> = result.pages.iter().map(|p| p.page).collect();
    assert_eq!(pages, vec![1, 2]);
    let salvaged = &result.pages[1].findings[0];
    assert_eq!(salvaged.label, "Q81");
    // Chunk-local page 3 of the chunk starting at 81 is partner page 83.
    assert_eq!(salvaged.connections[0].page, 83);
    assert_eq!(salvaged.connections[0].score, 110);
}

#[tokio::test(start_paused = true)]
async fn suspicious_empty_responses_get_one_regeneration() {
    let store = MemoryStore::new(&[("primary.pdf", 10), ("partner.pdf", 30)]);
    let total_calls = Arc::new(AtomicUsize::new(0));
    let counter = total_calls.clone();
    // First call returns an empty sheet, the retry returns real content.
    let behavior: Arc<Behavior> = Arc::new(move |_client, _call, prompt| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            Ok(r#"{"pages": []}"#.to_string())
        } else {
            Ok(good_response(chunk_start(prompt)))
        }
    });
    let analyzer = analyzer_with(store, mock_clients(2, behavior), Arc::new(NullSink));

    let result = analyzer
        .analyze(
            "primary.pdf",
            &["partner.pdf".to_string()],
            &options(),
            Arc::new(NeverCancelled),
        )
        .await
        .unwrap();

    assert_eq!(total_calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.failed_chunks, 0);
    assert_eq!(result.pages[0].findings[0].label, "Q1");
}

#[tokio::test]
async fn missing_credentials_abort_before_dispatch() {
    let store = MemoryStore::new(&[("primary.pdf", 10)]);
    let err = Analyzer::new(
        store,
        Vec::new(),
        Vec::new(),
        PoolConfig::default(),
        DispatchConfig::default(),
        Arc::new(NullSink),
    )
    .unwrap_err();
    assert!(matches!(err, AnalysisError::NoCredentials));
}

#[tokio::test(start_paused = true)]
async fn unknown_primary_document_is_fatal() {
    let store = MemoryStore::new(&[("partner.pdf", 100)]);
    let behavior: Arc<Behavior> =
        Arc::new(|_client, _call, prompt| Ok(good_response(chunk_start(prompt))));
    let analyzer = analyzer_with(store, mock_clients(1, behavior), Arc::new(NullSink));

    let err = analyzer
        .analyze(
            "primary.pdf",
            &["partner.pdf".to_string()],
            &options(),
            Arc::new(NeverCancelled),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidDocument { .. }));
}
