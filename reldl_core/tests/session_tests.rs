use std::collections::{BTreeSet, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use reldl_core::config::DownloadOptions;
use reldl_core::downloader::ledger::{MemoryLedger, ResumeLedger};
use reldl_core::downloader::session::DownloadSession;
use reldl_core::downloader::sink::MemorySink;
use reldl_core::transport::{FetchResponse, Transport};
use reldl_core::types::error::{DownloadError, LedgerError, TransportError};
use reldl_core::types::types::{ContentDescriptor, DownloadTarget, DownloadWarning, LedgerKey};

fn generate_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// In-process origin that records every range it is asked for.
struct ScriptedTransport {
    body: Vec<u8>,
    descriptor: ContentDescriptor,
    latency: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    requests: Mutex<Vec<(u64, u64)>>,
    /// Ranges starting here get half a body once.
    truncate_once: Mutex<HashSet<u64>>,
    /// Ranges starting here are refused with 416.
    unsatisfiable: HashSet<u64>,
    /// The next whole-file body stops halfway but still declares its full length.
    truncate_whole_once: AtomicBool,
    whole_requests: AtomicUsize,
}

impl ScriptedTransport {
    fn new(body: Vec<u8>, supports_ranges: bool) -> Self {
        let descriptor = ContentDescriptor {
            total_size: Some(body.len() as u64),
            supports_ranges,
            ..ContentDescriptor::default()
        };
        Self {
            body,
            descriptor,
            latency: Duration::from_millis(10),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            truncate_once: Mutex::new(HashSet::new()),
            unsatisfiable: HashSet::new(),
            truncate_whole_once: AtomicBool::new(false),
            whole_requests: AtomicUsize::new(0),
        }
    }

    fn requests(&self) -> Vec<(u64, u64)> {
        self.requests.lock().unwrap().clone()
    }

    fn response(pieces: Vec<Vec<u8>>) -> FetchResponse {
        let len = pieces.iter().map(Vec::len).sum::<usize>() as u64;
        FetchResponse {
            range_honored: true,
            content_length: Some(len),
            body: futures::stream::iter(pieces.into_iter().map(|p| Ok(Bytes::from(p)))).boxed(),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn probe(&self, _url: &str) -> Result<ContentDescriptor, TransportError> {
        Ok(self.descriptor.clone())
    }

    async fn fetch_range(
        &self,
        _url: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<FetchResponse, TransportError> {
        self.requests.lock().unwrap().push((start, end_inclusive));
        if self.unsatisfiable.contains(&start) {
            return Err(TransportError::RangeNotSatisfiable {
                start,
                end: end_inclusive,
            });
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let mut slice = self.body[start as usize..=end_inclusive as usize].to_vec();
        if self.truncate_once.lock().unwrap().remove(&start) {
            slice.truncate(slice.len() / 2);
        }
        Ok(Self::response(vec![slice]))
    }

    async fn fetch_all(&self, _url: &str) -> Result<FetchResponse, TransportError> {
        self.whole_requests.fetch_add(1, Ordering::SeqCst);
        if self.truncate_whole_once.swap(false, Ordering::SeqCst) {
            let half = self.body[..self.body.len() / 2].chunks(7).map(<[u8]>::to_vec).collect();
            let mut response = Self::response(half);
            response.content_length = Some(self.body.len() as u64);
            return Ok(response);
        }
        let pieces = self.body.chunks(7).map(<[u8]>::to_vec).collect();
        Ok(Self::response(pieces))
    }
}

/// Ledger whose writes always fail.
struct BrokenLedger;

#[async_trait]
impl ResumeLedger for BrokenLedger {
    async fn load(&self, _key: &LedgerKey) -> Result<BTreeSet<u32>, LedgerError> {
        Ok(BTreeSet::new())
    }

    async fn mark_completed(&self, _key: &LedgerKey, _index: u32) -> Result<(), LedgerError> {
        Err(LedgerError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "read-only")))
    }

    async fn invalidate(&self, _key: &LedgerKey) -> Result<(), LedgerError> {
        Ok(())
    }
}

fn options(chunk_size: u64, workers: usize) -> DownloadOptions {
    DownloadOptions::default()
        .with_chunk_size(chunk_size)
        .with_max_concurrency(workers)
        .with_max_attempts(3)
        .with_retry_delays(Duration::from_millis(1), Duration::from_millis(2))
        .with_retry_jitter(0.0)
}

async fn run(
    transport: Arc<ScriptedTransport>,
    ledger: Arc<dyn ResumeLedger>,
    sink: Arc<MemorySink>,
    options: DownloadOptions,
) -> Result<reldl_core::DownloadOutcome, DownloadError> {
    let session = DownloadSession::new(
        DownloadTarget::new("mem://file", sink),
        transport,
        ledger,
        options,
        CancellationToken::new(),
        None,
    );
    session.run().await
}

#[tokio::test]
async fn test_in_flight_chunks_never_exceed_concurrency() {
    let body = generate_test_data(100);
    let transport = Arc::new(ScriptedTransport::new(body.clone(), true));
    let sink = Arc::new(MemorySink::new());

    let outcome = run(transport.clone(), Arc::new(MemoryLedger::new()), sink.clone(), options(10, 2))
        .await
        .unwrap();

    assert_eq!(outcome.chunks_total, 10);
    assert_eq!(sink.contents(), body);
    assert_eq!(transport.requests().len(), 10);
    let peak = transport.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency {}", peak);
}

#[tokio::test]
async fn test_short_body_retry_continues_mid_chunk() {
    let body = generate_test_data(24);
    let transport = Arc::new(ScriptedTransport::new(body.clone(), true));
    transport.truncate_once.lock().unwrap().insert(8);
    let sink = Arc::new(MemorySink::new());

    run(transport.clone(), Arc::new(MemoryLedger::new()), sink.clone(), options(8, 1))
        .await
        .unwrap();

    assert_eq!(sink.contents(), body);
    assert_eq!(transport.requests(), vec![(0, 7), (8, 15), (12, 15), (16, 23)]);
}

#[tokio::test]
async fn test_unsatisfiable_range_fails_session() {
    let body = generate_test_data(24);
    let mut scripted = ScriptedTransport::new(body, true);
    scripted.unsatisfiable.insert(16);
    let transport = Arc::new(scripted);

    let err = run(transport.clone(), Arc::new(MemoryLedger::new()), Arc::new(MemorySink::new()), options(8, 1))
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            DownloadError::ChunkFailed {
                index: 2,
                attempts: 1,
                source: TransportError::RangeNotSatisfiable { .. }
            }
        ),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn test_unknown_size_streams_whole_file() {
    let body = generate_test_data(50);
    let mut scripted = ScriptedTransport::new(body.clone(), true);
    scripted.descriptor.total_size = None;
    let transport = Arc::new(scripted);
    let ledger = Arc::new(MemoryLedger::new());
    let sink = Arc::new(MemorySink::with_contents(vec![9u8; 80]));

    let outcome = run(transport.clone(), ledger, sink.clone(), options(8, 4))
        .await
        .unwrap();

    assert_eq!(outcome.bytes, 50);
    assert_eq!(outcome.chunks_total, 1);
    assert_eq!(sink.contents(), body);
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_unknown_size_short_body_is_retried() {
    let body = generate_test_data(50);
    let mut scripted = ScriptedTransport::new(body.clone(), false);
    scripted.descriptor.total_size = None;
    scripted.truncate_whole_once.store(true, Ordering::SeqCst);
    let transport = Arc::new(scripted);
    let sink = Arc::new(MemorySink::new());

    let outcome = run(transport.clone(), Arc::new(MemoryLedger::new()), sink.clone(), options(8, 1))
        .await
        .unwrap();

    assert_eq!(outcome.bytes, 50);
    assert_eq!(sink.contents(), body);
    assert_eq!(transport.whole_requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_short_output_discards_resume_ledger() {
    let body = generate_test_data(24);
    let transport = Arc::new(ScriptedTransport::new(body.clone(), true));
    let ledger = Arc::new(MemoryLedger::new());
    let key = LedgerKey::new("mem://file", &transport.descriptor, Some(8));
    for index in 0..3 {
        ledger.mark_completed(&key, index).await.unwrap();
    }
    // The output lost everything past the first chunk.
    let sink = Arc::new(MemorySink::with_contents(body[..8].to_vec()));

    let outcome = run(transport.clone(), ledger.clone(), sink.clone(), options(8, 2))
        .await
        .unwrap();

    assert_eq!(outcome.chunks_resumed, 0);
    assert_eq!(sink.contents(), body);
    assert_eq!(transport.requests().len(), 3);
}

#[tokio::test]
async fn test_ledger_failure_is_a_warning() {
    let body = generate_test_data(24);
    let transport = Arc::new(ScriptedTransport::new(body.clone(), true));
    let sink = Arc::new(MemorySink::new());

    let outcome = run(transport, Arc::new(BrokenLedger), sink.clone(), options(8, 3))
        .await
        .unwrap();

    assert_eq!(sink.contents(), body);
    let ledger_warnings = outcome
        .warnings
        .iter()
        .filter(|w| matches!(w, DownloadWarning::LedgerUnavailable(_)))
        .count();
    assert_eq!(ledger_warnings, 1);
    assert!(outcome.warnings.contains(&DownloadWarning::IntegrityUnverified));
}
