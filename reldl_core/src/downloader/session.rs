use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DownloadOptions;
use crate::downloader::integrity;
use crate::downloader::ledger::ResumeLedger;
use crate::downloader::retry_policy::{RetryDecision, RetryPolicy};
use crate::downloader::sink::Sink;
use crate::downloader::strategy::TransferStrategy;
use crate::progress::ProgressMessage;
use crate::transport::Transport;
use crate::types::error::{DownloadError, LedgerError, TransportError};
use crate::types::types::{
    ChunkRange, ChunkState, ContentDescriptor, DownloadOutcome, DownloadTarget, DownloadWarning,
    LedgerKey, ProgressEvent, SessionPhase,
};

/// Why work stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    Deadline,
    /// The session itself halted the pool (fatal chunk error or range fallback).
    Halted,
}

/// Caller cancellation, the optional session deadline and the session's own
/// halt switch, checked at every suspension point.
#[derive(Clone)]
struct StopSignal {
    caller: CancellationToken,
    halt: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl StopSignal {
    fn new(caller: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            halt: caller.child_token(),
            caller,
            deadline: timeout.map(|t| (Instant::now() + t, t)),
        }
    }

    /// Same caller token and deadline with a fresh halt switch.
    fn rearmed(&self) -> Self {
        Self {
            halt: self.caller.child_token(),
            caller: self.caller.clone(),
            deadline: self.deadline,
        }
    }

    fn halt(&self) {
        self.halt.cancel();
    }

    fn deadline_passed(&self) -> bool {
        matches!(self.deadline, Some((at, _)) if Instant::now() >= at)
    }

    fn reason(&self) -> StopReason {
        if self.caller.is_cancelled() {
            StopReason::Cancelled
        } else if self.deadline_passed() {
            StopReason::Deadline
        } else {
            StopReason::Halted
        }
    }

    fn check(&self) -> Option<StopReason> {
        (self.halt.is_cancelled() || self.deadline_passed()).then(|| self.reason())
    }

    /// Caller-driven stops only; a halt is the session's own business.
    fn external_stop(&self) -> Option<DownloadError> {
        match self.check() {
            Some(StopReason::Halted) | None => None,
            Some(reason) => Some(self.error(reason)),
        }
    }

    async fn stopped(&self) -> StopReason {
        match self.deadline {
            Some((at, _)) => {
                tokio::select! {
                    _ = self.halt.cancelled() => self.reason(),
                    _ = tokio::time::sleep_until(at) => StopReason::Deadline,
                }
            }
            None => {
                self.halt.cancelled().await;
                self.reason()
            }
        }
    }

    /// Runs `fut` unless the session is stopped first.
    async fn guard<T>(&self, fut: impl Future<Output = T>) -> Result<T, StopReason> {
        tokio::select! {
            biased;
            reason = self.stopped() => Err(reason),
            out = fut => Ok(out),
        }
    }

    fn error(&self, reason: StopReason) -> DownloadError {
        match reason {
            StopReason::Deadline => {
                DownloadError::DeadlineExceeded(self.deadline.map(|(_, t)| t).unwrap_or_default())
            }
            StopReason::Cancelled | StopReason::Halted => DownloadError::Cancelled,
        }
    }
}

/// One independently fetched piece of the resource.
#[derive(Debug, Clone, Copy)]
enum Unit {
    Range(ChunkRange),
    Whole { expected_len: Option<u64> },
}

impl Unit {
    fn index(&self) -> u32 {
        match self {
            Unit::Range(chunk) => chunk.index,
            Unit::Whole { .. } => 0,
        }
    }

    fn offset(&self) -> u64 {
        match self {
            Unit::Range(chunk) => chunk.start,
            Unit::Whole { .. } => 0,
        }
    }

    fn len(&self) -> Option<u64> {
        match self {
            Unit::Range(chunk) => Some(chunk.len()),
            Unit::Whole { expected_len } => *expected_len,
        }
    }

    fn units_of(strategy: &TransferStrategy) -> Vec<Unit> {
        match strategy {
            TransferStrategy::WholeFile { expected_len } => vec![Unit::Whole {
                expected_len: *expected_len,
            }],
            TransferStrategy::Chunked { chunks, .. } => chunks.iter().copied().map(Unit::Range).collect(),
        }
    }
}

/// Planned work plus the per-chunk state table.
struct SessionPlan {
    strategy: TransferStrategy,
    units: Arc<Vec<Unit>>,
    /// `None` when the size is unknown and nothing can be resumed.
    key: Option<LedgerKey>,
    states: Arc<Mutex<Vec<ChunkState>>>,
    resumed: usize,
    resumed_bytes: u64,
}

enum TransferResult {
    Done { bytes: u64 },
    RangeIgnored,
}

/// Why a single fetch attempt ended early.
enum AttemptError {
    Transport(TransportError),
    RangeIgnored,
    Disk(io::Error),
}

impl From<TransportError> for AttemptError {
    fn from(err: TransportError) -> Self {
        AttemptError::Transport(err)
    }
}

enum UnitFailure {
    Stopped,
    RangeIgnored,
    Failed {
        attempts: u32,
        error: DownloadError,
        /// Stops the whole pool instead of just this chunk.
        fatal: bool,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by the worker pool of one transfer.
struct WorkerContext {
    session_id: String,
    url: String,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn Sink>,
    ledger: Arc<dyn ResumeLedger>,
    key: Option<LedgerKey>,
    units: Arc<Vec<Unit>>,
    states: Arc<Mutex<Vec<ChunkState>>>,
    policy: RetryPolicy,
    chunk_timeout: Duration,
    stop: StopSignal,
    progress_tx: Option<mpsc::Sender<ProgressMessage>>,
    warnings: Arc<Mutex<Vec<DownloadWarning>>>,
    range_ignored: AtomicBool,
    whole_bytes: AtomicU64,
    first_error: Mutex<Option<DownloadError>>,
}

impl WorkerContext {
    /// Atomically moves the next `Pending` chunk to `InFlight`.
    fn claim_next(&self) -> Option<usize> {
        if self.stop.check().is_some() {
            return None;
        }
        let mut states = lock(&self.states);
        let next = states.iter().position(|s| *s == ChunkState::Pending)?;
        states[next] = ChunkState::InFlight;
        Some(next)
    }

    fn set_state(&self, slot: usize, state: ChunkState) {
        lock(&self.states)[slot] = state;
    }

    fn record_error(&self, error: DownloadError) {
        let mut first = lock(&self.first_error);
        if first.is_none() {
            *first = Some(error);
        }
    }

    fn report(&self, chunk_index: u32, bytes_delta: u64, total_bytes: Option<u64>) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.try_send(ProgressMessage::Chunk(ProgressEvent {
                chunk_index,
                bytes_delta,
                total_bytes,
            }));
        }
    }

    /// The unit starts over from byte 0; its reported bytes no longer count.
    async fn reset_progress(&self, chunk_index: u32) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(ProgressMessage::ChunkReset(chunk_index)).await;
        }
    }

    async fn run(self: Arc<Self>) {
        while let Some(slot) = self.claim_next() {
            let unit = self.units[slot];
            match self.run_unit(&unit).await {
                Ok(()) => {}
                Err(UnitFailure::Stopped) => {
                    self.set_state(slot, ChunkState::Pending);
                    break;
                }
                Err(UnitFailure::RangeIgnored) => {
                    self.set_state(slot, ChunkState::Pending);
                    self.range_ignored.store(true, Ordering::SeqCst);
                    self.stop.halt();
                    break;
                }
                Err(UnitFailure::Failed {
                    attempts,
                    error,
                    fatal,
                }) => {
                    log::error!(
                        "[session {}] chunk={}: giving up after {} attempt(s): {}",
                        self.session_id,
                        unit.index(),
                        attempts,
                        error
                    );
                    self.set_state(
                        slot,
                        ChunkState::Failed {
                            attempts,
                            last_error: error.to_string(),
                        },
                    );
                    self.record_error(error);
                    if fatal {
                        self.stop.halt();
                        break;
                    }
                }
            }
        }
    }

    /// Fetches one unit with retries, then flushes and records it:
    /// bytes are durable in the sink before the ledger hears about them.
    async fn run_unit(&self, unit: &Unit) -> Result<(), UnitFailure> {
        let index = unit.index();
        let mut written: u64 = 0;
        let mut attempts: u32 = 0;

        loop {
            if self.stop.check().is_some() {
                return Err(UnitFailure::Stopped);
            }
            attempts += 1;

            let attempt = tokio::time::timeout(self.chunk_timeout, self.fetch_into_sink(unit, &mut written));
            let result = match self.stop.guard(attempt).await {
                Err(_) => return Err(UnitFailure::Stopped),
                Ok(Err(_elapsed)) => Err(AttemptError::Transport(TransportError::Transient(format!(
                    "chunk {} timed out after {:?}",
                    index, self.chunk_timeout
                )))),
                Ok(Ok(result)) => result,
            };

            let err = match result {
                Ok(()) => break,
                Err(AttemptError::RangeIgnored) => return Err(UnitFailure::RangeIgnored),
                Err(AttemptError::Disk(e)) => {
                    return Err(UnitFailure::Failed {
                        attempts,
                        error: DownloadError::Disk(e),
                        fatal: true,
                    })
                }
                Err(AttemptError::Transport(err)) => err,
            };

            match self.policy.should_retry(attempts, err.kind()) {
                RetryDecision::Retry(delay) => {
                    log::warn!(
                        "[session {}] chunk={}: attempt {}/{} failed ({}), retrying in {:?} from byte {}",
                        self.session_id,
                        index,
                        attempts,
                        self.policy.max_attempts(),
                        err,
                        delay,
                        unit.offset() + written
                    );
                    if self.stop.guard(tokio::time::sleep(delay)).await.is_err() {
                        return Err(UnitFailure::Stopped);
                    }
                }
                RetryDecision::GiveUp => {
                    let fatal = matches!(err, TransportError::RangeNotSatisfiable { .. });
                    return Err(UnitFailure::Failed {
                        attempts,
                        error: DownloadError::ChunkFailed {
                            index,
                            attempts,
                            source: err,
                        },
                        fatal,
                    });
                }
            }
        }

        if let Unit::Whole { .. } = unit {
            self.whole_bytes.store(written, Ordering::SeqCst);
        }

        if let Err(e) = self.sink.flush().await {
            return Err(UnitFailure::Failed {
                attempts,
                error: DownloadError::Disk(e),
                fatal: true,
            });
        }
        if let Some(key) = &self.key {
            if let Err(e) = self.ledger.mark_completed(key, index).await {
                ledger_warning(&self.session_id, &self.warnings, e);
            }
        }
        self.set_state(index as usize, ChunkState::Completed);

        log::debug!(
            "[session {}] chunk={}: completed {} bytes in {} attempt(s)",
            self.session_id,
            index,
            written,
            attempts
        );
        Ok(())
    }

    /// One request streamed straight into the sink. Range units continue
    /// from `written`; whole-file units restart from zero.
    async fn fetch_into_sink(&self, unit: &Unit, written: &mut u64) -> Result<(), AttemptError> {
        if unit.len().is_some_and(|l| *written >= l) {
            return Ok(());
        }

        let response = match unit {
            Unit::Range(chunk) => {
                let response = self
                    .transport
                    .fetch_range(&self.url, chunk.start + *written, chunk.end_inclusive)
                    .await?;
                if !response.range_honored {
                    return Err(AttemptError::RangeIgnored);
                }
                response
            }
            Unit::Whole { .. } => {
                if *written > 0 {
                    self.reset_progress(unit.index()).await;
                    *written = 0;
                }
                self.transport.fetch_all(&self.url).await?
            }
        };

        // A whole-file answer of unknown size is held to its declared length.
        let limit = match unit {
            Unit::Whole { expected_len: None } => response.content_length,
            _ => unit.len(),
        };

        let index = unit.index();
        let base = unit.offset();
        let mut body = response.body;

        while let Some(piece) = body.next().await {
            let piece = piece?;
            // Never write past the unit, whatever the origin sends.
            let usable = match limit {
                Some(l) => (piece.len() as u64).min(l - *written) as usize,
                None => piece.len(),
            };
            if usable == 0 {
                break;
            }

            self.sink
                .write_at(base + *written, piece.slice(..usable))
                .await
                .map_err(AttemptError::Disk)?;
            *written += usable as u64;
            self.report(index, usable as u64, limit);

            if limit == Some(*written) {
                break;
            }
        }

        match limit {
            Some(l) if *written < l => Err(AttemptError::Transport(TransportError::Transient(format!(
                "body ended after {} of {} bytes",
                *written, l
            )))),
            _ => Ok(()),
        }
    }
}

fn ledger_warning(session_id: &str, warnings: &Mutex<Vec<DownloadWarning>>, err: LedgerError) {
    log::warn!(
        "[session {}] resume ledger unavailable, continuing without it: {}",
        session_id,
        err
    );
    let mut warnings = lock(warnings);
    if !warnings
        .iter()
        .any(|w| matches!(w, DownloadWarning::LedgerUnavailable(_)))
    {
        warnings.push(DownloadWarning::LedgerUnavailable(err.to_string()));
    }
}

/// One download attempt from probe to terminal outcome.
///
/// Phases run `Probing → Planning → Transferring → Verifying` and end in
/// `Succeeded` or `Failed`. The sink and ledger are borrowed collaborators:
/// a failed session leaves both in place so a later session can resume.
pub struct DownloadSession {
    id: String,
    target: DownloadTarget,
    transport: Arc<dyn Transport>,
    ledger: Arc<dyn ResumeLedger>,
    options: DownloadOptions,
    policy: RetryPolicy,
    stop: StopSignal,
    progress_tx: Option<mpsc::Sender<ProgressMessage>>,
    phase: SessionPhase,
    warnings: Arc<Mutex<Vec<DownloadWarning>>>,
}

impl DownloadSession {
    pub fn new(
        target: DownloadTarget,
        transport: Arc<dyn Transport>,
        ledger: Arc<dyn ResumeLedger>,
        options: DownloadOptions,
        cancel: CancellationToken,
        progress_tx: Option<mpsc::Sender<ProgressMessage>>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            id: id[..8].to_string(),
            target,
            transport,
            ledger,
            policy: RetryPolicy::from_options(&options),
            stop: StopSignal::new(cancel, options.session_timeout()),
            options,
            progress_tx,
            phase: SessionPhase::Probing,
            warnings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Drives the session to a terminal state. Never panics the caller;
    /// every failure comes back as a `DownloadError`.
    pub async fn run(mut self) -> Result<DownloadOutcome, DownloadError> {
        log::info!("[session {}] downloading {}", self.id, self.target.url);

        let result = self.drive().await;
        match &result {
            Ok(outcome) => {
                self.enter(SessionPhase::Succeeded);
                log::info!(
                    "[session {}] succeeded: {} bytes, {} chunk(s) ({} resumed), integrity_verified={}",
                    self.id,
                    outcome.bytes,
                    outcome.chunks_total,
                    outcome.chunks_resumed,
                    outcome.integrity_verified
                );
            }
            Err(e) => {
                self.enter(SessionPhase::Failed);
                if e.is_cancellation() {
                    log::info!("[session {}] stopped: {}", self.id, e);
                } else {
                    log::error!("[session {}] failed: {}", self.id, e);
                }
                if let Some(tx) = &self.progress_tx {
                    let _ = tx.send(ProgressMessage::Failed(e.to_string())).await;
                }
            }
        }
        result
    }

    fn enter(&mut self, phase: SessionPhase) {
        log::debug!("[session {}] {:?} -> {:?}", self.id, self.phase, phase);
        self.phase = phase;
    }

    async fn drive(&mut self) -> Result<DownloadOutcome, DownloadError> {
        self.enter(SessionPhase::Probing);
        let descriptor = self.probe().await?;

        self.enter(SessionPhase::Planning);
        let strategy = TransferStrategy::select(&descriptor, self.options.chunk_size_bytes)?;
        let mut plan = self.plan(&descriptor, strategy, true).await?;

        self.enter(SessionPhase::Transferring);
        let mut range_fallback = false;
        let bytes = match self.transfer(&plan).await? {
            TransferResult::Done { bytes } => bytes,
            TransferResult::RangeIgnored => {
                log::warn!(
                    "[session {}] origin ignores range requests; falling back to a single whole-file stream",
                    self.id
                );
                range_fallback = true;
                if let Some(key) = &plan.key {
                    if let Err(e) = self.ledger.invalidate(key).await {
                        ledger_warning(&self.id, &self.warnings, e);
                    }
                }
                let whole = TransferStrategy::WholeFile {
                    expected_len: descriptor.total_size,
                };
                plan = self.plan(&descriptor, whole, false).await?;
                match self.transfer(&plan).await? {
                    TransferResult::Done { bytes } => bytes,
                    TransferResult::RangeIgnored => {
                        return Err(DownloadError::Planning(
                            "range fallback requested while already streaming the whole file".to_string(),
                        ))
                    }
                }
            }
        };

        self.enter(SessionPhase::Verifying);
        let integrity_verified = self.verify(&descriptor, &plan, bytes).await?;

        let mut warnings = lock(&self.warnings).clone();
        if !integrity_verified {
            warnings.push(DownloadWarning::IntegrityUnverified);
        }
        Ok(DownloadOutcome {
            integrity_verified,
            bytes,
            chunks_total: plan.strategy.unit_count(),
            chunks_resumed: plan.resumed,
            range_fallback,
            warnings,
        })
    }

    /// Capability probe, retried on transient failures.
    async fn probe(&self) -> Result<ContentDescriptor, DownloadError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let probe = tokio::time::timeout(
                self.options.chunk_timeout(),
                self.transport.probe(&self.target.url),
            );
            let err = match self.stop.guard(probe).await {
                Err(reason) => return Err(self.stop.error(reason)),
                Ok(Ok(Ok(descriptor))) => return Ok(descriptor),
                Ok(Ok(Err(e))) => e,
                Ok(Err(_elapsed)) => TransportError::Transient("probe timed out".to_string()),
            };

            match self.policy.should_retry(attempts, err.kind()) {
                RetryDecision::Retry(delay) => {
                    log::warn!(
                        "[session {}] probe attempt {}/{} failed ({}), retrying in {:?}",
                        self.id,
                        attempts,
                        self.policy.max_attempts(),
                        err,
                        delay
                    );
                    if let Err(reason) = self.stop.guard(tokio::time::sleep(delay)).await {
                        return Err(self.stop.error(reason));
                    }
                }
                RetryDecision::GiveUp => return Err(DownloadError::Transport(err)),
            }
        }
    }

    /// Builds the state table, merging ledger progress when `resume` is set.
    async fn plan(
        &self,
        descriptor: &ContentDescriptor,
        strategy: TransferStrategy,
        resume: bool,
    ) -> Result<SessionPlan, DownloadError> {
        let units = Unit::units_of(&strategy);
        let key = descriptor
            .total_size
            .map(|_| LedgerKey::new(&self.target.url, descriptor, strategy.ledger_chunk_size()));
        let mut states = vec![ChunkState::Pending; units.len()];
        let mut resumed = 0;
        let mut resumed_bytes = 0;

        if let (Some(key), true) = (&key, resume) {
            match self.ledger.load(key).await {
                Ok(done) if done.is_empty() => {
                    // Absent or stale: make sure nothing stale lingers.
                    if let Err(e) = self.ledger.invalidate(key).await {
                        ledger_warning(&self.id, &self.warnings, e);
                    }
                }
                Ok(done) => {
                    for index in done {
                        match units.get(index as usize) {
                            Some(unit) => {
                                states[index as usize] = ChunkState::Completed;
                                resumed += 1;
                                resumed_bytes += unit.len().unwrap_or(0);
                            }
                            None => log::warn!(
                                "[session {}] ledger lists chunk {} outside a {}-chunk plan; ignoring it",
                                self.id,
                                index,
                                units.len()
                            ),
                        }
                    }
                }
                Err(e) => ledger_warning(&self.id, &self.warnings, e),
            }
        }

        if resumed > 0 {
            // Recorded chunks only count if the output still reaches them.
            let present = self.target.sink.len().await?;
            let needed = states
                .iter()
                .zip(units.iter())
                .filter(|(state, _)| **state == ChunkState::Completed)
                .map(|(_, unit)| unit.offset() + unit.len().unwrap_or(0))
                .max()
                .unwrap_or(0);
            if present < needed {
                log::warn!(
                    "[session {}] output holds {} bytes but the ledger vouches for {}; starting over",
                    self.id,
                    present,
                    needed
                );
                if let Some(key) = &key {
                    if let Err(e) = self.ledger.invalidate(key).await {
                        ledger_warning(&self.id, &self.warnings, e);
                    }
                }
                states.fill(ChunkState::Pending);
                resumed = 0;
                resumed_bytes = 0;
            }
        }

        if let (TransferStrategy::Chunked { .. }, Some(total)) = (&strategy, descriptor.total_size) {
            self.target.sink.set_len(total).await?;
        }

        log::info!(
            "[session {}] plan: {} ({} unit(s), {} already complete, {} bytes resumed)",
            self.id,
            match &strategy {
                TransferStrategy::WholeFile { .. } => "whole-file".to_string(),
                TransferStrategy::Chunked { chunk_size, .. } => format!("chunked by {} bytes", chunk_size),
            },
            units.len(),
            resumed,
            resumed_bytes
        );

        Ok(SessionPlan {
            strategy,
            units: Arc::new(units),
            key,
            states: Arc::new(Mutex::new(states)),
            resumed,
            resumed_bytes,
        })
    }

    /// Runs the bounded worker pool over every `Pending` unit.
    async fn transfer(&self, plan: &SessionPlan) -> Result<TransferResult, DownloadError> {
        let pending = lock(&plan.states)
            .iter()
            .filter(|s| **s == ChunkState::Pending)
            .count();
        let total_bytes = match &plan.strategy {
            TransferStrategy::WholeFile { expected_len } => *expected_len,
            TransferStrategy::Chunked { chunks, .. } => chunks.last().map(|c| c.end_inclusive + 1),
        };

        if let Some(tx) = &self.progress_tx {
            let _ = tx
                .send(ProgressMessage::Started {
                    total_bytes,
                    resumed_bytes: plan.resumed_bytes,
                })
                .await;
        }

        if pending == 0 {
            return Ok(TransferResult::Done {
                bytes: total_bytes.unwrap_or(0),
            });
        }

        let workers = match &plan.strategy {
            TransferStrategy::WholeFile { .. } => 1,
            TransferStrategy::Chunked { .. } => self.options.max_concurrency.min(pending),
        };
        log::info!(
            "[session {}] transferring {} unit(s) with {} worker(s)",
            self.id,
            pending,
            workers
        );

        let ctx = Arc::new(WorkerContext {
            session_id: self.id.clone(),
            url: self.target.url.clone(),
            transport: Arc::clone(&self.transport),
            sink: Arc::clone(&self.target.sink),
            ledger: Arc::clone(&self.ledger),
            key: plan.key.clone(),
            units: Arc::clone(&plan.units),
            states: Arc::clone(&plan.states),
            policy: self.policy.clone(),
            chunk_timeout: self.options.chunk_timeout(),
            stop: self.stop.rearmed(),
            progress_tx: self.progress_tx.clone(),
            warnings: Arc::clone(&self.warnings),
            range_ignored: AtomicBool::new(false),
            whole_bytes: AtomicU64::new(0),
            first_error: Mutex::new(None),
        });

        let handles: Vec<_> = (0..workers)
            .map(|_| tokio::spawn(Arc::clone(&ctx).run()))
            .collect();
        for joined in futures::future::join_all(handles).await {
            if let Err(join_err) = joined {
                ctx.record_error(DownloadError::Worker(join_err.to_string()));
            }
        }

        if let Some(err) = ctx.stop.external_stop() {
            return Err(err);
        }
        if ctx.range_ignored.load(Ordering::SeqCst) {
            return Ok(TransferResult::RangeIgnored);
        }
        if let Some(err) = lock(&ctx.first_error).take() {
            return Err(err);
        }

        let incomplete = lock(&plan.states)
            .iter()
            .filter(|s| **s != ChunkState::Completed)
            .count();
        if incomplete > 0 {
            return Err(DownloadError::Worker(format!(
                "{} chunk(s) left incomplete by the worker pool",
                incomplete
            )));
        }

        match &plan.strategy {
            TransferStrategy::WholeFile { .. } => {
                let bytes = ctx.whole_bytes.load(Ordering::SeqCst);
                // Drop any tail left by an older, longer output.
                self.target.sink.set_len(bytes).await?;
                Ok(TransferResult::Done { bytes })
            }
            TransferStrategy::Chunked { .. } => Ok(TransferResult::Done {
                bytes: total_bytes.unwrap_or(0),
            }),
        }
    }

    /// Runs once, after every unit is `Completed`.
    async fn verify(
        &self,
        descriptor: &ContentDescriptor,
        plan: &SessionPlan,
        bytes: u64,
    ) -> Result<bool, DownloadError> {
        debug_assert!(lock(&plan.states).iter().all(|s| *s == ChunkState::Completed));

        let Some(expected) = &descriptor.integrity_hash else {
            log::warn!(
                "[session {}] origin sent no Content-MD5; integrity NOT verified",
                self.id
            );
            return Ok(false);
        };
        if !self.options.verify_integrity {
            log::info!("[session {}] integrity verification disabled", self.id);
            return Ok(false);
        }

        let checked = self
            .stop
            .guard(integrity::verify(self.target.sink.as_ref(), bytes, expected))
            .await
            .map_err(|reason| self.stop.error(reason))?;

        match checked {
            Ok(()) => {
                log::info!("[session {}] MD5 verified", self.id);
                Ok(true)
            }
            Err(e @ DownloadError::IntegrityMismatch { .. }) => {
                // The output stays for the caller; our record of it does not.
                if let Some(key) = &plan.key {
                    if let Err(le) = self.ledger.invalidate(key).await {
                        ledger_warning(&self.id, &self.warnings, le);
                    }
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
