use std::collections::BTreeMap;
use std::time::Instant;

use tokio::sync::mpsc;

use super::observer::ProgressObserver;
use super::snapshot::{ChunkSnapshot, ProgressSnapshot};
use crate::types::types::ProgressEvent;

/// EMA smoothing factor. 0.3 = responsive but stable.
const EMA_ALPHA: f64 = 0.3;

/// What the session sends to the notifier.
#[derive(Debug, Clone)]
pub enum ProgressMessage {
    /// Sent after planning, and again if the session restarts as whole-file.
    Started {
        total_bytes: Option<u64>,
        resumed_bytes: u64,
    },
    Chunk(ProgressEvent),
    /// The chunk restarted from its first byte.
    ChunkReset(u32),
    /// Terminal failure; observers get `on_error` and the notifier stops.
    Failed(String),
}

struct ChunkProgress {
    bytes_downloaded: u64,
    total_bytes: u64,
    speed: f64,
    last_update: Instant,
}

/// Aggregates `ProgressMessage`s into `ProgressSnapshot`s and fans them out
/// to every registered observer.
///
/// | Channel message        | Observer method called          |
/// |------------------------|---------------------------------|
/// | `Chunk(event)`         | `on_progress(&snapshot)`        |
/// | `ChunkReset(index)`    | none; zeroes that chunk         |
/// | `Failed(msg)`          | `on_error(&msg)` then stops     |
/// | Channel closed         | `on_complete(&final_snapshot)`  |
pub struct ProgressNotifier {
    observers: Vec<Box<dyn ProgressObserver>>,
    chunks: BTreeMap<u32, ChunkProgress>,
    total_bytes: Option<u64>,
    resumed_bytes: u64,
    start_time: Instant,
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressNotifier {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
            chunks: BTreeMap::new(),
            total_bytes: None,
            resumed_bytes: 0,
            start_time: Instant::now(),
        }
    }

    /// Register an observer. Must be called before `run()`.
    pub fn add_observer(&mut self, observer: Box<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    pub fn has_observers(&self) -> bool {
        !self.observers.is_empty()
    }

    /// Consume messages until the channel closes or a failure arrives.
    pub async fn run(mut self, mut progress_rx: mpsc::Receiver<ProgressMessage>) {
        self.start_time = Instant::now();
        while let Some(msg) = progress_rx.recv().await {
            match msg {
                ProgressMessage::Started {
                    total_bytes,
                    resumed_bytes,
                } => {
                    // A restart after range fallback begins a fresh tally.
                    self.chunks.clear();
                    self.total_bytes = total_bytes;
                    self.resumed_bytes = resumed_bytes;
                }
                ProgressMessage::Chunk(ev) => {
                    let snapshot = self.handle_event(ev);
                    for observer in &self.observers {
                        observer.on_progress(&snapshot).await;
                    }
                }
                ProgressMessage::ChunkReset(index) => {
                    if let Some(chunk) = self.chunks.get_mut(&index) {
                        chunk.bytes_downloaded = 0;
                        chunk.speed = 0.0;
                    }
                }
                ProgressMessage::Failed(error) => {
                    for observer in &self.observers {
                        observer.on_error(&error).await;
                    }
                    return;
                }
            }
        }
        self.finish().await;
    }

    fn handle_event(&mut self, ev: ProgressEvent) -> ProgressSnapshot {
        let now = Instant::now();
        let chunk = self.chunks.entry(ev.chunk_index).or_insert_with(|| ChunkProgress {
            bytes_downloaded: 0,
            total_bytes: ev.total_bytes.unwrap_or(0),
            speed: 0.0,
            last_update: now,
        });

        chunk.bytes_downloaded += ev.bytes_delta;
        if chunk.total_bytes == 0 {
            if let Some(tb) = ev.total_bytes {
                chunk.total_bytes = tb;
            }
        }

        let elapsed = now.duration_since(chunk.last_update).as_secs_f64();
        if elapsed > 0.0 {
            let instant_speed = ev.bytes_delta as f64 / elapsed;
            chunk.speed = EMA_ALPHA * instant_speed + (1.0 - EMA_ALPHA) * chunk.speed;
            chunk.last_update = now;
        }

        self.build_snapshot()
    }

    fn build_snapshot(&self) -> ProgressSnapshot {
        let fetched: u64 = self.chunks.values().map(|c| c.bytes_downloaded).sum();
        let total_downloaded = fetched + self.resumed_bytes;
        let total_bytes = self.total_bytes.unwrap_or(0);
        let combined_speed: f64 = self.chunks.values().map(|c| c.speed).sum();
        let remaining = total_bytes.saturating_sub(total_downloaded);
        let eta = if combined_speed > 0.0 {
            remaining as f64 / combined_speed
        } else {
            0.0
        };

        let chunks = self
            .chunks
            .iter()
            .map(|(index, c)| ChunkSnapshot {
                chunk_index: *index,
                bytes_downloaded: c.bytes_downloaded,
                total_bytes: c.total_bytes,
                speed: c.speed,
            })
            .collect();

        ProgressSnapshot {
            chunks,
            total_bytes_downloaded: total_downloaded,
            total_bytes,
            resumed_bytes: self.resumed_bytes,
            speed: combined_speed,
            eta_secs: eta,
            done: false,
        }
    }

    /// Final snapshot with `done = true` and the average speed.
    async fn finish(self) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let fetched: u64 = self.chunks.values().map(|c| c.bytes_downloaded).sum();
        let avg_speed = if elapsed > 0.0 {
            fetched as f64 / elapsed
        } else {
            0.0
        };

        let mut final_snapshot = self.build_snapshot();
        final_snapshot.done = true;
        final_snapshot.speed = avg_speed;
        final_snapshot.eta_secs = 0.0;

        for observer in &self.observers {
            observer.on_complete(&final_snapshot).await;
        }
    }
}
