use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use reldl_core::progress::{format_bytes, ProgressObserver, ProgressSnapshot};

/// Reports progress through `log` every time another `step` percent is done.
pub struct LogProgressObserver {
    step: u64,
    last_bucket: AtomicU64,
}

impl LogProgressObserver {
    pub fn new(step: u64) -> Self {
        Self {
            step: step.max(1),
            last_bucket: AtomicU64::new(0),
        }
    }

    /// Which reporting bucket `snapshot` falls in, if the size is known.
    fn bucket(&self, snapshot: &ProgressSnapshot) -> Option<u64> {
        snapshot.percent().map(|p| p as u64 / self.step)
    }
}

impl Default for LogProgressObserver {
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl ProgressObserver for LogProgressObserver {
    async fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let Some(bucket) = self.bucket(snapshot) else {
            return;
        };
        if self.last_bucket.fetch_max(bucket, Ordering::Relaxed) < bucket {
            log::info!(
                "{:>3}%  {} / {}  {}/s  ETA {:.0}s",
                bucket * self.step,
                format_bytes(snapshot.total_bytes_downloaded),
                format_bytes(snapshot.total_bytes),
                format_bytes(snapshot.speed as u64),
                snapshot.eta_secs
            );
        }
    }

    async fn on_complete(&self, snapshot: &ProgressSnapshot) {
        log::info!(
            "transfer finished: {} ({} resumed), avg {}/s",
            format_bytes(snapshot.total_bytes_downloaded),
            format_bytes(snapshot.resumed_bytes),
            format_bytes(snapshot.speed as u64)
        );
    }

    async fn on_error(&self, error: &str) {
        log::debug!("transfer aborted: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(done: u64, total: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            total_bytes_downloaded: done,
            total_bytes: total,
            ..ProgressSnapshot::empty()
        }
    }

    #[test]
    fn buckets_follow_the_step() {
        let observer = LogProgressObserver::new(10);
        assert_eq!(observer.bucket(&snapshot(0, 100)), Some(0));
        assert_eq!(observer.bucket(&snapshot(19, 100)), Some(1));
        assert_eq!(observer.bucket(&snapshot(100, 100)), Some(10));
        assert_eq!(observer.bucket(&snapshot(5, 0)), None);
    }
}
