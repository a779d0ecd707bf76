use async_trait::async_trait;

use super::snapshot::ProgressSnapshot;

/// Receives aggregated progress from a running download.
///
/// - `on_progress` after every chunk write (per streamed body piece).
/// - `on_complete` once, after the session succeeded.
/// - `on_error` once, after the session failed or was cancelled.
#[async_trait]
pub trait ProgressObserver: Send + Sync + 'static {
    async fn on_progress(&self, snapshot: &ProgressSnapshot);

    async fn on_complete(&self, snapshot: &ProgressSnapshot);

    async fn on_error(&self, error: &str);
}
