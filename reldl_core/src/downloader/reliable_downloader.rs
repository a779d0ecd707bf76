use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::DownloadOptions;
use crate::downloader::ledger::{FileLedger, ResumeLedger};
use crate::downloader::session::DownloadSession;
use crate::downloader::sink::{FileSink, Sink};
use crate::progress::notifier::ProgressNotifier;
use crate::progress::observer::ProgressObserver;
use crate::transport::http_transport::HttpTransport;
use crate::transport::Transport;
use crate::types::error::DownloadError;
use crate::types::types::{DownloadOutcome, DownloadTarget};

/// Entry point for callers: owns the collaborators and runs one
/// `DownloadSession` per `download()` call.
pub struct ReliableDownloader {
    transport: Arc<dyn Transport>,
    ledger: Arc<dyn ResumeLedger>,
    options: DownloadOptions,
    notifier: ProgressNotifier,
}

impl ReliableDownloader {
    pub fn new(
        transport: Arc<dyn Transport>,
        ledger: Arc<dyn ResumeLedger>,
        options: DownloadOptions,
    ) -> Result<Self, DownloadError> {
        options.validate()?;
        Ok(Self {
            transport,
            ledger,
            options,
            notifier: ProgressNotifier::new(),
        })
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Register a progress observer. Must be called before `download()`;
    /// observers are consumed by the next download.
    pub fn add_observer(&mut self, observer: Box<dyn ProgressObserver>) {
        self.notifier.add_observer(observer);
    }

    /// Downloads `url` into `sink`. Cancelling `cancel` stops the session at
    /// its next suspension point; completed chunks stay recorded.
    pub async fn download(
        &mut self,
        url: &str,
        sink: Arc<dyn Sink>,
        cancel: CancellationToken,
    ) -> Result<DownloadOutcome, DownloadError> {
        let notifier = std::mem::take(&mut self.notifier);

        let (progress_tx, notifier_handle) = if notifier.has_observers() {
            let (tx, rx) = mpsc::channel(256);
            let handle = tokio::spawn(async move {
                notifier.run(rx).await;
            });
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        let session = DownloadSession::new(
            DownloadTarget::new(url, sink),
            Arc::clone(&self.transport),
            Arc::clone(&self.ledger),
            self.options.clone(),
            cancel,
            progress_tx,
        );
        // The session owns the only sender; once it is gone the notifier
        // drains and exits.
        let result = session.run().await;

        if let Some(handle) = notifier_handle {
            let _ = handle.await;
        }
        result
    }
}

/// Downloads `url` to `path` over HTTP, resuming from `<path>.reldl.json`
/// when a previous run left one behind.
pub async fn download_to_file(
    url: &str,
    path: &Path,
    options: DownloadOptions,
    cancel: CancellationToken,
) -> Result<DownloadOutcome, DownloadError> {
    options.validate()?;
    let transport = Arc::new(HttpTransport::new(&options)?);
    let ledger = Arc::new(FileLedger::for_output(path));
    let sink = Arc::new(FileSink::open(path).await?);

    let mut downloader = ReliableDownloader::new(transport, ledger, options)?;
    downloader.download(url, sink, cancel).await
}
