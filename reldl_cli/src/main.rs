use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use env_logger::Env;
use tokio_util::sync::CancellationToken;

use reldl_core::downloader::ledger::{FileLedger, MemoryLedger, ResumeLedger};
use reldl_core::downloader::sink::FileSink;
use reldl_core::transport::http_transport::HttpTransport;
use reldl_core::{
    file_name_from_url, DownloadError, DownloadOptions, FileDownloadSettings, ReliableDownloader,
};

mod log_observer;
use log_observer::LogProgressObserver;

const EXIT_FAILURE: u8 = 1;
const EXIT_INTEGRITY: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "reldl", version, about = "Resilient chunked downloader")]
struct Args {
    /// URL to download (falls back to `source_url` from --config)
    #[arg(env = "RELDL_URL")]
    url: Option<String>,

    /// Output file path (falls back to `destination`, then the URL's file name)
    #[arg(short, long, env = "RELDL_OUTPUT")]
    output: Option<PathBuf>,

    #[arg(long, env = "RELDL_CHUNK_SIZE_MIB")]
    chunk_size_mib: Option<u64>,

    /// Parallel chunk fetches
    #[arg(short = 'c', long, env = "RELDL_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Attempts per chunk, first try included
    #[arg(long, env = "RELDL_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Give up on the whole session after this many seconds
    #[arg(long, env = "RELDL_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// JSON settings file
    #[arg(long, env = "RELDL_CONFIG")]
    config: Option<PathBuf>,

    /// Ignore and do not write the resume sidecar
    #[arg(long)]
    no_resume: bool,

    /// Delete the output when the MD5 check fails
    #[arg(long)]
    discard_corrupt: bool,
}

/// A fully resolved download job.
#[derive(Debug)]
struct Job {
    url: String,
    output: PathBuf,
    options: DownloadOptions,
}

/// Settings file first, then command-line flags on top.
fn resolve(args: &Args, settings: Option<FileDownloadSettings>) -> Result<Job, String> {
    let (file_url, file_output, mut options) = match settings {
        Some(s) => (s.source_url, s.destination, s.options),
        None => (None, None, DownloadOptions::default()),
    };

    let url = args
        .url
        .clone()
        .or(file_url)
        .ok_or("no URL given on the command line or in the settings file")?;
    let output = match args.output.clone().or(file_output) {
        Some(path) => path,
        None => file_name_from_url(&url)
            .map(PathBuf::from)
            .ok_or("cannot derive an output name from the URL; pass -o")?,
    };

    if let Some(mib) = args.chunk_size_mib {
        options = options.with_chunk_size(mib.saturating_mul(1024 * 1024));
    }
    if let Some(workers) = args.concurrency {
        options = options.with_max_concurrency(workers);
    }
    if let Some(attempts) = args.max_attempts {
        options = options.with_max_attempts(attempts);
    }
    if let Some(secs) = args.timeout_secs {
        options = options.with_session_timeout(Some(Duration::from_secs(secs)));
    }
    options.validate().map_err(|e| e.to_string())?;

    Ok(Job { url, output, options })
}

fn exit_code(err: &DownloadError) -> u8 {
    match err {
        DownloadError::IntegrityMismatch { .. } => EXIT_INTEGRITY,
        e if e.is_cancellation() => EXIT_CANCELLED,
        _ => EXIT_FAILURE,
    }
}

async fn discard_output(output: &Path) {
    if let Err(e) = tokio::fs::remove_file(output).await {
        log::warn!("could not delete {}: {}", output.display(), e);
    }
    if let Err(e) = FileLedger::for_output(output).remove().await {
        log::warn!("could not delete resume sidecar: {}", e);
    }
}

async fn run(args: Args) -> Result<(), (u8, String)> {
    let settings = match &args.config {
        Some(path) => Some(
            FileDownloadSettings::load(path)
                .await
                .map_err(|e| (EXIT_FAILURE, format!("{}: {}", path.display(), e)))?,
        ),
        None => None,
    };
    let job = resolve(&args, settings).map_err(|msg| (EXIT_FAILURE, msg))?;

    let transport = HttpTransport::new(&job.options).map_err(|e| (EXIT_FAILURE, e.to_string()))?;
    let ledger: Arc<dyn ResumeLedger> = if args.no_resume {
        Arc::new(MemoryLedger::new())
    } else {
        Arc::new(FileLedger::for_output(&job.output))
    };
    let sink = FileSink::open(&job.output)
        .await
        .map_err(|e| (EXIT_FAILURE, format!("{}: {}", job.output.display(), e)))?;

    let mut downloader = ReliableDownloader::new(Arc::new(transport), ledger, job.options)
        .map_err(|e| (EXIT_FAILURE, e.to_string()))?;
    downloader.add_observer(Box::new(LogProgressObserver::default()));

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt received, stopping (progress is kept)");
            on_ctrl_c.cancel();
        }
    });

    log::info!("downloading {} -> {}", job.url, job.output.display());
    let start = Instant::now();

    match downloader.download(&job.url, Arc::new(sink), cancel).await {
        Ok(outcome) => {
            // A finished download needs no resume state.
            if !args.no_resume {
                if let Err(e) = FileLedger::for_output(&job.output).remove().await {
                    log::warn!("could not delete resume sidecar: {}", e);
                }
            }
            for warning in &outcome.warnings {
                log::warn!("{}", warning);
            }
            println!(
                "Downloaded {} bytes in {:.2}s ({} chunk(s), {} resumed{}){}",
                outcome.bytes,
                start.elapsed().as_secs_f64(),
                outcome.chunks_total,
                outcome.chunks_resumed,
                if outcome.range_fallback { ", whole-file fallback" } else { "" },
                if outcome.integrity_verified { ", MD5 verified" } else { ", integrity NOT verified" }
            );
            Ok(())
        }
        Err(e) => {
            if matches!(e, DownloadError::IntegrityMismatch { .. }) && args.discard_corrupt {
                discard_output(&job.output).await;
            }
            Err((exit_code(&e), e.to_string()))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err((code, message)) => {
            eprintln!("Download failed: {}", message);
            ExitCode::from(code)
        }
    }
}
