use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

/// Randomly writable, flushable byte store the orchestrator writes into.
///
/// Writes from different workers always target disjoint ranges, so
/// implementations need no ordering between concurrent `write_at` calls.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()>;

    /// Reads up to `len` bytes; a shorter result means end of data.
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes>;

    /// Current size of the store in bytes.
    async fn len(&self) -> io::Result<u64>;

    /// Grows or truncates the store to exactly `len` bytes.
    async fn set_len(&self, len: u64) -> io::Result<()>;

    /// Returns once every completed write is durable.
    async fn flush(&self) -> io::Result<()>;
}

/// A local file written with positional I/O on the blocking pool.
pub struct FileSink {
    file: Arc<std::fs::File>,
    path: PathBuf,
}

impl FileSink {
    /// Opens (or creates) the file without truncating it, so partial output
    /// from an earlier session survives for resume.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?
            .into_std()
            .await;
        Ok(Self {
            file: Arc::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, op: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&std::fs::File) -> io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || op(&file))
            .await
            .map_err(io::Error::other)?
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()> {
        self.blocking(move |file| write_all_at(file, &data, offset)).await
    }

    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        self.blocking(move |file| {
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                let n = read_at(file, &mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(Bytes::from(buf))
        })
        .await
    }

    async fn len(&self) -> io::Result<u64> {
        self.blocking(|file| Ok(file.metadata()?.len())).await
    }

    async fn set_len(&self, len: u64) -> io::Result<()> {
        self.blocking(move |file| file.set_len(len)).await
    }

    async fn flush(&self) -> io::Result<()> {
        self.blocking(|file| file.sync_data()).await
    }
}

#[cfg(unix)]
fn write_all_at(file: &std::fs::File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(unix)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &std::fs::File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "failed to write whole buffer"));
        }
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// In-memory sink, mostly for tests and small payloads.
#[derive(Default)]
pub struct MemorySink {
    data: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start + data.len();
        let mut buf = self.lock();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(&data);
        Ok(())
    }

    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let buf = self.lock();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(buf.len());
        let end = start.saturating_add(len).min(buf.len());
        Ok(Bytes::copy_from_slice(&buf[start..end]))
    }

    async fn len(&self) -> io::Result<u64> {
        Ok(self.lock().len() as u64)
    }

    async fn set_len(&self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length too large"))?;
        self.lock().resize(len, 0);
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}
