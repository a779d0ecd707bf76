use crate::types::error::DownloadError;
use crate::types::types::ChunkRange;

/// Splits `[0, total_size)` into consecutive ranges of `chunk_size` bytes.
///
/// The last range holds the remainder and is never empty. A zero-byte
/// resource yields an empty plan.
pub fn plan(total_size: u64, chunk_size: u64) -> Result<Vec<ChunkRange>, DownloadError> {
    if chunk_size == 0 {
        return Err(DownloadError::Planning("chunk size must be positive".to_string()));
    }

    let count = total_size.div_ceil(chunk_size);
    if count > u64::from(u32::MAX) {
        return Err(DownloadError::Planning(format!(
            "{} bytes in {}-byte chunks needs {} chunks, more than the {} a plan can index",
            total_size,
            chunk_size,
            count,
            u32::MAX
        )));
    }

    let chunks = (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end_inclusive = start.saturating_add(chunk_size).min(total_size) - 1;
            ChunkRange {
                index: i as u32,
                start,
                end_inclusive,
            }
        })
        .collect();

    Ok(chunks)
}
