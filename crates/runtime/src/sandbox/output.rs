//! Bounded reading of run-unit output streams

use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE: usize = 8 * 1024;

/// Result of reading one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundedOutput {
    /// The data that was kept, with a marker appended when truncated.
    pub data: String,
    /// Whether the stream produced more than the ceiling.
    pub truncated: bool,
    /// Total bytes the stream produced, kept or not.
    pub bytes_seen: usize,
}

/// Read `reader` to EOF, keeping at most `max_bytes`.
///
/// Bytes past the ceiling are drained and discarded so the writer never
/// blocks on a full pipe.
pub async fn read_bounded<R: AsyncRead + Unpin>(reader: &mut R, max_bytes: usize) -> BoundedOutput {
    let mut kept = Vec::with_capacity(max_bytes.min(CHUNK_SIZE));
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut seen = 0usize;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                seen += n;
                let room = max_bytes.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                tracing::debug!("Output stream closed with error: {}", e);
                break;
            }
        }
    }

    let truncated = seen > max_bytes;
    let text = String::from_utf8_lossy(&kept).to_string();
    let data = if truncated {
        format!("{}\n... [output truncated at {} bytes]", text, max_bytes)
    } else {
        text
    };

    BoundedOutput {
        data,
        truncated,
        bytes_seen: seen,
    }
}
