//! Offset-based tailing and consumer-side line splitting.

use std::io::{ErrorKind, SeekFrom};
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Read every byte at or after `offset`.
///
/// Returns the bytes and the offset to pass on the next call. A log that
/// does not exist yet reads as empty. Bytes are never dropped: whatever was
/// appended after the returned range is picked up by the next call.
pub async fn read_from(path: &Path, offset: u64) -> std::io::Result<(Vec<u8>, u64)> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), offset)),
        Err(e) => return Err(e),
    };

    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    let n = file.read_to_end(&mut buf).await?;
    Ok((buf, offset + n as u64))
}

/// Splits a byte stream into lines, holding back an unfinished last line.
///
/// Lines are decoded lossily, a trailing `\r` is stripped, and empty lines
/// are dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            if let Some(line) = decode(&self.pending[start..end]) {
                lines.push(line);
            }
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Emit whatever partial line is buffered.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        decode(&rest)
    }
}

fn decode(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(raw).into_owned())
}
