use std::fmt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Suffix for in-progress download files
const PARTIAL_SUFFIX: &str = ".part";

/// Half-open byte range `[start, end)` moved in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Next chunk after `offset`, or `None` once `offset` reaches `total`.
    pub fn next(offset: u64, chunk_size: u64, total: u64) -> Option<Self> {
        if offset >= total || chunk_size == 0 {
            return None;
        }
        Some(Self::new(offset, offset.saturating_add(chunk_size).min(total)))
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Inclusive `Range` request header value, e.g. `bytes=0-1023`.
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }

    /// Inclusive `Content-Range` header value for an upload of `total` bytes.
    pub fn content_range_header(&self, total: u64) -> String {
        if self.is_empty() {
            format!("bytes */{}", total)
        } else {
            format!("bytes {}-{}/{}", self.start, self.end - 1, total)
        }
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Remote acknowledgement of an upload chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAck {
    /// The remote side holds the first `committed` bytes and wants more.
    Partial { committed: u64 },
    /// The final byte arrived and the file was created.
    Complete { file_id: String },
}

/// Read exactly `range` from the file at `path`.
pub async fn read_range(path: &Path, range: ChunkRange) -> io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; range.len() as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Path of the in-progress file backing a download to `output`.
pub fn partial_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    output.with_file_name(name)
}

/// Download target written chunk by chunk at exact offsets, renamed onto the
/// final path once complete.
pub struct PartialDownload {
    file: File,
    partial: PathBuf,
    output: PathBuf,
}

impl PartialDownload {
    /// Open (or create) the partial file for `output`, keeping at most
    /// `committed` bytes. Bytes past the durable offset may be a torn write
    /// and are discarded. Returns the writer and the offset it can resume
    /// from, which is 0 when the partial file is shorter than `committed`.
    pub async fn open(output: &Path, committed: u64) -> io::Result<(Self, u64)> {
        let partial = partial_path(output);
        if let Some(parent) = partial.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&partial)
            .await?;

        let on_disk = file.metadata().await?.len();
        let resume_at = if on_disk >= committed { committed } else { 0 };
        file.set_len(resume_at).await?;

        Ok((
            Self {
                file,
                partial,
                output: output.to_path_buf(),
            },
            resume_at,
        ))
    }

    /// Write `bytes` at `offset` and flush them to disk.
    pub async fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(bytes).await?;
        self.file.sync_data().await
    }

    /// Flush and move the partial file onto the output path.
    pub async fn finish(mut self) -> io::Result<PathBuf> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.partial, &self.output).await?;
        Ok(self.output)
    }
}
