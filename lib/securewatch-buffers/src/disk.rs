//! Disk overflow tier: a length-prefixed append log with a recoverable read
//! cursor.
//!
//! On-disk format, repeated per record: 4-byte big-endian payload length,
//! then the payload bytes (raw JSON or a compression frame). No header and
//! no per-record checksum in v1; recovery walks the length-prefix chain.
//! A truncated tail is quarantined to a `.corrupt` sidecar, never silently
//! deleted.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use snafu::{ensure, ResultExt, Snafu};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::internal_events::DiskBufferCorruption;
use securewatch_common::emit;

const LENGTH_PREFIX_SIZE: u64 = 4;

/// Largest payload the reader will accept. A length prefix beyond this is
/// treated as corruption rather than an allocation request.
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Snafu)]
pub enum DiskBufferError {
    #[snafu(display("disk buffer is full ({max_items} items)"))]
    DiskFull { max_items: usize },

    #[snafu(display("disk buffer corrupt at offset {offset}"))]
    Corrupt { offset: u64 },

    #[snafu(display("disk buffer I/O error: {source}"))]
    Io { source: std::io::Error },
}

/// The append-log disk buffer.
///
/// Writes are serialized through `&mut self`; the buffer manager owns the
/// buffer behind an async mutex. The read cursor lives only in memory and
/// restarts at zero on reopen, which re-delivers unacknowledged items: the
/// documented at-least-once boundary.
#[derive(Debug)]
pub struct DiskBuffer {
    path: PathBuf,
    file: File,
    max_items: usize,
    write_offset: u64,
    read_offset: u64,
    total_items: usize,
    read_items: usize,
}

impl DiskBuffer {
    /// Open (or create) the buffer at `path`, scanning the length-prefix
    /// chain to recover the item count and write offset. The read cursor
    /// starts at zero.
    pub async fn open(path: impl AsRef<Path>, max_items: usize) -> Result<Self, DiskBufferError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.context(IoSnafu)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .context(IoSnafu)?;

        let file_len = file.metadata().await.context(IoSnafu)?.len();
        let (total_items, write_offset) = scan_record_chain(&mut file, file_len).await?;

        let mut buffer = Self {
            path,
            file,
            max_items,
            write_offset,
            read_offset: 0,
            total_items,
            read_items: 0,
        };

        if write_offset < file_len {
            buffer.quarantine_tail(write_offset, file_len).await?;
        }

        debug!(
            message = "Disk buffer opened.",
            path = %buffer.path.display(),
            items = total_items,
            write_offset,
        );

        Ok(buffer)
    }

    /// Append one payload. Fails with `DiskFull` when the unread item count
    /// has reached the configured maximum.
    pub async fn write(&mut self, payload: &[u8]) -> Result<(), DiskBufferError> {
        ensure!(
            self.len() < self.max_items,
            DiskFullSnafu {
                max_items: self.max_items
            }
        );

        let len = u32::try_from(payload.len()).map_err(|_| DiskBufferError::Corrupt {
            offset: self.write_offset,
        })?;
        self.file
            .write_all(&len.to_be_bytes())
            .await
            .context(IoSnafu)?;
        self.file.write_all(payload).await.context(IoSnafu)?;
        self.file.flush().await.context(IoSnafu)?;

        self.write_offset += LENGTH_PREFIX_SIZE + u64::from(len);
        self.total_items += 1;
        Ok(())
    }

    /// Read up to `count` payloads from the cursor, advancing it.
    ///
    /// A truncated record mid-read (external interference; the open scan
    /// validated the chain) quarantines the tail and ends the iteration. The
    /// items recovered so far are returned; a read that recovers nothing
    /// from a corrupt position fails with `Corrupt`.
    pub async fn read(&mut self, count: usize) -> Result<Vec<Bytes>, DiskBufferError> {
        let mut items = Vec::with_capacity(count.min(self.len()));

        while items.len() < count && self.read_offset < self.write_offset {
            match self.read_one().await {
                Ok(payload) => items.push(payload),
                Err(DiskBufferError::Corrupt { offset }) => {
                    let file_len = self.file.metadata().await.context(IoSnafu)?.len();
                    self.quarantine_tail(offset, file_len).await?;
                    self.write_offset = offset;
                    self.total_items = self.read_items + items.len();
                    if items.is_empty() {
                        return Err(DiskBufferError::Corrupt { offset });
                    }
                    break;
                }
                Err(other) => return Err(other),
            }
        }
        self.read_items += items.len();

        // Once everything written has been read, compact so the log does not
        // grow without bound across spill cycles.
        if self.read_items == self.total_items && self.total_items > 0 {
            self.reset_log().await?;
        }

        Ok(items)
    }

    async fn read_one(&mut self) -> Result<Bytes, DiskBufferError> {
        let record_offset = self.read_offset;
        self.file
            .seek(SeekFrom::Start(record_offset))
            .await
            .context(IoSnafu)?;

        let mut prefix = [0u8; 4];
        self.file
            .read_exact(&mut prefix)
            .await
            .map_err(|_| DiskBufferError::Corrupt {
                offset: record_offset,
            })?;
        let len = u32::from_be_bytes(prefix);
        if len > MAX_RECORD_SIZE {
            return Err(DiskBufferError::Corrupt {
                offset: record_offset,
            });
        }

        let mut payload = vec![0u8; len as usize];
        self.file
            .read_exact(&mut payload)
            .await
            .map_err(|_| DiskBufferError::Corrupt {
                offset: record_offset,
            })?;

        self.read_offset = record_offset + LENGTH_PREFIX_SIZE + u64::from(len);
        Ok(Bytes::from(payload))
    }

    /// Unread item count.
    pub fn len(&self) -> usize {
        self.total_items - self.read_items
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Drop all contents, read and unread.
    pub async fn clear(&mut self) -> Result<(), DiskBufferError> {
        self.reset_log().await
    }

    /// Flush and durably sync the log.
    pub async fn close(mut self) -> Result<(), DiskBufferError> {
        self.file.flush().await.context(IoSnafu)?;
        self.file.sync_all().await.context(IoSnafu)?;
        Ok(())
    }

    async fn reset_log(&mut self) -> Result<(), DiskBufferError> {
        self.file.set_len(0).await.context(IoSnafu)?;
        self.file
            .seek(SeekFrom::Start(0))
            .await
            .context(IoSnafu)?;
        self.write_offset = 0;
        self.read_offset = 0;
        self.total_items = 0;
        self.read_items = 0;
        Ok(())
    }

    /// Copy the bytes in `[from, file_len)` to the `.corrupt` sidecar and
    /// truncate the log back to the last known-good position.
    async fn quarantine_tail(&mut self, from: u64, file_len: u64) -> Result<(), DiskBufferError> {
        let tail_len = file_len.saturating_sub(from);
        if tail_len == 0 {
            return Ok(());
        }

        self.file
            .seek(SeekFrom::Start(from))
            .await
            .context(IoSnafu)?;
        let mut tail = vec![0u8; tail_len as usize];
        self.file.read_exact(&mut tail).await.context(IoSnafu)?;

        let quarantine_path = self.path.with_extension("corrupt");
        let mut quarantine = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&quarantine_path)
            .await
            .context(IoSnafu)?;
        quarantine.write_all(&tail).await.context(IoSnafu)?;
        quarantine.flush().await.context(IoSnafu)?;

        self.file.set_len(from).await.context(IoSnafu)?;

        emit(DiskBufferCorruption {
            path: &self.path,
            offset: from,
            bytes_quarantined: tail_len,
        });
        Ok(())
    }
}

/// Walk the length-prefix chain from the start of the file, returning the
/// count of complete records and the offset just past the last one.
async fn scan_record_chain(
    file: &mut File,
    file_len: u64,
) -> Result<(usize, u64), DiskBufferError> {
    let mut offset = 0u64;
    let mut count = 0usize;

    file.seek(SeekFrom::Start(0)).await.context(IoSnafu)?;
    loop {
        if offset + LENGTH_PREFIX_SIZE > file_len {
            break;
        }
        let mut prefix = [0u8; 4];
        file.read_exact(&mut prefix).await.context(IoSnafu)?;
        let len = u32::from_be_bytes(prefix);
        if len > MAX_RECORD_SIZE {
            break;
        }
        let next = offset + LENGTH_PREFIX_SIZE + u64::from(len);
        if next > file_len {
            break;
        }
        file.seek(SeekFrom::Start(next)).await.context(IoSnafu)?;
        offset = next;
        count += 1;
    }

    Ok((count, offset))
}
