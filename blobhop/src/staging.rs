//! Local staging area that holds the object between download and upload.
//!
//! By default the object is staged in an anonymous temporary file, because the objects this crate
//! is built for (tens or hundreds of GB) don't fit in memory.  The file is sized up front and
//! each downloaded range is written at its own offset, so concurrent writers never touch the same
//! bytes.  The file is unlinked as soon as it's created, so it disappears when the last handle is
//! dropped no matter how the transfer ends.
use crate::{Config, Result};
use bytes::Bytes;
use snafu::prelude::*;
use std::fs::File;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use tracing::debug;

enum Backing {
    Memory(Mutex<Vec<u8>>),
    File(File),
}

struct Inner {
    backing: Backing,
    len: u64,
}

/// Offset-addressable, fixed-size byte store which downloaded ranges are written into.
///
/// Cloning is cheap (it's an `Arc`) so that each concurrent writer can hold its own handle.  Once
/// every range has been written, [`Self::seal`] turns this into a read-only [`StagedObject`].
#[derive(Clone)]
pub struct StagingBuffer {
    inner: Arc<Inner>,
}

impl StagingBuffer {
    /// Create a staging buffer for an object of `len` bytes, in memory or on disk per `config`
    pub async fn new(config: &Config, len: u64) -> Result<Self> {
        if config.stage_in_memory {
            Ok(Self::in_memory(len))
        } else {
            Self::temp_file(config.staging_dir.clone(), len).await
        }
    }

    pub fn in_memory(len: u64) -> Self {
        debug!(len, "Staging object in memory");

        Self {
            inner: Arc::new(Inner {
                backing: Backing::Memory(Mutex::new(vec![0u8; len as usize])),
                len,
            }),
        }
    }

    /// Stage in an anonymous temporary file in `dir`, or in the system temp dir if `None`
    pub async fn temp_file(dir: Option<std::path::PathBuf>, len: u64) -> Result<Self> {
        let file = tokio::task::spawn_blocking(move || {
            let file = match &dir {
                Some(dir) => tempfile::tempfile_in(dir),
                None => tempfile::tempfile(),
            }
            .context(crate::error::StagingSnafu)?;

            // Reserve the full size now so every offset is valid for writing
            file.set_len(len).context(crate::error::StagingSnafu)?;

            debug!(?dir, len, "Staging object in temporary file");

            Result::<_>::Ok(file)
        })
        .await
        .context(crate::error::SpawnBlockingSnafu)??;

        Ok(Self {
            inner: Arc::new(Inner {
                backing: Backing::File(file),
                len,
            }),
        })
    }

    pub fn len(&self) -> u64 {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Write `data` starting at `offset`.
    ///
    /// Callers must never write overlapping ranges concurrently; the download coordinator
    /// guarantees this because the planned ranges are disjoint.
    pub async fn write_at(&self, offset: u64, data: Bytes) -> Result<()> {
        let end = offset + data.len() as u64;
        assert!(
            end <= self.inner.len,
            "BUG: write of {}..{end} is past the end of the {}-byte staging area",
            offset,
            self.inner.len
        );

        match &self.inner.backing {
            Backing::Memory(buffer) => {
                let mut buffer = buffer.lock().unwrap();
                buffer[offset as usize..end as usize].copy_from_slice(&data);

                Ok(())
            }
            Backing::File(_) => {
                let inner = self.inner.clone();

                tokio::task::spawn_blocking(move || {
                    let Backing::File(file) = &inner.backing else {
                        unreachable!()
                    };

                    positional::write_all_at(file, &data, offset).context(crate::error::StagingSnafu)
                })
                .await
                .context(crate::error::SpawnBlockingSnafu)?
            }
        }
    }

    /// Read back a range of the staged bytes
    async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
        assert!(
            range.start <= range.end && range.end <= self.inner.len,
            "BUG: read of {range:?} is outside the {}-byte staging area",
            self.inner.len
        );

        match &self.inner.backing {
            Backing::Memory(buffer) => {
                let buffer = buffer.lock().unwrap();

                Ok(Bytes::copy_from_slice(
                    &buffer[range.start as usize..range.end as usize],
                ))
            }
            Backing::File(_) => {
                let inner = self.inner.clone();

                tokio::task::spawn_blocking(move || {
                    let Backing::File(file) = &inner.backing else {
                        unreachable!()
                    };

                    let mut data = vec![0u8; (range.end - range.start) as usize];
                    positional::read_exact_at(file, &mut data, range.start)
                        .context(crate::error::StagingSnafu)?;

                    Result::<_>::Ok(Bytes::from(data))
                })
                .await
                .context(crate::error::SpawnBlockingSnafu)?
            }
        }
    }

    /// Give up write access.  The staged bytes can only be read from here on.
    pub fn seal(self) -> StagedObject {
        StagedObject { buffer: self }
    }
}

impl std::fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backing = match &self.inner.backing {
            Backing::Memory(_) => "memory",
            Backing::File(_) => "file",
        };

        f.debug_struct("StagingBuffer")
            .field("backing", &backing)
            .field("len", &self.inner.len)
            .finish()
    }
}

/// The fully-downloaded object, readable by any number of concurrent part uploads.
#[derive(Clone, Debug)]
pub struct StagedObject {
    buffer: StagingBuffer,
}

impl StagedObject {
    pub fn len(&self) -> u64 {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
        self.buffer.read_range(range).await
    }
}

#[cfg(unix)]
mod positional {
    use std::fs::File;
    use std::os::unix::fs::FileExt;

    pub(super) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
        file.write_all_at(buf, offset)
    }

    pub(super) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        file.read_exact_at(buf, offset)
    }
}

#[cfg(windows)]
mod positional {
    use std::fs::File;
    use std::io::{Error, ErrorKind};
    use std::os::windows::fs::FileExt;

    // `seek_write` and `seek_read` move the file cursor, but every access here is positional so
    // nothing depends on where the cursor ends up
    pub(super) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
        while !buf.is_empty() {
            match file.seek_write(buf, offset)? {
                0 => return Err(Error::new(ErrorKind::WriteZero, "failed to write whole buffer")),
                n => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
            }
        }

        Ok(())
    }

    pub(super) fn read_exact_at(
        file: &File,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> std::io::Result<()> {
        while !buf.is_empty() {
            match file.seek_read(buf, offset)? {
                0 => return Err(Error::new(ErrorKind::UnexpectedEof, "failed to fill whole buffer")),
                n => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
            }
        }

        Ok(())
    }
}
