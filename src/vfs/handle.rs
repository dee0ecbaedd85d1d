//! Open file handles.
//!
//! A handle is Open until `close`, which is terminal: the close outcome is
//! surfaced once, and every later call reports a closed handle. Reads and
//! writes take explicit offsets; there is no cursor. Content either lives
//! in a local cache file (write-caching instances) or moves through the
//! backend directly (streaming instances).

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use log::warn;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::instance::{Vfs, WriterGuard};
use crate::backend::RemoteBackend;
use crate::error::BackendError;

/// Sequentially-growing window reader over a backend object.
///
/// Fetches start at the configured chunk size and double on sequential
/// access up to the growth limit, resetting after a seek.
pub(crate) struct ChunkedReader {
    backend: Arc<dyn RemoteBackend>,
    path: String,
    chunk_size: u64,
    limit: u64,
    window: Bytes,
    window_start: u64,
    next_size: u64,
}

impl ChunkedReader {
    pub(crate) fn new(
        backend: Arc<dyn RemoteBackend>,
        path: String,
        chunk_size: u64,
        limit: u64,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            backend,
            path,
            chunk_size,
            limit: limit.max(chunk_size),
            window: Bytes::new(),
            window_start: 0,
            next_size: chunk_size,
        }
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes, BackendError> {
        let window_end = self.window_start + self.window.len() as u64;
        if offset >= self.window_start && offset + len as u64 <= window_end {
            let start = (offset - self.window_start) as usize;
            return Ok(self.window.slice(start..start + len));
        }

        let sequential = offset == window_end && !self.window.is_empty();
        let fetch = self.next_size.max(len as u64);
        let data = self.backend.read_range(&self.path, offset, fetch as usize).await?;

        self.next_size = if sequential {
            (self.next_size * 2).min(self.limit)
        } else {
            self.chunk_size
        };
        self.window = data.clone();
        self.window_start = offset;

        Ok(data.slice(..len.min(data.len())))
    }
}

enum HandleState {
    /// Content materialized in a local cache file; uploaded on close.
    Cached {
        file: tokio::fs::File,
        cache_path: PathBuf,
        dirty: bool,
        guard: Option<WriterGuard>,
    },
    /// Read-only ranged reads against the backend.
    StreamRead(ChunkedReader),
    /// Write buffer uploaded wholesale on close.
    StreamWrite {
        buf: Vec<u8>,
        guard: Option<WriterGuard>,
    },
}

/// An open file bound to one VFS instance.
pub struct FileHandle {
    vfs: Arc<Vfs>,
    path: String,
    readable: bool,
    writable: bool,
    state: Mutex<HandleState>,
    closed: AtomicBool,
}

impl FileHandle {
    pub(crate) fn cached(
        vfs: Arc<Vfs>,
        path: String,
        readable: bool,
        writable: bool,
        file: tokio::fs::File,
        cache_path: PathBuf,
        dirty: bool,
        guard: Option<WriterGuard>,
    ) -> Self {
        Self {
            vfs,
            path,
            readable,
            writable,
            state: Mutex::new(HandleState::Cached {
                file,
                cache_path,
                dirty,
                guard,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn stream_read(vfs: Arc<Vfs>, path: String, reader: ChunkedReader) -> Self {
        Self {
            vfs,
            path,
            readable: true,
            writable: false,
            state: Mutex::new(HandleState::StreamRead(reader)),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn stream_write(
        vfs: Arc<Vfs>,
        path: String,
        readable: bool,
        guard: Option<WriterGuard>,
    ) -> Self {
        Self {
            vfs,
            path,
            readable,
            writable: true,
            state: Mutex::new(HandleState::StreamWrite {
                buf: Vec::new(),
                guard,
            }),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BackendError::ClosedHandle)
        } else {
            Ok(())
        }
    }

    /// Read up to `len` bytes at `offset`. A short or empty result means
    /// end of file, not an error.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, BackendError> {
        self.ensure_open()?;
        if !self.readable {
            return Err(BackendError::BadHandle);
        }

        let mut state = self.state.lock().await;
        match &mut *state {
            HandleState::Cached { file, .. } => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len];
                let mut filled = 0;
                while filled < len {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(Bytes::from(buf))
            }
            HandleState::StreamRead(reader) => reader.read_at(offset, len).await,
            HandleState::StreamWrite { buf, .. } => {
                let start = (offset as usize).min(buf.len());
                let end = start.saturating_add(len).min(buf.len());
                Ok(Bytes::copy_from_slice(&buf[start..end]))
            }
        }
    }

    /// Write `data` at `offset`, returning the count written.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize, BackendError> {
        self.ensure_open()?;
        if !self.writable {
            return Err(BackendError::BadHandle);
        }

        let mut state = self.state.lock().await;
        match &mut *state {
            HandleState::Cached { file, dirty, .. } => {
                file.seek(SeekFrom::Start(offset)).await?;
                file.write_all(data).await?;
                *dirty = true;
                Ok(data.len())
            }
            HandleState::StreamRead(_) => Err(BackendError::BadHandle),
            HandleState::StreamWrite { buf, .. } => {
                let end = offset as usize + data.len();
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[offset as usize..end].copy_from_slice(data);
                Ok(data.len())
            }
        }
    }

    /// Request durability of everything written so far. The backend may
    /// legally treat this as a no-op; the upload itself happens on close.
    pub async fn flush(&self) -> Result<(), BackendError> {
        self.ensure_open()?;

        let mut state = self.state.lock().await;
        if let HandleState::Cached { file, .. } = &mut *state {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Current size of the handle's content.
    pub async fn size(&self) -> Result<u64, BackendError> {
        self.ensure_open()?;

        let mut state = self.state.lock().await;
        match &mut *state {
            HandleState::Cached { file, .. } => Ok(file.metadata().await?.len()),
            HandleState::StreamRead(reader) => {
                Ok(reader.backend.stat(&reader.path).await?.size)
            }
            HandleState::StreamWrite { buf, .. } => Ok(buf.len() as u64),
        }
    }

    /// Close the handle. The handle is closed afterwards even if the
    /// upload or backend close reports an error.
    pub async fn close(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BackendError::ClosedHandle);
        }

        let mut state = self.state.lock().await;
        let result = match &mut *state {
            HandleState::Cached {
                file,
                cache_path,
                dirty,
                guard,
            } => {
                let result = if *dirty {
                    self.upload_cache_file(file, cache_path).await
                } else {
                    Ok(())
                };
                self.vfs.release_cache_file(cache_path);
                guard.take();
                result
            }
            HandleState::StreamRead(_) => Ok(()),
            HandleState::StreamWrite { buf, guard } => {
                let data = Bytes::from(std::mem::take(buf));
                let result = self.vfs.backend().put(&self.path, data).await;
                guard.take();
                result
            }
        };

        if self.writable {
            self.vfs.invalidate_parent_listing(&self.path);
        }
        result
    }

    async fn upload_cache_file(
        &self,
        file: &mut tokio::fs::File,
        cache_path: &PathBuf,
    ) -> Result<(), BackendError> {
        file.flush().await?;
        file.sync_all().await?;

        let write_back = self.vfs.opts().write_back;
        if write_back.is_zero() {
            let data = tokio::fs::read(cache_path).await?;
            return self.vfs.backend().put(&self.path, Bytes::from(data)).await;
        }

        // Deferred upload; only meaningful while the instance is still
        // constructing. The writer guard rides along so eviction drains it.
        let vfs = self.vfs.clone();
        let path = self.path.clone();
        let cache_path = cache_path.clone();
        let guard = vfs.begin_write();
        tokio::spawn(async move {
            tokio::time::sleep(write_back).await;
            let result = match tokio::fs::read(&cache_path).await {
                Ok(data) => vfs.backend().put(&path, Bytes::from(data)).await,
                Err(err) => Err(BackendError::Io(err)),
            };
            if let Err(err) = result {
                warn!("{}: deferred upload of {path} failed: {err}", vfs.remote());
            }
            drop(guard);
        });
        Ok(())
    }
}
