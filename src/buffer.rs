//! Per-file replay buffer: in-memory up to a threshold, then spilled to a temp file on disk.

use std::{
    cell::RefCell,
    cmp, fmt,
    path::PathBuf,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use actix_web::web::Bytes;
use futures_core::Stream;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead as _, AsyncWriteExt as _, ReadBuf};

use crate::error::UploadError;

// Read granularity for the spilled region.
const SPILL_READ_CHUNK: usize = 8 * 1024;

/// Write-once, read-many buffer over one file part's content.
///
/// The request processor writes chunks as they arrive off the wire; any number of [`FileStream`]
/// readers consume the content independently, each from the beginning. Content is held in memory
/// up to the configured limit and appended to a named temp file past it. A failure stored with
/// [`fail`](Self::fail) is sticky and surfaced by every subsequent read; [`release`](Self::release)
/// is idempotent and deletes the spill file.
#[derive(Clone)]
pub(crate) struct FileBuffer {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    memory_limit: usize,
    directory: Option<PathBuf>,

    /// In-memory prefix of the content. Frozen once spilling starts.
    chunks: Vec<Bytes>,
    mem_len: usize,

    /// Spill file plus its write handle. The handle is taken for the duration of each write so no
    /// `RefCell` borrow is held across an await point.
    spill: Option<NamedTempFile>,
    writer: Option<tokio::fs::File>,

    /// Spilled bytes visible to readers. Only advanced after a write completes.
    spill_len: u64,

    done: bool,
    error: Option<UploadError>,
    released: bool,
    release_error: Option<UploadError>,

    wakers: Vec<Waker>,
}

impl Inner {
    fn register(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|w| w.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }

    fn wake(&mut self) {
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }

    fn record_failure(&mut self, err: UploadError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.done = true;
        self.writer = None;
        self.wake();
    }
}

impl FileBuffer {
    pub(crate) fn new(memory_limit: usize, directory: Option<PathBuf>) -> Self {
        FileBuffer {
            inner: Rc::new(RefCell::new(Inner {
                memory_limit,
                directory,
                chunks: Vec::new(),
                mem_len: 0,
                spill: None,
                writer: None,
                spill_len: 0,
                done: false,
                error: None,
                released: false,
                release_error: None,
                wakers: Vec::new(),
            })),
        }
    }

    /// Appends a chunk of content, spilling to disk once the memory limit is reached.
    pub(crate) async fn write(&self, chunk: Bytes) -> Result<(), UploadError> {
        {
            let mut inner = self.inner.borrow_mut();

            if inner.released {
                return Ok(());
            }

            if inner.spill.is_none() && inner.mem_len + chunk.len() <= inner.memory_limit {
                inner.mem_len += chunk.len();
                inner.chunks.push(chunk);
                inner.wake();
                return Ok(());
            }
        }

        self.write_spilled(chunk).await
    }

    async fn write_spilled(&self, chunk: Bytes) -> Result<(), UploadError> {
        let mut writer = {
            let mut inner = self.inner.borrow_mut();

            match inner.writer.take() {
                Some(writer) => writer,
                None if inner.spill.is_none() => {
                    match open_spill(inner.directory.as_deref()) {
                        Ok((file, writer)) => {
                            inner.spill = Some(file);
                            writer
                        }
                        Err(err) => {
                            inner.record_failure(err.clone());
                            return Err(err);
                        }
                    }
                }
                // a previous write failed and dropped the handle
                None => {
                    return Err(inner
                        .error
                        .clone()
                        .unwrap_or(UploadError::Released));
                }
            }
        };

        let result = writer.write_all(&chunk).await;
        let mut inner = self.inner.borrow_mut();

        match result {
            Ok(()) => {
                inner.spill_len += chunk.len() as u64;
                inner.writer = Some(writer);
                inner.wake();
                Ok(())
            }
            Err(err) => {
                let err = UploadError::BufferIo {
                    message: err.to_string(),
                };
                inner.record_failure(err.clone());
                Err(err)
            }
        }
    }

    /// Marks the content complete, flushing any spill writes first.
    pub(crate) async fn finish(&self) -> Result<(), UploadError> {
        let writer = self.inner.borrow_mut().writer.take();

        if let Some(mut writer) = writer {
            if let Err(err) = writer.flush().await {
                let err = UploadError::BufferIo {
                    message: err.to_string(),
                };
                self.inner.borrow_mut().record_failure(err.clone());
                return Err(err);
            }
        }

        let mut inner = self.inner.borrow_mut();
        inner.done = true;
        inner.wake();
        Ok(())
    }

    /// Stores a sticky failure; all current and future readers observe it.
    pub(crate) fn fail(&self, err: UploadError) {
        self.inner.borrow_mut().record_failure(err);
    }

    /// Releases the buffer: memory is dropped, the spill file is deleted, and later
    /// [`open`](Self::open) calls fail with `error` (or [`UploadError::Released`]). Idempotent.
    pub(crate) fn release(&self, error: Option<UploadError>) {
        let mut inner = self.inner.borrow_mut();

        if inner.released {
            return;
        }

        inner.released = true;
        inner.release_error = error;
        inner.chunks = Vec::new();
        inner.mem_len = 0;
        inner.writer = None;
        inner.spill = None;
        inner.wake();
    }

    /// Opens an independent reader over the full content.
    pub(crate) fn open(&self) -> Result<FileStream, UploadError> {
        let inner = self.inner.borrow();

        if let Some(err) = &inner.error {
            return Err(err.clone());
        }

        if inner.released {
            return Err(inner.release_error.clone().unwrap_or(UploadError::Released));
        }

        Ok(FileStream {
            inner: Rc::clone(&self.inner),
            chunk_idx: 0,
            file: None,
            file_pos: 0,
        })
    }
}

fn open_spill(
    directory: Option<&std::path::Path>,
) -> Result<(NamedTempFile, tokio::fs::File), UploadError> {
    let io_err = |err: std::io::Error| UploadError::BufferIo {
        message: err.to_string(),
    };

    let file = match directory {
        Some(dir) => NamedTempFile::new_in(dir),
        None => NamedTempFile::new(),
    }
    .map_err(io_err)?;

    let writer = file.reopen().map_err(io_err)?;

    Ok((file, tokio::fs::File::from_std(writer)))
}

impl fmt::Debug for FileBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("FileBuffer")
            .field("len", &(inner.mem_len as u64 + inner.spill_len))
            .field("spilled", &inner.spill.is_some())
            .field("done", &inner.done)
            .field("error", &inner.error)
            .field("released", &inner.released)
            .finish()
    }
}

/// An independent read stream over a buffered file's content.
///
/// The in-memory region is served as cheap [`Bytes`] clones; the spilled region is read through a
/// private re-open of the temp file, so concurrent readers never disturb each other's position.
pub struct FileStream {
    inner: Rc<RefCell<Inner>>,
    chunk_idx: usize,
    file: Option<tokio::fs::File>,
    file_pos: u64,
}

enum Step {
    Fail(UploadError),
    Memory(Bytes),
    Spill { want: usize },
    Finished,
    Park,
}

impl Stream for FileStream {
    type Item = Result<Bytes, UploadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        let step = {
            let inner = this.inner.borrow();

            if let Some(err) = &inner.error {
                Step::Fail(err.clone())
            } else if inner.released {
                Step::Fail(inner.release_error.clone().unwrap_or(UploadError::Released))
            } else if this.chunk_idx < inner.chunks.len() {
                Step::Memory(inner.chunks[this.chunk_idx].clone())
            } else if this.file_pos < inner.spill_len {
                let avail = inner.spill_len - this.file_pos;
                Step::Spill {
                    want: cmp::min(avail, SPILL_READ_CHUNK as u64) as usize,
                }
            } else if inner.done {
                Step::Finished
            } else {
                Step::Park
            }
        };

        match step {
            Step::Fail(err) => Poll::Ready(Some(Err(err))),

            Step::Memory(chunk) => {
                this.chunk_idx += 1;
                Poll::Ready(Some(Ok(chunk)))
            }

            Step::Finished => Poll::Ready(None),

            Step::Park => {
                this.inner.borrow_mut().register(cx.waker());
                Poll::Pending
            }

            Step::Spill { want } => this.poll_spill(cx, want),
        }
    }
}

impl FileStream {
    fn poll_spill(
        &mut self,
        cx: &mut Context<'_>,
        want: usize,
    ) -> Poll<Option<Result<Bytes, UploadError>>> {
        let io_err = |err: std::io::Error| UploadError::BufferIo {
            message: err.to_string(),
        };

        if self.file.is_none() {
            let reopened = {
                let inner = self.inner.borrow();
                match &inner.spill {
                    Some(file) => file.reopen().map_err(io_err),
                    // release() ran between the borrow in poll_next and here
                    None => return Poll::Ready(Some(Err(UploadError::Released))),
                }
            };

            match reopened {
                Ok(file) => self.file = Some(tokio::fs::File::from_std(file)),
                Err(err) => return Poll::Ready(Some(Err(err))),
            }
        }

        let file = self
            .file
            .as_mut()
            .expect("reader spill file was just opened");

        let mut buf = vec![0; want];
        let mut read_buf = ReadBuf::new(&mut buf);

        match Pin::new(file).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled().len();

                if filled == 0 {
                    // raced ahead of the writer's durable bytes; wait for the next write
                    self.inner.borrow_mut().register(cx.waker());
                    return Poll::Pending;
                }

                self.file_pos += filled as u64;
                buf.truncate(filled);
                Poll::Ready(Some(Ok(Bytes::from(buf))))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Some(Err(io_err(err)))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for FileStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStream")
            .field("chunk_idx", &self.chunk_idx)
            .field("file_pos", &self.file_pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use actix_web::web::BytesMut;
    use assert_matches::assert_matches;
    use futures_util::StreamExt as _;

    use super::*;

    async fn collect(mut stream: FileStream) -> Result<Bytes, UploadError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    #[actix_rt::test]
    async fn replays_in_memory_content() {
        let buffer = FileBuffer::new(1024, None);
        buffer.write(Bytes::from_static(b"hello ")).await.unwrap();
        buffer.write(Bytes::from_static(b"world")).await.unwrap();
        buffer.finish().await.unwrap();

        let first = collect(buffer.open().unwrap()).await.unwrap();
        let second = collect(buffer.open().unwrap()).await.unwrap();

        assert_eq!(first, Bytes::from_static(b"hello world"));
        assert_eq!(first, second);
    }

    #[actix_rt::test]
    async fn spills_past_memory_limit() {
        let buffer = FileBuffer::new(8, None);
        buffer.write(Bytes::from_static(b"12345")).await.unwrap();
        // exceeds the 8 byte limit, goes to disk
        buffer.write(Bytes::from_static(b"67890")).await.unwrap();
        buffer.write(Bytes::from_static(b"abcdef")).await.unwrap();
        buffer.finish().await.unwrap();

        let content = collect(buffer.open().unwrap()).await.unwrap();
        assert_eq!(content, Bytes::from_static(b"1234567890abcdef"));

        // a second reader sees the same spilled content
        let content = collect(buffer.open().unwrap()).await.unwrap();
        assert_eq!(content, Bytes::from_static(b"1234567890abcdef"));
    }

    #[actix_rt::test]
    async fn reader_observes_concurrent_writes() {
        let buffer = FileBuffer::new(0, None);
        let reader = buffer.open().unwrap();

        let writer = buffer.clone();
        let task = actix_web::rt::spawn(async move {
            writer.write(Bytes::from_static(b"abc")).await.unwrap();
            actix_web::rt::task::yield_now().await;
            writer.write(Bytes::from_static(b"def")).await.unwrap();
            writer.finish().await.unwrap();
        });

        let content = collect(reader).await.unwrap();
        assert_eq!(content, Bytes::from_static(b"abcdef"));
        task.await.unwrap();
    }

    #[actix_rt::test]
    async fn failure_is_sticky_for_all_readers() {
        let buffer = FileBuffer::new(1024, None);
        buffer.write(Bytes::from_static(b"partial")).await.unwrap();

        let mut open_before = buffer.open().unwrap();
        assert_eq!(
            open_before.next().await.unwrap().unwrap(),
            Bytes::from_static(b"partial"),
        );

        buffer.fail(UploadError::Disconnected);

        assert_matches!(
            open_before.next().await,
            Some(Err(UploadError::Disconnected))
        );
        assert_matches!(buffer.open(), Err(UploadError::Disconnected));
    }

    #[actix_rt::test]
    async fn release_is_idempotent_and_fails_later_opens() {
        let buffer = FileBuffer::new(0, None);
        buffer.write(Bytes::from_static(b"spilled")).await.unwrap();
        buffer.finish().await.unwrap();

        buffer.release(None);
        buffer.release(Some(UploadError::Disconnected));

        // second release is a no-op, so the stored outcome stays `Released`
        assert_matches!(buffer.open(), Err(UploadError::Released));
    }
}
