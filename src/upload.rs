//! File upload placeholders and resolved file handles.

use std::{
    cell::RefCell,
    fmt,
    future::poll_fn,
    rc::Rc,
    task::{Poll, Waker},
};

use mime::Mime;

use crate::{
    buffer::{FileBuffer, FileStream},
    error::UploadError,
};

/// A single forward-referenced file upload, bound into the operations tree before its bytes
/// arrive.
///
/// Cloning is shallow: all clones (including every tree position a deduplicated `map` entry was
/// bound at) share one settlement. The request processor resolves the placeholder when the
/// matching file part starts streaming, or rejects it when the file never arrives or the request
/// fails.
#[derive(Clone)]
pub struct FileUpload {
    inner: Rc<RefCell<Slot>>,
}

struct Slot {
    settled: Option<Result<UploadedFile, UploadError>>,
    wakers: Vec<Waker>,
}

impl FileUpload {
    pub(crate) fn new() -> Self {
        FileUpload {
            inner: Rc::new(RefCell::new(Slot {
                settled: None,
                wakers: Vec::new(),
            })),
        }
    }

    /// Waits for the upload to settle, returning the file handle or the error the request
    /// processor recorded for it.
    pub async fn file(&self) -> Result<UploadedFile, UploadError> {
        poll_fn(|cx| {
            let mut slot = self.inner.borrow_mut();

            match &slot.settled {
                Some(result) => Poll::Ready(result.clone()),
                None => {
                    if !slot.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                        slot.wakers.push(cx.waker().clone());
                    }
                    Poll::Pending
                }
            }
        })
        .await
    }

    /// Returns the settled outcome without waiting, or `None` while the file part has not yet
    /// arrived.
    pub fn try_file(&self) -> Option<Result<UploadedFile, UploadError>> {
        self.inner.borrow().settled.clone()
    }

    pub(crate) fn resolve(&self, file: UploadedFile) {
        self.settle(Ok(file));
    }

    pub(crate) fn reject(&self, err: UploadError) {
        self.settle(Err(err));
    }

    /// First settlement wins; later attempts are dropped.
    fn settle(&self, result: Result<UploadedFile, UploadError>) {
        let mut slot = self.inner.borrow_mut();

        if slot.settled.is_some() {
            log::debug!("ignoring repeated settlement of file upload");
            return;
        }

        if let Err(err) = &result {
            log::debug!("rejecting file upload: {err}");
        }

        slot.settled = Some(result);

        for waker in slot.wakers.drain(..) {
            waker.wake();
        }
    }
}

/// Equality is placeholder identity: two handles are equal when they share a settlement.
impl PartialEq for FileUpload {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for FileUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.borrow().settled {
            None => f.write_str("FileUpload(pending)"),
            Some(Ok(file)) => f.debug_tuple("FileUpload").field(file).finish(),
            Some(Err(err)) => write!(f, "FileUpload(rejected: {err})"),
        }
    }
}

/// Metadata and content access for a file part that has started streaming.
///
/// All metadata is client-supplied and untrusted. Content is read through
/// [`read_stream()`](Self::read_stream), which may be called any number of times; each call
/// yields an independent stream over the full buffered content.
#[derive(Clone, Debug)]
pub struct UploadedFile {
    filename: Option<String>,
    content_type: Option<Mime>,
    transfer_encoding: Option<String>,
    buffer: FileBuffer,
}

impl UploadedFile {
    pub(crate) fn new(
        filename: Option<String>,
        content_type: Option<Mime>,
        transfer_encoding: Option<String>,
        buffer: FileBuffer,
    ) -> Self {
        UploadedFile {
            filename,
            content_type,
            transfer_encoding,
            buffer,
        }
    }

    /// The `filename` value from the part's Content-Disposition header, if supplied.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// The part's declared Content-Type, if supplied. There is no attempt to validate it against
    /// the actual content.
    pub fn content_type(&self) -> Option<&Mime> {
        self.content_type.as_ref()
    }

    /// The part's Content-Transfer-Encoding, defaulting to `7bit` as multipart bodies do.
    pub fn transfer_encoding(&self) -> &str {
        self.transfer_encoding.as_deref().unwrap_or("7bit")
    }

    /// Opens a new stream over the file's content from the beginning.
    ///
    /// # Errors
    ///
    /// Fails with the error stored on the file's buffer (size limit, disconnect, I/O failure), or
    /// with the request's terminal error once the request state has been released.
    pub fn read_stream(&self) -> Result<FileStream, UploadError> {
        self.buffer.open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn settles_once() {
        let upload = FileUpload::new();
        assert!(upload.try_file().is_none());

        upload.reject(UploadError::Disconnected);
        upload.reject(UploadError::MisorderedFiles);

        assert_matches::assert_matches!(upload.file().await, Err(UploadError::Disconnected));
    }

    #[actix_rt::test]
    async fn clones_share_settlement() {
        let upload = FileUpload::new();
        let other = upload.clone();

        let waiter = actix_web::rt::spawn(async move { other.file().await });
        actix_web::rt::task::yield_now().await;

        upload.reject(UploadError::FileMissing("1".to_owned()));

        let result = waiter.await.unwrap();
        assert_matches::assert_matches!(result, Err(UploadError::FileMissing(_)));
    }
}
