//! Error and Result module.

use std::rc::Rc;

use actix_multipart::MultipartError;
use actix_web::{error::PayloadError, http::StatusCode, ResponseError};
use derive_more::{Display, Error};

/// A set of errors that can occur while processing a GraphQL multipart request.
///
/// The first terminal error of a request is broadcast to every upload placeholder that has not yet
/// resolved, which is why this type is `Clone`.
#[derive(Clone, Debug, Display, Error)]
#[non_exhaustive]
pub enum UploadError {
    /// Request Content-Type is not `multipart/form-data`.
    #[display("Content-Type is not multipart/form-data")]
    ContentTypeIncompatible,

    /// A JSON field (`operations` or `map`) could not be parsed.
    #[display("invalid JSON in `{field}` multipart field: {message}")]
    InvalidJson {
        /// Name of the offending multipart field.
        field: &'static str,

        /// Parser diagnostic.
        message: String,
    },

    /// The `operations` field is valid JSON but not an object or array.
    #[display("`operations` multipart field must be a JSON object or array")]
    InvalidOperationsType,

    /// The `map` field is valid JSON but not an object.
    #[display("`map` multipart field must be a JSON object")]
    InvalidMapType,

    /// A `map` entry is not an array of path strings.
    #[display("`map` entry for multipart field `{field}` must be an array of path strings")]
    InvalidMapEntry {
        /// The `map` key whose value is malformed.
        field: String,
    },

    /// A `map` path does not address a bindable position in `operations`.
    #[display("invalid upload path `{path}` in `map` multipart field")]
    InvalidPath {
        /// The offending path string.
        path: String,
    },

    /// The first multipart field is not `operations`.
    #[display("misordered multipart fields; `operations` should come first")]
    MisorderedOperations,

    /// The second multipart field is not `map`.
    #[display("misordered multipart fields; `map` should follow `operations`")]
    MisorderedMap,

    /// A file part arrived before the `map` field was parsed.
    #[display("misordered multipart fields; files should follow `map`")]
    MisorderedFiles,

    /// The request ended before a required field arrived.
    #[display("missing multipart field `{_0}`")]
    MissingField(#[error(not(source))] &'static str),

    /// A file declared in `map` never arrived.
    #[display("file for `map` multipart field `{_0}` was not attached")]
    FileMissing(#[error(not(source))] String),

    /// The `operations` or `map` field value exceeded the field size limit.
    #[display("`{field}` multipart field exceeded the size limit of {limit} bytes")]
    FieldSizeExceeded {
        /// Name of the truncated field.
        field: &'static str,

        /// The configured limit.
        limit: usize,
    },

    /// A file part's content exceeded the per-file size limit.
    #[display("file for multipart field `{field}` exceeded the size limit of {limit} bytes")]
    FileSizeExceeded {
        /// The multipart field name of the truncated file.
        field: String,

        /// The configured limit.
        limit: u64,
    },

    /// The `map` field declares more entries than allowed.
    #[display("{declared} `map` entries exceed the limit of {limit} file uploads")]
    FileCountExceeded {
        /// Entry count declared by the `map` field.
        declared: usize,

        /// The configured limit.
        limit: usize,
    },

    /// The client disconnected before the multipart body was fully parsed.
    #[display("request disconnected during multipart parsing")]
    Disconnected,

    /// A file upload was released before its content was read.
    #[display("file upload was released and can no longer be read")]
    Released,

    /// I/O failure in the file buffering layer.
    #[display("file buffer I/O error: {message}")]
    BufferIo {
        /// Underlying I/O diagnostic.
        message: String,
    },

    /// Low-level multipart parse error, propagated from the tokenizer as-is.
    #[display("{_0}")]
    Multipart(#[error(not(source))] Rc<MultipartError>),
}

impl UploadError {
    /// Wraps a tokenizer error, classifying client aborts as [`UploadError::Disconnected`].
    ///
    /// A transport-level abort surfaces as a payload error; a body whose byte stream ends cleanly
    /// but mid-parse surfaces as the tokenizer's own incomplete-stream error. Both mean the client
    /// went away before finishing the upload.
    pub(crate) fn from_multipart(err: MultipartError) -> Self {
        match err {
            MultipartError::Incomplete
            | MultipartError::Payload(PayloadError::Incomplete(_)) => UploadError::Disconnected,
            err => UploadError::Multipart(Rc::new(err)),
        }
    }
}

impl ResponseError for UploadError {
    fn status_code(&self) -> StatusCode {
        match self {
            UploadError::ContentTypeIncompatible => StatusCode::UNSUPPORTED_MEDIA_TYPE,

            UploadError::FieldSizeExceeded { .. }
            | UploadError::FileSizeExceeded { .. }
            | UploadError::FileCountExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,

            // nginx's non-standard "client closed request"
            UploadError::Disconnected => {
                StatusCode::from_u16(499).expect("499 is a valid status code")
            }

            UploadError::BufferIo { .. } => StatusCode::INTERNAL_SERVER_ERROR,

            UploadError::Multipart(err) => err.status_code(),

            _ => StatusCode::BAD_REQUEST,
        }
    }
}
