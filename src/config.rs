//! Processing limits and buffering knobs.

use std::path::{Path, PathBuf};

use actix_web::{web, HttpRequest};

/// Configuration for GraphQL multipart request processing.
///
/// Add to your app data to have it picked up by the [`UploadRequest`](crate::UploadRequest)
/// extractor, or pass directly to [`process_request`](crate::process_request).
#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub(crate) max_field_size: usize,
    pub(crate) max_file_size: Option<u64>,
    pub(crate) max_files: Option<usize>,
    pub(crate) memory_limit: usize,
    pub(crate) directory: Option<PathBuf>,
}

impl UploadConfig {
    /// Sets the maximum accepted size of the `operations` and `map` field values. By default this
    /// limit is 1MB.
    pub fn max_field_size(mut self, max_field_size: usize) -> Self {
        self.max_field_size = max_field_size;
        self
    }

    /// Sets the maximum accepted size of each uploaded file. Unbounded by default.
    ///
    /// Exceeding the limit truncates the affected file and errors its readers without failing the
    /// rest of the request.
    pub fn max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = Some(max_file_size);
        self
    }

    /// Sets the maximum number of entries the `map` field may declare. Unbounded by default.
    pub fn max_files(mut self, max_files: usize) -> Self {
        self.max_files = Some(max_files);
        self
    }

    /// Sets the number of bytes of each file buffered in memory before spilling to a temporary
    /// file on disk. By default this limit is 2MiB.
    pub fn memory_limit(mut self, memory_limit: usize) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    /// Sets the directory that spill files will be created in.
    ///
    /// The default temporary file location is platform dependent.
    pub fn directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.directory = Some(dir.as_ref().to_owned());
        self
    }

    /// Extracts upload config from app data. Check both `T` and `Data<T>`, in that order, and fall
    /// back to the default config.
    pub(crate) fn from_req(req: &HttpRequest) -> &Self {
        req.app_data::<Self>()
            .or_else(|| req.app_data::<web::Data<Self>>().map(|d| d.as_ref()))
            .unwrap_or(&DEFAULT_CONFIG)
    }
}

const DEFAULT_CONFIG: UploadConfig = UploadConfig {
    max_field_size: 1_000_000,
    max_file_size: None,
    max_files: None,
    memory_limit: 2_097_152, // 2 MiB
    directory: None,
};

impl Default for UploadConfig {
    fn default() -> Self {
        DEFAULT_CONFIG
    }
}
