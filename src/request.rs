//! GraphQL multipart request processing.

use std::{cell::RefCell, cmp, collections::HashMap, fmt, rc::Rc};

use actix_multipart::{Field, Multipart, MultipartError};
use actix_web::{
    rt,
    web::{Bytes, BytesMut},
};
use futures_util::StreamExt as _;

use crate::{
    buffer::FileBuffer,
    config::UploadConfig,
    drain,
    error::UploadError,
    path,
    upload::{FileUpload, UploadedFile},
    value::OperationsValue,
};

/// State shared between the caller-facing [`UploadRequest`] and the background part driver.
struct Shared {
    /// First terminal error, sticky for the remainder of processing.
    error: Option<UploadError>,

    /// Multipart field name to placeholder, as declared by `map`.
    slots: HashMap<String, FileUpload>,

    /// Buffers allocated for file parts, released together when the request state is dropped.
    buffers: Vec<FileBuffer>,

    released: bool,
}

impl Shared {
    /// Records the terminal error and cascades it to every placeholder that has not received a
    /// file. No-op if a terminal error is already recorded.
    fn exit(&mut self, err: UploadError) {
        if self.error.is_some() {
            return;
        }

        self.error = Some(err.clone());

        for upload in self.slots.values() {
            if upload.try_file().is_none() {
                upload.reject(err.clone());
            }
        }
    }
}

/// A successfully parsed GraphQL multipart request.
///
/// Available as soon as the `operations` and `map` fields are validated and bound; file parts may
/// still be streaming in while the caller inspects the operations graph. Dropping this value (or
/// calling [`release()`](Self::release)) deletes every file buffer, so keep it alive until the
/// uploads have been consumed.
pub struct UploadRequest {
    operations: OperationsValue,
    uploads: HashMap<String, FileUpload>,
    shared: Rc<RefCell<Shared>>,
}

impl UploadRequest {
    /// The operations graph, with an upload placeholder at every path the `map` field declared.
    pub fn operations(&self) -> &OperationsValue {
        &self.operations
    }

    /// Mutable access to the operations graph.
    pub fn operations_mut(&mut self) -> &mut OperationsValue {
        &mut self.operations
    }

    /// Looks up the placeholder for a `map` key (the multipart field name of a file part).
    pub fn upload(&self, name: &str) -> Option<&FileUpload> {
        self.uploads.get(name)
    }

    /// Iterates over all declared `map` keys and their placeholders.
    pub fn uploads(&self) -> impl Iterator<Item = (&str, &FileUpload)> {
        self.uploads
            .iter()
            .map(|(name, upload)| (name.as_str(), upload))
    }

    /// Releases every file buffer: temp files are deleted and later
    /// [`read_stream`](UploadedFile::read_stream) calls fail. Idempotent; also runs on drop.
    pub fn release(&self) {
        let mut shared = self.shared.borrow_mut();

        if shared.released {
            return;
        }

        shared.released = true;

        let error = shared.error.clone();
        for buffer in &shared.buffers {
            buffer.release(error.clone());
        }
    }
}

impl Drop for UploadRequest {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadRequest")
            .field("operations", &self.operations)
            .field("uploads", &self.uploads)
            .finish()
    }
}

/// Processes a GraphQL multipart request body.
///
/// Resolves with the [`UploadRequest`] the moment the `map` field has been validated and every
/// placeholder bound into the operations graph; remaining file parts are consumed by a background
/// task on the current thread, settling each placeholder as its part arrives. Must be called from
/// within the Actix runtime.
///
/// # Errors
///
/// Rejects with errors that occur before the operations graph is complete: malformed or misordered
/// `operations`/`map` fields, exceeded field/count limits, and early disconnects. Errors after
/// that point are reported through the individual placeholders instead.
pub async fn process_request(
    mut multipart: Multipart,
    config: UploadConfig,
) -> Result<UploadRequest, UploadError> {
    // `operations` must come first. The yielded field stays local to this match arm: the
    // tokenizer refuses to advance while a previously yielded field is still alive, so each
    // field must be dropped before `multipart` is polled again.
    let bytes = match multipart.next().await {
        None => return Err(UploadError::MissingField("operations")),
        // the body ended cleanly before any field arrived
        Some(Err(MultipartError::Incomplete)) => {
            return Err(UploadError::MissingField("operations"));
        }
        Some(Err(err)) => return Err(UploadError::from_multipart(err)),
        Some(Ok(mut field)) => {
            if is_file_part(&field) {
                return Err(fail_early(multipart, Some(field), UploadError::MisorderedFiles));
            }

            if field.name() != Some("operations") {
                return Err(fail_early(
                    multipart,
                    Some(field),
                    UploadError::MisorderedOperations,
                ));
            }

            match collect_field(&mut field, "operations", config.max_field_size).await {
                Ok(bytes) => bytes,
                Err(err @ UploadError::FieldSizeExceeded { .. }) => {
                    return Err(fail_early(multipart, Some(field), err));
                }
                // the tokenizer itself failed; it must not be polled again
                Err(err) => return Err(err),
            }
        }
    };

    let json: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(json) => json,
        Err(err) => {
            return Err(fail_early(
                multipart,
                None,
                UploadError::InvalidJson {
                    field: "operations",
                    message: err.to_string(),
                },
            ));
        }
    };

    if !json.is_object() && !json.is_array() {
        return Err(fail_early(multipart, None, UploadError::InvalidOperationsType));
    }

    let mut operations = OperationsValue::from(json);

    // `map` must come second
    let bytes = match multipart.next().await {
        None => return Err(UploadError::MissingField("map")),
        Some(Err(MultipartError::Incomplete)) => {
            return Err(UploadError::MissingField("map"));
        }
        Some(Err(err)) => return Err(UploadError::from_multipart(err)),
        Some(Ok(mut field)) => {
            if is_file_part(&field) {
                return Err(fail_early(multipart, Some(field), UploadError::MisorderedFiles));
            }

            if field.name() != Some("map") {
                return Err(fail_early(multipart, Some(field), UploadError::MisorderedMap));
            }

            match collect_field(&mut field, "map", config.max_field_size).await {
                Ok(bytes) => bytes,
                Err(err @ UploadError::FieldSizeExceeded { .. }) => {
                    return Err(fail_early(multipart, Some(field), err));
                }
                Err(err) => return Err(err),
            }
        }
    };

    let uploads = match parse_map(&mut operations, &bytes, &config) {
        Ok(uploads) => uploads,
        Err(err) => return Err(fail_early(multipart, None, err)),
    };

    let shared = Rc::new(RefCell::new(Shared {
        error: None,
        slots: uploads.clone(),
        buffers: Vec::new(),
        released: false,
    }));

    // the operations graph is complete; file parts stream in the background from here
    rt::spawn(drive(multipart, Rc::clone(&shared), config));

    Ok(UploadRequest {
        operations,
        uploads,
        shared,
    })
}

/// Parses the `map` field and binds one placeholder per entry at every declared path.
///
/// The declared entry count is checked against the file limit before any placeholder is created.
/// On a later failure, placeholders created so far are rejected with the same error.
fn parse_map(
    operations: &mut OperationsValue,
    bytes: &[u8],
    config: &UploadConfig,
) -> Result<HashMap<String, FileUpload>, UploadError> {
    let json: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|err| UploadError::InvalidJson {
            field: "map",
            message: err.to_string(),
        })?;

    let serde_json::Value::Object(entries) = json else {
        return Err(UploadError::InvalidMapType);
    };

    if let Some(limit) = config.max_files {
        if entries.len() > limit {
            return Err(UploadError::FileCountExceeded {
                declared: entries.len(),
                limit,
            });
        }
    }

    let mut uploads = HashMap::with_capacity(entries.len());

    if let Err(err) = bind_entries(operations, entries, &mut uploads) {
        for upload in uploads.values() {
            upload.reject(err.clone());
        }
        return Err(err);
    }

    Ok(uploads)
}

fn bind_entries(
    operations: &mut OperationsValue,
    entries: serde_json::Map<String, serde_json::Value>,
    uploads: &mut HashMap<String, FileUpload>,
) -> Result<(), UploadError> {
    for (name, paths) in entries {
        let serde_json::Value::Array(paths) = paths else {
            return Err(UploadError::InvalidMapEntry { field: name });
        };

        let upload = FileUpload::new();
        // inserted before binding so a bind failure can still reject it
        uploads.insert(name.clone(), upload.clone());

        for path_str in paths {
            let serde_json::Value::String(path_str) = path_str else {
                return Err(UploadError::InvalidMapEntry { field: name });
            };

            path::bind(operations, &path_str, upload.clone())?;
        }
    }

    Ok(())
}

/// Consumes file parts after the operations graph has been handed to the caller.
async fn drive(mut multipart: Multipart, shared: Rc<RefCell<Shared>>, config: UploadConfig) {
    loop {
        match multipart.next().await {
            Some(Ok(mut field)) => {
                let discard = {
                    let shared = shared.borrow();
                    shared.error.is_some() || shared.released
                };

                if discard {
                    drain::field(&mut field).await;
                    continue;
                }

                if let PartOutcome::TokenizerFailed =
                    stream_part(&mut field, &shared, &config).await
                {
                    // the failure surfaced through the field; the tokenizer must not be polled
                    // again
                    return;
                }
            }

            Some(Err(err)) => {
                shared.borrow_mut().exit(UploadError::from_multipart(err));
                return;
            }

            None => break,
        }
    }

    // all parts consumed; placeholders that never got a file are rejected now
    let slots: Vec<(String, FileUpload)> = shared
        .borrow()
        .slots
        .iter()
        .map(|(name, upload)| (name.clone(), upload.clone()))
        .collect();

    for (name, upload) in slots {
        if upload.try_file().is_none() {
            upload.reject(UploadError::FileMissing(name));
        }
    }
}

enum PartOutcome {
    Consumed,
    TokenizerFailed,
}

/// Streams one file part into a fresh buffer, resolving its placeholder as soon as the first
/// bytes can arrive.
async fn stream_part(
    field: &mut Field,
    shared: &Rc<RefCell<Shared>>,
    config: &UploadConfig,
) -> PartOutcome {
    let Some(name) = field.name().map(ToOwned::to_owned) else {
        drain::field(field).await;
        return PartOutcome::Consumed;
    };

    // only file parts may settle a placeholder
    if !is_file_part(field) {
        log::debug!("discarding stray non-file multipart part `{name}`");
        drain::field(field).await;
        return PartOutcome::Consumed;
    }

    let upload = shared.borrow().slots.get(&name).cloned();

    let Some(upload) = upload else {
        // not declared in `map`; dropped without failing the request
        log::debug!("discarding extraneous multipart part `{name}`");
        drain::field(field).await;
        return PartOutcome::Consumed;
    };

    if upload.try_file().is_some() {
        log::debug!("discarding duplicate multipart part `{name}`");
        drain::field(field).await;
        return PartOutcome::Consumed;
    }

    let buffer = FileBuffer::new(config.memory_limit, config.directory.clone());
    shared.borrow_mut().buffers.push(buffer.clone());

    let file = UploadedFile::new(
        field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(ToOwned::to_owned),
        field.content_type().cloned(),
        transfer_encoding(field),
        buffer.clone(),
    );

    // consumers get the handle when content starts arriving, not when it completes
    upload.resolve(file);

    let mut size = 0u64;

    while let Some(chunk) = field.next().await {
        match chunk {
            Ok(chunk) => {
                size += chunk.len() as u64;

                if let Some(limit) = config.max_file_size {
                    if size > limit {
                        // truncates this file only; the rest of the request keeps going
                        buffer.fail(UploadError::FileSizeExceeded { field: name, limit });
                        drain::field(field).await;
                        return PartOutcome::Consumed;
                    }
                }

                if buffer.write(chunk).await.is_err() {
                    // failure already recorded on the buffer; this file is lost, the request
                    // is not
                    drain::field(field).await;
                    return PartOutcome::Consumed;
                }
            }

            Err(err) => {
                let err = UploadError::from_multipart(err);
                buffer.fail(err.clone());
                shared.borrow_mut().exit(err);
                return PartOutcome::TokenizerFailed;
            }
        }
    }

    if let Err(err) = buffer.finish().await {
        log::warn!("failed to flush upload buffer for `{name}`: {err}");
    }

    PartOutcome::Consumed
}

/// Records an early failure and schedules draining of the rest of the request on a later turn of
/// the event loop, so the unread body cannot stall the connection.
fn fail_early(multipart: Multipart, field: Option<Field>, err: UploadError) -> UploadError {
    rt::spawn(async move {
        if let Some(mut field) = field {
            drain::field(&mut field).await;
        }
        drain::multipart(multipart).await;
    });

    err
}

/// Collects a field's content, bounded by `limit`.
async fn collect_field(
    field: &mut Field,
    name: &'static str,
    limit: usize,
) -> Result<Bytes, UploadError> {
    const INITIAL_ALLOC_BYTES: usize = 2 * 1024;

    let mut buf = BytesMut::with_capacity(cmp::min(limit, INITIAL_ALLOC_BYTES));

    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(UploadError::from_multipart)?;

        if buf.len() + chunk.len() > limit {
            return Err(UploadError::FieldSizeExceeded { field: name, limit });
        }

        buf.extend_from_slice(&chunk);
    }

    Ok(buf.freeze())
}

fn is_file_part(field: &Field) -> bool {
    field
        .content_disposition()
        .is_some_and(|cd| cd.get_filename().is_some())
}

fn transfer_encoding(field: &Field) -> Option<String> {
    field
        .headers()
        .get("content-transfer-encoding")
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}
