//! Binds upload placeholders at dot-separated paths inside the operations tree.

use crate::{error::UploadError, upload::FileUpload, value::OperationsValue};

fn invalid(path: &str) -> UploadError {
    UploadError::InvalidPath {
        path: path.to_owned(),
    }
}

/// Replaces the value at `path` in `root` with an upload placeholder.
///
/// Paths are dot-separated object keys and array indices, e.g. `variables.files.0`. The final
/// segment may name a key missing from an object (it is inserted), but intermediate containers are
/// never created and arrays are never grown. Empty paths, traversal through non-containers,
/// non-numeric array segments, and out-of-range indices are all rejected.
pub(crate) fn bind(
    root: &mut OperationsValue,
    path: &str,
    upload: FileUpload,
) -> Result<(), UploadError> {
    if path.is_empty() {
        return Err(invalid(path));
    }

    let mut current = root;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            return Err(invalid(path));
        }

        let last = segments.peek().is_none();

        match current {
            OperationsValue::Object(map) => {
                if last {
                    map.insert(segment.to_owned(), OperationsValue::Upload(upload));
                    return Ok(());
                }

                current = map.get_mut(segment).ok_or_else(|| invalid(path))?;
            }

            OperationsValue::Array(items) => {
                let idx: usize = segment.parse().map_err(|_| invalid(path))?;

                if last {
                    let slot = items.get_mut(idx).ok_or_else(|| invalid(path))?;
                    *slot = OperationsValue::Upload(upload);
                    return Ok(());
                }

                current = items.get_mut(idx).ok_or_else(|| invalid(path))?;
            }

            _ => return Err(invalid(path)),
        }
    }

    // split('.') yields at least one segment for a non-empty path
    Err(invalid(path))
}

/// Resolves a dot-separated path to a reference into the tree.
pub(crate) fn resolve<'v>(root: &'v OperationsValue, path: &str) -> Option<&'v OperationsValue> {
    if path.is_empty() {
        return None;
    }

    let mut current = root;

    for segment in path.split('.') {
        current = match current {
            OperationsValue::Object(map) => map.get(segment)?,
            OperationsValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn tree(json: &str) -> OperationsValue {
        OperationsValue::from(serde_json::from_str::<serde_json::Value>(json).unwrap())
    }

    #[test]
    fn binds_nested_object_path() {
        let mut ops = tree(r#"{"variables":{"file":null}}"#);
        let upload = FileUpload::new();

        bind(&mut ops, "variables.file", upload.clone()).unwrap();

        assert_eq!(
            ops.get_path("variables.file").unwrap().as_upload(),
            Some(&upload),
        );
    }

    #[test]
    fn binds_array_index_path() {
        let mut ops = tree(r#"{"variables":{"files":[null,null]}}"#);

        bind(&mut ops, "variables.files.1", FileUpload::new()).unwrap();

        assert_matches!(
            ops.get_path("variables.files.0"),
            Some(OperationsValue::Null)
        );
        assert_matches!(
            ops.get_path("variables.files.1"),
            Some(OperationsValue::Upload(_))
        );
    }

    #[test]
    fn inserts_missing_final_key() {
        let mut ops = tree(r#"{"variables":{}}"#);

        bind(&mut ops, "variables.file", FileUpload::new()).unwrap();

        assert_matches!(
            ops.get_path("variables.file"),
            Some(OperationsValue::Upload(_))
        );
    }

    #[test]
    fn rejects_bad_paths() {
        let mut ops = tree(r#"{"variables":{"file":null,"files":[null]}}"#);

        for path in [
            "",
            "variables..file",
            "missing.file",
            "variables.file.nested",
            "variables.files.x",
            "variables.files.1",
            "variables.files.0.deep",
        ] {
            assert_matches!(
                bind(&mut ops, path, FileUpload::new()),
                Err(UploadError::InvalidPath { .. }),
                "path {path:?} should be rejected",
            );
        }
    }
}
