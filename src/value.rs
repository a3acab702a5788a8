//! JSON-like operations tree with file upload leaves.

use std::collections::BTreeMap;

use serde_json::Number;

use crate::{path, upload::FileUpload};

/// The parsed `operations` field of a GraphQL multipart request.
///
/// Structurally this is plain JSON, except that positions declared by the `map` field hold an
/// [`Upload`](OperationsValue::Upload) placeholder instead of the `null` the client sent.
#[derive(Clone, Debug, PartialEq)]
pub enum OperationsValue {
    /// JSON `null`.
    Null,

    /// JSON boolean.
    Bool(bool),

    /// JSON number.
    Number(Number),

    /// JSON string.
    String(String),

    /// JSON array.
    Array(Vec<OperationsValue>),

    /// JSON object.
    Object(BTreeMap<String, OperationsValue>),

    /// A file upload placeholder bound by the `map` field.
    Upload(FileUpload),
}

impl OperationsValue {
    /// Returns the object representation, if this value is an object.
    pub fn as_object(&self) -> Option<&BTreeMap<String, OperationsValue>> {
        match self {
            OperationsValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the array representation, if this value is an array.
    pub fn as_array(&self) -> Option<&[OperationsValue]> {
        match self {
            OperationsValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the string representation, if this value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OperationsValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the upload placeholder, if this value is one.
    pub fn as_upload(&self) -> Option<&FileUpload> {
        match self {
            OperationsValue::Upload(upload) => Some(upload),
            _ => None,
        }
    }

    /// Looks up a key of an object value.
    pub fn get(&self, key: &str) -> Option<&OperationsValue> {
        self.as_object()?.get(key)
    }

    /// Resolves a dot-separated path (e.g. `variables.files.0`) against this value.
    pub fn get_path(&self, path: &str) -> Option<&OperationsValue> {
        path::resolve(self, path)
    }
}

impl From<serde_json::Value> for OperationsValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => OperationsValue::Null,
            serde_json::Value::Bool(b) => OperationsValue::Bool(b),
            serde_json::Value::Number(n) => OperationsValue::Number(n),
            serde_json::Value::String(s) => OperationsValue::String(s),
            serde_json::Value::Array(items) => {
                OperationsValue::Array(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => {
                OperationsValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_nested_json() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"query":"{ me }","variables":{"files":[null,1.5]}}"#).unwrap();
        let value = OperationsValue::from(json);

        assert_eq!(value.get("query").unwrap().as_str(), Some("{ me }"));
        assert_eq!(
            value.get_path("variables.files.0"),
            Some(&OperationsValue::Null),
        );
        assert!(matches!(
            value.get_path("variables.files.1"),
            Some(OperationsValue::Number(_)),
        ));
        assert_eq!(value.get_path("variables.files.2"), None);
    }
}
