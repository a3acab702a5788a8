//! GraphQL multipart request testing utilities.

use actix_web::{
    http::header::{self, HeaderMap},
    web::{BufMut as _, Bytes, BytesMut},
};
use mime::Mime;
use rand::distr::{Alphanumeric, SampleString as _};

const CRLF: &[u8] = b"\r\n";
const CRLF_CRLF: &[u8] = b"\r\n\r\n";
const HYPHENS: &[u8] = b"--";
const BOUNDARY_PREFIX: &str = "------------------------";

/// One part of a test request body.
#[derive(Debug, Clone)]
pub struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<Mime>,
    content: Bytes,
}

impl Part {
    /// A plain text field, e.g. `operations` or `map`.
    pub fn field(name: impl Into<String>, content: impl Into<Bytes>) -> Part {
        Part {
            name: name.into(),
            filename: None,
            content_type: None,
            content: content.into(),
        }
    }

    /// A file part carrying a filename in its Content-Disposition header.
    pub fn file(
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: Option<Mime>,
        content: impl Into<Bytes>,
    ) -> Part {
        Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type,
            content: content.into(),
        }
    }
}

/// Constructs a `multipart/form-data` payload from a sequence of parts.
///
/// Returned header map can be extended or merged with existing headers.
///
/// Multipart boundary used is a random alphanumeric string.
///
/// # Examples
///
/// ```
/// use actix_graphql_upload::test::{create_upload_payload_and_headers, Part};
/// use actix_web::web::Bytes;
///
/// let (body, headers) = create_upload_payload_and_headers(&[
///     Part::field("operations", r#"{"variables":{"file":null}}"#),
///     Part::field("map", r#"{"1":["variables.file"]}"#),
///     Part::file("1", "a.txt", Some(mime::TEXT_PLAIN), Bytes::from_static(b"a")),
/// ]);
///
/// assert!(headers
///     .get("content-type")
///     .unwrap()
///     .to_str()
///     .unwrap()
///     .starts_with("multipart/form-data; boundary=\""));
/// # let _ = body;
/// ```
pub fn create_upload_payload_and_headers(parts: &[Part]) -> (Bytes, HeaderMap) {
    let boundary = Alphanumeric.sample_string(&mut rand::rng(), 32);

    create_upload_payload_and_headers_with_boundary(&boundary, parts)
}

/// Constructs a `multipart/form-data` payload from a sequence of parts with a fixed boundary.
///
/// See [`create_upload_payload_and_headers`] for more details.
pub fn create_upload_payload_and_headers_with_boundary(
    boundary: &str,
    parts: &[Part],
) -> (Bytes, HeaderMap) {
    let mut buf = BytesMut::new();

    let boundary_str = [BOUNDARY_PREFIX, boundary].concat();
    let boundary = boundary_str.as_bytes();

    for part in parts {
        buf.put(HYPHENS);
        buf.put(boundary);
        buf.put(CRLF);

        buf.put(format!("Content-Disposition: form-data; name=\"{}\"", part.name).as_bytes());
        if let Some(filename) = &part.filename {
            buf.put(format!("; filename=\"{filename}\"").as_bytes());
        }
        if let Some(ct) = &part.content_type {
            buf.put(CRLF);
            buf.put(format!("Content-Type: {ct}").as_bytes());
        }

        buf.put(CRLF_CRLF);
        buf.put(part.content.clone());
        buf.put(CRLF);
    }

    buf.put(HYPHENS);
    buf.put(boundary);
    buf.put(HYPHENS);
    buf.put(CRLF);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary=\"{boundary_str}\"")
            .parse()
            .unwrap(),
    );

    (buf.freeze(), headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format() {
        let (pl, headers) = create_upload_payload_and_headers_with_boundary(
            "qWeRtYuIoP",
            &[
                Part::field("operations", "{}"),
                Part::file("1", "a.txt", Some(mime::TEXT_PLAIN), "alpha"),
            ],
        );

        assert_eq!(
            headers
                .get("content-type")
                .unwrap()
                .to_str()
                .unwrap()
                .parse::<Mime>()
                .unwrap()
                .get_param(mime::BOUNDARY)
                .unwrap()
                .as_str(),
            "------------------------qWeRtYuIoP",
        );

        assert_eq!(
            std::str::from_utf8(&pl).unwrap(),
            "--------------------------qWeRtYuIoP\r\n\
            Content-Disposition: form-data; name=\"operations\"\r\n\
            \r\n\
            {}\r\n\
            --------------------------qWeRtYuIoP\r\n\
            Content-Disposition: form-data; name=\"1\"; filename=\"a.txt\"\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            alpha\r\n\
            --------------------------qWeRtYuIoP--\r\n",
        );
    }
}
