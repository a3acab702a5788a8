//! Discards multipart content without stalling the tokenizer.
//!
//! Parts the processor decides not to keep (extraneous files, anything after a terminal error)
//! must still be read to completion; merely dropping them would leave the transport blocked on
//! backpressure. Stream errors are swallowed here since a discarded part has nothing to report
//! them to.

use actix_multipart::{Field, Multipart};
use futures_util::StreamExt as _;

/// Consumes and discards the rest of a field's content.
pub(crate) async fn field(field: &mut Field) {
    while let Some(chunk) = field.next().await {
        if let Err(err) = chunk {
            log::debug!("ignoring error while draining multipart field: {err}");
            break;
        }
    }
}

/// Consumes and discards all remaining parts of a multipart stream.
pub(crate) async fn multipart(mut multipart: Multipart) {
    while let Some(item) = multipart.next().await {
        match item {
            Ok(mut part) => field(&mut part).await,
            Err(err) => {
                log::debug!("ignoring error while draining multipart stream: {err}");
                break;
            }
        }
    }
}
