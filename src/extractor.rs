//! Extractor glue for [`UploadRequest`].

use actix_multipart::Multipart;
use actix_web::{dev::Payload, Error, FromRequest, HttpMessage as _, HttpRequest};
use futures_core::future::LocalBoxFuture;

use crate::{
    config::UploadConfig,
    error::UploadError,
    request::{process_request, UploadRequest},
};

/// Extract a [`UploadRequest`] from a `multipart/form-data` request body.
///
/// Limits are taken from an [`UploadConfig`] in app data, falling back to defaults.
///
/// The extractor resolves once the operations graph is complete; file parts continue streaming
/// in the background while the handler runs. See [`process_request`] for the error behavior.
impl FromRequest for UploadRequest {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let mime_ok = req
            .mime_type()
            .ok()
            .flatten()
            .is_some_and(|mime| mime.type_() == mime::MULTIPART && mime.subtype() == mime::FORM_DATA);

        let config = UploadConfig::from_req(req).clone();
        let multipart = Multipart::new(req.headers(), payload.take());

        Box::pin(async move {
            if !mime_ok {
                return Err(UploadError::ContentTypeIncompatible.into());
            }

            Ok(process_request(multipart, config).await?)
        })
    }
}
