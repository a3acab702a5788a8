//! Streaming [GraphQL multipart request] support for Actix Web.
//!
//! A GraphQL multipart request carries an `operations` JSON field, a `map` field binding
//! multipart parts into positions of the operations graph, and then one part per uploaded file.
//! The [`UploadRequest`] extractor resolves as soon as `operations` and `map` have been parsed,
//! before the file parts have arrived: every mapped position holds a [`FileUpload`] placeholder
//! that settles once its part begins streaming, so request execution can start while uploads are
//! still in flight.
//!
//! File content is buffered in memory up to a configurable limit and spilled to a temporary file
//! beyond it, and can be re-read any number of times until the [`UploadRequest`] is dropped.
//!
//! # Examples
//!
//! ```no_run
//! use actix_graphql_upload::{UploadConfig, UploadRequest};
//! use actix_web::{post, App, HttpResponse, HttpServer};
//! use futures_util::TryStreamExt as _;
//!
//! #[post("/graphql")]
//! async fn graphql(request: UploadRequest) -> actix_web::Result<HttpResponse> {
//!     for (name, upload) in request.uploads() {
//!         let file = upload.file().await?;
//!
//!         let mut size = 0;
//!         let mut content = file.read_stream()?;
//!         while let Some(chunk) = content.try_next().await? {
//!             size += chunk.len();
//!         }
//!
//!         println!("{name}: {:?} ({size} bytes)", file.filename());
//!     }
//!
//!     Ok(HttpResponse::Ok().finish())
//! }
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     HttpServer::new(|| {
//!         App::new()
//!             .app_data(UploadConfig::default().max_files(10))
//!             .service(graphql)
//!     })
//!     .bind(("127.0.0.1", 8080))?
//!     .run()
//!     .await
//! }
//! ```
//!
//! [GraphQL multipart request]: https://github.com/jaydenseric/graphql-multipart-request-spec

#![deny(rust_2018_idioms, nonstandard_style)]
#![warn(future_incompatible)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod buffer;
mod config;
mod drain;
mod error;
mod extractor;
mod path;
mod request;
pub mod test;
mod upload;
mod value;

pub use crate::{
    buffer::FileStream,
    config::UploadConfig,
    error::UploadError,
    request::{process_request, UploadRequest},
    upload::{FileUpload, UploadedFile},
    value::OperationsValue,
};
