//! Validated `multipart/form-data` upload decoding for Actix Web.
//!
//! Uploaded files are checked against a MIME type allow-list, a size limit, and an optional custom
//! validator before the handler sees them. Files and plain form fields are merged into a single
//! [`DecodedRequestBody`].
//!
//! # Examples
//! ```no_run
//! use actix_web::{post, web, App, HttpResponse, HttpServer, Responder};
//! use restler_upload::{UploadForm, UploadFormatConfig};
//!
//! #[post("/photos")]
//! async fn upload(form: UploadForm) -> impl Responder {
//!     let count = form.file("photos").map_or(0, |set| set.files().count());
//!     HttpResponse::Ok().body(format!("{count} photo(s) uploaded"))
//! }
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     HttpServer::new(|| {
//!         App::new()
//!             .app_data(web::Data::new(
//!                 UploadFormatConfig::default()
//!                     .allowed_mime_types(["image/png", "image/jpeg"])
//!                     .maximum_file_size(1024 * 1024),
//!             ))
//!             .service(upload)
//!     })
//!     .bind(("127.0.0.1", 8080))?
//!     .run()
//!     .await
//! }
//! ```
//!
//! Without the extractor, [`UploadFormat`] decodes collections that were parsed elsewhere.

#![deny(rust_2018_idioms, nonstandard_style)]
#![warn(future_incompatible)]

mod body;
mod config;
mod error;
mod extractor;
mod file;
mod format;
mod rules;

pub use self::body::{DecodedRequestBody, FieldValue, FormFields, FormValue, RawUpload};
pub use self::config::UploadFormatConfig;
pub use self::error::{FileFailure, UploadError};
pub use self::extractor::UploadForm;
pub use self::file::{
    FileFields, ParallelFiles, RawFileField, RawFiles, UploadedFile, UploadedFileSet,
    UploadedFiles,
};
pub use self::format::{Format, UploadFormat};
pub use self::rules::{AllowEmptyFiles, EmptyFileRule, RejectEmptyFiles, RuleFailure};
