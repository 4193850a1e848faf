//! Upload extractor for `multipart/form-data` requests.

use std::{future::ready, str};

use actix_multipart::{Field, Multipart};
use actix_web::{dev, web::BytesMut, Error, FromRequest, HttpMessage as _, HttpRequest};
use derive_more::{Deref, DerefMut};
use futures_core::future::LocalBoxFuture;
use futures_util::TryStreamExt as _;
use log::{debug, warn};
use tokio::io::AsyncWriteExt as _;

use crate::{
    body::{DecodedRequestBody, RawUpload},
    config::{UploadErrorHandler, UploadFormatConfig},
    error::UploadError,
    file::UploadedFile,
    format::{Format as _, UploadFormat},
};

/// Validated `multipart/form-data` upload extractor.
///
/// File parts are staged in temporary files and text parts are read into memory, then everything
/// goes through [`UploadFormat`] validation. Field names ending in `[]` collect every part sent
/// under that name.
///
/// Note that this extractor rejects requests with any other Content-Type such as `multipart/mixed`,
/// `multipart/related`, or non-multipart media types.
///
/// Add an [`UploadFormatConfig`] to your app data to configure extraction.
///
/// # Examples
/// ```
/// use actix_web::{post, HttpResponse, Responder};
/// use restler_upload::{UploadForm, UploadedFileSet};
///
/// #[post("/avatar")]
/// async fn upload_avatar(form: UploadForm) -> impl Responder {
///     match form.file("avatar") {
///         Some(UploadedFileSet::Single(file)) if !file.error => {
///             HttpResponse::Ok().body(format!("stored {} bytes", file.size))
///         }
///         _ => HttpResponse::BadRequest().finish(),
///     }
/// }
/// ```
#[derive(Debug, Deref, DerefMut)]
pub struct UploadForm(pub DecodedRequestBody);

impl UploadForm {
    /// Unwrap into inner `DecodedRequestBody` value.
    pub fn into_inner(self) -> DecodedRequestBody {
        self.0
    }
}

impl FromRequest for UploadForm {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    #[inline]
    fn from_request(req: &HttpRequest, payload: &mut dev::Payload) -> Self::Future {
        let config = UploadFormatConfig::from_req(req).clone();
        let err_handler = config.err_handler();

        let is_form_data = matches!(
            req.mime_type(),
            Ok(Some(ref mt)) if mt.type_() == mime::MULTIPART && mt.subtype() == mime::FORM_DATA
        );

        if !is_form_data {
            let err = map_error(&err_handler, req, UploadError::ContentType);
            return Box::pin(ready(Err(err)));
        }

        let multipart = Multipart::new(req.headers(), payload.take());
        let req = req.clone();

        Box::pin(async move {
            let upload = read_upload(&config, multipart).await;
            let decoded = upload.and_then(|upload| UploadFormat::new(config).decode(upload));

            decoded
                .map(UploadForm)
                .map_err(|err| map_error(&err_handler, &req, err))
        })
    }
}

fn map_error(err_handler: &UploadErrorHandler, req: &HttpRequest, err: UploadError) -> Error {
    if let Some(ref err_handler) = err_handler {
        (err_handler)(err, req)
    } else {
        err.into()
    }
}

/// Used to keep track of the remaining limits for the form.
struct Limits {
    total_limit: usize,
    total_limit_remaining: usize,
    memory_limit: usize,
    memory_limit_remaining: usize,
}

impl Limits {
    fn new(total_limit: usize, memory_limit: usize) -> Self {
        Self {
            total_limit,
            total_limit_remaining: total_limit,
            memory_limit,
            memory_limit_remaining: memory_limit,
        }
    }

    /// Should be called when reading each chunk of a field to ensure that the form limits are not
    /// exceeded.
    fn try_consume_limits(&mut self, bytes: usize, in_memory: bool) -> Result<(), UploadError> {
        self.total_limit_remaining = self
            .total_limit_remaining
            .checked_sub(bytes)
            .ok_or(UploadError::Overflow {
                limit: self.total_limit,
            })?;

        if in_memory {
            self.memory_limit_remaining = self
                .memory_limit_remaining
                .checked_sub(bytes)
                .ok_or(UploadError::Overflow {
                    limit: self.memory_limit,
                })?;
        }

        Ok(())
    }
}

/// Reads every part of the stream into raw files and form fields.
async fn read_upload(
    config: &UploadFormatConfig,
    mut multipart: Multipart,
) -> Result<RawUpload, UploadError> {
    let (total_limit, memory_limit) = config.limits();
    let mut limits = Limits::new(total_limit, memory_limit);
    let mut upload = RawUpload::default();

    while let Some(mut field) = multipart.try_next().await? {
        let Some(field_name) = field.name().map(ToOwned::to_owned) else {
            debug!("skipping multipart field without a name");
            drain(&mut field, &mut limits).await?;
            continue;
        };

        let (name, is_array) = match field_name.strip_suffix("[]") {
            Some(name) => (name.to_owned(), true),
            None => (field_name.clone(), false),
        };

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(ToOwned::to_owned);

        match filename {
            Some(filename) => {
                let file = read_file(config, &mut field, filename, &mut limits).await?;
                upload.files.push(name, is_array, file);
            }

            None => {
                let value = read_text(&field_name, &mut field, &mut limits).await?;
                upload.fields.push(name, is_array, value);
            }
        }
    }

    Ok(upload)
}

/// Stages a file part on disk.
///
/// Parts over the server file limit are drained and flagged instead of staged.
async fn read_file(
    config: &UploadFormatConfig,
    field: &mut Field,
    name: String,
    limits: &mut Limits,
) -> Result<UploadedFile, UploadError> {
    if name.is_empty() {
        let field_name = field.name().unwrap_or_default();
        debug!("file input `{field_name}` submitted without a file");
        drain(field, limits).await?;
        return Ok(UploadedFile::no_file());
    }

    // https://datatracker.ietf.org/doc/html/rfc7578#section-4.4
    let content_type = field
        .content_type()
        .map_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string(), ToString::to_string);

    let file_limit = config.file_limit();
    let tmp = config.create_tempfile()?;
    let mut file_async = tokio::fs::File::from_std(tmp.reopen()?);

    let mut size = 0u64;
    let mut exceeded = false;

    while let Some(chunk) = field.try_next().await? {
        limits.try_consume_limits(chunk.len(), false)?;
        size += chunk.len() as u64;

        if size > file_limit {
            exceeded = true;
            continue;
        }

        file_async.write_all(chunk.as_ref()).await?;
    }

    if exceeded {
        warn!("uploaded file {name:?} exceeds the server file limit ({file_limit} bytes)");

        return Ok(UploadedFile {
            name,
            content_type,
            ..UploadedFile::no_file()
        });
    }

    file_async.flush().await?;

    Ok(UploadedFile::new(name, content_type, size).with_temp_path(tmp.into_temp_path()))
}

async fn read_text(
    field_name: &str,
    field: &mut Field,
    limits: &mut Limits,
) -> Result<String, UploadError> {
    let mut buf = BytesMut::new();

    while let Some(chunk) = field.try_next().await? {
        limits.try_consume_limits(chunk.len(), true)?;
        buf.extend_from_slice(&chunk);
    }

    str::from_utf8(&buf)
        .map(ToOwned::to_owned)
        .map_err(|source| UploadError::Utf8 {
            field: field_name.to_owned(),
            source,
        })
}

async fn drain(field: &mut Field, limits: &mut Limits) -> Result<(), UploadError> {
    while let Some(chunk) = field.try_next().await? {
        limits.try_consume_limits(chunk.len(), false)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use actix_web::{
        error::InternalError,
        http::{
            header::{self, HeaderMap},
            StatusCode,
        },
        test::TestRequest,
        web::Bytes,
        HttpResponse,
    };
    use assert_matches::assert_matches;

    use super::*;
    use crate::{body::FieldValue, file::UploadedFileSet, test::FormDataBuilder};

    fn parts(
        (body, headers): (Bytes, HeaderMap),
        config: UploadFormatConfig,
    ) -> (HttpRequest, dev::Payload) {
        headers
            .into_iter()
            .fold(TestRequest::post(), |req, hdr| req.insert_header(hdr))
            .app_data(config)
            .set_payload(body)
            .to_http_parts()
    }

    async fn extract(
        form: FormDataBuilder,
        config: UploadFormatConfig,
    ) -> Result<UploadForm, Error> {
        let (req, mut pl) = parts(form.build(), config);
        UploadForm::from_request(&req, &mut pl).await
    }

    fn png_config() -> UploadFormatConfig {
        UploadFormatConfig::default()
            .allowed_mime_types(["image/png"])
            .maximum_file_size(1024)
    }

    fn status(err: Error) -> StatusCode {
        err.error_response().status()
    }

    #[actix_rt::test]
    async fn stages_files_and_reads_fields() {
        let form = FormDataBuilder::new()
            .text("title", "holiday")
            .file(
                "avatar",
                "a.png",
                Some(mime::IMAGE_PNG),
                Bytes::from_static(b"not really a png"),
            );

        let form = extract(form, png_config()).await.unwrap();
        assert_eq!(form.text("title"), Some("holiday"));

        let file = assert_matches!(
            form.file("avatar"),
            Some(UploadedFileSet::Single(file)) => file
        );
        assert_eq!(file.name, "a.png");
        assert_eq!(file.content_type, "image/png");
        assert_eq!(file.size, 16);
        assert!(!file.error);

        let mut contents = String::new();
        std::fs::File::open(file.path().unwrap())
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "not really a png");
    }

    #[actix_rt::test]
    async fn array_names_accumulate() {
        let form = FormDataBuilder::new()
            .text("tags[]", "sea")
            .text("tags[]", "sun")
            .text("title", "first")
            .text("title", "second")
            .file("photos[]", "a.png", Some(mime::IMAGE_PNG), "aaa")
            .file("photos[]", "b.png", Some(mime::IMAGE_PNG), "bbbb");

        let form = extract(form, png_config()).await.unwrap();

        assert_eq!(
            form.field("tags"),
            Some(&FieldValue::List(vec!["sea".to_owned(), "sun".to_owned()]))
        );
        assert_eq!(form.text("title"), Some("second"));

        let photos = form.file("photos").unwrap();
        let sizes = photos.files().map(|file| file.size).collect::<Vec<_>>();
        assert_eq!(sizes, [3, 4]);
    }

    #[actix_rt::test]
    async fn rejects_unsupported_type() {
        let form = FormDataBuilder::new().file("avatar", "a.gif", Some(mime::IMAGE_GIF), "GIF89a");

        let err = extract(form, png_config()).await.unwrap_err();
        assert_eq!(status(err), StatusCode::FORBIDDEN);
    }

    #[actix_rt::test]
    async fn missing_content_type_defaults_to_octet_stream() {
        let form = FormDataBuilder::new().file("blob", "data.bin", None, "1234");

        let form = extract(form, UploadFormatConfig::default()).await.unwrap();
        let file = form.file("blob").unwrap().files().next().unwrap();
        assert_eq!(file.content_type, "application/octet-stream");
    }

    #[actix_rt::test]
    async fn server_file_limit_flags_file() {
        let config = png_config().server_file_limit(4);
        let form = || {
            FormDataBuilder::new().file("avatar", "a.png", Some(mime::IMAGE_PNG), "12345")
        };

        let err = extract(form(), config.clone()).await.unwrap_err();
        assert_eq!(status(err), StatusCode::PAYLOAD_TOO_LARGE);

        let config = config.suppress_failures_as_file_error(true);
        let form = extract(form(), config).await.unwrap();

        let file = form.file("avatar").unwrap().files().next().unwrap();
        assert!(file.error);
        assert_eq!(file.size, 0);
        assert!(file.path().is_none());
        assert_eq!(
            file.failure.as_ref().map(ToString::to_string).as_deref(),
            Some("Uploaded file (a.png) is too big.")
        );
    }

    #[actix_rt::test]
    async fn total_limit() {
        let config = UploadFormatConfig::default().total_limit(10);

        let form = FormDataBuilder::new().text("field", "7 bytes");
        extract(form, config.clone()).await.unwrap();

        let form =
            FormDataBuilder::new().file("file", "a.txt", None, "this string is 28 bytes long");
        let err = extract(form, config).await.unwrap_err();
        assert_eq!(status(err), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[actix_rt::test]
    async fn memory_limit_applies_to_text_only() {
        let config = UploadFormatConfig::default().memory_limit(10);

        let form = FormDataBuilder::new().text("field", "this string is 28 bytes long");
        let err = extract(form, config.clone()).await.unwrap_err();
        assert_eq!(status(err), StatusCode::PAYLOAD_TOO_LARGE);

        let form =
            FormDataBuilder::new().file("file", "a.txt", None, "this string is 28 bytes long");
        extract(form, config).await.unwrap();
    }

    #[actix_rt::test]
    async fn invalid_utf8_text() {
        let form =
            FormDataBuilder::new().part("field", None, None, Bytes::from_static(b"\xff\xfe"));

        let err = extract(form, UploadFormatConfig::default()).await.unwrap_err();
        assert_eq!(status(err), StatusCode::BAD_REQUEST);
    }

    #[actix_rt::test]
    async fn empty_file_rejected_by_default_rule() {
        let form = FormDataBuilder::new().file("file", "empty.txt", None, Bytes::new());

        let err = extract(form, UploadFormatConfig::default()).await.unwrap_err();
        assert_eq!(status(err), StatusCode::BAD_REQUEST);
    }

    #[actix_rt::test]
    async fn non_multipart_form_data() {
        let (body, mut headers) = FormDataBuilder::new().text("foo", "foo").build();

        // mangle content-type, keeping the boundary
        let ct = headers
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .replacen("/form-data", "/mixed", 1);
        headers.insert(header::CONTENT_TYPE, ct.parse().unwrap());

        let (req, mut pl) = parts((body, headers), UploadFormatConfig::default());
        let err = UploadForm::from_request(&req, &mut pl).await.unwrap_err();
        assert_eq!(status(err), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let (req, mut pl) = TestRequest::post()
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload("{}")
            .to_http_parts();
        let err = UploadForm::from_request(&req, &mut pl).await.unwrap_err();
        assert_eq!(status(err), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[actix_rt::test]
    async fn custom_error_handler() {
        let config = png_config().error_handler(|err, _req| {
            let message = err.to_string();
            InternalError::from_response(err, HttpResponse::Conflict().body(message)).into()
        });

        let form = FormDataBuilder::new().file("avatar", "a.gif", Some(mime::IMAGE_GIF), "GIF89a");
        let err = extract(form, config).await.unwrap_err();
        assert_eq!(status(err), StatusCode::CONFLICT);
    }
}
