//! Upload validation and extraction settings.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::{Arc, Once},
};

use actix_web::{web, Error, HttpRequest};
use log::warn;
use tempfile::NamedTempFile;

use crate::{
    error::{FileFailure, UploadError},
    file::UploadedFile,
    rules::{EmptyFileRule, RejectEmptyFiles},
};

type CustomValidator = Arc<dyn Fn(&UploadedFile) -> Result<bool, FileFailure> + Send + Sync>;

pub(crate) type UploadErrorHandler =
    Option<Arc<dyn Fn(UploadError, &HttpRequest) -> Error + Send + Sync>>;

static REJECT_EMPTY_FILES: RejectEmptyFiles = RejectEmptyFiles;

/// Settings shared by every request that decodes an upload.
///
/// Built once at startup and read concurrently afterwards. Add it to app data (directly or wrapped
/// in [`web::Data`]) to have it picked up by the [`UploadForm`](crate::UploadForm) extractor.
#[derive(Clone)]
pub struct UploadFormatConfig {
    allowed_mime_types: Vec<String>,
    maximum_file_size: u64,
    custom_validator: Option<CustomValidator>,
    suppress_failures_as_file_error: bool,
    empty_file_rule: Option<Arc<dyn EmptyFileRule>>,
    total_limit: usize,
    memory_limit: usize,
    server_file_limit: u64,
    file_limits_checked: Option<Arc<Once>>,
    temp_dir: Option<PathBuf>,
    err_handler: UploadErrorHandler,
}

impl UploadFormatConfig {
    /// Sets the MIME types uploads may declare. An empty list allows every type.
    pub fn allowed_mime_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_mime_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the largest accepted file size in bytes. Zero disables the size check.
    ///
    /// This can only tighten the server file limit, never loosen it.
    pub fn maximum_file_size(mut self, size: u64) -> Self {
        self.maximum_file_size = size;
        self.file_limits_checked = Some(Arc::new(Once::new()));
        self
    }

    /// Sets a validator run after the built-in checks.
    ///
    /// Returning `Ok(false)` rejects the file with a 403. Returning `Err` rejects it with the
    /// validator's own failure, usually built with [`FileFailure::custom`].
    pub fn custom_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&UploadedFile) -> Result<bool, FileFailure> + Send + Sync + 'static,
    {
        self.custom_validator = Some(Arc::new(f));
        self
    }

    /// When enabled, a failing file is marked and kept instead of failing the request.
    pub fn suppress_failures_as_file_error(mut self, suppress: bool) -> Self {
        self.suppress_failures_as_file_error = suppress;
        self
    }

    /// Replaces the empty-file rule. By default [`RejectEmptyFiles`] is used.
    pub fn empty_file_rule<R>(mut self, rule: R) -> Self
    where
        R: EmptyFileRule + 'static,
    {
        self.empty_file_rule = Some(Arc::new(rule));
        self
    }

    /// Sets maximum accepted payload size for the entire form. By default this limit is 50MiB.
    pub fn total_limit(mut self, total_limit: usize) -> Self {
        self.total_limit = total_limit;
        self
    }

    /// Sets maximum accepted text field data that will be read into memory. By default this limit
    /// is 2MiB.
    pub fn memory_limit(mut self, memory_limit: usize) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    /// Sets the server's per-file limit. By default this limit is 8MiB.
    ///
    /// Files over this limit are not staged; they reach the decoder flagged with `error`.
    pub fn server_file_limit(mut self, limit: u64) -> Self {
        self.server_file_limit = limit;
        self.file_limits_checked = Some(Arc::new(Once::new()));
        self
    }

    /// Sets the directory that temp files will be created in.
    ///
    /// The default temporary file location is platform dependent.
    pub fn temp_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.temp_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Sets custom error handler.
    pub fn error_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(UploadError, &HttpRequest) -> Error + Send + Sync + 'static,
    {
        self.err_handler = Some(Arc::new(f));
        self
    }

    pub(crate) fn mime_types(&self) -> &[String] {
        &self.allowed_mime_types
    }

    pub(crate) fn max_file_size(&self) -> u64 {
        self.maximum_file_size
    }

    pub(crate) fn validator(&self) -> Option<&CustomValidator> {
        self.custom_validator.as_ref()
    }

    pub(crate) fn suppresses_failures(&self) -> bool {
        self.suppress_failures_as_file_error
    }

    pub(crate) fn rule(&self) -> &dyn EmptyFileRule {
        match self.empty_file_rule {
            Some(ref rule) => &**rule,
            None => &REJECT_EMPTY_FILES,
        }
    }

    pub(crate) fn limits(&self) -> (usize, usize) {
        (self.total_limit, self.memory_limit)
    }

    pub(crate) fn file_limit(&self) -> u64 {
        self.server_file_limit
    }

    /// Warns when the maximum file size can never be reached.
    ///
    /// Clones share the check, so it runs once per configured instance.
    pub(crate) fn check_file_limits(&self) {
        let Some(ref checked) = self.file_limits_checked else {
            return;
        };

        checked.call_once(|| {
            let (max, limit) = (self.maximum_file_size, self.server_file_limit);

            if max > limit {
                warn!(
                    "maximum file size ({max}) exceeds the server file limit ({limit}); \
                     the server limit applies"
                );
            }
        });
    }

    pub(crate) fn create_tempfile(&self) -> io::Result<NamedTempFile> {
        if let Some(ref dir) = self.temp_dir {
            NamedTempFile::new_in(dir)
        } else {
            NamedTempFile::new()
        }
    }

    pub(crate) fn err_handler(&self) -> UploadErrorHandler {
        self.err_handler.clone()
    }

    /// Extracts upload config from app data. Check both `T` and `Data<T>`, in that order, and fall
    /// back to the default upload config.
    pub(crate) fn from_req(req: &HttpRequest) -> &Self {
        req.app_data::<Self>()
            .or_else(|| req.app_data::<web::Data<Self>>().map(|d| d.as_ref()))
            .unwrap_or(&DEFAULT_CONFIG)
    }
}

static DEFAULT_CONFIG: UploadFormatConfig = UploadFormatConfig {
    allowed_mime_types: Vec::new(),
    maximum_file_size: 0,
    custom_validator: None,
    suppress_failures_as_file_error: false,
    empty_file_rule: None,
    total_limit: 52_428_800,      // 50 MiB
    memory_limit: 2_097_152,      // 2 MiB
    server_file_limit: 8_388_608, // 8 MiB
    file_limits_checked: None,
    temp_dir: None,
    err_handler: None,
};

impl Default for UploadFormatConfig {
    fn default() -> Self {
        DEFAULT_CONFIG.clone()
    }
}

impl fmt::Debug for UploadFormatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFormatConfig")
            .field("allowed_mime_types", &self.allowed_mime_types)
            .field("maximum_file_size", &self.maximum_file_size)
            .field("custom_validator", &self.custom_validator.is_some())
            .field(
                "suppress_failures_as_file_error",
                &self.suppress_failures_as_file_error,
            )
            .field("total_limit", &self.total_limit)
            .field("memory_limit", &self.memory_limit)
            .field("server_file_limit", &self.server_file_limit)
            .field("temp_dir", &self.temp_dir)
            .finish_non_exhaustive()
    }
}
