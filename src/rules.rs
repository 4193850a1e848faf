//! Pre-flight rules run over the whole file collection before any file is checked.

use actix_web::http::StatusCode;
use derive_more::{Display, Error};

use crate::file::{FileFields, UploadedFile, UploadedFileSet};

/// Outcome of a failed pre-flight rule: the status code and message to respond with.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[display("{message}")]
pub struct RuleFailure {
    pub status: StatusCode,
    pub message: String,
}

impl RuleFailure {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Detects empty file submissions.
///
/// The rule is run unconditionally on every decode, before MIME, size, and custom checks, and
/// its failure always aborts the request regardless of suppression mode.
///
/// Closures of the shape `Fn(&FileFields) -> Result<(), RuleFailure>` implement this trait.
pub trait EmptyFileRule: Send + Sync {
    fn check(&self, files: &FileFields) -> Result<(), RuleFailure>;
}

impl<F> EmptyFileRule for F
where
    F: Fn(&FileFields) -> Result<(), RuleFailure> + Send + Sync,
{
    fn check(&self, files: &FileFields) -> Result<(), RuleFailure> {
        (self)(files)
    }
}

/// Fails with `400 Bad Request` on the first named file that arrived intact but holds no bytes.
///
/// Files flagged by the server are left to the per-file checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectEmptyFiles;

impl EmptyFileRule for RejectEmptyFiles {
    fn check(&self, files: &FileFields) -> Result<(), RuleFailure> {
        let empty = files
            .values()
            .flat_map(UploadedFileSet::files)
            .find(|file| !file.name.is_empty() && !file.error && file.size == 0);

        match empty {
            Some(UploadedFile { name, .. }) => Err(RuleFailure::new(
                StatusCode::BAD_REQUEST,
                format!("The uploaded file ({name}) is empty."),
            )),
            None => Ok(()),
        }
    }
}

/// Accepts every file collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowEmptyFiles;

impl EmptyFileRule for AllowEmptyFiles {
    fn check(&self, _files: &FileFields) -> Result<(), RuleFailure> {
        Ok(())
    }
}
