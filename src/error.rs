//! Error and Result module

use std::{io, str::Utf8Error};

use actix_multipart::MultipartError;
use actix_web::{http::StatusCode, ResponseError};
use derive_more::{Display, Error, From};
use serde::ser::{Serialize, SerializeStruct as _, Serializer};

use crate::rules::RuleFailure;

/// A validation failure for a single uploaded file.
///
/// Failures are either propagated as [`UploadError::File`] or, in suppression mode, attached to
/// the offending file record.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[non_exhaustive]
pub enum FileFailure {
    /// The server flagged the upload, or its size exceeds the configured maximum.
    #[display("Uploaded file ({name}) is too big.")]
    TooBig { name: String },

    /// The declared MIME type is not in the allow-list.
    #[display("File type ({content_type}) is not supported.")]
    UnsupportedType { content_type: String },

    /// The custom validator rejected the file.
    #[display("File ({name}) is not supported.")]
    Rejected { name: String },

    /// The custom validator raised its own failure.
    #[display("{message}")]
    Custom { status: StatusCode, message: String },
}

impl FileFailure {
    /// Creates a failure with its own status and message, for use by custom validators.
    pub fn custom(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Custom {
            status,
            message: message.into(),
        }
    }
}

impl ResponseError for FileFailure {
    fn status_code(&self) -> StatusCode {
        match self {
            FileFailure::TooBig { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            FileFailure::UnsupportedType { .. } | FileFailure::Rejected { .. } => {
                StatusCode::FORBIDDEN
            }
            FileFailure::Custom { status, .. } => *status,
        }
    }
}

impl Serialize for FileFailure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("FileFailure", 2)?;
        state.serialize_field("status", &self.status_code().as_u16())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// A set of errors that can occur while collecting and decoding an upload.
#[derive(Debug, Display, Error, From)]
#[non_exhaustive]
pub enum UploadError {
    /// A file failed validation.
    #[display("{_0}")]
    #[from]
    File(FileFailure),

    /// The empty-file rule failed before any file was checked.
    #[display("{_0}")]
    #[from]
    Rule(RuleFailure),

    /// Encoding was attempted through the decode-only upload format.
    #[display("UploadFormat is read only")]
    ReadOnly,

    /// Request content type is not `multipart/form-data`.
    #[display("Content type error")]
    ContentType,

    /// The whole multipart payload is larger than the configured total limit.
    #[display("Multipart payload is larger than allowed (limit: {limit} bytes)")]
    Overflow { limit: usize },

    /// The multipart stream could not be parsed.
    #[display("{_0}")]
    #[from]
    Multipart(MultipartError),

    /// A text field is not valid UTF-8.
    #[display("Field `{field}` is not valid UTF-8: {source}")]
    Utf8 { field: String, source: Utf8Error },

    /// Staging a file on disk failed.
    #[display("File I/O error: {_0}")]
    #[from]
    Io(io::Error),
}

impl ResponseError for UploadError {
    fn status_code(&self) -> StatusCode {
        match self {
            UploadError::File(failure) => failure.status_code(),
            UploadError::Rule(failure) => failure.status,
            UploadError::ReadOnly | UploadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::ContentType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            UploadError::Overflow { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::Multipart(err) => err.status_code(),
            UploadError::Utf8 { .. } => StatusCode::BAD_REQUEST,
        }
    }
}
