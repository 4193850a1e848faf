//! The `multipart/form-data` request format.

use actix_web::web::Bytes;
use log::{debug, trace, warn};

use crate::{
    body::{DecodedRequestBody, RawUpload},
    config::UploadFormatConfig,
    error::{FileFailure, UploadError},
    file::{UploadedFile, UploadedFileSet},
};

/// A request/response body format a host framework can negotiate.
pub trait Format {
    /// What the host hands over for decoding.
    type Input;

    /// What decoding produces for the handler.
    type Output;

    type Error;

    /// The media type this format handles.
    fn mime(&self) -> &'static str;

    /// The URL extension this format is selected by.
    fn extension(&self) -> &'static str;

    fn is_readable(&self) -> bool {
        true
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn decode(&self, input: Self::Input) -> Result<Self::Output, Self::Error>;

    fn encode(
        &self,
        data: &serde_json::Value,
        human_readable: bool,
    ) -> Result<Bytes, Self::Error>;
}

/// Which of the optional built-in checks are active for a decode.
#[derive(Debug, Clone, Copy)]
struct Checks {
    mime: bool,
    size: bool,
}

/// Decode-only format for `multipart/form-data` uploads.
///
/// Validates every uploaded file against the configured allow-list, size limit, and custom
/// validator, then merges files and form fields into a [`DecodedRequestBody`].
#[derive(Debug, Clone, Default)]
pub struct UploadFormat {
    config: UploadFormatConfig,
}

impl UploadFormat {
    pub const MIME: &'static str = "multipart/form-data";
    pub const EXTENSION: &'static str = "post";

    pub fn new(config: UploadFormatConfig) -> Self {
        config.check_file_limits();
        Self { config }
    }

    pub fn config(&self) -> &UploadFormatConfig {
        &self.config
    }

    /// Runs the built-in checks and the custom validator against one file.
    fn check_file(&self, file: &UploadedFile, checks: Checks) -> Result<(), FileFailure> {
        let UploadedFile {
            name,
            content_type,
            size,
            ..
        } = file;
        trace!("checking uploaded file {name:?} ({content_type}, {size} bytes)");

        // the server flags uploads it could not store; assume the size limit was hit
        if file.error {
            return Err(FileFailure::TooBig {
                name: file.name.clone(),
            });
        }

        if checks.mime && !self.config.mime_types().contains(&file.content_type) {
            return Err(FileFailure::UnsupportedType {
                content_type: file.content_type.clone(),
            });
        }

        if checks.size && file.size > self.config.max_file_size() {
            return Err(FileFailure::TooBig {
                name: file.name.clone(),
            });
        }

        if let Some(validator) = self.config.validator() {
            if !validator(file)? {
                return Err(FileFailure::Rejected {
                    name: file.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Checks one file, attaching the failure in suppression mode.
    ///
    /// Returns the attached failure, if any.
    fn check_or_attach(
        &self,
        file: &mut UploadedFile,
        checks: Checks,
    ) -> Result<Option<FileFailure>, UploadError> {
        match self.check_file(file, checks) {
            Ok(()) => Ok(None),

            Err(failure) if self.config.suppresses_failures() => {
                warn!("suppressed upload failure: {failure}");
                file.attach(failure.clone());
                Ok(Some(failure))
            }

            Err(failure) => Err(failure.into()),
        }
    }
}

impl Format for UploadFormat {
    type Input = RawUpload;
    type Output = DecodedRequestBody;
    type Error = UploadError;

    fn mime(&self) -> &'static str {
        Self::MIME
    }

    fn extension(&self) -> &'static str {
        Self::EXTENSION
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn decode(&self, input: RawUpload) -> Result<DecodedRequestBody, UploadError> {
        let RawUpload { files, fields } = input;
        let mut files = files.normalize();

        self.config.rule().check(&files)?;

        let checks = Checks {
            mime: !self.config.mime_types().is_empty(),
            size: self.config.max_file_size() != 0,
        };

        for (field_name, set) in files.iter_mut() {
            match set {
                UploadedFileSet::Multiple(multi) => {
                    for file in multi.files.iter_mut() {
                        if file.name.is_empty() {
                            continue;
                        }

                        if let Some(failure) = self.check_or_attach(file, checks)? {
                            debug!("skipping remaining files of field `{field_name}`");
                            multi.error = true;
                            multi.failure = Some(failure);
                            break;
                        }
                    }
                }

                UploadedFileSet::Single(file) => {
                    if !file.name.is_empty() {
                        self.check_or_attach(file, checks)?;
                    }
                }
            }
        }

        debug!(
            "decoded upload with {} file field(s) and {} form field(s)",
            files.len(),
            fields.len()
        );

        Ok(DecodedRequestBody::merge(files, fields))
    }

    fn encode(
        &self,
        _data: &serde_json::Value,
        _human_readable: bool,
    ) -> Result<Bytes, UploadError> {
        Err(UploadError::ReadOnly)
    }
}
