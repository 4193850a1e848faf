//! Uploaded file records and the raw shapes they arrive in.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    slice,
};

use derive_more::{Deref, DerefMut};
use serde::ser::{Serialize, SerializeStruct as _, Serializer};
use tempfile::TempPath;

use crate::error::FileFailure;

/// Normalized file fields, keyed by form field name.
pub type FileFields = BTreeMap<String, UploadedFileSet>;

/// A single file sent in the request.
#[derive(Debug, Default)]
pub struct UploadedFile {
    /// The `filename` value in the part's `content-disposition` header.
    pub name: String,

    /// The client-declared MIME type.
    pub content_type: String,

    /// The size in bytes of the file.
    pub size: u64,

    /// Set when the server reported a problem with the upload, or when a failure was attached.
    pub error: bool,

    /// Staged file on disk, deleted when the record is dropped.
    pub temp_path: Option<TempPath>,

    /// Failure attached in suppression mode.
    pub failure: Option<FileFailure>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            size,
            ..Self::default()
        }
    }

    /// A file input that was submitted without selecting a file.
    pub fn no_file() -> Self {
        Self {
            error: true,
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: bool) -> Self {
        self.error = error;
        self
    }

    pub fn with_temp_path(mut self, temp_path: TempPath) -> Self {
        self.temp_path = Some(temp_path);
        self
    }

    /// Location of the staged file, if one was written.
    pub fn path(&self) -> Option<&Path> {
        self.temp_path.as_deref()
    }

    /// Marks the file as failed and keeps the failure on the record.
    pub fn attach(&mut self, failure: FileFailure) {
        self.error = true;
        self.failure = Some(failure);
    }

    /// Moves the staged file to `new_path` so it outlives the request.
    ///
    /// On failure the staged file is kept on the record.
    pub fn persist(&mut self, new_path: impl AsRef<Path>) -> io::Result<PathBuf> {
        let temp_path = self.temp_path.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "uploaded file was not staged")
        })?;

        let new_path = new_path.as_ref();
        match temp_path.persist(new_path) {
            Ok(()) => Ok(new_path.to_owned()),
            Err(err) => {
                self.temp_path = Some(err.path);
                Err(err.error)
            }
        }
    }
}

impl Serialize for UploadedFile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("UploadedFile", 6)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("type", &self.content_type)?;
        state.serialize_field("size", &self.size)?;
        state.serialize_field("error", &self.error)?;
        state.serialize_field("tmp_name", &self.path())?;
        state.serialize_field("failure", &self.failure)?;
        state.end()
    }
}

/// Files submitted under one array-valued field name, in submission order.
#[derive(Debug, Default)]
pub struct UploadedFiles {
    pub files: Vec<UploadedFile>,

    /// Set when any file of the field failed in suppression mode.
    pub error: bool,

    /// The first failure found in the field.
    pub failure: Option<FileFailure>,
}

impl UploadedFiles {
    pub fn new(files: Vec<UploadedFile>) -> Self {
        Self {
            files,
            ..Self::default()
        }
    }
}

/// Either a single file or all files sharing an array-valued field name.
#[derive(Debug)]
pub enum UploadedFileSet {
    Single(UploadedFile),
    Multiple(UploadedFiles),
}

impl UploadedFileSet {
    pub fn files(&self) -> slice::Iter<'_, UploadedFile> {
        match self {
            UploadedFileSet::Single(file) => slice::from_ref(file).iter(),
            UploadedFileSet::Multiple(multi) => multi.files.iter(),
        }
    }

    pub fn error(&self) -> bool {
        match self {
            UploadedFileSet::Single(file) => file.error,
            UploadedFileSet::Multiple(multi) => multi.error,
        }
    }

    pub fn failure(&self) -> Option<&FileFailure> {
        match self {
            UploadedFileSet::Single(file) => file.failure.as_ref(),
            UploadedFileSet::Multiple(multi) => multi.failure.as_ref(),
        }
    }
}

/// A multi-file field is rendered as an array of its files.
///
/// The field-level `error` and `failure` of a multi-file field are not part of the rendering; the
/// failing record carries the same failure. Use [`UploadedFileSet::error`] and
/// [`UploadedFileSet::failure`] to read the field-level marker.
impl Serialize for UploadedFileSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            UploadedFileSet::Single(file) => file.serialize(serializer),
            UploadedFileSet::Multiple(multi) => serializer.collect_seq(&multi.files),
        }
    }
}

/// Multi-file field delivered as one array per property, indexed in parallel.
///
/// Arrays of unequal length are truncated to the shortest one.
#[derive(Debug, Default)]
pub struct ParallelFiles {
    pub name: Vec<String>,
    pub content_type: Vec<String>,
    pub size: Vec<u64>,
    pub error: Vec<bool>,
    pub temp_path: Vec<Option<TempPath>>,
}

impl ParallelFiles {
    /// Rebuilds one record per index.
    pub fn into_files(self) -> Vec<UploadedFile> {
        self.name
            .into_iter()
            .zip(self.content_type)
            .zip(self.size)
            .zip(self.error)
            .zip(self.temp_path)
            .map(
                |((((name, content_type), size), error), temp_path)| UploadedFile {
                    name,
                    content_type,
                    size,
                    error,
                    temp_path,
                    failure: None,
                },
            )
            .collect()
    }
}

/// A file field as handed over by the transport, before normalization.
#[derive(Debug)]
pub enum RawFileField {
    Single(UploadedFile),
    Records(Vec<UploadedFile>),
    Parallel(ParallelFiles),
}

impl From<UploadedFile> for RawFileField {
    fn from(file: UploadedFile) -> Self {
        RawFileField::Single(file)
    }
}

impl From<Vec<UploadedFile>> for RawFileField {
    fn from(files: Vec<UploadedFile>) -> Self {
        RawFileField::Records(files)
    }
}

impl From<ParallelFiles> for RawFileField {
    fn from(files: ParallelFiles) -> Self {
        RawFileField::Parallel(files)
    }
}

impl From<RawFileField> for UploadedFileSet {
    fn from(raw: RawFileField) -> Self {
        match raw {
            RawFileField::Single(file) => UploadedFileSet::Single(file),
            RawFileField::Records(files) => UploadedFileSet::Multiple(UploadedFiles::new(files)),
            RawFileField::Parallel(files) => {
                UploadedFileSet::Multiple(UploadedFiles::new(files.into_files()))
            }
        }
    }
}

/// Raw file fields of one request, keyed by form field name.
#[derive(Debug, Default, Deref, DerefMut)]
pub struct RawFiles(pub BTreeMap<String, RawFileField>);

impl RawFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file under `name`.
    ///
    /// Array-valued names accumulate; otherwise a repeated name replaces the earlier file.
    pub fn push(&mut self, name: String, is_array: bool, file: UploadedFile) {
        if !is_array {
            self.0.insert(name, RawFileField::Single(file));
            return;
        }

        match self.0.get_mut(&name) {
            Some(RawFileField::Records(files)) => files.push(file),
            _ => {
                self.0.insert(name, RawFileField::Records(vec![file]));
            }
        }
    }

    /// Converts every field into per-file records.
    pub fn normalize(self) -> FileFields {
        self.0
            .into_iter()
            .map(|(name, raw)| (name, UploadedFileSet::from(raw)))
            .collect()
    }
}

impl FromIterator<(String, RawFileField)> for RawFiles {
    fn from_iter<I: IntoIterator<Item = (String, RawFileField)>>(iter: I) -> Self {
        RawFiles(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn parallel_arrays_normalize_in_index_order() {
        let parallel = ParallelFiles {
            name: vec!["a.png".to_owned(), "".to_owned(), "c.gif".to_owned()],
            content_type: vec![
                "image/png".to_owned(),
                "".to_owned(),
                "image/gif".to_owned(),
            ],
            size: vec![10, 0, 30],
            error: vec![false, true, false],
            temp_path: vec![None, None, None],
        };

        let set = UploadedFileSet::from(RawFileField::from(parallel));
        let files = set.files().collect::<Vec<_>>();
        assert_eq!(files.len(), 3);

        assert_eq!(files[0].name, "a.png");
        assert_eq!(files[0].content_type, "image/png");
        assert_eq!(files[0].size, 10);
        assert!(!files[0].error);

        assert_eq!(files[1].name, "");
        assert!(files[1].error);

        assert_eq!(files[2].name, "c.gif");
        assert_eq!(files[2].size, 30);
        assert!(!set.error());
        assert!(set.failure().is_none());
    }

    #[test]
    fn parallel_arrays_truncate_to_shortest() {
        let parallel = ParallelFiles {
            name: vec!["a".to_owned(), "b".to_owned()],
            content_type: vec!["text/plain".to_owned(), "text/plain".to_owned()],
            size: vec![1],
            error: vec![false, false],
            temp_path: vec![None, None],
        };

        assert_eq!(parallel.into_files().len(), 1);
    }

    #[test]
    fn raw_files_push() {
        let mut raw = RawFiles::new();
        raw.push("avatar".to_owned(), false, UploadedFile::new("a.png", "image/png", 1));
        raw.push("avatar".to_owned(), false, UploadedFile::new("b.png", "image/png", 2));
        raw.push("docs".to_owned(), true, UploadedFile::new("a.txt", "text/plain", 3));
        raw.push("docs".to_owned(), true, UploadedFile::new("b.txt", "text/plain", 4));

        let files = raw.normalize();
        assert_matches::assert_matches!(
            &files["avatar"],
            UploadedFileSet::Single(file) if file.name == "b.png"
        );

        let names = files["docs"]
            .files()
            .map(|file| file.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["a.txt", "b.txt"]);
    }

    #[test]
    fn attach_marks_error() {
        let mut file = UploadedFile::new("a.png", "image/png", 1);
        file.attach(FileFailure::Rejected {
            name: "a.png".to_owned(),
        });
        assert!(file.error);
        assert_eq!(
            file.failure.as_ref().map(ToString::to_string).as_deref(),
            Some("File (a.png) is not supported.")
        );
    }

    #[test]
    fn persist_staged_file() {
        let dir = tempfile::tempdir().unwrap();

        let mut tmp = NamedTempFile::new_in(dir.path()).unwrap();
        tmp.write_all(b"Hello, world!").unwrap();

        let mut file =
            UploadedFile::new("hello.txt", "text/plain", 13).with_temp_path(tmp.into_temp_path());
        let dest = dir.path().join("hello.txt");

        let persisted = file.persist(&dest).unwrap();
        assert_eq!(persisted, dest);
        assert!(file.path().is_none());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "Hello, world!");

        let err = file.persist(dir.path().join("again.txt")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn serialize_as_form_entry() {
        let file = UploadedFile::new("a.png", "image/png", 500);
        assert_eq!(
            serde_json::to_value(&file).unwrap(),
            serde_json::json!({
                "name": "a.png",
                "type": "image/png",
                "size": 500,
                "error": false,
                "tmp_name": null,
                "failure": null,
            })
        );
    }

    #[test]
    fn multi_file_marker_stays_on_the_set() {
        let failure = FileFailure::Rejected {
            name: "b.png".to_owned(),
        };

        let mut failing = UploadedFile::new("b.png", "image/png", 2);
        failing.attach(failure.clone());

        let mut multi =
            UploadedFiles::new(vec![UploadedFile::new("a.png", "image/png", 1), failing]);
        multi.error = true;
        multi.failure = Some(failure.clone());
        let set = UploadedFileSet::Multiple(multi);

        assert!(set.error());
        assert_eq!(set.failure(), Some(&failure));

        let json = serde_json::to_value(&set).unwrap();
        let records = json.as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["error"], serde_json::json!(false));
        assert_eq!(records[1]["error"], serde_json::json!(true));
        assert_eq!(
            records[1]["failure"],
            serde_json::json!({ "status": 403, "message": "File (b.png) is not supported." })
        );
    }
}
