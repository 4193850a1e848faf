//! Form fields and the merged request body handed to handlers.

use std::collections::{btree_map::Entry, BTreeMap};

use derive_more::{Deref, DerefMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::file::{FileFields, RawFiles, UploadedFileSet};

/// A non-file form value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),

    /// Values submitted under an array-valued name, in submission order.
    List(Vec<String>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            FieldValue::List(_) => None,
        }
    }
}

/// Non-file form fields of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref, DerefMut)]
pub struct FormFields(pub BTreeMap<String, FieldValue>);

impl FormFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value under `name`.
    ///
    /// Array-valued names accumulate; otherwise a repeated name replaces the earlier value.
    pub fn push(&mut self, name: String, is_array: bool, value: String) {
        if !is_array {
            self.0.insert(name, FieldValue::Text(value));
            return;
        }

        match self.0.get_mut(&name) {
            Some(FieldValue::List(values)) => values.push(value),
            _ => {
                self.0.insert(name, FieldValue::List(vec![value]));
            }
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FormFields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        FormFields(
            iter.into_iter()
                .map(|(name, value)| (name.into(), FieldValue::Text(value.into())))
                .collect(),
        )
    }
}

/// Everything a `multipart/form-data` request submitted, before decoding.
#[derive(Debug, Default)]
pub struct RawUpload {
    pub files: RawFiles,
    pub fields: FormFields,
}

/// A value of the decoded body.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum FormValue {
    File(UploadedFileSet),
    Field(FieldValue),
}

/// Files and form fields of one request, keyed by field name.
#[derive(Debug, Default, Serialize, Deref, DerefMut)]
#[serde(transparent)]
pub struct DecodedRequestBody(BTreeMap<String, FormValue>);

impl DecodedRequestBody {
    /// Union of the file fields and the form fields.
    ///
    /// When a form field shares its name with a file field, the file entry is kept.
    pub fn merge(files: FileFields, fields: FormFields) -> Self {
        let mut body = files
            .into_iter()
            .map(|(name, set)| (name, FormValue::File(set)))
            .collect::<BTreeMap<_, _>>();

        for (name, value) in fields.0 {
            match body.entry(name) {
                Entry::Vacant(entry) => {
                    entry.insert(FormValue::Field(value));
                }
                Entry::Occupied(entry) => {
                    let name = entry.key();
                    log::debug!("form field `{name}` shadowed by file field");
                }
            }
        }

        DecodedRequestBody(body)
    }

    pub fn file(&self, name: &str) -> Option<&UploadedFileSet> {
        match self.0.get(name)? {
            FormValue::File(set) => Some(set),
            FormValue::Field(_) => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        match self.0.get(name)? {
            FormValue::Field(value) => Some(value),
            FormValue::File(_) => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.field(name)?.as_text()
    }

    /// Removes a file field from the body, e.g. to persist its files.
    pub fn take_file(&mut self, name: &str) -> Option<UploadedFileSet> {
        match self.0.remove(name)? {
            FormValue::File(set) => Some(set),
            value @ FormValue::Field(_) => {
                self.0.insert(name.to_owned(), value);
                None
            }
        }
    }

    pub fn into_inner(self) -> BTreeMap<String, FormValue> {
        self.0
    }

    /// Renders the body as JSON; files become `{name, type, size, error, tmp_name, failure}`.
    ///
    /// Multi-file fields render as arrays of records, so their field-level marker is only
    /// available through [`UploadedFileSet::error`] and [`UploadedFileSet::failure`].
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Binds the body to a typed parameter struct through its JSON rendering.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_json()?)
    }
}
