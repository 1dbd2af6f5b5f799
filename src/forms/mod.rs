//! Form definitions known to the device
//!
//! A form row is keyed by an internal id. The form identifier is a business
//! key shared by every version of a form; the MD5 content hash identifies a
//! particular definition file.

mod registry;

pub use registry::FormRegistry;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Internal row id of a form
pub type FormId = i64;

/// A form definition known to the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Form {
    pub id: FormId,
    pub display_name: String,
    pub description: Option<String>,
    /// Business key, shared across versions
    pub form_identifier: String,
    pub version: Option<String>,
    /// MD5 of the definition file
    pub md5_hash: String,
    /// Registration time, epoch millis
    pub date: i64,
    pub form_file_path: PathBuf,
    pub form_media_path: PathBuf,
    pub cache_file_path: PathBuf,
    pub language: Option<String>,
    pub submission_uri: Option<String>,
    /// Base64 RSA key; present when submissions must be encrypted
    pub public_key: Option<String>,
    pub auto_send: Option<bool>,
    pub auto_delete: Option<bool>,
    pub last_detected_version_hash: Option<String>,
    pub deleted: bool,
}

impl Form {
    pub fn is_encrypted(&self) -> bool {
        self.public_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Whether sent instances of this form are deleted, falling back to the app setting
    pub fn should_auto_delete(&self, app_default: bool) -> bool {
        self.auto_delete.unwrap_or(app_default)
    }
}

/// Values supplied when registering a definition file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormMetadata {
    pub form_identifier: String,
    /// Defaults to the file name
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub submission_uri: Option<String>,
    pub public_key: Option<String>,
    pub language: Option<String>,
    pub auto_send: Option<bool>,
    pub auto_delete: Option<bool>,
    /// Defaults to now
    pub date: Option<i64>,
    /// Defaults to `<basename>-media` next to the definition
    pub media_path: Option<PathBuf>,
    /// Defaults to `<cache>/<md5>.formdef`
    pub cache_path: Option<PathBuf>,
}

impl FormMetadata {
    pub fn new(form_identifier: &str) -> Self {
        Self {
            form_identifier: form_identifier.to_string(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn with_display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    pub fn with_submission_uri(mut self, uri: &str) -> Self {
        self.submission_uri = Some(uri.to_string());
        self
    }

    pub fn with_date(mut self, date: i64) -> Self {
        self.date = Some(date);
        self
    }
}

/// Field changes for [`FormRegistry::update`]; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormUpdate {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub submission_uri: Option<String>,
    pub public_key: Option<String>,
    pub language: Option<String>,
    pub auto_send: Option<bool>,
    pub auto_delete: Option<bool>,
    pub last_detected_version_hash: Option<String>,
    /// Changing the definition file recomputes the hash and drops stale files
    pub form_file_path: Option<PathBuf>,
    pub form_media_path: Option<PathBuf>,
    pub cache_file_path: Option<PathBuf>,
}

impl FormUpdate {
    pub fn is_empty(&self) -> bool {
        *self == FormUpdate::default()
    }
}

/// Row selection for listing and bulk deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormFilter {
    All,
    /// Not soft-deleted
    Live,
    Deleted,
    Identifier(String),
    IdentifierAndVersion(String, Option<String>),
    Md5(String),
}
