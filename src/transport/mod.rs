//! OpenRosa-style HTTP transport
//!
//! This module handles:
//! - Fetching the server's form list, manifests, definitions and media
//! - Multipart submission uploads, split into several requests when large
//! - Credential handling, including the token URL rewrite

mod chunking;
mod client;
mod routing;

pub use chunking::{plan_chunks, ChunkLimits, RequestChunk, INCOMPLETE_PART};
pub use client::{HttpTransport, TransportConfig};
pub use routing::{RouteRule, TokenRouting};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Multipart part carrying the instance XML
pub const XML_SUBMISSION_PART: &str = "xml_submission_file";

/// Header carrying the submission status
pub const FORM_STATUS_HEADER: &str = "form_status";

/// Server credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    Basic { username: String, password: String },
    /// Sent as a bearer token; requests are routed through the token paths
    Token { token: String },
}

impl Credentials {
    pub fn basic(username: &str, password: &str) -> Self {
        Credentials::Basic {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn token(token: &str) -> Self {
        Credentials::Token {
            token: token.to_string(),
        }
    }

    pub fn uses_token(&self) -> bool {
        matches!(self, Credentials::Token { .. })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Token { .. } => f
                .debug_struct("Token")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// One entry of the server's form list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormSummary {
    #[serde(rename = "formID")]
    pub form_id: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    /// `md5:<hex>`
    #[serde(default)]
    pub hash: Option<String>,
    pub download_url: String,
    #[serde(default)]
    pub manifest_url: Option<String>,
}

impl FormSummary {
    /// Hash without its `md5:` prefix, lowercased
    pub fn md5(&self) -> Option<String> {
        self.hash.as_deref().map(strip_md5_prefix)
    }
}

/// Media files a form needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub media_files: Vec<MediaFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFile {
    pub filename: String,
    pub hash: String,
    pub download_url: String,
}

impl MediaFile {
    pub fn md5(&self) -> String {
        strip_md5_prefix(&self.hash)
    }
}

/// A downloaded definition and its content hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormDefinition {
    pub bytes: Vec<u8>,
    pub md5: String,
}

/// Everything needed to submit one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub endpoint: String,
    pub instance_xml: PathBuf,
    pub attachments: Vec<PathBuf>,
    /// Value of the `form_status` header; `complete` when absent
    pub form_status: Option<String>,
    pub survey_notes: Option<String>,
    pub location_trigger: Option<String>,
    pub assignment_id: Option<String>,
}

impl UploadRequest {
    pub fn new(endpoint: &str, instance_xml: PathBuf, attachments: Vec<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            instance_xml,
            attachments,
            form_status: None,
            survey_notes: None,
            location_trigger: None,
            assignment_id: None,
        }
    }
}

/// Outcome of a submission that the server accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    /// HTTP requests issued
    pub requests: usize,
    /// Status of the last response (201 or 202)
    pub status: u16,
    /// Body of the last response
    pub message: String,
}

/// Server operations used by the uploader and the form synchronizer
#[async_trait]
pub trait OpenRosaTransport: Send + Sync {
    async fn fetch_form_list(&self, url: &str) -> Result<Vec<FormSummary>>;

    async fn fetch_form_manifest(&self, url: &str) -> Result<Manifest>;

    async fn fetch_form_definition(&self, url: &str) -> Result<FormDefinition>;

    async fn fetch_media_file(&self, url: &str) -> Result<Vec<u8>>;

    /// Submit an instance; succeeds only when every request is accepted
    async fn upload_instance(&self, request: &UploadRequest) -> Result<UploadResult>;
}

pub(crate) fn strip_md5_prefix(hash: &str) -> String {
    let hash = hash.trim();
    hash.strip_prefix("md5:")
        .unwrap_or(hash)
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_list_json_shape() {
        let json = r#"[{
            "formID": "one-question",
            "name": "One Question",
            "version": "2",
            "hash": "md5:ABCDEF",
            "downloadUrl": "https://example.org/formXml?formId=one-question",
            "manifestUrl": "https://example.org/xformsManifest?formId=one-question"
        }, {
            "formID": "bare",
            "name": "Bare",
            "downloadUrl": "https://example.org/formXml?formId=bare"
        }]"#;

        let list: Vec<FormSummary> = serde_json::from_str(json).unwrap();
        assert_eq!(list[0].form_id, "one-question");
        assert_eq!(list[0].md5().as_deref(), Some("abcdef"));
        assert!(list[1].version.is_none());
        assert!(list[1].manifest_url.is_none());
        assert!(list[1].md5().is_none());
    }

    #[test]
    fn test_manifest_json_shape() {
        let json = r#"{"mediaFiles": [
            {"filename": "logo.png", "hash": "md5:00ff", "downloadUrl": "https://example.org/m/1"}
        ]}"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.media_files[0].md5(), "00ff");
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let basic = format!("{:?}", Credentials::basic("alice", "s3cret"));
        assert!(basic.contains("alice"));
        assert!(!basic.contains("s3cret"));
        let token = format!("{:?}", Credentials::token("tok-123"));
        assert!(!token.contains("tok-123"));
    }
}
