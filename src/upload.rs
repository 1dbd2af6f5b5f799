//! Sending finalized instances to the server

use crate::error::{Error, Result};
use crate::forms::FormRegistry;
use crate::instances::{Instance, InstanceId, InstanceRegistry, InstanceStatus};
use crate::transport::{OpenRosaTransport, UploadRequest, UploadResult};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use walkdir::WalkDir;

/// Result of one accepted submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    pub instance_id: InstanceId,
    pub result: UploadResult,
    /// The instance was deleted after submission
    pub deleted: bool,
}

/// What [`InstanceUploader::upload_all`] did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub submitted: Vec<InstanceId>,
    pub failed: Vec<(InstanceId, String)>,
}

/// Submits instances and records the outcome in the instance registry
pub struct InstanceUploader {
    instances: Arc<InstanceRegistry>,
    forms: Arc<FormRegistry>,
    transport: Arc<dyn OpenRosaTransport>,
    default_endpoint: Option<String>,
    auto_delete_default: bool,
}

impl InstanceUploader {
    pub fn new(
        instances: Arc<InstanceRegistry>,
        forms: Arc<FormRegistry>,
        transport: Arc<dyn OpenRosaTransport>,
    ) -> Self {
        Self {
            instances,
            forms,
            transport,
            default_endpoint: None,
            auto_delete_default: false,
        }
    }

    /// Endpoint for forms without their own submission URI
    pub fn with_default_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.default_endpoint = Some(endpoint.into());
        self
    }

    /// App-wide auto-delete setting; a form's own flag wins
    pub fn with_auto_delete(mut self, enabled: bool) -> Self {
        self.auto_delete_default = enabled;
        self
    }

    /// Submit one finalized instance.
    ///
    /// Success marks it `SUBMITTED`. An authentication failure leaves the
    /// status alone so the user can fix credentials; any other failure marks
    /// it `SUBMISSION_FAILED`. The error is returned in both cases.
    pub async fn upload(&self, id: InstanceId) -> Result<UploadOutcome> {
        let instance = self.instances.get(id)?.ok_or(Error::NotFound {
            entity: "instance",
            id,
        })?;
        if instance.is_deleted() || !instance.status.is_sendable() {
            return Err(Error::InvalidTransition {
                from: if instance.is_deleted() {
                    "DELETED".to_string()
                } else {
                    instance.status.to_string()
                },
                to: InstanceStatus::Submitted.to_string(),
            });
        }

        let form = self.forms.find_latest_by_form_identifier_and_version(
            &instance.form_identifier,
            instance.form_version.as_deref(),
        )?;
        let endpoint = form
            .as_ref()
            .and_then(|f| f.submission_uri.clone())
            .filter(|uri| !uri.trim().is_empty())
            .or_else(|| self.default_endpoint.clone())
            .ok_or_else(|| {
                Error::Config(format!(
                    "no submission endpoint for form {}",
                    instance.form_identifier
                ))
            })?;

        let request = UploadRequest::new(
            &endpoint,
            instance.instance_file_path.clone(),
            collect_attachments(&instance),
        );
        tracing::info!(
            instance_id = id,
            attachments = request.attachments.len(),
            %endpoint,
            "uploading instance"
        );

        match self.transport.upload_instance(&request).await {
            Ok(result) => {
                self.instances.update_status(id, InstanceStatus::Submitted)?;

                let auto_delete = form
                    .as_ref()
                    .map(|f| f.should_auto_delete(self.auto_delete_default))
                    .unwrap_or(self.auto_delete_default);
                if auto_delete {
                    self.instances.soft_delete(id)?;
                }

                Ok(UploadOutcome {
                    instance_id: id,
                    result,
                    deleted: auto_delete,
                })
            }
            Err(e) if e.requires_credentials() => {
                tracing::warn!(instance_id = id, error = %e, "upload needs credentials");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(instance_id = id, error = %e, "upload failed");
                self.instances
                    .update_status(id, InstanceStatus::SubmissionFailed)?;
                Err(e)
            }
        }
    }

    /// Submit every sendable instance, oldest first.
    ///
    /// Stops at the first authentication failure and returns it; other
    /// failures are collected and the remaining instances still go out.
    pub async fn upload_all(&self) -> Result<UploadSummary> {
        let mut summary = UploadSummary::default();

        for instance in self.instances.list_sendable()? {
            match self.upload(instance.id).await {
                Ok(_) => summary.submitted.push(instance.id),
                Err(e) if e.requires_credentials() => return Err(e),
                Err(e) => summary.failed.push((instance.id, e.to_string())),
            }
        }

        tracing::info!(
            submitted = summary.submitted.len(),
            failed = summary.failed.len(),
            "upload pass finished"
        );
        Ok(summary)
    }
}

/// Files next to the instance XML, by name; the XML and temp files are skipped
fn collect_attachments(instance: &Instance) -> Vec<PathBuf> {
    let Some(dir) = instance.instance_dir() else {
        return Vec::new();
    };

    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| *path != instance.instance_file_path)
        .filter(|path| path.extension().map_or(true, |ext| ext != "tmp"))
        .collect()
}
