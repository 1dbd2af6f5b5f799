//! Saving instance payloads: validate, write, encrypt, then record status

use super::{Instance, InstanceId, InstanceRegistry, InstanceStatus};
use crate::error::{Error, Result};
use crate::forms::{Form, FormRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Encrypts a finalized instance for a form that carries a public key.
///
/// Implementations write their output (encrypted payload, submission
/// manifest) into the instance directory and must leave the plaintext
/// XML in place on failure.
#[async_trait]
pub trait Encryptor: Send + Sync {
    async fn encrypt(&self, form: &Form, instance: &Instance) -> Result<()>;
}

/// Checks a payload before it may be finalized
pub trait FinalizeValidator: Send + Sync {
    fn validate(&self, xml: &[u8]) -> Result<()>;
}

/// Accepts any payload that looks like a single XML document
#[derive(Debug, Clone, Copy, Default)]
pub struct WellFormedPayload;

impl FinalizeValidator for WellFormedPayload {
    fn validate(&self, xml: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(xml)
            .map_err(|e| Error::validation(format!("instance payload is not UTF-8: {}", e)))?;
        let trimmed = text.trim();
        if !trimmed.starts_with('<') || !trimmed.ends_with('>') {
            return Err(Error::validation("instance payload is not an XML document"));
        }
        Ok(())
    }
}

/// One save of an instance payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub xml: Vec<u8>,
    /// Mark the instance `COMPLETE` after writing
    pub finalize: bool,
}

impl SaveRequest {
    pub fn draft(xml: impl Into<Vec<u8>>) -> Self {
        Self {
            xml: xml.into(),
            finalize: false,
        }
    }

    pub fn finalized(xml: impl Into<Vec<u8>>) -> Self {
        Self {
            xml: xml.into(),
            finalize: true,
        }
    }
}

/// Serializes saves per instance; saves of different instances run concurrently
pub struct InstanceSaver {
    instances: Arc<InstanceRegistry>,
    forms: Arc<FormRegistry>,
    validator: Arc<dyn FinalizeValidator>,
    encryptor: Option<Arc<dyn Encryptor>>,
    locks: Mutex<HashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstanceSaver {
    pub fn new(instances: Arc<InstanceRegistry>, forms: Arc<FormRegistry>) -> Self {
        Self {
            instances,
            forms,
            validator: Arc::new(WellFormedPayload),
            encryptor: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn FinalizeValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    fn lock_for(&self, id: InstanceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(id).or_default().clone()
    }

    /// Drop the map entry once no other save holds or waits on it
    fn release_lock(&self, id: InstanceId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the map, one here
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&id);
        }
    }

    /// Write a payload and record the resulting status.
    ///
    /// The status change is the last step: if anything before it fails (or
    /// the future is dropped), the row keeps its previous status and the
    /// previous payload stays readable.
    pub async fn save(&self, id: InstanceId, request: SaveRequest) -> Result<Instance> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.save_locked(id, request).await
        };
        self.release_lock(id, lock);
        result
    }

    async fn save_locked(&self, id: InstanceId, request: SaveRequest) -> Result<Instance> {
        let instance = self.instances.get(id)?.ok_or(Error::NotFound {
            entity: "instance",
            id,
        })?;
        if instance.is_deleted() {
            return Err(Error::validation(format!("instance {} is deleted", id)));
        }
        if request.xml.is_empty() {
            return Err(Error::validation("instance payload is empty"));
        }

        let target = if request.finalize {
            InstanceStatus::Complete
        } else {
            InstanceStatus::Incomplete
        };
        if !instance.status.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                from: instance.status.to_string(),
                to: target.to_string(),
            });
        }
        if request.finalize {
            self.validator.validate(&request.xml)?;
        }

        write_atomically(&instance.instance_file_path, &request.xml).await?;

        if request.finalize {
            self.encrypt_if_required(&instance).await?;
        }

        self.instances.update_status(id, target)?;
        tracing::debug!(instance_id = id, status = %target, bytes = request.xml.len(), "saved instance");

        self.instances.get(id)?.ok_or(Error::NotFound {
            entity: "instance",
            id,
        })
    }

    async fn encrypt_if_required(&self, instance: &Instance) -> Result<()> {
        let form = self.forms.find_latest_by_form_identifier_and_version(
            &instance.form_identifier,
            instance.form_version.as_deref(),
        )?;
        let Some(form) = form.filter(Form::is_encrypted) else {
            return Ok(());
        };

        let encryptor = self.encryptor.as_ref().ok_or_else(|| {
            Error::Encryption(format!(
                "form {} requires encryption but no encryptor is configured",
                form.form_identifier
            ))
        })?;

        encryptor.encrypt(&form, instance).await.map_err(|e| match e {
            Error::Encryption(_) => e,
            other => Error::Encryption(other.to_string()),
        })?;
        tracing::info!(instance_id = instance.id, "encrypted instance");
        Ok(())
    }

    /// The stored payload, byte for byte
    pub async fn read_xml(&self, id: InstanceId) -> Result<Vec<u8>> {
        let instance = self.instances.get(id)?.ok_or(Error::NotFound {
            entity: "instance",
            id,
        })?;
        Ok(tokio::fs::read(&instance.instance_file_path).await?)
    }
}

/// Write to `<file>.tmp` and rename over the target
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");

    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
