//! Wiring the registries, transport and services for one storage root

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::forms::{FormId, FormRegistry};
use crate::instances::{
    InstanceId, InstanceRegistry, InstanceSaver, NewInstance, SaveRequest, WellFormedPayload,
};
use crate::storage::{OpenOutcome, StoragePaths};
use crate::sync::{FormSynchronizer, SyncScheduler};
use crate::transport::HttpTransport;
use crate::upload::InstanceUploader;
use std::path::Path;
use std::sync::Arc;

/// Everything that lives under one storage root
pub struct App {
    paths: StoragePaths,
    settings: Settings,
    events: EventBus,
    forms: Arc<FormRegistry>,
    instances: Arc<InstanceRegistry>,
    recreated: Vec<String>,
}

impl App {
    /// Open the storage root, creating missing directories.
    ///
    /// Unreadable registries are replaced with empty ones; see
    /// [`App::recreated_registries`].
    pub fn open(root: &Path) -> Result<Self> {
        let paths = StoragePaths::new(root);
        paths.ensure_dirs()?;
        let settings = Settings::load_or_default(root)?;
        let events = EventBus::new();

        let mut recreated = Vec::new();
        let (forms, outcome) = FormRegistry::open_or_recreate(&paths, events.clone())?;
        if let OpenOutcome::Recreated { reason } = outcome {
            recreated.push(format!("forms: {}", reason));
        }
        let (instances, outcome) = InstanceRegistry::open_or_recreate(&paths, events.clone())?;
        if let OpenOutcome::Recreated { reason } = outcome {
            recreated.push(format!("instances: {}", reason));
        }

        tracing::debug!(root = %root.display(), "opened storage root");

        Ok(Self {
            paths,
            settings,
            events,
            forms: Arc::new(forms),
            instances: Arc::new(instances),
            recreated,
        })
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn forms(&self) -> &Arc<FormRegistry> {
        &self.forms
    }

    pub fn instances(&self) -> &Arc<InstanceRegistry> {
        &self.instances
    }

    /// Registries that were unreadable and started over empty
    pub fn recreated_registries(&self) -> &[String] {
        &self.recreated
    }

    pub fn transport(&self) -> Result<Arc<HttpTransport>> {
        let transport = HttpTransport::new(
            self.settings.transport_config(),
            self.settings.server.credentials(),
        )?;
        Ok(Arc::new(transport))
    }

    pub fn saver(&self) -> InstanceSaver {
        InstanceSaver::new(self.instances.clone(), self.forms.clone())
            .with_validator(Arc::new(WellFormedPayload))
    }

    pub fn uploader(&self) -> Result<InstanceUploader> {
        let mut uploader =
            InstanceUploader::new(self.instances.clone(), self.forms.clone(), self.transport()?)
                .with_auto_delete(self.settings.instances.auto_delete);
        if let Ok(endpoint) = self.settings.server.submission_url() {
            uploader = uploader.with_default_endpoint(endpoint);
        }
        Ok(uploader)
    }

    pub fn synchronizer(&self) -> Result<FormSynchronizer> {
        Ok(FormSynchronizer::new(
            self.forms.clone(),
            self.instances.clone(),
            self.transport()?,
            self.settings.server.form_list_url()?,
            self.settings.sync.mode,
        ))
    }

    pub fn scheduler(&self) -> Result<SyncScheduler> {
        Ok(SyncScheduler::new(
            Arc::new(self.synchronizer()?),
            self.settings.sync_interval(),
        ))
    }

    /// Start a blank instance of a form and store its first draft
    pub async fn create_instance(&self, form_id: FormId, xml: Vec<u8>) -> Result<InstanceId> {
        let form = self.forms.get(form_id)?.ok_or(Error::NotFound {
            entity: "form",
            id: form_id,
        })?;
        if form.deleted {
            return Err(Error::validation(format!("form {} is deleted", form_id)));
        }

        let id = self.instances.create(&form, NewInstance::default())?;
        if let Err(e) = self.saver().save(id, SaveRequest::draft(xml)).await {
            self.instances.delete(id)?;
            return Err(e);
        }
        Ok(id)
    }

    /// Whether finalized instances of this form go out straight away
    pub fn auto_send_enabled(&self, instance_id: InstanceId) -> Result<bool> {
        let Some(instance) = self.instances.get(instance_id)? else {
            return Ok(false);
        };
        let form = self.forms.find_latest_by_form_identifier_and_version(
            &instance.form_identifier,
            instance.form_version.as_deref(),
        )?;
        Ok(form
            .and_then(|f| f.auto_send)
            .unwrap_or(self.settings.instances.auto_send))
    }
}
