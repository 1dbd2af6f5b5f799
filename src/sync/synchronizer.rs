//! Downloading forms and applying sync plans

use super::{reconcile, SyncMode};
use crate::error::{Error, Result};
use crate::forms::{Form, FormFilter, FormId, FormMetadata, FormRegistry};
use crate::instances::InstanceRegistry;
use crate::storage::{self, media_dir_for, md5_file, now_millis, Subdirectory};
use crate::transport::{FormSummary, OpenRosaTransport};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a downloaded form ended up in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadKind {
    /// New row for an identifier not yet on the device
    Added,
    /// New row for another version of a known identifier
    Updated,
    /// A soft-deleted row with the same content was made live again
    Restored,
    /// A live row already had this content
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    pub form_id: FormId,
    pub form_identifier: String,
    pub kind: DownloadKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub form_identifier: String,
    pub error: String,
}

/// What a sync cycle or download batch did, by form identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.failures.is_empty()
    }

    fn record(&mut self, outcome: &DownloadOutcome) {
        let identifier = outcome.form_identifier.clone();
        match outcome.kind {
            DownloadKind::Added | DownloadKind::Restored => self.added.push(identifier),
            DownloadKind::Updated => self.updated.push(identifier),
            DownloadKind::AlreadyPresent => {}
        }
    }

    fn fail(&mut self, form_identifier: &str, error: &Error) {
        self.failures.push(SyncFailure {
            form_identifier: form_identifier.to_string(),
            error: error.to_string(),
        });
    }
}

/// Brings the local form set in line with the server
pub struct FormSynchronizer {
    forms: Arc<FormRegistry>,
    instances: Arc<InstanceRegistry>,
    transport: Arc<dyn OpenRosaTransport>,
    form_list_url: String,
    mode: SyncMode,
}

impl FormSynchronizer {
    pub fn new(
        forms: Arc<FormRegistry>,
        instances: Arc<InstanceRegistry>,
        transport: Arc<dyn OpenRosaTransport>,
        form_list_url: impl Into<String>,
        mode: SyncMode,
    ) -> Self {
        Self {
            forms,
            instances,
            transport,
            form_list_url: form_list_url.into(),
            mode,
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub async fn fetch_form_list(&self) -> Result<Vec<FormSummary>> {
        self.transport.fetch_form_list(&self.form_list_url).await
    }

    /// Run one automatic cycle under the configured mode.
    ///
    /// Failing to fetch the form list, or an authentication failure at any
    /// point, aborts the cycle with an error. Other per-form failures are
    /// recorded in the report and the rest of the plan still runs.
    pub async fn sync(&self) -> Result<SyncReport> {
        if self.mode == SyncMode::Manual {
            tracing::debug!("manual sync mode; nothing to do");
            return Ok(SyncReport::default());
        }

        let server = self.fetch_form_list().await?;
        let local = self.forms.list(&FormFilter::Live)?;
        let plan = reconcile(self.mode, &server, &local);
        tracing::info!(
            mode = %self.mode,
            add = plan.to_add.len(),
            update = plan.to_update.len(),
            delete = plan.to_delete.len(),
            "sync plan"
        );

        let mut report = SyncReport::default();
        for summary in plan.to_add.iter().chain(plan.to_update.iter()) {
            match self.download_form(summary).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) if e.requires_credentials() => return Err(e),
                Err(e) => {
                    tracing::warn!(form_identifier = %summary.form_id, error = %e, "download failed");
                    report.fail(&summary.form_id, &e);
                }
            }
        }

        for form in &plan.to_delete {
            match self.remove_form(form) {
                Ok(()) => {
                    if !report.deleted.contains(&form.form_identifier) {
                        report.deleted.push(form.form_identifier.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!(form_id = form.id, error = %e, "delete failed");
                    report.fail(&form.form_identifier, &e);
                }
            }
        }

        tracing::info!(
            added = report.added.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            failed = report.failures.len(),
            "sync finished"
        );
        Ok(report)
    }

    /// Download the given forms regardless of mode
    pub async fn download(&self, summaries: &[FormSummary]) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for summary in summaries {
            match self.download_form(summary).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) if e.requires_credentials() => return Err(e),
                Err(e) => {
                    tracing::warn!(form_identifier = %summary.form_id, error = %e, "download failed");
                    report.fail(&summary.form_id, &e);
                }
            }
        }
        Ok(report)
    }

    /// Fetch one form's definition and media, then register it.
    ///
    /// A definition whose content hash is already known is not stored twice:
    /// a live row is reused, a soft-deleted one is restored.
    pub async fn download_form(&self, summary: &FormSummary) -> Result<DownloadOutcome> {
        let definition = self
            .transport
            .fetch_form_definition(&summary.download_url)
            .await?;
        if let Some(expected) = summary.md5() {
            if expected != definition.md5 {
                return Err(Error::validation(format!(
                    "definition for {} has hash {} but the form list says {}",
                    summary.form_id, definition.md5, expected
                )));
            }
        }

        if let Some(existing) = self.forms.get_by_md5(&definition.md5)? {
            if let Some(outcome) = self.reuse(&existing, summary, &definition.bytes).await? {
                return Ok(outcome);
            }
        }

        let previous = self.forms.find_latest_by_form_identifier(&summary.form_id)?;
        let staging = self
            .forms
            .paths()
            .dir(Subdirectory::Cache)
            .join(format!("download-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging).await?;

        let result = self
            .install(summary, &definition.bytes, &staging, previous.as_ref())
            .await;
        storage::remove_path(&staging)?;
        let form_id = result?;

        Ok(DownloadOutcome {
            form_id,
            form_identifier: summary.form_id.clone(),
            kind: if previous.is_some() {
                DownloadKind::Updated
            } else {
                DownloadKind::Added
            },
        })
    }

    /// Reuse a row that already holds this content; `None` when it cannot be
    async fn reuse(
        &self,
        existing: &Form,
        summary: &FormSummary,
        bytes: &[u8],
    ) -> Result<Option<DownloadOutcome>> {
        if existing.deleted {
            let holder = self.forms.get_by_path(&existing.form_file_path)?;
            if holder.is_some_and(|f| !f.deleted && f.id != existing.id) {
                return Ok(None);
            }
        }

        if !existing.form_file_path.is_file() {
            if let Some(parent) = existing.form_file_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&existing.form_file_path, bytes).await?;
        }
        if let Some(manifest_url) = &summary.manifest_url {
            self.download_media(
                manifest_url,
                &existing.form_media_path,
                Some(&existing.form_media_path),
            )
            .await?;
        }

        let kind = if existing.deleted {
            self.forms.restore(existing.id)?;
            DownloadKind::Restored
        } else {
            DownloadKind::AlreadyPresent
        };
        tracing::info!(form_id = existing.id, ?kind, "reused existing form");

        Ok(Some(DownloadOutcome {
            form_id: existing.id,
            form_identifier: existing.form_identifier.clone(),
            kind,
        }))
    }

    /// Stage the definition and media, move them into `forms/`, register
    async fn install(
        &self,
        summary: &FormSummary,
        bytes: &[u8],
        staging: &Path,
        previous: Option<&Form>,
    ) -> Result<FormId> {
        let staged_file = staging.join("form.xml");
        tokio::fs::write(&staged_file, bytes).await?;

        let staged_media = staging.join("media");
        if let Some(manifest_url) = &summary.manifest_url {
            self.download_media(
                manifest_url,
                &staged_media,
                previous.map(|f| f.form_media_path.as_path()),
            )
            .await?;
        }

        let target = self.unique_form_path(&summary.name, &summary.form_id)?;
        let target_media = media_dir_for(&target);
        tokio::fs::rename(&staged_file, &target).await?;
        if staged_media.is_dir() {
            if let Err(e) = tokio::fs::rename(&staged_media, &target_media).await {
                storage::remove_path(&target)?;
                return Err(e.into());
            }
        }

        let mut metadata = FormMetadata::new(&summary.form_id)
            .with_display_name(&summary.name)
            .with_date(now_millis());
        metadata.version = summary.version.clone();

        match self.forms.register(&target, metadata) {
            Ok(id) => {
                tracing::info!(
                    form_id = id,
                    form_identifier = %summary.form_id,
                    path = %target.display(),
                    "downloaded form"
                );
                Ok(id)
            }
            Err(e) => {
                storage::remove_path(&target)?;
                storage::remove_path(&target_media)?;
                Err(e)
            }
        }
    }

    /// Fetch the manifest and every listed file into `dir`.
    ///
    /// Files whose hash matches a copy in `known` (or already in `dir`) are
    /// copied locally instead of downloaded.
    async fn download_media(&self, manifest_url: &str, dir: &Path, known: Option<&Path>) -> Result<()> {
        let manifest = self.transport.fetch_form_manifest(manifest_url).await?;
        tokio::fs::create_dir_all(dir).await?;

        for file in &manifest.media_files {
            let name = safe_media_name(&file.filename)?;
            let target = dir.join(name);
            let expected = file.md5();

            if target.is_file() && md5_file(&target)? == expected {
                tracing::debug!(file = %name, "media file up to date");
                continue;
            }
            if let Some(known) = known.map(|k| k.join(name)) {
                if known != target && known.is_file() && md5_file(&known)? == expected {
                    tokio::fs::copy(&known, &target).await?;
                    tracing::debug!(file = %name, "reused media file");
                    continue;
                }
            }

            let bytes = self.transport.fetch_media_file(&file.download_url).await?;
            tokio::fs::write(&target, bytes).await?;
            tracing::debug!(file = %name, "downloaded media file");
        }
        Ok(())
    }

    /// `forms/<name>.xml`, or `<name>_2.xml` and so on when taken
    fn unique_form_path(&self, name: &str, form_identifier: &str) -> Result<PathBuf> {
        let forms_dir = self.forms.paths().dir(Subdirectory::Forms);
        std::fs::create_dir_all(&forms_dir)?;

        let mut base = sanitize_file_name(name);
        if base.is_empty() {
            base = sanitize_file_name(form_identifier);
        }
        if base.is_empty() {
            base = "form".to_string();
        }

        let mut n = 1;
        loop {
            let file_name = if n == 1 {
                format!("{}.xml", base)
            } else {
                format!("{}_{}.xml", base, n)
            };
            let candidate = forms_dir.join(file_name);
            if !candidate.exists()
                && !media_dir_for(&candidate).exists()
                && self.forms.get_by_path(&candidate)?.is_none()
            {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// Hide a form that still has instances; remove it outright otherwise
    fn remove_form(&self, form: &Form) -> Result<()> {
        let in_use = self
            .instances
            .count_for_form(&form.form_identifier, form.version.as_deref())?;
        if in_use > 0 {
            tracing::info!(form_id = form.id, instances = in_use, "form has instances; soft-deleting");
            self.forms.soft_delete(form.id)
        } else {
            self.forms.delete(form.id)
        }
    }
}

/// Keep letters, digits, spaces, `-` and `_`; everything else becomes `_`
fn sanitize_file_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}

fn safe_media_name(name: &str) -> Result<&str> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\');
    if invalid {
        return Err(Error::validation(format!("unsafe media file name {:?}", name)));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::instances::NewInstance;
    use crate::storage::{md5_bytes, StoragePaths};
    use crate::transport::{FormDefinition, Manifest, MediaFile, UploadRequest, UploadResult};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeServer {
        forms: Mutex<Vec<FormSummary>>,
        files: Mutex<HashMap<String, Vec<u8>>>,
        manifests: Mutex<HashMap<String, Manifest>>,
        broken: Mutex<HashSet<String>>,
        unauthorized: bool,
        fetched: Mutex<Vec<String>>,
    }

    impl FakeServer {
        fn publish(&self, identifier: &str, name: &str, xml: &str, media: &[(&str, &str)]) {
            let download_url = format!("https://example.org/formXml?formId={}", identifier);
            let manifest_url = (!media.is_empty())
                .then(|| format!("https://example.org/manifest?formId={}", identifier));

            self.files
                .lock()
                .unwrap()
                .insert(download_url.clone(), xml.as_bytes().to_vec());
            if let Some(url) = &manifest_url {
                let mut media_files = Vec::new();
                for (file, content) in media {
                    let media_url = format!("https://example.org/media/{}/{}", identifier, file);
                    self.files
                        .lock()
                        .unwrap()
                        .insert(media_url.clone(), content.as_bytes().to_vec());
                    media_files.push(MediaFile {
                        filename: file.to_string(),
                        hash: format!("md5:{}", md5_bytes(content.as_bytes())),
                        download_url: media_url,
                    });
                }
                self.manifests
                    .lock()
                    .unwrap()
                    .insert(url.clone(), Manifest { media_files });
            }

            let mut forms = self.forms.lock().unwrap();
            forms.retain(|f| f.form_id != identifier);
            forms.push(FormSummary {
                form_id: identifier.to_string(),
                name: name.to_string(),
                version: None,
                hash: Some(format!("md5:{}", md5_bytes(xml.as_bytes()))),
                download_url,
                manifest_url,
            });
        }

        fn withdraw(&self, identifier: &str) {
            self.forms.lock().unwrap().retain(|f| f.form_id != identifier);
        }

        fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.fetched.lock().unwrap().push(url.to_string());
            if self.broken.lock().unwrap().contains(url) {
                return Err(Error::Network {
                    url: url.to_string(),
                    message: "connection reset".into(),
                });
            }
            self.files.lock().unwrap().get(url).cloned().ok_or(Error::Server {
                url: url.to_string(),
                status: 404,
                message: "Not Found".into(),
            })
        }
    }

    #[async_trait]
    impl OpenRosaTransport for FakeServer {
        async fn fetch_form_list(&self, url: &str) -> Result<Vec<FormSummary>> {
            if self.unauthorized {
                return Err(Error::Authentication {
                    url: url.to_string(),
                });
            }
            Ok(self.forms.lock().unwrap().clone())
        }

        async fn fetch_form_manifest(&self, url: &str) -> Result<Manifest> {
            Ok(self
                .manifests
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_form_definition(&self, url: &str) -> Result<FormDefinition> {
            let bytes = self.fetch(url)?;
            let md5 = md5_bytes(&bytes);
            Ok(FormDefinition { bytes, md5 })
        }

        async fn fetch_media_file(&self, url: &str) -> Result<Vec<u8>> {
            self.fetch(url)
        }

        async fn upload_instance(&self, _request: &UploadRequest) -> Result<UploadResult> {
            unreachable!("sync never uploads")
        }
    }

    struct Fixture {
        _tmp: TempDir,
        paths: StoragePaths,
        forms: Arc<FormRegistry>,
        instances: Arc<InstanceRegistry>,
        server: Arc<FakeServer>,
    }

    impl Fixture {
        fn synchronizer(&self, mode: SyncMode) -> FormSynchronizer {
            FormSynchronizer::new(
                self.forms.clone(),
                self.instances.clone(),
                self.server.clone(),
                "https://example.org/formList",
                mode,
            )
        }

        fn live(&self) -> Vec<Form> {
            self.forms.list(&FormFilter::Live).unwrap()
        }
    }

    fn fixture_with(server: FakeServer) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let paths = StoragePaths::new(tmp.path());
        paths.ensure_dirs().unwrap();
        let events = EventBus::new();
        Fixture {
            forms: Arc::new(FormRegistry::open(&paths, events.clone()).unwrap()),
            instances: Arc::new(InstanceRegistry::open(&paths, events).unwrap()),
            server: Arc::new(server),
            paths,
            _tmp: tmp,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeServer::default())
    }

    fn staging_dirs(paths: &StoragePaths) -> usize {
        std::fs::read_dir(paths.dir(Subdirectory::Cache))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("download-"))
            .count()
    }

    #[tokio::test]
    async fn test_match_exactly_downloads_forms_and_media() {
        let fx = fixture();
        fx.server.publish("birds", "Birds", "<h:html>birds</h:html>", &[("photo.jpg", "jpeg")]);
        fx.server.publish("trees", "Trees", "<h:html>trees</h:html>", &[]);

        let report = fx.synchronizer(SyncMode::MatchExactly).sync().await.unwrap();
        assert_eq!(report.added, vec!["birds", "trees"]);
        assert!(report.failures.is_empty());

        let birds = fx.forms.find_latest_by_form_identifier("birds").unwrap().unwrap();
        assert_eq!(birds.display_name, "Birds");
        assert_eq!(birds.form_file_path.file_name().unwrap(), "Birds.xml");
        assert_eq!(
            std::fs::read_to_string(birds.form_media_path.join("photo.jpg")).unwrap(),
            "jpeg"
        );
        assert_eq!(staging_dirs(&fx.paths), 0);

        // nothing changed on the server: the next cycle is a no-op
        let again = fx.synchronizer(SyncMode::MatchExactly).sync().await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_same_display_name_gets_unique_file() {
        let fx = fixture();
        fx.server.publish("a", "Survey", "<h:html>a</h:html>", &[]);
        fx.server.publish("b", "Survey", "<h:html>b</h:html>", &[]);

        fx.synchronizer(SyncMode::MatchExactly).sync().await.unwrap();
        let mut names: Vec<String> = fx
            .live()
            .iter()
            .map(|f| f.form_file_path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Survey.xml", "Survey_2.xml"]);
    }

    #[tokio::test]
    async fn test_update_registers_new_version_and_reuses_media() {
        let fx = fixture();
        fx.server.publish("birds", "Birds", "<h:html>v1</h:html>", &[("photo.jpg", "jpeg")]);
        let sync = fx.synchronizer(SyncMode::PreviouslyDownloadedOnly);

        // previously-downloaded-only never adds, so fetch explicitly first
        let summaries = sync.fetch_form_list().await.unwrap();
        sync.download(&summaries).await.unwrap();
        let v1 = fx.forms.find_latest_by_form_identifier("birds").unwrap().unwrap();

        fx.server.publish("birds", "Birds", "<h:html>v2</h:html>", &[("photo.jpg", "jpeg")]);
        fx.server.fetched.lock().unwrap().clear();
        let report = sync.sync().await.unwrap();
        assert_eq!(report.updated, vec!["birds"]);

        let v2 = fx.forms.find_latest_by_form_identifier("birds").unwrap().unwrap();
        assert_ne!(v1.id, v2.id);
        assert_eq!(v2.md5_hash, md5_bytes(b"<h:html>v2</h:html>"));
        assert!(v2.form_media_path.join("photo.jpg").is_file());
        // the unchanged media file was copied, not fetched
        let fetched = fx.server.fetched.lock().unwrap();
        assert!(!fetched.iter().any(|url| url.contains("photo.jpg")));
    }

    #[tokio::test]
    async fn test_withdrawn_forms_deleted_or_hidden() {
        let fx = fixture();
        fx.server.publish("used", "Used", "<h:html>used</h:html>", &[]);
        fx.server.publish("unused", "Unused", "<h:html>unused</h:html>", &[]);
        let sync = fx.synchronizer(SyncMode::MatchExactly);
        sync.sync().await.unwrap();

        let used = fx.forms.find_latest_by_form_identifier("used").unwrap().unwrap();
        fx.instances.create(&used, NewInstance::default()).unwrap();

        fx.server.withdraw("used");
        fx.server.withdraw("unused");
        let mut report = sync.sync().await.unwrap();
        report.deleted.sort();
        assert_eq!(report.deleted, vec!["unused", "used"]);

        let hidden = fx.forms.get(used.id).unwrap().unwrap();
        assert!(hidden.deleted);
        assert!(!hidden.form_file_path.exists());
        assert!(fx.forms.list(&FormFilter::All).unwrap().len() == 1);
    }

    #[tokio::test]
    async fn test_redownload_restores_soft_deleted_form() {
        let fx = fixture();
        fx.server.publish("used", "Used", "<h:html>used</h:html>", &[]);
        let sync = fx.synchronizer(SyncMode::MatchExactly);
        sync.sync().await.unwrap();
        let form = fx.forms.find_latest_by_form_identifier("used").unwrap().unwrap();
        fx.instances.create(&form, NewInstance::default()).unwrap();

        fx.server.withdraw("used");
        sync.sync().await.unwrap();
        assert!(fx.forms.get(form.id).unwrap().unwrap().deleted);

        fx.server.publish("used", "Used", "<h:html>used</h:html>", &[]);
        let report = sync.sync().await.unwrap();
        assert_eq!(report.added, vec!["used"]);

        let restored = fx.forms.get(form.id).unwrap().unwrap();
        assert!(!restored.deleted);
        assert!(restored.form_file_path.is_file());
        assert_eq!(fx.forms.list(&FormFilter::All).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_cycle() {
        let fx = fixture();
        fx.server.publish("good", "Good", "<h:html>good</h:html>", &[]);
        fx.server.publish("bad", "Bad", "<h:html>bad</h:html>", &[]);
        fx.server
            .broken
            .lock()
            .unwrap()
            .insert("https://example.org/formXml?formId=bad".into());

        let report = fx.synchronizer(SyncMode::MatchExactly).sync().await.unwrap();
        assert_eq!(report.added, vec!["good"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].form_identifier, "bad");
        assert!(fx.forms.find_latest_by_form_identifier("bad").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_media_leaves_nothing_behind() {
        let fx = fixture();
        fx.server.publish("birds", "Birds", "<h:html>birds</h:html>", &[("photo.jpg", "jpeg")]);
        fx.server
            .broken
            .lock()
            .unwrap()
            .insert("https://example.org/media/birds/photo.jpg".into());

        let report = fx.synchronizer(SyncMode::MatchExactly).sync().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(fx.live().is_empty());
        assert!(!fx.paths.dir(Subdirectory::Forms).join("Birds.xml").exists());
        assert_eq!(staging_dirs(&fx.paths), 0);
    }

    #[tokio::test]
    async fn test_authentication_aborts_cycle() {
        let fx = fixture_with(FakeServer {
            unauthorized: true,
            ..Default::default()
        });
        let err = fx
            .synchronizer(SyncMode::MatchExactly)
            .sync()
            .await
            .unwrap_err();
        assert!(err.requires_credentials());
    }

    #[tokio::test]
    async fn test_manual_mode_does_not_contact_server() {
        let fx = fixture_with(FakeServer {
            unauthorized: true,
            ..Default::default()
        });
        let report = fx.synchronizer(SyncMode::Manual).sync().await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_rejected() {
        let fx = fixture();
        fx.server.publish("birds", "Birds", "<h:html>birds</h:html>", &[]);
        fx.server.files.lock().unwrap().insert(
            "https://example.org/formXml?formId=birds".into(),
            b"<h:html>tampered</h:html>".to_vec(),
        );

        let report = fx.synchronizer(SyncMode::MatchExactly).sync().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(fx.live().is_empty());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("Birds / Trees?"), "Birds _ Trees_");
        assert_eq!(sanitize_file_name("  "), "");
        assert!(safe_media_name("../etc").is_err());
        assert!(safe_media_name("photo.jpg").is_ok());
    }
}
