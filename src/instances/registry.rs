//! Instance registry backed by `metadata/instances.db`

use super::{
    Instance, InstanceId, InstanceQuery, InstanceStatus, InstanceUpdate, NewInstance, SortOrder,
    TASK_STATUS_CLOSED,
};
use crate::error::{Error, Result};
use crate::events::{EventBus, RegistryEvent};
use crate::forms::Form;
use crate::storage::{self, now_millis, OpenOutcome, StoragePaths, Subdirectory, INSTANCES_SCHEMA};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Params, Row};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const INSTANCE_COLUMNS: &str = "id, display_name, status, last_status_change_date, \
     instance_file_path, form_identifier, form_version, deleted_date, geometry_type, geometry, \
     task_status";

const DEFAULT_PAGE_SIZE: usize = 50;

/// Typed access to the instances table; all writes go through one connection
pub struct InstanceRegistry {
    conn: Mutex<Connection>,
    paths: StoragePaths,
    events: EventBus,
}

impl InstanceRegistry {
    pub fn open(paths: &StoragePaths, events: EventBus) -> Result<Self> {
        let conn = storage::open_registry(&paths.instances_db(), &INSTANCES_SCHEMA)?;
        Ok(Self::with_connection(conn, paths, events))
    }

    pub fn open_or_recreate(paths: &StoragePaths, events: EventBus) -> Result<(Self, OpenOutcome)> {
        let (conn, outcome) =
            storage::open_registry_or_recreate(&paths.instances_db(), &INSTANCES_SCHEMA)?;
        Ok((Self::with_connection(conn, paths, events), outcome))
    }

    /// Registry with an in-memory database (for testing)
    pub fn open_in_memory(paths: &StoragePaths, events: EventBus) -> Result<Self> {
        let conn = storage::open_registry_in_memory(&INSTANCES_SCHEMA)?;
        Ok(Self::with_connection(conn, paths, events))
    }

    fn with_connection(conn: Connection, paths: &StoragePaths, events: EventBus) -> Self {
        Self {
            conn: Mutex::new(conn),
            paths: paths.clone(),
            events,
        }
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ==================== Inserts ====================

    /// Start a new instance of `form`.
    ///
    /// The form identifier and version are copied onto the row. Without an
    /// explicit path a fresh directory `instances/<form>_<timestamp>/` is made.
    pub fn create(&self, form: &Form, values: NewInstance) -> Result<InstanceId> {
        let status = values.status.unwrap_or(InstanceStatus::Incomplete);
        if status != InstanceStatus::Incomplete {
            return Err(Error::validation(format!(
                "new instances start as {}, not {}",
                InstanceStatus::Incomplete,
                status
            )));
        }

        let instance_file = match values.instance_file_path {
            Some(path) => {
                let path = std::path::absolute(path)?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                path
            }
            None => self.allocate_instance_file(form)?,
        };

        let display_name = values
            .display_name
            .unwrap_or_else(|| form.display_name.clone());
        let date = values.last_status_change_date.unwrap_or_else(now_millis);

        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO instances (
                display_name, status, last_status_change_date, instance_file_path,
                form_identifier, form_version, geometry_type, geometry
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                display_name,
                status.as_str(),
                date,
                self.paths.to_db_path(Subdirectory::Instances, &instance_file),
                form.form_identifier,
                form.version,
                values.geometry_type,
                values.geometry,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        tracing::info!(
            instance_id = id,
            form_identifier = %form.form_identifier,
            path = %instance_file.display(),
            "created instance"
        );
        self.events.publish(RegistryEvent::InstanceChanged { id });
        Ok(id)
    }

    fn allocate_instance_file(&self, form: &Form) -> Result<PathBuf> {
        let base = form
            .form_file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| form.form_identifier.clone());
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        let root = self.paths.dir(Subdirectory::Instances);
        std::fs::create_dir_all(&root)?;

        let mut attempt = 1;
        loop {
            let name = if attempt == 1 {
                format!("{}_{}", base, stamp)
            } else {
                format!("{}_{}_{}", base, stamp, attempt)
            };
            let dir = root.join(&name);
            match std::fs::create_dir(&dir) {
                Ok(()) => return Ok(dir.join(format!("{}.xml", name))),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ==================== Queries ====================

    /// Row by id; `None` when absent
    pub fn get(&self, id: InstanceId) -> Result<Option<Instance>> {
        let conn = self.conn();
        self.query_one(&conn, id)
    }

    /// Lazy listing of rows matching `query`
    pub fn list(&self, query: InstanceQuery) -> InstanceList<'_> {
        InstanceList {
            registry: self,
            query,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Live rows in the given order
    pub fn list_active(&self, sort: SortOrder) -> InstanceList<'_> {
        self.list(InstanceQuery::active(sort))
    }

    pub fn list_by_form_identifier(&self, form_identifier: &str) -> InstanceList<'_> {
        self.list(InstanceQuery::for_form(form_identifier))
    }

    /// Finalized rows waiting for the server, oldest first
    pub fn list_sendable(&self) -> Result<Vec<Instance>> {
        let query = InstanceQuery {
            sort: SortOrder::DateAsc,
            ..InstanceQuery::default()
        }
        .with_statuses(&[InstanceStatus::Complete, InstanceStatus::SubmissionFailed]);
        self.list(query).iter().collect()
    }

    /// Live rows created against this form identifier and version
    pub fn count_for_form(&self, form_identifier: &str, version: Option<&str>) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM instances \
             WHERE form_identifier = ?1 AND form_version IS ?2 AND deleted_date IS NULL",
            params![form_identifier, version],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn count_matching(&self, query: &InstanceQuery) -> Result<usize> {
        let (clause, values) = where_clause(query);
        let conn = self.conn();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM instances WHERE {}", clause),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn fetch_page(&self, query: &InstanceQuery, offset: usize, limit: usize) -> Result<Vec<Instance>> {
        let (clause, values) = where_clause(query);
        let sql = format!(
            "SELECT {} FROM instances WHERE {} ORDER BY {} LIMIT {} OFFSET {}",
            INSTANCE_COLUMNS,
            clause,
            query.sort.order_by(),
            limit,
            offset
        );
        let conn = self.conn();
        self.query_all(&conn, &sql, params_from_iter(values.iter()))
    }

    fn query_one(&self, conn: &Connection, id: InstanceId) -> Result<Option<Instance>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM instances WHERE id = ?1", INSTANCE_COLUMNS),
                params![id],
                InstanceRow::from_row,
            )
            .optional()?;
        row.map(|r| r.into_instance(&self.paths)).transpose()
    }

    fn query_all<P: Params>(&self, conn: &Connection, sql: &str, params: P) -> Result<Vec<Instance>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, InstanceRow::from_row)?;

        let mut instances = Vec::new();
        for row in rows {
            instances.push(row?.into_instance(&self.paths)?);
        }
        Ok(instances)
    }

    fn require(&self, conn: &Connection, id: InstanceId) -> Result<Instance> {
        self.query_one(conn, id)?.ok_or(Error::NotFound {
            entity: "instance",
            id,
        })
    }

    // ==================== Updates ====================

    /// Move an instance along the state machine and stamp the change time
    pub fn update_status(&self, id: InstanceId, status: InstanceStatus) -> Result<()> {
        let conn = self.conn();
        let instance = self.require(&conn, id)?;

        if instance.is_deleted() {
            return Err(Error::InvalidTransition {
                from: "DELETED".to_string(),
                to: status.to_string(),
            });
        }
        if !instance.status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                from: instance.status.to_string(),
                to: status.to_string(),
            });
        }

        conn.execute(
            "UPDATE instances SET status = ?1, last_status_change_date = ?2 WHERE id = ?3",
            params![status.as_str(), now_millis(), id],
        )?;
        drop(conn);

        tracing::debug!(instance_id = id, from = %instance.status, to = %status, "status changed");
        self.events.publish(RegistryEvent::InstanceChanged { id });
        Ok(())
    }

    /// Change non-status fields of a live instance
    pub fn update(&self, id: InstanceId, update: InstanceUpdate) -> Result<()> {
        let conn = self.conn();
        let instance = self.require(&conn, id)?;
        if instance.is_deleted() {
            return Err(Error::validation(format!("instance {} is deleted", id)));
        }

        let mut sets: Vec<(&'static str, Value)> = Vec::new();
        if let Some(name) = update.display_name {
            sets.push(("display_name", Value::Text(name)));
        }
        if let Some(path) = update.instance_file_path {
            let path = std::path::absolute(path)?;
            sets.push((
                "instance_file_path",
                Value::Text(self.paths.to_db_path(Subdirectory::Instances, &path)),
            ));
        }
        if let Some(kind) = update.geometry_type {
            sets.push(("geometry_type", Value::Text(kind)));
        }
        if let Some(geometry) = update.geometry {
            sets.push(("geometry", Value::Text(geometry)));
        }
        sets.push(("last_status_change_date", Value::Integer(now_millis())));

        let assignments: Vec<String> = sets
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = ?{}", column, i + 1))
            .collect();
        let sql = format!(
            "UPDATE instances SET {} WHERE id = ?{}",
            assignments.join(", "),
            sets.len() + 1
        );
        let mut values: Vec<Value> = sets.into_iter().map(|(_, value)| value).collect();
        values.push(Value::Integer(id));

        conn.execute(&sql, params_from_iter(values.iter()))?;
        drop(conn);

        self.events.publish(RegistryEvent::InstanceChanged { id });
        Ok(())
    }

    // ==================== Deletes ====================

    /// Retire an instance while keeping its row.
    ///
    /// Submitted work keeps its XML for audit; only attachments and geometry
    /// are scrubbed. Anything else loses its whole directory and has its task
    /// closed. A second call on a deleted instance changes nothing.
    pub fn soft_delete(&self, id: InstanceId) -> Result<()> {
        let conn = self.conn();
        let instance = self.require(&conn, id)?;
        if instance.is_deleted() {
            return Ok(());
        }

        if instance.status == InstanceStatus::Submitted {
            self.remove_attachments(&instance)?;
            conn.execute(
                "UPDATE instances SET deleted_date = ?1, geometry_type = NULL, geometry = NULL \
                 WHERE id = ?2",
                params![now_millis(), id],
            )?;
        } else {
            self.remove_instance_files(&instance)?;
            conn.execute(
                "UPDATE instances SET deleted_date = ?1, geometry_type = NULL, geometry = NULL, \
                 task_status = ?2 WHERE id = ?3",
                params![now_millis(), TASK_STATUS_CLOSED, id],
            )?;
        }
        drop(conn);

        tracing::info!(instance_id = id, status = %instance.status, "soft-deleted instance");
        self.events.publish(RegistryEvent::InstanceChanged { id });
        Ok(())
    }

    /// Physically remove matching rows and their directories
    pub fn purge(&self, query: &InstanceQuery) -> Result<usize> {
        let (clause, values) = where_clause(query);
        let mut conn = self.conn();
        let instances = self.query_all(
            &conn,
            &format!("SELECT {} FROM instances WHERE {}", INSTANCE_COLUMNS, clause),
            params_from_iter(values.iter()),
        )?;
        if instances.is_empty() {
            return Ok(0);
        }

        let tx = conn.transaction()?;
        for instance in &instances {
            tx.execute("DELETE FROM instances WHERE id = ?1", params![instance.id])?;
        }
        tx.commit()?;

        for instance in &instances {
            self.remove_instance_files(instance)?;
        }
        drop(conn);

        tracing::info!(count = instances.len(), "purged instances");
        for instance in &instances {
            self.events
                .publish(RegistryEvent::InstanceChanged { id: instance.id });
        }
        Ok(instances.len())
    }

    /// Physically remove one row and its directory
    pub fn delete(&self, id: InstanceId) -> Result<()> {
        let conn = self.conn();
        let instance = self.require(&conn, id)?;
        conn.execute("DELETE FROM instances WHERE id = ?1", params![id])?;
        self.remove_instance_files(&instance)?;
        drop(conn);

        tracing::info!(instance_id = id, "deleted instance");
        self.events.publish(RegistryEvent::InstanceChanged { id });
        Ok(())
    }

    /// The instance directory, when it is a dedicated directory under `instances/`
    fn owned_dir(&self, instance: &Instance) -> Option<PathBuf> {
        let root = self.paths.dir(Subdirectory::Instances);
        instance
            .instance_dir()
            .filter(|dir| dir.starts_with(&root) && *dir != root.as_path())
            .map(|dir| dir.to_path_buf())
    }

    fn remove_instance_files(&self, instance: &Instance) -> Result<()> {
        match self.owned_dir(instance) {
            Some(dir) => storage::remove_path(&dir),
            None => storage::remove_path(&instance.instance_file_path),
        }
    }

    fn remove_attachments(&self, instance: &Instance) -> Result<()> {
        let Some(dir) = self.owned_dir(instance) else {
            return Ok(());
        };
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path != instance.instance_file_path {
                storage::remove_path(&path)?;
            }
        }
        Ok(())
    }
}

/// A finite listing that can be iterated any number of times.
///
/// Rows are fetched a page at a time as the iterator advances.
pub struct InstanceList<'a> {
    registry: &'a InstanceRegistry,
    query: InstanceQuery,
    page_size: usize,
}

impl<'a> InstanceList<'a> {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn query(&self) -> &InstanceQuery {
        &self.query
    }

    /// Start a fresh pass from the first row
    pub fn iter(&self) -> InstanceIter<'a> {
        InstanceIter {
            registry: self.registry,
            query: self.query.clone(),
            page_size: self.page_size,
            offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn count(&self) -> Result<usize> {
        self.registry.count_matching(&self.query)
    }

    pub fn to_vec(&self) -> Result<Vec<Instance>> {
        self.iter().collect()
    }
}

pub struct InstanceIter<'a> {
    registry: &'a InstanceRegistry,
    query: InstanceQuery,
    page_size: usize,
    offset: usize,
    buffer: VecDeque<Instance>,
    exhausted: bool,
}

impl Iterator for InstanceIter<'_> {
    type Item = Result<Instance>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self
                .registry
                .fetch_page(&self.query, self.offset, self.page_size)
            {
                Ok(page) => {
                    if page.len() < self.page_size {
                        self.exhausted = true;
                    }
                    self.offset += page.len();
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

fn where_clause(query: &InstanceQuery) -> (String, Vec<Value>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if !query.include_deleted {
        conditions.push("deleted_date IS NULL".to_string());
    }
    if let Some(identifier) = &query.form_identifier {
        values.push(Value::Text(identifier.clone()));
        conditions.push(format!("form_identifier = ?{}", values.len()));
        if let Some(version) = &query.form_version {
            values.push(Value::Text(version.clone()));
            conditions.push(format!("form_version = ?{}", values.len()));
        }
    }
    if !query.statuses.is_empty() {
        let mut placeholders = Vec::new();
        for status in &query.statuses {
            values.push(Value::Text(status.as_str().to_string()));
            placeholders.push(format!("?{}", values.len()));
        }
        conditions.push(format!("status IN ({})", placeholders.join(", ")));
    }

    if conditions.is_empty() {
        ("1 = 1".to_string(), values)
    } else {
        (conditions.join(" AND "), values)
    }
}

/// Internal row struct for database queries
struct InstanceRow {
    id: i64,
    display_name: String,
    status: String,
    last_status_change_date: i64,
    instance_file_path: String,
    form_identifier: String,
    form_version: Option<String>,
    deleted_date: Option<i64>,
    geometry_type: Option<String>,
    geometry: Option<String>,
    task_status: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            display_name: row.get(1)?,
            status: row.get(2)?,
            last_status_change_date: row.get(3)?,
            instance_file_path: row.get(4)?,
            form_identifier: row.get(5)?,
            form_version: row.get(6)?,
            deleted_date: row.get(7)?,
            geometry_type: row.get(8)?,
            geometry: row.get(9)?,
            task_status: row.get(10)?,
        })
    }

    fn into_instance(self, paths: &StoragePaths) -> Result<Instance> {
        let status =
            InstanceStatus::parse(&self.status).ok_or_else(|| Error::StorageCorruption {
                path: paths.instances_db(),
                reason: format!("instance {} has unknown status {:?}", self.id, self.status),
            })?;

        Ok(Instance {
            id: self.id,
            display_name: self.display_name,
            status,
            last_status_change_date: self.last_status_change_date,
            instance_file_path: paths.to_absolute(Subdirectory::Instances, &self.instance_file_path),
            form_identifier: self.form_identifier,
            form_version: self.form_version,
            deleted_date: self.deleted_date,
            geometry_type: self.geometry_type,
            geometry: self.geometry,
            task_status: self.task_status,
        })
    }
}

/// A form row for tests that never touch the forms registry
#[cfg(test)]
pub(crate) fn sample_form(paths: &StoragePaths, identifier: &str, version: Option<&str>) -> Form {
    let form_file = paths
        .dir(Subdirectory::Forms)
        .join(format!("{}.xml", identifier));
    Form {
        id: 1,
        display_name: identifier.to_string(),
        description: None,
        form_identifier: identifier.to_string(),
        version: version.map(str::to_string),
        md5_hash: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
        date: 0,
        form_media_path: storage::media_dir_for(&form_file),
        cache_file_path: paths.cache_file_for("d41d8cd98f00b204e9800998ecf8427e"),
        form_file_path: form_file,
        language: None,
        submission_uri: None,
        public_key: None,
        auto_send: None,
        auto_delete: None,
        last_detected_version_hash: None,
        deleted: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, InstanceRegistry, Form) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = StoragePaths::new(tmp.path());
        paths.ensure_dirs().unwrap();
        let registry = InstanceRegistry::open(&paths, EventBus::new()).unwrap();
        let form = sample_form(&paths, "household", Some("3"));
        (tmp, registry, form)
    }

    fn create_with_files(registry: &InstanceRegistry, form: &Form) -> Instance {
        let id = registry.create(form, NewInstance::default()).unwrap();
        let instance = registry.get(id).unwrap().unwrap();
        std::fs::write(&instance.instance_file_path, b"<data/>").unwrap();
        std::fs::write(instance.instance_dir().unwrap().join("photo.jpg"), b"jpg").unwrap();
        instance
    }

    fn advance(registry: &InstanceRegistry, id: InstanceId, steps: &[InstanceStatus]) {
        for status in steps {
            registry.update_status(id, *status).unwrap();
        }
    }

    #[test]
    fn test_create_defaults() {
        let (_tmp, registry, form) = setup();
        let id = registry.create(&form, NewInstance::default()).unwrap();
        let instance = registry.get(id).unwrap().unwrap();

        assert_eq!(instance.status, InstanceStatus::Incomplete);
        assert_eq!(instance.display_name, "household");
        assert_eq!(instance.form_identifier, "household");
        assert_eq!(instance.form_version.as_deref(), Some("3"));
        assert!(instance.last_status_change_date > 0);
        assert!(instance.instance_dir().unwrap().is_dir());
        assert!(instance
            .instance_file_path
            .starts_with(registry.paths().dir(Subdirectory::Instances)));
    }

    #[test]
    fn test_create_allocates_distinct_directories() {
        let (_tmp, registry, form) = setup();
        let a = registry.create(&form, NewInstance::default()).unwrap();
        let b = registry.create(&form, NewInstance::default()).unwrap();
        let a = registry.get(a).unwrap().unwrap();
        let b = registry.get(b).unwrap().unwrap();
        assert_ne!(a.instance_dir(), b.instance_dir());
    }

    #[test]
    fn test_create_rejects_non_initial_status() {
        let (_tmp, registry, form) = setup();
        let err = registry
            .create(
                &form,
                NewInstance {
                    status: Some(InstanceStatus::Submitted),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_status_follows_state_machine() {
        let (_tmp, registry, form) = setup();
        let id = registry.create(&form, NewInstance::default()).unwrap();

        let err = registry
            .update_status(id, InstanceStatus::Submitted)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        advance(
            &registry,
            id,
            &[
                InstanceStatus::Complete,
                InstanceStatus::SubmissionFailed,
                InstanceStatus::Complete,
                InstanceStatus::Submitted,
            ],
        );

        let err = registry
            .update_status(id, InstanceStatus::Incomplete)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(
            registry.get(id).unwrap().unwrap().status,
            InstanceStatus::Submitted
        );
    }

    #[test]
    fn test_soft_delete_draft_removes_directory_once() {
        let (_tmp, registry, form) = setup();
        let instance = create_with_files(&registry, &form);
        registry
            .update(
                instance.id,
                InstanceUpdate {
                    geometry_type: Some("Point".into()),
                    geometry: Some("{\"coordinates\":[1,2]}".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        registry.soft_delete(instance.id).unwrap();
        let deleted = registry.get(instance.id).unwrap().unwrap();
        assert!(deleted.is_deleted());
        assert_eq!(deleted.task_status.as_deref(), Some(TASK_STATUS_CLOSED));
        assert!(deleted.geometry.is_none());
        assert!(!instance.instance_dir().unwrap().exists());

        registry.soft_delete(instance.id).unwrap();
        let again = registry.get(instance.id).unwrap().unwrap();
        assert_eq!(again.deleted_date, deleted.deleted_date);

        let err = registry
            .update_status(instance.id, InstanceStatus::Complete)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn test_soft_delete_submitted_keeps_xml_for_audit() {
        let (_tmp, registry, form) = setup();
        let instance = create_with_files(&registry, &form);
        advance(
            &registry,
            instance.id,
            &[InstanceStatus::Complete, InstanceStatus::Submitted],
        );

        registry.soft_delete(instance.id).unwrap();
        let deleted = registry.get(instance.id).unwrap().unwrap();
        assert!(deleted.is_deleted());
        assert_eq!(deleted.status, InstanceStatus::Submitted);
        assert!(deleted.task_status.is_none());
        assert!(instance.instance_file_path.exists());
        assert!(!instance.instance_dir().unwrap().join("photo.jpg").exists());
    }

    #[test]
    fn test_listing_is_lazy_and_restartable() {
        let (_tmp, registry, form) = setup();
        for i in 0..5 {
            registry
                .create(
                    &form,
                    NewInstance {
                        display_name: Some(format!("n{}", i)),
                        last_status_change_date: Some(i),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let list = registry.list_active(SortOrder::DateAsc).with_page_size(2);
        let first: Vec<String> = list
            .iter()
            .map(|r| r.unwrap().display_name)
            .collect();
        let second: Vec<String> = list
            .iter()
            .map(|r| r.unwrap().display_name)
            .collect();
        assert_eq!(first, vec!["n0", "n1", "n2", "n3", "n4"]);
        assert_eq!(first, second);
        assert_eq!(list.count().unwrap(), 5);
    }

    #[test]
    fn test_deleted_rows_hidden_unless_requested() {
        let (_tmp, registry, form) = setup();
        let keep = registry.create(&form, NewInstance::default()).unwrap();
        let gone = registry.create(&form, NewInstance::default()).unwrap();
        registry.soft_delete(gone).unwrap();

        let active = registry.list_active(SortOrder::NameAsc).to_vec().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, keep);

        let all = registry
            .list(InstanceQuery::active(SortOrder::NameAsc).including_deleted())
            .to_vec()
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_sendable_and_counts() {
        let (_tmp, registry, form) = setup();
        let other = sample_form(registry.paths(), "census", None);

        let draft = registry.create(&form, NewInstance::default()).unwrap();
        let done = registry.create(&form, NewInstance::default()).unwrap();
        let failed = registry.create(&other, NewInstance::default()).unwrap();
        advance(&registry, done, &[InstanceStatus::Complete]);
        advance(
            &registry,
            failed,
            &[InstanceStatus::Complete, InstanceStatus::SubmissionFailed],
        );

        let sendable: Vec<InstanceId> = registry
            .list_sendable()
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert!(sendable.contains(&done));
        assert!(sendable.contains(&failed));
        assert!(!sendable.contains(&draft));

        assert_eq!(registry.count_for_form("household", Some("3")).unwrap(), 2);
        assert_eq!(registry.count_for_form("household", Some("4")).unwrap(), 0);
        assert_eq!(registry.count_for_form("census", None).unwrap(), 1);
        assert_eq!(
            registry
                .list_by_form_identifier("census")
                .to_vec()
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_purge_removes_rows_and_directories() {
        let (_tmp, registry, form) = setup();
        let instance = create_with_files(&registry, &form);
        registry.soft_delete(instance.id).unwrap();

        let purged = registry
            .purge(&InstanceQuery::for_form("household").including_deleted())
            .unwrap();
        assert_eq!(purged, 1);
        assert!(registry.get(instance.id).unwrap().is_none());
    }

    #[test]
    fn test_delete_removes_row_and_directory() {
        let (_tmp, registry, form) = setup();
        let instance = create_with_files(&registry, &form);
        registry.delete(instance.id).unwrap();
        assert!(registry.get(instance.id).unwrap().is_none());
        assert!(!instance.instance_dir().unwrap().exists());
        assert!(matches!(
            registry.delete(instance.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_missing_ids() {
        let (_tmp, registry, _form) = setup();
        assert!(registry.get(7).unwrap().is_none());
        assert!(matches!(
            registry.update_status(7, InstanceStatus::Complete),
            Err(Error::NotFound { entity: "instance", id: 7 })
        ));
        assert!(matches!(
            registry.soft_delete(7),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            registry.update(7, InstanceUpdate::default()),
            Err(Error::NotFound { .. })
        ));
    }
}
