//! Form registry backed by `metadata/forms.db`

use super::{Form, FormFilter, FormId, FormMetadata, FormUpdate};
use crate::error::{Error, Result};
use crate::events::{EventBus, RegistryEvent};
use crate::storage::{
    self, md5_file, media_dir_for, now_millis, OpenOutcome, StoragePaths, Subdirectory,
    FORMS_SCHEMA,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Params, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const FORM_COLUMNS: &str = "id, display_name, description, form_identifier, version, md5_hash, \
     date, form_file_path, form_media_path, cache_file_path, language, submission_uri, \
     public_key, auto_send, auto_delete, last_detected_version_hash, deleted";

/// Typed access to the forms table.
///
/// Every mutation runs while holding the connection lock, so a reader never
/// sees a row whose files were half replaced.
pub struct FormRegistry {
    conn: Mutex<Connection>,
    paths: StoragePaths,
    events: EventBus,
}

impl FormRegistry {
    /// Open (and migrate) the registry under `paths`
    pub fn open(paths: &StoragePaths, events: EventBus) -> Result<Self> {
        let conn = storage::open_registry(&paths.forms_db(), &FORMS_SCHEMA)?;
        Ok(Self::with_connection(conn, paths, events))
    }

    /// Open the registry, replacing it with an empty one when it is unreadable
    pub fn open_or_recreate(paths: &StoragePaths, events: EventBus) -> Result<(Self, OpenOutcome)> {
        let (conn, outcome) = storage::open_registry_or_recreate(&paths.forms_db(), &FORMS_SCHEMA)?;
        if outcome.lost_data() {
            // Registered definitions are still on disk but no longer known
            events.publish(RegistryEvent::FormsChanged);
            events.publish(RegistryEvent::LatestFormsChanged);
        }
        Ok((Self::with_connection(conn, paths, events), outcome))
    }

    /// Registry with an in-memory database (for testing)
    pub fn open_in_memory(paths: &StoragePaths, events: EventBus) -> Result<Self> {
        let conn = storage::open_registry_in_memory(&FORMS_SCHEMA)?;
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

    /// Receive an event after every committed mutation
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied statement
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.events.publish(RegistryEvent::FormsChanged);
        self.events.publish(RegistryEvent::LatestFormsChanged);
    }

    // ==================== Inserts ====================

    /// Register a definition file that already sits on disk.
    ///
    /// The content hash is always computed here; callers cannot supply it.
    pub fn register(&self, file_path: &Path, metadata: FormMetadata) -> Result<FormId> {
        if file_path.as_os_str().is_empty() {
            return Err(Error::validation("form file path is required"));
        }
        if metadata.form_identifier.trim().is_empty() {
            return Err(Error::validation("form identifier is required"));
        }

        let file_path = std::path::absolute(file_path)?;
        if !file_path.is_file() {
            return Err(Error::validation(format!(
                "form definition {} does not exist",
                file_path.display()
            )));
        }

        let md5 = md5_file(&file_path)?;
        let stored_path = self.paths.to_db_path(Subdirectory::Forms, &file_path);
        let display_name = metadata.display_name.unwrap_or_else(|| {
            file_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        let media_path = metadata
            .media_path
            .unwrap_or_else(|| media_dir_for(&file_path));
        let cache_path = metadata
            .cache_path
            .unwrap_or_else(|| self.paths.cache_file_for(&md5));
        let date = metadata.date.unwrap_or_else(now_millis);

        let conn = self.conn();

        let existing: Option<FormId> = conn
            .query_row(
                "SELECT id FROM forms WHERE form_file_path = ?1 AND deleted = 0",
                params![stored_path],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(Error::DuplicateForm { path: file_path });
        }

        conn.execute(
            r#"
            INSERT INTO forms (
                display_name, description, form_identifier, version, md5_hash, date,
                form_file_path, form_media_path, cache_file_path, language,
                submission_uri, public_key, auto_send, auto_delete
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                display_name,
                metadata.description,
                metadata.form_identifier,
                metadata.version,
                md5,
                date,
                stored_path,
                self.paths.to_db_path(Subdirectory::Forms, &media_path),
                self.paths.to_db_path(Subdirectory::Cache, &cache_path),
                metadata.language,
                metadata.submission_uri,
                metadata.public_key,
                flag_to_text(metadata.auto_send),
                flag_to_text(metadata.auto_delete),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        tracing::info!(
            form_id = id,
            form_identifier = %metadata.form_identifier,
            version = ?metadata.version,
            %md5,
            "registered form"
        );
        self.notify();

        Ok(id)
    }

    // ==================== Queries ====================

    /// Row by id; `None` when absent
    pub fn get(&self, id: FormId) -> Result<Option<Form>> {
        let conn = self.conn();
        self.query_one(
            &conn,
            &format!("SELECT {} FROM forms WHERE id = ?1", FORM_COLUMNS),
            params![id],
        )
    }

    /// A row with this content hash, preferring live rows over soft-deleted ones
    pub fn get_by_md5(&self, md5: &str) -> Result<Option<Form>> {
        let conn = self.conn();
        self.query_one(
            &conn,
            &format!(
                "SELECT {} FROM forms WHERE md5_hash = ?1 \
                 ORDER BY deleted ASC, date DESC, id DESC LIMIT 1",
                FORM_COLUMNS
            ),
            params![md5.to_lowercase()],
        )
    }

    pub fn get_by_path(&self, path: &Path) -> Result<Option<Form>> {
        let absolute = std::path::absolute(path)?;
        let stored = self.paths.to_db_path(Subdirectory::Forms, &absolute);
        let conn = self.conn();
        self.query_one(
            &conn,
            &format!(
                "SELECT {} FROM forms WHERE form_file_path = ?1 \
                 ORDER BY deleted ASC, id DESC LIMIT 1",
                FORM_COLUMNS
            ),
            params![stored],
        )
    }

    /// The form to fill now: newest live row (by date) sharing the identifier
    pub fn find_latest_by_form_identifier(&self, form_identifier: &str) -> Result<Option<Form>> {
        let conn = self.conn();
        self.query_one(
            &conn,
            &format!(
                "SELECT {} FROM forms WHERE form_identifier = ?1 AND deleted = 0 \
                 ORDER BY date DESC, id DESC LIMIT 1",
                FORM_COLUMNS
            ),
            params![form_identifier],
        )
    }

    /// Newest row for an exact identifier and version; `None` version matches unversioned rows
    pub fn find_latest_by_form_identifier_and_version(
        &self,
        form_identifier: &str,
        version: Option<&str>,
    ) -> Result<Option<Form>> {
        let conn = self.conn();
        self.query_one(
            &conn,
            &format!(
                "SELECT {} FROM forms WHERE form_identifier = ?1 AND version IS ?2 \
                 ORDER BY deleted ASC, date DESC, id DESC LIMIT 1",
                FORM_COLUMNS
            ),
            params![form_identifier, version],
        )
    }

    pub fn list(&self, filter: &FormFilter) -> Result<Vec<Form>> {
        let (clause, values) = filter_clause(filter);
        let conn = self.conn();
        self.query_all(
            &conn,
            &format!(
                "SELECT {} FROM forms WHERE {} \
                 ORDER BY display_name COLLATE NOCASE ASC, date DESC, id DESC",
                FORM_COLUMNS, clause
            ),
            params_from_iter(values.iter()),
        )
    }

    /// One live row per identifier: the newest by date
    pub fn list_latest_per_form_identifier(&self) -> Result<Vec<Form>> {
        let conn = self.conn();
        self.query_all(
            &conn,
            &format!(
                r#"
                SELECT {} FROM forms f
                WHERE f.deleted = 0 AND f.id = (
                    SELECT g.id FROM forms g
                    WHERE g.form_identifier = f.form_identifier AND g.deleted = 0
                    ORDER BY g.date DESC, g.id DESC LIMIT 1
                )
                ORDER BY f.display_name COLLATE NOCASE ASC
                "#,
                FORM_COLUMNS
            ),
            [],
        )
    }

    fn query_one<P: Params>(&self, conn: &Connection, sql: &str, params: P) -> Result<Option<Form>> {
        let row = conn.query_row(sql, params, FormRow::from_row).optional()?;
        Ok(row.map(|r| r.into_form(&self.paths)))
    }

    fn query_all<P: Params>(&self, conn: &Connection, sql: &str, params: P) -> Result<Vec<Form>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, FormRow::from_row)?;

        let mut forms = Vec::new();
        for row in rows {
            forms.push(row?.into_form(&self.paths));
        }
        Ok(forms)
    }

    fn require(&self, conn: &Connection, id: FormId) -> Result<Form> {
        self.query_one(
            conn,
            &format!("SELECT {} FROM forms WHERE id = ?1", FORM_COLUMNS),
            params![id],
        )?
        .ok_or(Error::NotFound { entity: "form", id })
    }

    // ==================== Updates ====================

    /// Apply field changes to one row.
    ///
    /// A new definition path recomputes the hash. After the row is rewritten,
    /// the old definition and the old compiled cache are deleted unless
    /// another row still points at them.
    pub fn update(&self, id: FormId, update: FormUpdate) -> Result<()> {
        let conn = self.conn();
        let existing = self.require(&conn, id)?;
        if update.is_empty() {
            return Ok(());
        }

        let mut sets: Vec<(&'static str, Value)> = Vec::new();
        let mut stale: Vec<(&'static str, Subdirectory, PathBuf)> = Vec::new();

        if let Some(new_path) = &update.form_file_path {
            let new_path = std::path::absolute(new_path)?;
            if !new_path.is_file() {
                return Err(Error::validation(format!(
                    "form definition {} does not exist",
                    new_path.display()
                )));
            }
            let stored_path = self.paths.to_db_path(Subdirectory::Forms, &new_path);
            let taken: Option<FormId> = conn
                .query_row(
                    "SELECT id FROM forms WHERE form_file_path = ?1 AND deleted = 0 AND id != ?2",
                    params![stored_path, id],
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Err(Error::DuplicateForm { path: new_path });
            }
            let md5 = md5_file(&new_path)?;

            if !same_path_ignoring_case(&new_path, &existing.form_file_path) {
                stale.push((
                    "form_file_path",
                    Subdirectory::Forms,
                    existing.form_file_path.clone(),
                ));
            }
            stale.push((
                "cache_file_path",
                Subdirectory::Cache,
                existing.cache_file_path.clone(),
            ));

            let cache = update
                .cache_file_path
                .clone()
                .unwrap_or_else(|| self.paths.cache_file_for(&md5));
            sets.push(("form_file_path", Value::Text(stored_path)));
            sets.push(("md5_hash", Value::Text(md5)));
            sets.push((
                "cache_file_path",
                Value::Text(self.paths.to_db_path(Subdirectory::Cache, &cache)),
            ));
        } else if let Some(cache) = &update.cache_file_path {
            if *cache != existing.cache_file_path {
                stale.push((
                    "cache_file_path",
                    Subdirectory::Cache,
                    existing.cache_file_path.clone(),
                ));
            }
            sets.push((
                "cache_file_path",
                Value::Text(self.paths.to_db_path(Subdirectory::Cache, cache)),
            ));
        }

        if let Some(media) = &update.form_media_path {
            sets.push((
                "form_media_path",
                Value::Text(self.paths.to_db_path(Subdirectory::Forms, media)),
            ));
        }

        let text_fields = [
            ("display_name", &update.display_name),
            ("description", &update.description),
            ("version", &update.version),
            ("submission_uri", &update.submission_uri),
            ("public_key", &update.public_key),
            ("language", &update.language),
            ("last_detected_version_hash", &update.last_detected_version_hash),
        ];
        for (column, value) in text_fields {
            if let Some(value) = value {
                sets.push((column, Value::Text(value.clone())));
            }
        }
        if let Some(flag) = update.auto_send {
            sets.push(("auto_send", Value::Text(flag.to_string())));
        }
        if let Some(flag) = update.auto_delete {
            sets.push(("auto_delete", Value::Text(flag.to_string())));
        }

        let assignments: Vec<String> = sets
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = ?{}", column, i + 1))
            .collect();
        let sql = format!(
            "UPDATE forms SET {} WHERE id = ?{}",
            assignments.join(", "),
            sets.len() + 1
        );
        let mut values: Vec<Value> = sets.into_iter().map(|(_, value)| value).collect();
        values.push(Value::Integer(id));

        conn.execute(&sql, params_from_iter(values.iter()))?;

        for (column, subdir, path) in &stale {
            let stored = self.paths.to_db_path(*subdir, path);
            if !is_referenced(&conn, column, &stored, false)? {
                storage::remove_path(path)?;
            }
        }
        drop(conn);

        tracing::debug!(form_id = id, "updated form");
        self.notify();
        Ok(())
    }

    // ==================== Deletes ====================

    /// Remove a row together with its definition, cache, media and dataset caches
    pub fn delete(&self, id: FormId) -> Result<()> {
        let conn = self.conn();
        let form = self.require(&conn, id)?;

        conn.execute("DELETE FROM forms WHERE id = ?1", params![id])?;
        self.remove_unreferenced_files(&conn, &form)?;
        drop(conn);

        tracing::info!(form_id = id, form_identifier = %form.form_identifier, "deleted form");
        self.notify();
        Ok(())
    }

    /// Remove every row matching `filter`; returns how many were removed
    pub fn delete_where(&self, filter: &FormFilter) -> Result<usize> {
        let (clause, values) = filter_clause(filter);
        let mut conn = self.conn();
        let forms = self.query_all(
            &conn,
            &format!("SELECT {} FROM forms WHERE {}", FORM_COLUMNS, clause),
            params_from_iter(values.iter()),
        )?;
        if forms.is_empty() {
            return Ok(0);
        }

        let tx = conn.transaction()?;
        for form in &forms {
            tx.execute("DELETE FROM forms WHERE id = ?1", params![form.id])?;
        }
        tx.commit()?;

        for form in &forms {
            self.remove_unreferenced_files(&conn, form)?;
        }
        drop(conn);

        tracing::info!(count = forms.len(), ?filter, "deleted forms");
        self.notify();
        Ok(forms.len())
    }

    /// Hide a form: the definition and compiled cache go, the row stays.
    ///
    /// Deleting an already hidden form does nothing.
    pub fn soft_delete(&self, id: FormId) -> Result<()> {
        let conn = self.conn();
        let form = self.require(&conn, id)?;
        if form.deleted {
            return Ok(());
        }

        conn.execute("UPDATE forms SET deleted = 1 WHERE id = ?1", params![id])?;
        storage::remove_path(&form.form_file_path)?;
        let cache = self.paths.to_db_path(Subdirectory::Cache, &form.cache_file_path);
        if !is_referenced(&conn, "cache_file_path", &cache, true)? {
            storage::remove_path(&form.cache_file_path)?;
        }
        drop(conn);

        tracing::info!(form_id = id, form_identifier = %form.form_identifier, "soft-deleted form");
        self.notify();
        Ok(())
    }

    /// Make a soft-deleted form live again. The caller puts the definition back.
    pub fn restore(&self, id: FormId) -> Result<()> {
        let conn = self.conn();
        let form = self.require(&conn, id)?;
        if !form.deleted {
            return Ok(());
        }

        let stored = self.paths.to_db_path(Subdirectory::Forms, &form.form_file_path);
        if is_referenced(&conn, "form_file_path", &stored, true)? {
            return Err(Error::DuplicateForm {
                path: form.form_file_path,
            });
        }

        conn.execute("UPDATE forms SET deleted = 0 WHERE id = ?1", params![id])?;
        drop(conn);

        tracing::info!(form_id = id, "restored form");
        self.notify();
        Ok(())
    }

    /// Physically remove every soft-deleted row
    pub fn purge_deleted(&self) -> Result<usize> {
        self.delete_where(&FormFilter::Deleted)
    }

    /// Delete files of a removed row that no remaining row points at
    fn remove_unreferenced_files(&self, conn: &Connection, form: &Form) -> Result<()> {
        let stored = self.paths.to_db_path(Subdirectory::Forms, &form.form_file_path);
        if !is_referenced(conn, "form_file_path", &stored, false)? {
            storage::remove_path(&form.form_file_path)?;
        }

        let media = self.paths.to_db_path(Subdirectory::Forms, &form.form_media_path);
        if !is_referenced(conn, "form_media_path", &media, false)? {
            storage::remove_path(&form.form_media_path)?;
            storage::remove_path(&self.paths.external_cache_dir(&form.form_media_path))?;
        }

        let cache = self.paths.to_db_path(Subdirectory::Cache, &form.cache_file_path);
        if !is_referenced(conn, "cache_file_path", &cache, false)? {
            storage::remove_path(&form.cache_file_path)?;
        }
        Ok(())
    }
}

fn is_referenced(conn: &Connection, column: &str, stored: &str, live_only: bool) -> Result<bool> {
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM forms WHERE {} = ?1{})",
        column,
        if live_only { " AND deleted = 0" } else { "" }
    );
    Ok(conn.query_row(&sql, params![stored], |row| row.get(0))?)
}

fn filter_clause(filter: &FormFilter) -> (&'static str, Vec<Value>) {
    match filter {
        FormFilter::All => ("1 = 1", Vec::new()),
        FormFilter::Live => ("deleted = 0", Vec::new()),
        FormFilter::Deleted => ("deleted = 1", Vec::new()),
        FormFilter::Identifier(id) => ("form_identifier = ?1", vec![Value::Text(id.clone())]),
        FormFilter::IdentifierAndVersion(id, version) => (
            "form_identifier = ?1 AND version IS ?2",
            vec![
                Value::Text(id.clone()),
                version.clone().map(Value::Text).unwrap_or(Value::Null),
            ],
        ),
        FormFilter::Md5(hash) => ("md5_hash = ?1", vec![Value::Text(hash.to_lowercase())]),
    }
}

fn flag_to_text(flag: Option<bool>) -> Option<String> {
    flag.map(|f| f.to_string())
}

fn text_to_flag(text: Option<String>) -> Option<bool> {
    text.map(|t| t.trim().eq_ignore_ascii_case("true"))
}

fn same_path_ignoring_case(a: &Path, b: &Path) -> bool {
    a.to_string_lossy()
        .eq_ignore_ascii_case(&b.to_string_lossy())
}

/// Internal row struct for database queries
struct FormRow {
    id: i64,
    display_name: String,
    description: Option<String>,
    form_identifier: String,
    version: Option<String>,
    md5_hash: String,
    date: i64,
    form_file_path: String,
    form_media_path: String,
    cache_file_path: String,
    language: Option<String>,
    submission_uri: Option<String>,
    public_key: Option<String>,
    auto_send: Option<String>,
    auto_delete: Option<String>,
    last_detected_version_hash: Option<String>,
    deleted: bool,
}

impl FormRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            display_name: row.get(1)?,
            description: row.get(2)?,
            form_identifier: row.get(3)?,
            version: row.get(4)?,
            md5_hash: row.get(5)?,
            date: row.get(6)?,
            form_file_path: row.get(7)?,
            form_media_path: row.get(8)?,
            cache_file_path: row.get(9)?,
            language: row.get(10)?,
            submission_uri: row.get(11)?,
            public_key: row.get(12)?,
            auto_send: row.get(13)?,
            auto_delete: row.get(14)?,
            last_detected_version_hash: row.get(15)?,
            deleted: row.get(16)?,
        })
    }

    fn into_form(self, paths: &StoragePaths) -> Form {
        Form {
            id: self.id,
            display_name: self.display_name,
            description: self.description,
            form_identifier: self.form_identifier,
            version: self.version,
            md5_hash: self.md5_hash,
            date: self.date,
            form_file_path: paths.to_absolute(Subdirectory::Forms, &self.form_file_path),
            form_media_path: paths.to_absolute(Subdirectory::Forms, &self.form_media_path),
            cache_file_path: paths.to_absolute(Subdirectory::Cache, &self.cache_file_path),
            language: self.language,
            submission_uri: self.submission_uri,
            public_key: self.public_key,
            auto_send: text_to_flag(self.auto_send),
            auto_delete: text_to_flag(self.auto_delete),
            last_detected_version_hash: self.last_detected_version_hash,
            deleted: self.deleted,
        }
    }
}

/// Write a definition into the forms directory (shared test helper)
#[cfg(test)]
pub(crate) fn write_form_file(
    paths: &StoragePaths,
    name: &str,
    content: &str,
) -> std::path::PathBuf {
    let path = paths.dir(Subdirectory::Forms).join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    path
}
