//! SQLite storage layer for fieldsync
//!
//! This module handles:
//! - The on-disk layout (forms, instances, cache, metadata, layers)
//! - Content hashing of form definitions and media files
//! - Opening registry databases, migrating them in one transaction, and
//!   recreating them when they are unreadable

pub mod paths;
pub mod schema;

pub use paths::{media_dir_for, StoragePaths, Subdirectory};
pub use schema::{RegistrySchema, FORMS_SCHEMA, INSTANCES_SCHEMA};

use crate::error::{Error, Result};
use rusqlite::{Connection, ErrorCode};
use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// MD5 of a byte slice as 32 lowercase hex characters
pub fn md5_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// MD5 of a file's contents, streamed
pub fn md5_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
    }
    Ok(format!("{:x}", context.finalize()))
}

/// Current time as epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// How a registry database came to be usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Opened (and migrated if needed) with its rows intact
    Opened,
    /// The old file was unreadable and was replaced by an empty registry
    Recreated { reason: String },
}

impl OpenOutcome {
    pub fn lost_data(&self) -> bool {
        matches!(self, OpenOutcome::Recreated { .. })
    }
}

/// Open a registry database and bring its schema to the current version.
///
/// Fails with [`Error::StorageCorruption`] when the file is not a readable
/// SQLite database or carries a schema newer than this build understands.
pub(crate) fn open_registry(path: &Path, schema: &RegistrySchema) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut conn = Connection::open(path).map_err(|e| classify(path, e))?;
    conn.busy_timeout(Duration::from_secs(5))?;

    check_integrity(&conn, path)?;
    migrate(&mut conn, schema, path)?;

    Ok(conn)
}

/// Like [`open_registry`], but replaces an unreadable database with an empty one.
///
/// The returned outcome must be shown to the user when it reports data loss.
pub(crate) fn open_registry_or_recreate(
    path: &Path,
    schema: &RegistrySchema,
) -> Result<(Connection, OpenOutcome)> {
    match open_registry(path, schema) {
        Ok(conn) => Ok((conn, OpenOutcome::Opened)),
        Err(Error::StorageCorruption { reason, .. }) => {
            tracing::error!(
                path = %path.display(),
                %reason,
                "registry database unreadable, recreating it; all rows are lost"
            );
            remove_database_files(path)?;
            let conn = open_registry(path, schema)?;
            Ok((conn, OpenOutcome::Recreated { reason }))
        }
        Err(e) => Err(e),
    }
}

/// In-memory registry (for testing)
pub(crate) fn open_registry_in_memory(schema: &RegistrySchema) -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    migrate(&mut conn, schema, Path::new(":memory:"))?;
    Ok(conn)
}

fn check_integrity(conn: &Connection, path: &Path) -> Result<()> {
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| classify(path, e))?;

    if verdict != "ok" {
        return Err(Error::StorageCorruption {
            path: path.to_path_buf(),
            reason: verdict,
        });
    }
    Ok(())
}

fn migrate(conn: &mut Connection, schema: &RegistrySchema, path: &Path) -> Result<()> {
    let current: u32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| classify(path, e))?;

    if current == schema.version {
        return Ok(());
    }

    if current > schema.version {
        return Err(Error::StorageCorruption {
            path: path.to_path_buf(),
            reason: format!(
                "schema version {} is newer than supported version {}",
                current, schema.version
            ),
        });
    }

    let tx = conn.transaction()?;

    let table_exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [schema.table],
        |row| row.get(0),
    )?;

    if !table_exists {
        tx.execute_batch(schema.create)?;
    } else {
        // An unversioned table predates versioning and is treated as version 1
        let from = current.max(1);
        for migration in schema.migrations.iter().filter(|m| m.version > from) {
            tracing::debug!(
                table = schema.table,
                version = migration.version,
                "applying migration"
            );
            tx.execute_batch(migration.sql)?;
        }
    }

    tx.pragma_update(None, "user_version", schema.version)?;
    tx.commit()?;

    tracing::info!(
        table = schema.table,
        from = current,
        to = schema.version,
        "registry schema ready"
    );

    Ok(())
}

fn classify(path: &Path, err: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(ref failure, _) = err {
        if matches!(
            failure.code,
            ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase
        ) {
            return Error::StorageCorruption {
                path: path.to_path_buf(),
                reason: err.to_string(),
            };
        }
    }
    Error::Database(err)
}

fn remove_database_files(path: &Path) -> Result<()> {
    let base = path.to_string_lossy().into_owned();
    for candidate in [
        base.clone(),
        format!("{}-wal", base),
        format!("{}-shm", base),
        format!("{}-journal", base),
    ] {
        match std::fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Remove a file or a whole directory tree; missing targets are fine
pub(crate) fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };

    match result {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "deleted");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
