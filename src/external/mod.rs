//! Read-only datasets built from the CSV files bundled with a form
//!
//! Each `*.csv` in a form's media directory becomes one SQLite table kept
//! under the cache directory. A table is rebuilt only when the CSV content
//! hash changes.

use crate::error::{Error, Result};
use crate::storage::{self, md5_file, StoragePaths};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

const DATASET_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dataset_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dataset_columns (
    position INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    safe_name TEXT NOT NULL
);
"#;

/// Prefix for column names inside the dataset table
pub const COLUMN_PREFIX: &str = "c_";

/// How a search value is compared against the queried columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    Contains,
    /// Exact match
    Matches,
    StartsWith,
    EndsWith,
}

impl SearchType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "contains" => Some(SearchType::Contains),
            "matches" => Some(SearchType::Matches),
            "startswith" => Some(SearchType::StartsWith),
            "endswith" => Some(SearchType::EndsWith),
            _ => None,
        }
    }

    fn pattern(&self, value: &str) -> String {
        let escaped = escape_like(value);
        match self {
            SearchType::Contains => format!("%{}%", escaped),
            SearchType::Matches => value.to_string(),
            SearchType::StartsWith => format!("{}%", escaped),
            SearchType::EndsWith => format!("%{}", escaped),
        }
    }
}

/// A search over one dataset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// `None` returns every row (subject to the filter)
    pub search_type: Option<SearchType>,
    pub value: String,
    /// Columns compared against `value`; any match selects the row
    pub queried_columns: Vec<String>,
    /// Extra `column = value` condition
    pub filter: Option<(String, String)>,
}

impl SearchQuery {
    pub fn new(search_type: SearchType, value: &str, columns: &[&str]) -> Self {
        Self {
            search_type: Some(search_type),
            value: value.to_string(),
            queried_columns: columns.iter().map(|c| c.to_string()).collect(),
            filter: None,
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, column: &str, value: &str) -> Self {
        self.filter = Some((column.to_string(), value.to_string()));
        self
    }
}

/// One dataset row, keyed by the original CSV column names
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetRow {
    /// 1-based position in the CSV
    pub index: i64,
    pub fields: BTreeMap<String, String>,
}

impl DatasetRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }
}

struct Dataset {
    conn: Connection,
    /// (original name, safe name) in CSV order
    columns: Vec<(String, String)>,
}

impl Dataset {
    fn safe_column(&self, dataset: &str, column: &str) -> Result<&str> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, safe)| safe.as_str())
            .ok_or_else(|| {
                Error::validation(format!("dataset {} has no column {}", dataset, column))
            })
    }
}

/// Datasets of one form, open for the length of a fill session
pub struct ExternalDataSession {
    media_dir: PathBuf,
    cache_dir: PathBuf,
    datasets: HashMap<String, Dataset>,
}

impl ExternalDataSession {
    /// Import (or reuse) every CSV in `media_dir`
    pub fn open(paths: &StoragePaths, media_dir: &Path) -> Result<Self> {
        let cache_dir = paths.external_cache_dir(media_dir);
        let mut datasets = HashMap::new();

        if media_dir.is_dir() {
            let mut csv_files: Vec<PathBuf> = std::fs::read_dir(media_dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| {
                    path.is_file()
                        && path
                            .extension()
                            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
                })
                .collect();
            csv_files.sort();

            if !csv_files.is_empty() {
                std::fs::create_dir_all(&cache_dir)?;
            }
            for csv_file in csv_files {
                let name = csv_file
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let dataset = load_dataset(&csv_file, &cache_dir.join(format!("{}.db", name)))?;
                datasets.insert(name, dataset);
            }
        }

        tracing::debug!(
            media_dir = %media_dir.display(),
            datasets = datasets.len(),
            "opened external data session"
        );

        Ok(Self {
            media_dir: media_dir.to_path_buf(),
            cache_dir,
            datasets,
        })
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Dataset names, sorted
    pub fn dataset_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.datasets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Original CSV column names in file order
    pub fn columns(&self, dataset: &str) -> Result<Vec<String>> {
        let data = self.dataset(dataset)?;
        Ok(data.columns.iter().map(|(name, _)| name.clone()).collect())
    }

    /// Rows matching `query` in CSV order
    pub fn search(&self, dataset: &str, query: &SearchQuery) -> Result<Vec<DatasetRow>> {
        let data = self.dataset(dataset)?;
        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(search_type) = query.search_type {
            if query.queried_columns.is_empty() {
                return Err(Error::validation("search needs at least one queried column"));
            }
            let pattern = search_type.pattern(&query.value);
            let mut alternatives = Vec::new();
            for column in &query.queried_columns {
                let safe = data.safe_column(dataset, column)?;
                values.push(Value::Text(pattern.clone()));
                alternatives.push(match search_type {
                    SearchType::Matches => format!("{} = ?{}", safe, values.len()),
                    _ => format!("{} LIKE ?{} ESCAPE '\\'", safe, values.len()),
                });
            }
            conditions.push(format!("({})", alternatives.join(" OR ")));
        }

        if let Some((column, value)) = &query.filter {
            let safe = data.safe_column(dataset, column)?;
            values.push(Value::Text(value.clone()));
            conditions.push(format!("{} = ?{}", safe, values.len()));
        }

        let select: Vec<&str> = data.columns.iter().map(|(_, safe)| safe.as_str()).collect();
        let sql = format!(
            "SELECT _row, {} FROM dataset_rows{} ORDER BY _row",
            select.join(", "),
            if conditions.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", conditions.join(" AND "))
            }
        );

        let mut stmt = data.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let mut fields = BTreeMap::new();
            for (i, (name, _)) in data.columns.iter().enumerate() {
                let value: Option<String> = row.get(i + 1)?;
                fields.insert(name.clone(), value.unwrap_or_default());
            }
            results.push(DatasetRow {
                index: row.get(0)?,
                fields,
            });
        }
        Ok(results)
    }

    /// First value of `return_column` in a row whose `key_column` equals `key_value`
    pub fn lookup(
        &self,
        dataset: &str,
        return_column: &str,
        key_column: &str,
        key_value: &str,
    ) -> Result<Option<String>> {
        let data = self.dataset(dataset)?;
        let ret = data.safe_column(dataset, return_column)?;
        let key = data.safe_column(dataset, key_column)?;

        let value = data
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM dataset_rows WHERE {} = ?1 ORDER BY _row LIMIT 1",
                    ret, key
                ),
                params![key_value],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    /// End the session. Dropping the session has the same effect.
    pub fn close(self) {
        tracing::debug!(media_dir = %self.media_dir.display(), "closed external data session");
    }

    /// Remove the cached tables of a form's media directory
    pub fn purge_cache(paths: &StoragePaths, media_dir: &Path) -> Result<()> {
        storage::remove_path(&paths.external_cache_dir(media_dir))
    }

    fn dataset(&self, name: &str) -> Result<&Dataset> {
        self.datasets
            .get(name)
            .ok_or_else(|| Error::validation(format!("no external dataset named {}", name)))
    }
}

fn load_dataset(csv_file: &Path, db_file: &Path) -> Result<Dataset> {
    let md5 = md5_file(csv_file)?;

    if db_file.exists() {
        match Connection::open(db_file).and_then(|conn| {
            let stored: Option<String> = conn
                .query_row(
                    "SELECT value FROM dataset_meta WHERE key = 'md5'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok((conn, stored))
        }) {
            Ok((conn, Some(stored))) if stored == md5 => {
                let columns = read_columns(&conn)?;
                tracing::debug!(csv = %csv_file.display(), "reusing imported dataset");
                return Ok(Dataset { conn, columns });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(db = %db_file.display(), error = %e, "discarding unreadable dataset cache");
            }
        }
        storage::remove_path(db_file)?;
    }

    import_csv(csv_file, db_file, &md5)
}

fn read_columns(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT name, safe_name FROM dataset_columns ORDER BY position")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    Ok(columns)
}

fn import_csv(csv_file: &Path, db_file: &Path, md5: &str) -> Result<Dataset> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(csv_file)?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(Error::validation(format!(
            "{} has no header row",
            csv_file.display()
        )));
    }

    let mut columns: Vec<(String, String)> = Vec::with_capacity(headers.len());
    for header in headers {
        let mut safe = to_safe_column_name(&header);
        let base = safe.clone();
        let mut n = 2;
        while columns.iter().any(|(_, existing)| *existing == safe) {
            safe = format!("{}_{}", base, n);
            n += 1;
        }
        columns.push((header, safe));
    }

    let mut conn = Connection::open(db_file)?;
    conn.execute_batch(DATASET_SCHEMA)?;

    let definitions: Vec<String> = columns
        .iter()
        .map(|(_, safe)| format!("{} TEXT", safe))
        .collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let safe_names: Vec<&str> = columns.iter().map(|(_, safe)| safe.as_str()).collect();

    let tx = conn.transaction()?;
    tx.execute_batch(&format!(
        "CREATE TABLE dataset_rows (_row INTEGER PRIMARY KEY, {})",
        definitions.join(", ")
    ))?;
    for (position, (name, safe)) in columns.iter().enumerate() {
        tx.execute(
            "INSERT INTO dataset_columns (position, name, safe_name) VALUES (?1, ?2, ?3)",
            params![position as i64, name, safe],
        )?;
    }

    let mut count = 0usize;
    {
        let mut insert = tx.prepare(&format!(
            "INSERT INTO dataset_rows ({}) VALUES ({})",
            safe_names.join(", "),
            placeholders.join(", ")
        ))?;
        for record in reader.records() {
            let record = record?;
            let values: Vec<&str> = (0..columns.len())
                .map(|i| record.get(i).unwrap_or(""))
                .collect();
            insert.execute(params_from_iter(values.iter()))?;
            count += 1;
        }
    }

    tx.execute(
        "INSERT OR REPLACE INTO dataset_meta (key, value) VALUES ('md5', ?1)",
        params![md5],
    )?;
    tx.commit()?;

    tracing::info!(csv = %csv_file.display(), rows = count, "imported external dataset");
    Ok(Dataset { conn, columns })
}

/// `first name` -> `c_first_name`
pub fn to_safe_column_name(name: &str) -> String {
    let body: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}{}", COLUMN_PREFIX, body)
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
