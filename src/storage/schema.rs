//! Registry database schemas and their linear migrations

/// One upgrade step; applied when the stored version is below `version`
pub struct Migration {
    pub version: u32,
    pub sql: &'static str,
}

/// Schema of one registry database
pub struct RegistrySchema {
    /// Table holding the registry rows
    pub table: &'static str,
    /// Version written by `create`
    pub version: u32,
    /// Creates the table at `version` on a fresh database
    pub create: &'static str,
    /// Upgrade steps ordered by version
    pub migrations: &'static [Migration],
}

pub const FORMS_SCHEMA: RegistrySchema = RegistrySchema {
    table: "forms",
    version: 3,
    create: FORMS_CREATE,
    migrations: &[
        Migration {
            version: 2,
            sql: r#"
            ALTER TABLE forms ADD COLUMN auto_send TEXT;
            ALTER TABLE forms ADD COLUMN auto_delete TEXT;
            "#,
        },
        Migration {
            version: 3,
            sql: r#"
            ALTER TABLE forms ADD COLUMN last_detected_version_hash TEXT;
            ALTER TABLE forms ADD COLUMN deleted INTEGER NOT NULL DEFAULT 0;
            CREATE INDEX IF NOT EXISTS idx_forms_deleted ON forms(deleted);
            "#,
        },
    ],
};

const FORMS_CREATE: &str = r#"
CREATE TABLE IF NOT EXISTS forms (
    id INTEGER PRIMARY KEY,
    display_name TEXT NOT NULL,
    description TEXT,
    form_identifier TEXT NOT NULL,
    version TEXT,
    md5_hash TEXT NOT NULL,
    date INTEGER NOT NULL,
    form_file_path TEXT NOT NULL,
    form_media_path TEXT NOT NULL,
    language TEXT,
    submission_uri TEXT,
    public_key TEXT,
    cache_file_path TEXT NOT NULL,
    auto_send TEXT,
    auto_delete TEXT,
    last_detected_version_hash TEXT,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_forms_identifier ON forms(form_identifier);
CREATE INDEX IF NOT EXISTS idx_forms_md5 ON forms(md5_hash);
CREATE INDEX IF NOT EXISTS idx_forms_path ON forms(form_file_path);
CREATE INDEX IF NOT EXISTS idx_forms_deleted ON forms(deleted);
"#;

/// The version 1 forms table, kept for upgrade tests
#[cfg(test)]
pub const FORMS_CREATE_V1: &str = r#"
CREATE TABLE forms (
    id INTEGER PRIMARY KEY,
    display_name TEXT NOT NULL,
    description TEXT,
    form_identifier TEXT NOT NULL,
    version TEXT,
    md5_hash TEXT NOT NULL,
    date INTEGER NOT NULL,
    form_file_path TEXT NOT NULL,
    form_media_path TEXT NOT NULL,
    language TEXT,
    submission_uri TEXT,
    public_key TEXT,
    cache_file_path TEXT NOT NULL
);
"#;

pub const INSTANCES_SCHEMA: RegistrySchema = RegistrySchema {
    table: "instances",
    version: 2,
    create: INSTANCES_CREATE,
    migrations: &[Migration {
        version: 2,
        sql: r#"
        ALTER TABLE instances ADD COLUMN geometry_type TEXT;
        ALTER TABLE instances ADD COLUMN geometry TEXT;
        ALTER TABLE instances ADD COLUMN task_status TEXT;
        "#,
    }],
};

const INSTANCES_CREATE: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id INTEGER PRIMARY KEY,
    display_name TEXT NOT NULL,
    status TEXT NOT NULL,
    last_status_change_date INTEGER NOT NULL,
    instance_file_path TEXT NOT NULL,
    form_identifier TEXT NOT NULL,
    form_version TEXT,
    deleted_date INTEGER,
    geometry_type TEXT,
    geometry TEXT,
    task_status TEXT
);

CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);
CREATE INDEX IF NOT EXISTS idx_instances_form ON instances(form_identifier, form_version);
CREATE INDEX IF NOT EXISTS idx_instances_deleted ON instances(deleted_date);
"#;

#[cfg(test)]
pub const INSTANCES_CREATE_V1: &str = r#"
CREATE TABLE instances (
    id INTEGER PRIMARY KEY,
    display_name TEXT NOT NULL,
    status TEXT NOT NULL,
    last_status_change_date INTEGER NOT NULL,
    instance_file_path TEXT NOT NULL,
    form_identifier TEXT NOT NULL,
    form_version TEXT,
    deleted_date INTEGER
);
"#;
