//! Command implementations

use super::{
    ConfigArgs, FormsCommand, InstancesCommand, OutputFormat, QueryArgs, SubmitArgs, SyncArgs,
};
use crate::app::App;
use crate::config::Settings;
use crate::external::{DatasetRow, ExternalDataSession, SearchQuery, SearchType};
use crate::forms::{Form, FormFilter, FormMetadata};
use crate::instances::{Instance, InstanceQuery, SaveRequest};
use crate::storage::StoragePaths;
use crate::sync::{SchedulerStop, SyncMode, SyncReport};
use crate::upload::UploadSummary;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Storage root from the command line, or the default data directory
pub fn resolve_root(root: Option<&Path>) -> PathBuf {
    root.map(Path::to_path_buf)
        .unwrap_or_else(StoragePaths::default_root)
}

/// Open the storage root, warning about registries that had to be recreated
pub fn open_app(root: &Path) -> Result<App> {
    let app = App::open(root)
        .with_context(|| format!("Failed to open storage at {}", root.display()))?;
    for lost in app.recreated_registries() {
        eprintln!("⚠ Registry was unreadable and has been recreated empty ({})", lost);
    }
    Ok(app)
}

/// Create the storage layout and a default config
pub fn init(root: &Path, force: bool, server: Option<&str>) -> Result<()> {
    let config_path = Settings::path(root);
    if config_path.exists() && !force {
        anyhow::bail!("fieldsync already initialized. Use --force to re-initialize.");
    }

    let mut settings = Settings::default();
    if let Some(url) = server {
        settings.server.url = url.to_string();
    }
    settings.save(root)?;

    let app = open_app(root)?;

    println!("✓ Initialized fieldsync in {}", root.display());
    println!("  Forms: {}", app.paths().forms_db().display());
    println!("  Instances: {}", app.paths().instances_db().display());
    println!("  Config: {}", config_path.display());

    Ok(())
}

// ==================== Forms ====================

pub fn forms(app: &App, command: FormsCommand, format: OutputFormat) -> Result<()> {
    match command {
        FormsCommand::List { all, latest } => {
            let forms = if latest {
                app.forms().list_latest_per_form_identifier()?
            } else if all {
                app.forms().list(&FormFilter::All)?
            } else {
                app.forms().list(&FormFilter::Live)?
            };
            match format {
                OutputFormat::Json => print_json(&forms)?,
                OutputFormat::Text => print_forms_text(&forms),
            }
        }

        FormsCommand::Register {
            file,
            form_id,
            version,
            name,
            submission_uri,
        } => {
            let identifier = match form_id {
                Some(id) => id,
                None => file
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .context("Cannot derive a form id from the file name; pass --form-id")?,
            };
            let mut metadata = FormMetadata::new(&identifier);
            metadata.version = version;
            metadata.display_name = name;
            metadata.submission_uri = submission_uri;

            let id = app
                .forms()
                .register(&file, metadata)
                .with_context(|| format!("Failed to register {}", file.display()))?;
            println!("✓ Registered form {} as {}", identifier, id);
        }

        FormsCommand::Delete { id, soft } => {
            if soft {
                app.forms().soft_delete(id)?;
                println!("✓ Hid form {}", id);
            } else {
                app.forms().delete(id)?;
                println!("✓ Deleted form {}", id);
            }
        }

        FormsCommand::Purge => {
            let count = app.forms().purge_deleted()?;
            println!("✓ Purged {} deleted form(s)", count);
        }
    }
    Ok(())
}

fn print_forms_text(forms: &[Form]) {
    if forms.is_empty() {
        println!("No forms.");
        return;
    }

    for form in forms {
        let version = form.version.as_deref().unwrap_or("-");
        let marker = if form.deleted { " [deleted]" } else { "" };
        println!(
            "{:>4}  {:<24} {:<10} {}{}",
            form.id, form.form_identifier, version, form.display_name, marker
        );
    }
}

// ==================== Instances ====================

pub async fn instances(app: &App, command: InstancesCommand, format: OutputFormat) -> Result<()> {
    match command {
        InstancesCommand::List { form, all, sort } => {
            let mut query = InstanceQuery::active(sort.into());
            query.form_identifier = form;
            if all {
                query = query.including_deleted();
            }
            let instances = app.instances().list(query).to_vec()?;
            match format {
                OutputFormat::Json => print_json(&instances)?,
                OutputFormat::Text => print_instances_text(&instances),
            }
        }

        InstancesCommand::New { form, xml } => {
            let payload = std::fs::read(&xml)
                .with_context(|| format!("Failed to read {}", xml.display()))?;
            let id = app.create_instance(form, payload).await?;
            println!("✓ Created instance {}", id);
        }

        InstancesCommand::Finalize { id, xml } => {
            let saver = app.saver();
            let payload = match xml {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => saver.read_xml(id).await?,
            };
            let instance = saver.save(id, SaveRequest::finalized(payload)).await?;
            println!("✓ Instance {} is {}", id, instance.status);

            if app.auto_send_enabled(id)? {
                let outcome = app.uploader()?.upload(id).await?;
                println!("✓ Submitted instance {} ({})", id, outcome.result.status);
            }
        }

        InstancesCommand::Delete { id, purge } => {
            if purge {
                app.instances().delete(id)?;
                println!("✓ Purged instance {}", id);
            } else {
                app.instances().soft_delete(id)?;
                println!("✓ Deleted instance {}", id);
            }
        }
    }
    Ok(())
}

fn print_instances_text(instances: &[Instance]) {
    if instances.is_empty() {
        println!("No instances.");
        return;
    }

    for instance in instances {
        let changed = chrono::DateTime::from_timestamp_millis(instance.last_status_change_date)
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let marker = if instance.is_deleted() { " [deleted]" } else { "" };
        println!(
            "{:>4}  {:<18} {:<16} {:<20} {}{}",
            instance.id,
            instance.status.to_string(),
            changed,
            instance.form_identifier,
            instance.display_name,
            marker
        );
    }
}

// ==================== Server ====================

pub async fn submit(app: &App, args: &SubmitArgs, format: OutputFormat) -> Result<()> {
    let uploader = app.uploader()?;

    let summary = match args.id {
        Some(id) if !args.all => {
            let outcome = uploader
                .upload(id)
                .await
                .with_context(|| format!("Failed to submit instance {}", id))?;
            UploadSummary {
                submitted: vec![outcome.instance_id],
                failed: Vec::new(),
            }
        }
        _ => uploader
            .upload_all()
            .await
            .context("Submission stopped; check server credentials")?,
    };

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Text => {
            println!("✓ Submitted {} instance(s)", summary.submitted.len());
            for (id, error) in &summary.failed {
                println!("✗ Instance {}: {}", id, error);
            }
        }
    }
    Ok(())
}

pub async fn sync(app: &App, args: &SyncArgs, format: OutputFormat) -> Result<()> {
    let synchronizer = app.synchronizer()?;

    if args.list {
        let forms = synchronizer.fetch_form_list().await?;
        match format {
            OutputFormat::Json => print_json(&forms)?,
            OutputFormat::Text => {
                for form in &forms {
                    println!(
                        "{:<24} {:<10} {}",
                        form.form_id,
                        form.version.as_deref().unwrap_or("-"),
                        form.name
                    );
                }
            }
        }
        return Ok(());
    }

    if !args.download.is_empty() {
        let available = synchronizer.fetch_form_list().await?;
        let mut wanted = Vec::new();
        for identifier in &args.download {
            let summary = available
                .iter()
                .find(|f| &f.form_id == identifier)
                .with_context(|| format!("Server does not list form {}", identifier))?;
            wanted.push(summary.clone());
        }
        let report = synchronizer.download(&wanted).await?;
        return print_report(&report, format);
    }

    if synchronizer.mode() == SyncMode::Manual {
        println!("Sync mode is manual. Use --download <FORM_ID> or set sync.mode.");
        return Ok(());
    }

    if args.watch {
        let scheduler = app.scheduler()?;
        let (tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(true);
            }
        });

        println!("Syncing every {}s. Press Ctrl+C to stop.", app.settings().sync.interval_secs);
        match scheduler.run(rx).await {
            SchedulerStop::Shutdown { cycles } => {
                println!("✓ Stopped after {} cycle(s)", cycles);
                Ok(())
            }
            SchedulerStop::CredentialsRequired { error, .. } => {
                Err(error).context("Sync paused; update server credentials")
            }
        }
    } else {
        let report = synchronizer.sync().await?;
        print_report(&report, format)
    }
}

fn print_report(report: &SyncReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }

    if report.is_empty() {
        println!("✓ Forms are up to date");
        return Ok(());
    }
    for identifier in &report.added {
        println!("+ {}", identifier);
    }
    for identifier in &report.updated {
        println!("~ {}", identifier);
    }
    for identifier in &report.deleted {
        println!("- {}", identifier);
    }
    for failure in &report.failures {
        println!("✗ {}: {}", failure.form_identifier, failure.error);
    }
    Ok(())
}

// ==================== Datasets ====================

pub fn query(app: &App, args: &QueryArgs, format: OutputFormat) -> Result<()> {
    let form = app
        .forms()
        .get(args.form)?
        .with_context(|| format!("Form {} not found", args.form))?;
    let session = ExternalDataSession::open(app.paths(), &form.form_media_path)?;

    let mut query = match &args.search {
        Some(kind) => {
            let search_type = SearchType::parse(kind)
                .with_context(|| format!("Unknown search type: {}", kind))?;
            let columns: Vec<&str> = args.columns.iter().map(String::as_str).collect();
            SearchQuery::new(search_type, args.value.as_deref().unwrap_or_default(), &columns)
        }
        None => SearchQuery::all(),
    };
    if let Some(filter) = &args.filter {
        let (column, value) = filter
            .split_once('=')
            .context("--filter expects column=value")?;
        query = query.with_filter(column.trim(), value.trim());
    }

    let rows = session.search(&args.dataset, &query)?;
    session.close();

    match format {
        OutputFormat::Json => print_json(&rows)?,
        OutputFormat::Text => print_rows_text(&rows),
    }
    Ok(())
}

fn print_rows_text(rows: &[DatasetRow]) {
    if rows.is_empty() {
        println!("No matching rows.");
        return;
    }
    for row in rows {
        let fields: Vec<String> = row
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!("{:>4}  {}", row.index, fields.join(", "));
    }
}

// ==================== Config ====================

pub fn config(root: &Path, args: &ConfigArgs) -> Result<()> {
    let mut settings = Settings::load_or_default(root)?;

    if args.reset {
        settings = Settings::default();
        settings.save(root)?;
        println!("✓ Configuration reset to defaults");
    }

    if let Some(assignment) = &args.set {
        let (key, value) = assignment
            .split_once('=')
            .context("--set expects key=value")?;
        settings = set_config_value(&settings, key.trim(), value.trim())?;
        settings.save(root)?;
        println!("✓ Set {}", key.trim());
    }

    if let Some(key) = &args.get {
        let value = toml::Value::try_from(&settings)?;
        match lookup_key(&value, key) {
            Some(toml::Value::String(s)) => println!("{}", s),
            Some(other) => println!("{}", other),
            None => println!("Unknown config key: {}", key),
        }
    }

    if args.show || (!args.reset && args.set.is_none() && args.get.is_none()) {
        println!("fieldsync Configuration");
        println!("=======================\n");
        println!("Root: {}", root.display());
        println!();
        print!("{}", toml::to_string_pretty(&redacted(&settings))?);
    }

    Ok(())
}

const CONFIG_SECTIONS: [&str; 5] = ["server", "sync", "transport", "token_routing", "instances"];

fn lookup_key<'a>(value: &'a toml::Value, key: &str) -> Option<&'a toml::Value> {
    key.split('.').try_fold(value, |v, part| v.get(part))
}

/// Apply `key = raw` to a copy of the settings; the result is validated
fn set_config_value(settings: &Settings, key: &str, raw: &str) -> Result<Settings> {
    let parts: Vec<&str> = key.split('.').collect();
    let Some((last, sections)) = parts.split_last() else {
        anyhow::bail!("Empty config key");
    };
    if sections.is_empty() || !CONFIG_SECTIONS.contains(&sections[0]) {
        anyhow::bail!("Unknown config key: {}", key);
    }

    let mut root = toml::Value::try_from(settings)?;
    let mut table = root
        .as_table_mut()
        .context("Settings did not serialize to a table")?;
    for section in sections {
        table = table
            .entry(section.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()))
            .as_table_mut()
            .with_context(|| format!("{} is not a section", section))?;
    }
    table.insert(last.to_string(), parse_config_value(raw));

    let updated: Settings = root
        .try_into()
        .with_context(|| format!("Invalid value for {}", key))?;
    updated.validate()?;
    Ok(updated)
}

/// TOML literal when it parses as one, plain string otherwise
fn parse_config_value(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("v = {}", raw))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

fn redacted(settings: &Settings) -> Settings {
    let mut shown = settings.clone();
    if shown.server.password.is_some() {
        shown.server.password = Some("********".to_string());
    }
    if shown.server.token.is_some() {
        shown.server.token = Some("********".to_string());
    }
    shown
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}
