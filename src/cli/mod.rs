//! CLI interface using clap
//!
//! Provides the command-line interface for fieldsync

mod commands;

pub use commands::*;

use crate::instances::SortOrder;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// fieldsync - Offline form and submission store
#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Storage root (defaults to the user data directory)
    #[arg(short, long, global = true, env = "FIELDSYNC_ROOT")]
    pub root: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json)
    #[arg(short = 'o', long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the storage layout and a default config file
    Init(InitArgs),

    /// Manage downloaded form definitions
    #[command(subcommand)]
    Forms(FormsCommand),

    /// Manage filled-in instances
    #[command(subcommand)]
    Instances(InstancesCommand),

    /// Submit finalized instances to the server
    Submit(SubmitArgs),

    /// Reconcile local forms with the server
    Sync(SyncArgs),

    /// Query a CSV dataset bundled with a form
    Query(QueryArgs),

    /// Show or change configuration
    Config(ConfigArgs),
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Arguments for init command
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config file with defaults
    #[arg(short, long)]
    pub force: bool,

    /// Server base URL to store in the new config
    #[arg(long)]
    pub server: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum FormsCommand {
    /// List forms
    List {
        /// Include soft-deleted forms
        #[arg(short, long)]
        all: bool,

        /// Only the newest version of each form
        #[arg(short, long, conflicts_with = "all")]
        latest: bool,
    },

    /// Register a definition file already on disk
    #[command(disable_version_flag = true)]
    Register {
        /// Definition file
        file: PathBuf,

        /// Form identifier (defaults to the file name without extension)
        #[arg(long)]
        form_id: Option<String>,

        #[arg(long)]
        version: Option<String>,

        /// Display name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,

        /// Where instances of this form are submitted
        #[arg(long)]
        submission_uri: Option<String>,
    },

    /// Delete a form
    Delete {
        /// Form database id
        id: i64,

        /// Hide the form but keep its row
        #[arg(long)]
        soft: bool,
    },

    /// Remove every soft-deleted form for good
    Purge,
}

#[derive(Subcommand, Debug)]
pub enum InstancesCommand {
    /// List instances
    List {
        /// Only instances of this form identifier
        #[arg(long)]
        form: Option<String>,

        /// Include deleted instances
        #[arg(short, long)]
        all: bool,

        /// Sort order
        #[arg(long, default_value = "date-desc")]
        sort: SortArg,
    },

    /// Start an instance of a form from an XML draft
    New {
        /// Form database id
        form: i64,

        /// Draft payload
        xml: PathBuf,
    },

    /// Mark an instance complete, optionally replacing its payload
    Finalize {
        id: i64,

        /// New payload to store before finalizing
        #[arg(long)]
        xml: Option<PathBuf>,
    },

    /// Delete an instance
    Delete {
        id: i64,

        /// Remove the row and its files instead of soft-deleting
        #[arg(long)]
        purge: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SortArg {
    NameAsc,
    NameDesc,
    DateAsc,
    DateDesc,
    Status,
}

impl From<SortArg> for SortOrder {
    fn from(sort: SortArg) -> Self {
        match sort {
            SortArg::NameAsc => SortOrder::NameAsc,
            SortArg::NameDesc => SortOrder::NameDesc,
            SortArg::DateAsc => SortOrder::DateAsc,
            SortArg::DateDesc => SortOrder::DateDesc,
            SortArg::Status => SortOrder::Status,
        }
    }
}

/// Arguments for submit command
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Instance id to submit
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub id: Option<i64>,

    /// Submit every finalized instance
    #[arg(short, long)]
    pub all: bool,
}

/// Arguments for sync command
#[derive(Parser, Debug)]
pub struct SyncArgs {
    /// Keep running cycles at the configured interval
    #[arg(short, long)]
    pub watch: bool,

    /// Download these form identifiers regardless of sync mode
    #[arg(short, long, conflicts_with = "watch")]
    pub download: Vec<String>,

    /// Only show the server's form list
    #[arg(long, conflicts_with_all = ["watch", "download"])]
    pub list: bool,
}

/// Arguments for query command
#[derive(Parser, Debug)]
pub struct QueryArgs {
    /// Form database id whose media directory holds the dataset
    pub form: i64,

    /// Dataset name (CSV file name without extension)
    pub dataset: String,

    /// Search type: contains, matches, startswith, endswith
    #[arg(long, requires = "value")]
    pub search: Option<String>,

    /// Value to search for
    #[arg(long)]
    pub value: Option<String>,

    /// Columns to search, comma separated
    #[arg(long, value_delimiter = ',')]
    pub columns: Vec<String>,

    /// Restrict rows to `column=value`
    #[arg(long)]
    pub filter: Option<String>,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Show current configuration
    #[arg(long)]
    pub show: bool,

    /// Set a value, e.g. `sync.mode=match_exactly`
    #[arg(long)]
    pub set: Option<String>,

    /// Get a value, e.g. `server.url`
    #[arg(long)]
    pub get: Option<String>,

    /// Reset to defaults
    #[arg(long)]
    pub reset: bool,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["fieldsync", "sync", "--watch"]);
        if let Commands::Sync(args) = cli.command {
            assert!(args.watch);
        } else {
            panic!("expected sync");
        }
    }

    #[test]
    fn test_global_root_and_format() {
        let cli = Cli::parse_from(["fieldsync", "forms", "list", "--root", "/data", "-o", "json"]);
        assert_eq!(cli.root, Some(PathBuf::from("/data")));
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Forms(FormsCommand::List { all: false, latest: false })
        ));
    }

    #[test]
    fn test_submit_requires_target() {
        assert!(Cli::try_parse_from(["fieldsync", "submit"]).is_err());
        assert!(Cli::try_parse_from(["fieldsync", "submit", "3", "--all"]).is_err());

        let cli = Cli::parse_from(["fieldsync", "submit", "--all"]);
        if let Commands::Submit(args) = cli.command {
            assert!(args.all);
            assert!(args.id.is_none());
        }
    }

    #[test]
    fn test_instances_sort_argument() {
        let cli = Cli::parse_from(["fieldsync", "instances", "list", "--sort", "name-asc"]);
        match cli.command {
            Commands::Instances(InstancesCommand::List { sort, .. }) => {
                assert_eq!(SortOrder::from(sort), SortOrder::NameAsc)
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
