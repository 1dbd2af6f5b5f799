//! fieldsync - Offline form and submission store
//!
//! Keeps form definitions and filled-in instances on disk and synchronizes
//! them with an OpenRosa-style server.

use anyhow::Result;
use fieldsync::cli::{self, Cli, Commands};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let root = cli::resolve_root(cli.root.as_deref());

    // Execute command
    match cli.command {
        Commands::Init(args) => {
            cli::init(&root, args.force, args.server.as_deref())?;
        }

        Commands::Config(args) => {
            cli::config(&root, &args)?;
        }

        Commands::Forms(command) => {
            let app = cli::open_app(&root)?;
            cli::forms(&app, command, cli.format)?;
        }

        Commands::Instances(command) => {
            let app = cli::open_app(&root)?;
            cli::instances(&app, command, cli.format).await?;
        }

        Commands::Submit(args) => {
            let app = cli::open_app(&root)?;
            cli::submit(&app, &args, cli.format).await?;
        }

        Commands::Sync(args) => {
            let app = cli::open_app(&root)?;
            cli::sync(&app, &args, cli.format).await?;
        }

        Commands::Query(args) => {
            let app = cli::open_app(&root)?;
            cli::query(&app, &args, cli.format)?;
        }
    }

    Ok(())
}
