use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod api_client;
mod commands;
mod config;
mod plugin;
mod ui;

#[derive(Parser)]
#[command(name = "plot")]
#[command(about = "Build, deploy and operate Plot plugins.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a new plugin crate
    Create {
        /// Plugin name. If omitted, prompts for one.
        #[arg(value_name = "NAME")]
        name: Option<String>,
    },

    /// Generate a plugin from a written description
    Generate {
        /// File containing the plugin description. If omitted, prompts for one.
        #[arg(long, value_name = "FILE")]
        spec: Option<PathBuf>,

        /// Directory to write the generated files into
        #[arg(long, value_name = "DIR")]
        out: Option<PathBuf>,
    },

    /// Check a plugin directory for problems
    Lint {
        #[arg(value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },

    /// Bundle and upload a plugin
    Deploy {
        #[arg(value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },

    /// Show recent plugin logs
    Logs {
        /// Plugin directory whose logs to show
        #[arg(long, value_name = "DIR", default_value = ".")]
        dir: PathBuf,

        /// Number of lines to show
        #[arg(short = 'n', default_value = "50")]
        lines: usize,

        /// Follow log output
        #[arg(short = 'f', long)]
        follow: bool,
    },

    /// Manage priorities
    Priority {
        #[command(subcommand)]
        command: PriorityCommand,
    },
}

#[derive(Subcommand)]
enum PriorityCommand {
    /// List priorities as a tree
    List,
    /// Create a priority
    Create {
        title: String,
        /// Parent priority id
        #[arg(long, value_name = "ID")]
        parent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Debug logs are hidden unless RUST_LOG asks for them
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Create { name } => commands::create::run(name),
        Commands::Generate { spec, out } => commands::generate::run(spec, out).await,
        Commands::Lint { dir } => commands::lint::run(&dir),
        Commands::Deploy { dir } => commands::deploy::run(&dir).await,
        Commands::Logs { dir, lines, follow } => commands::logs::run(&dir, lines, follow).await,
        Commands::Priority { command } => match command {
            PriorityCommand::List => commands::priority::list().await,
            PriorityCommand::Create { title, parent } => commands::priority::create(&title, parent).await,
        },
    }
}
