//! Provtrack CLI: browse lineage stores and run the demo pipeline.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Provtrack: lineage capture and versioned snapshots for data pipelines
#[derive(Parser, Debug)]
#[command(name = "provtrack", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (for `.provtrack/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Snapshot store directory (overrides `store.root`)
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// List projects with their pipelines and run counts
    Projects,
    /// List the pipelines of a project
    Pipelines {
        project: String,
        #[arg(long)]
        user_tag: Option<String>,
    },
    /// List runs of a project
    Runs {
        project: String,
        #[arg(long)]
        pipeline: Option<String>,
        #[arg(long)]
        user_tag: Option<String>,
    },
    /// Print the current lineage graph of matching runs
    Dag {
        project: String,
        #[arg(long)]
        pipeline: Option<String>,
        /// Narrow to one run (takes precedence over --pipeline)
        #[arg(long)]
        run: Option<String>,
        #[arg(long)]
        user_tag: Option<String>,
    },
    /// List every committed snapshot version of a run
    History { run_uid: String },
    /// Render one snapshot of a run (the current one by default)
    Show {
        run_uid: String,
        /// Sequence version to show
        #[arg(long)]
        version: Option<u64>,
    },
    /// Check a run's snapshot hash chain
    Verify { run_uid: String },
    /// Track a small pipeline over a CSV file and commit it to the store
    Demo {
        /// CSV file with an `id` column (a built-in sample is used if omitted)
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Print the graph to stdout while tracking
        #[arg(long)]
        console: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Create default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show current configuration
    Show,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "provtrack", "provtrack")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from(".provtrack").join("logs"));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "provtrack.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let ctx = commands::Context {
        workspace,
        store: cli.store,
        json: cli.json,
    };
    let mut out = std::io::stdout().lock();
    commands::handle_command(cli.command, &ctx, &mut out)
}
