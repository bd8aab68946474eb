mod commands;
mod resolver;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// QTI item and test processing engine.
#[derive(Parser)]
#[command(name = "qti", version, about = "QTI item and test processing engine")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Statically check an item or test definition (JSON)
    Validate {
        /// Path to the item or test JSON file
        file: PathBuf,
        /// Directory that item hrefs of a test resolve against
        /// (defaults to the test file's directory)
        #[arg(long)]
        items: Option<PathBuf>,
    },

    /// Run an item session: one attempt per entry of the responses file
    RunItem {
        /// Path to the item JSON file
        item: PathBuf,
        /// JSON array of attempts, each mapping response identifiers to
        /// lists of raw strings
        #[arg(long)]
        responses: PathBuf,
        /// Seed for shuffling, template processing and random expressions
        #[arg(long)]
        seed: Option<u64>,
        /// Attempts allowed (0 means unlimited)
        #[arg(long, default_value = "1")]
        max_attempts: u32,
        /// Template processing retries before giving up
        #[arg(long, default_value = "100")]
        template_limit: u32,
    },
}

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file, items } => {
            commands::validate::cmd_validate(&file, items.as_deref(), cli.output, cli.quiet);
        }
        Commands::RunItem {
            item,
            responses,
            seed,
            max_attempts,
            template_limit,
        } => {
            commands::run_item::cmd_run_item(
                &item,
                &responses,
                commands::run_item::RunOptions {
                    seed,
                    max_attempts,
                    template_limit,
                },
                cli.output,
                cli.quiet,
            );
        }
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}
