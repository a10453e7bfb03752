//! Opcache CLI: drive the compiled-artifact cache from the command line.
//!
//! Provides `opcache check` for validating configuration, `opcache run` for
//! executing source files through the cache over several simulated requests,
//! and `opcache pack` / `opcache preload` for building and inspecting value
//! store data files.

#![warn(missing_docs)]

mod data;
mod exec;
mod run;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use opcache_config::{ConfigError, OpcacheConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration file looked up in the working directory when `--config` is
/// not given.
pub const DEFAULT_CONFIG: &str = "opcache.toml";

/// Opcache: a shared compiled-artifact cache.
#[derive(Parser, Debug)]
#[command(name = "opcache", version, about = "Shared compiled-artifact cache")]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Enable verbose (debug-level) output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a custom `opcache.toml` configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate the configuration and print the effective settings.
    Check,
    /// Execute source files through the cache.
    Run(RunArgs),
    /// Write a value store data file from a JSON document.
    Pack(PackArgs),
    /// Load a directory of data files and list the keys it provides.
    Preload {
        /// Directory holding `*.data` files.
        dir: PathBuf,
    },
}

/// Arguments for the `opcache run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Source files, executed in order within each request.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Number of requests to simulate.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub requests: usize,

    /// Recompile and republish every file instead of looking it up.
    #[arg(long)]
    pub force_update: bool,

    /// Directories searched for relative file paths.
    #[arg(short = 'I', long = "include-path")]
    pub include_path: Vec<PathBuf>,

    /// Output format for the cache report.
    #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

/// Arguments for the `opcache pack` subcommand.
#[derive(Parser, Debug)]
pub struct PackArgs {
    /// Key the value is stored under.
    pub key: String,

    /// JSON document holding the value.
    pub json: String,

    /// Directory the data file is written to.
    #[arg(short, long, default_value = ".")]
    pub out: PathBuf,

    /// Serializer to encode with (default: the configured one).
    #[arg(short, long)]
    pub serializer: Option<String>,
}

/// Report output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Human-readable terminal output.
    Text,
    /// Machine-readable JSON output.
    Json,
}

/// Global settings derived from CLI flags.
pub struct GlobalArgs {
    /// Whether to suppress non-error output.
    pub quiet: bool,
    /// Whether to print verbose/debug information.
    pub verbose: bool,
    /// Optional path to a custom config file.
    pub config: Option<PathBuf>,
}

impl GlobalArgs {
    /// Loads the configuration named by `--config`, else `opcache.toml` in
    /// the working directory, else the defaults.
    pub fn load_config(&self) -> Result<OpcacheConfig, ConfigError> {
        match &self.config {
            Some(path) => opcache_config::load_config(path),
            None if Path::new(DEFAULT_CONFIG).is_file() => {
                opcache_config::load_config(Path::new(DEFAULT_CONFIG))
            }
            None => Ok(OpcacheConfig::default()),
        }
    }
}

fn init_logging(global: &GlobalArgs) {
    let default = if global.quiet {
        "error"
    } else if global.verbose {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    let cli = Cli::parse();

    let global = GlobalArgs {
        quiet: cli.quiet,
        verbose: cli.verbose,
        config: cli.config,
    };
    init_logging(&global);

    let result = match cli.command {
        Command::Check => run::check(&global),
        Command::Run(ref args) => run::run(args, &global),
        Command::Pack(ref args) => data::pack(args, &global),
        Command::Preload { ref dir } => data::preload(dir, &global),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}
