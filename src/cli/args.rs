use clap::{ArgAction, Parser, Subcommand};
use anyhow::Result;
use std::path::PathBuf;
use log::debug;

use crate::task::TaskStatus;

/// Resumable rule-by-program scan orchestration
#[derive(Parser, Debug)]
#[command(name = "rulescan")]
#[command(about = "Inspect, recover and diff resumable rule scans")]
#[command(version)]
pub struct Args {
    /// Verbose output (debug level logging)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet output (error level logging only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Debug output (trace level logging)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log format: text or json
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    pub log_format: String,

    /// Log file path for file output
    #[arg(long, value_name = "FILE", global = true)]
    pub log_file: Option<PathBuf>,

    /// Log level for file output (independent of console level)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_file_level: Option<String>,

    /// Configuration file path
    #[arg(long, value_name = "FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// Configuration section name
    #[arg(long, value_name = "SECTION", global = true)]
    pub config_name: Option<String>,

    /// Task record directory (overrides orchestrator.store-dir)
    #[arg(long, value_name = "DIR", global = true)]
    pub store_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print a persisted task record as JSON
    Status {
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },

    /// List persisted tasks, most recently updated first
    List {
        /// Only tasks with this status
        #[arg(long, value_name = "STATUS")]
        status: Option<TaskStatus>,

        /// Only tasks scanning exactly these programs
        #[arg(long = "program", value_name = "NAME", action = ArgAction::Append)]
        programs: Vec<String>,

        /// Maximum number of tasks to show
        #[arg(short = 'L', long, value_name = "N")]
        limit: Option<usize>,
    },

    /// Classify values of two JSON-lines files as added, removed or unchanged
    Diff {
        #[arg(value_name = "BASE")]
        base: PathBuf,

        #[arg(value_name = "COMPARE")]
        compare: PathBuf,

        /// Identity fields; the whole value is the identity when omitted
        #[arg(long = "key", value_name = "FIELD", action = ArgAction::Append)]
        keys: Vec<String>,

        /// Print only the summary
        #[arg(long)]
        summary: bool,
    },

    /// Mark tasks left executing by a dead process as resumable errors
    ///
    /// Every task recorded as executing in the store is marked, including
    /// tasks another live process is still running; that process then
    /// writes its record back to executing on its next unit. Run this only
    /// while no other rulescan process uses the same store directory.
    Recover,
}

/// Parse command line arguments
pub fn parse_args() -> Args {
    let args = Args::parse();
    debug!("Parsed CLI arguments: {:?}", args);
    args
}

/// Validate CLI argument combinations
pub fn validate_args(args: &Args) -> Result<()> {
    let log_flags_count = [args.verbose, args.quiet, args.debug]
        .iter()
        .filter(|&&flag| flag)
        .count();
    if log_flags_count > 1 {
        return Err(anyhow::anyhow!(
            "Conflicting log level flags: only one of --verbose, --quiet, or --debug may be specified"
        ));
    }

    match args.log_format.to_lowercase().as_str() {
        "text" | "json" => {}
        _ => return Err(anyhow::anyhow!(
            "Invalid log format '{}'. Valid options: text, json", args.log_format
        )),
    }

    if let Some(ref level) = args.log_file_level {
        crate::logging::parse_log_level(level)
            .map_err(|_| anyhow::anyhow!("Invalid log file level '{}'. Valid levels: error, warn, info, debug, trace, off", level))?;
    }
    if args.log_file_level.is_some() && args.log_file.is_none() {
        return Err(anyhow::anyhow!("--log-file-level requires --log-file to be specified"));
    }

    Ok(())
}
