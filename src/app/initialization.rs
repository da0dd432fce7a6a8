//! Application initialization and configuration

use anyhow::Result;
use log::{debug, LevelFilter};
use std::str::FromStr;
use crate::{cli, config, logging};
use crate::scan::OrchestratorConfig;

pub fn load_configuration(args: &cli::Args) -> Result<config::ConfigManager> {
    let mut manager = match &args.config_file {
        Some(config_file) => config::ConfigManager::load_from_file(config_file.clone())?,
        None => config::ConfigManager::load()?,
    };
    if let Some(section_name) = &args.config_name {
        manager.select_section(section_name.clone());
    }
    Ok(manager)
}

/// Logging settings: CLI flags first, then `[base]` config keys
pub fn configure_logging(args: &cli::Args, config: &config::ConfigManager) -> Result<logging::LogConfig> {
    let console_level = if args.debug {
        LevelFilter::Trace
    } else if args.verbose {
        LevelFilter::Debug
    } else if args.quiet {
        LevelFilter::Error
    } else {
        config.get_log_level("base", "console-level")?.unwrap_or(LevelFilter::Info)
    };

    let format = if args.log_format != "text" {
        logging::LogFormat::from_str(&args.log_format).map_err(|e| anyhow::anyhow!(e))?
    } else {
        match config.get_value("base", "log-format") {
            Some(format) => logging::LogFormat::from_str(format).map_err(|e| anyhow::anyhow!(e))?,
            None => logging::LogFormat::Text,
        }
    };

    let log_file = args.log_file.clone().or_else(|| config.get_path("base", "log-file"));
    let file_level = match &args.log_file_level {
        Some(level) => Some(logging::parse_log_level(level)?),
        None => config.get_log_level("base", "file-log-level")?,
    };

    let (destination, file_level) = match log_file {
        Some(path) => {
            let level = file_level.unwrap_or(console_level);
            debug!("File logging enabled: {} (level: {:?})", path.display(), level);
            (logging::LogDestination::Both(path), Some(level))
        }
        None => (logging::LogDestination::Console, None),
    };

    Ok(logging::LogConfig {
        console_level,
        file_level,
        format,
        destination,
    })
}

/// Orchestrator settings with `--store-dir` applied over the config file
pub fn orchestrator_config(args: &cli::Args, config: &config::ConfigManager) -> Result<OrchestratorConfig> {
    let mut orchestrator = config.get_orchestrator_config()?;
    if let Some(dir) = &args.store_dir {
        orchestrator.store_dir = Some(dir.clone());
    }
    if orchestrator.store_dir.is_none() {
        orchestrator.store_dir = dirs::data_dir().map(|d| d.join("rulescan").join("tasks"));
    }
    debug!("Orchestrator configuration: {:?}", orchestrator);
    Ok(orchestrator)
}
