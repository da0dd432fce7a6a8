use anyhow::Result;
use log::{debug, error};
use std::process;

use rulescan::{app, cli, logging, version};

fn main() {
    // Unwinding must continue so a panicked scan loop ends as an Error task
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("Panic: {}", panic_info);
        default_hook(panic_info);
    }));

    if let Err(e) = run() {
        let error_msg = e.to_string();

        // Lookup misses are user errors and skip the log noise
        let is_user_error = error_msg.contains("not found")
            || error_msg.contains("Invalid")
            || error_msg.contains("No task store directory");

        if is_user_error {
            eprintln!("{}", e);
        } else {
            error!("Application error: {:#}", e);
            eprintln!("Error: {:#}", e);
        }
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = cli::args::parse_args();
    cli::args::validate_args(&args)?;

    let config_manager = app::load_configuration(&args)?;
    let log_config = app::configure_logging(&args, &config_manager)?;
    logging::init_logger(log_config)?;
    debug!(
        "rulescan {} (protocol {})",
        env!("CARGO_PKG_VERSION"),
        version::version_to_date_string(version::get_protocol_version())
    );

    let orchestrator = app::orchestrator_config(&args, &config_manager)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(orchestrator.max_active_tasks.clamp(1, num_cpus::get().max(1)))
        .enable_all()
        .build()?;

    runtime.block_on(app::execute(args.command, &orchestrator))
}
