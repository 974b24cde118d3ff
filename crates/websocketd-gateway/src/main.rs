//! wazo-websocketd
//!
//! Supervisor mode (default): bootstrap, then pre-fork worker processes.
//! Worker mode (hidden `--worker` flag): run one WebSocket server.

use clap::Parser;

use websocketd_gateway::{config, controller::Controller, logging, process, server};

fn main() {
    let cli = config::Cli::parse();

    let config = match config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("wazo-websocketd: {e}");
            std::process::exit(2);
        }
    };
    logging::setup_logging(&config);

    // The session pipeline is cooperative and single-threaded inside each
    // process; parallelism comes from the worker processes.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("unable to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = if cli.worker {
        runtime.block_on(server::run_worker(config))
    } else {
        if let Some(user) = config.user.clone() {
            if let Err(e) = process::change_user(&user) {
                tracing::error!("{e}");
                std::process::exit(1);
            }
        }
        runtime.block_on(Controller::new(config).run(&cli))
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
