//! Logging setup shared by the supervisor and the worker processes.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Configure the global subscriber from `log_file`, `log_level` and `debug`.
///
/// `RUST_LOG` takes precedence over the configured level. The AMQP and HTTP
/// client internals are kept at `warn` unless explicitly re-enabled.
pub fn setup_logging(config: &Config) {
    let level = if config.debug {
        "debug"
    } else {
        config.log_level.as_str()
    };
    let directives = format!("{level},lapin=warn,reqwest=warn,hyper=warn,hyper_util=warn");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    if let Some(path) = &config.log_file {
        match OpenOptions::new().append(true).create(true).open(path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .init();
                return;
            }
            Err(e) => {
                tracing_subscriber::fmt().with_env_filter(filter).init();
                tracing::warn!(path, "cannot open log file, logging to stderr: {e}");
                return;
            }
        }
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
