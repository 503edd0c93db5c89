//! `env_logger` setup shared by both binaries.
//!
//! Output goes to stderr unless `PREFORK_LOG_FILE` names a file. `RUST_LOG`
//! overrides the default filter.

use std::fs::OpenOptions;

use crate::config::vars;

/// Initialise logging with `default_filter` when `RUST_LOG` is unset.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(default_filter: &str) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var(vars::LOG_FILE) {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Failed to open log file {path}: {e}"),
        }
    }

    let _ = builder.try_init();
}
