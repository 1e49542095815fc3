//! Log bootstrap for the `logging` config section.
//!
//! The core logs through the `log` facade everywhere; this module wires
//! the facade to `env_logger` according to `logging.{level, path,
//! console}`. Initialization is idempotent: a second call is a no-op so
//! tests and embedding applications can both call it safely.

use crate::automatosx::config::LoggingSection;
use std::fs::OpenOptions;
use std::path::Path;

/// Initialize the global logger from the config section.
///
/// When `path` is set, log lines are appended to that file (created on
/// demand); otherwise they go to stderr. `console: false` without a file
/// path silences output entirely while keeping the level filter intact,
/// which preserves `log::log_enabled!` semantics for callers.
pub fn init(section: &LoggingSection, project_dir: &Path) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(section.level.to_filter());

    match &section.path {
        Some(path) => {
            let full = project_dir.join(path);
            if let Some(parent) = full.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match OpenOptions::new().create(true).append(true).open(&full) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(err) => {
                    eprintln!(
                        "automatosx: cannot open log file {}: {}; logging to stderr",
                        full.display(),
                        err
                    );
                }
            }
        }
        None if !section.console => {
            builder.filter_level(log::LevelFilter::Off);
        }
        None => {}
    }

    // A second init attempt (tests, embedders) is fine to ignore.
    let _ = builder.try_init();
}
