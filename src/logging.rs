//! Logging setup for the CLI.
//!
//! Installs a global tracing subscriber writing to stderr, so stdout stays
//! reserved for command output (`--json` in particular).

use time::{format_description::FormatItem, macros::format_description};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

const TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]Z");

/// Errors that may occur while initializing logging.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter {filter:?}: {source}")]
    Filter {
        filter: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("Failed to install global tracing subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Initialize tracing. `RUST_LOG` wins over the `-v` count.
pub fn init(verbosity: u8) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(verbosity)?;
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_timer(fmt::time::UtcTime::new(TIME_FORMAT))
        .with_writer(std::io::stderr);

    let subscriber = Registry::default().with(env_filter).with(stderr_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter(verbosity: u8) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = default_directive(verbosity);
    EnvFilter::try_new(&directive).map_err(|source| LoggingError::Filter {
        filter: directive,
        source,
    })
}

/// Map a `-v` count to a filter directive for this crate.
fn default_directive(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    format!("warn,scholar_runs={level}")
}
