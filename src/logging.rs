//! Logging initialization.
//!
//! The engine itself only emits `tracing` events; wiring a subscriber is the
//! embedding application's job. The helpers here cover the common setups: a
//! filtered stderr subscriber, an optional JSON line mirror for ingestion,
//! and a test-writer variant for the integration suite.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Subscriber setup for [`init_logging`].
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Filter directives used when `RUST_LOG` is unset, e.g.
    /// `"stoneforge=info"`. Defaults to the crate at info (debug in debug
    /// builds).
    pub directives: Option<String>,
    /// Mirror every event as a JSON line into this file, appending.
    pub json_file: Option<PathBuf>,
}

/// Install the global subscriber: filtered human-readable output on stderr,
/// plus the optional JSON file mirror. `RUST_LOG` overrides the configured
/// directives.
///
/// # Errors
///
/// Returns an error if the filter does not parse, the JSON file cannot be
/// opened, or a global subscriber is already installed.
pub fn init_logging(options: &LogOptions) -> Result<()> {
    let directives = options
        .directives
        .clone()
        .unwrap_or_else(default_directives);
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(directives))?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal());

    let registry = tracing_subscriber::registry().with(filter).with(stderr_layer);

    if let Some(path) = &options.json_file {
        let file = std::fs::File::options().create(true).append(true).open(path)?;
        let json_layer = fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .json();
        registry.with(json_layer).try_init()?;
    } else {
        registry.try_init()?;
    }

    Ok(())
}

fn default_directives() -> String {
    let level = if cfg!(debug_assertions) { "debug" } else { "info" };
    format!("stoneforge={level}")
}

/// Capture engine logs through the libtest writer so `--nocapture` shows
/// them. Safe to call from every test; later calls are no-ops.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stoneforge=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .ok();
}
