//! Diagnostic tracing for the engine.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG` on stderr. While a
//!   controller runs, info-level events are also appended to
//!   `.phaser/logs/controller.log`, which `phaser logs` prints.
//!
//! - **Phase artifacts (`io/checks`, `io/agent`)**: agent and check logs plus
//!   verification summaries under `.phaser/logs/<phase>/`. Always written,
//!   unaffected by `RUST_LOG`.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG` for stderr output, defaulting to `warn`. With
/// `controller_log`, info-level events are also appended to that file.
///
/// # Example
/// ```bash
/// RUST_LOG=phaser=debug phaser start
/// ```
pub fn init(controller_log: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_filter(filter);

    let file = match controller_log {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open controller log {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(false)
                    .with_filter(LevelFilter::INFO),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(())
}
