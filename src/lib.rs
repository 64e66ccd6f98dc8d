//! slex - SSH commands multiplexed
//!
//! Runs one command on many hosts over SSH, using the operator's OpenSSH
//! configuration and credentials, and streams back per-host output.

pub mod app;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod ssh;

pub use app::run;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging on stderr. `RUST_LOG` wins over `debug`.
pub fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
