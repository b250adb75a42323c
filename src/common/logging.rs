//! Process-wide logging setup
//!
//! Installed once at startup from immutable configuration. `RUST_LOG`, when
//! set, takes precedence over the configured level.

use crate::common::{Error, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Map the configured level names onto a filter directive
fn level_directive(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Install the global subscriber writing to stdout or to `destination`
pub fn init_logging(level: &str, destination: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));

    if destination == "stdout" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| Error::InvalidConfig(format!("logging already initialized: {}", e)))?;
    } else {
        if let Some(dir) = Path::new(destination).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(destination)?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .try_init()
            .map_err(|e| Error::InvalidConfig(format!("logging already initialized: {}", e)))?;
    }

    tracing::info!("Logging to {}", destination);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive("WARN"), "warn");
        assert_eq!(level_directive("warning"), "warn");
        assert_eq!(level_directive("debug"), "debug");
        assert_eq!(level_directive("bogus"), "info");
    }
}
