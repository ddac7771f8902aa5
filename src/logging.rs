//! Structured logging initialization.
//!
//! `json` installs `tracing_subscriber::fmt().json()` for production use;
//! `pretty` is the default human-readable formatter for local runs. Level
//! filtering comes from `RUST_LOG` via `EnvFilter`.

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

pub fn init(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
    }
}
