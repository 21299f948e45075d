//! Tracing setup for the daemon and embedders.
//!
//! The filter comes from `RUST_LOG`, then `observability.log_level`, then
//! `info`. Output format comes from [`LogFormat::resolve`].

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::ObservabilityConfig;

static TRACING_INIT: OnceLock<LogFormat> = OnceLock::new();

/// Environment switch for JSON output, independent of the config file.
pub const LOG_FORMAT_ENV: &str = "WARDEN_LOG_FORMAT";

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// JSON when the config asks for it or the environment value is `json`.
    pub fn resolve(config: &ObservabilityConfig, env_value: Option<&str>) -> Self {
        let env_json = env_value.is_some_and(|v| v.trim().eq_ignore_ascii_case("json"));
        if config.json_logs || env_json {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }
}

fn filter_for(config: &ObservabilityConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber once per process and return the format in
/// use. Later calls keep the first format.
pub fn init_tracing(config: &ObservabilityConfig) -> LogFormat {
    *TRACING_INIT.get_or_init(|| {
        let env_value = std::env::var(LOG_FORMAT_ENV).ok();
        let format = LogFormat::resolve(config, env_value.as_deref());

        let output = match format {
            LogFormat::Json => fmt::layer().json().boxed(),
            LogFormat::Compact => fmt::layer().compact().boxed(),
        };
        if let Err(err) = tracing_subscriber::registry()
            .with(filter_for(config))
            .with(output)
            .try_init()
        {
            eprintln!("tracing init skipped: {err}");
        }
        format
    })
}
