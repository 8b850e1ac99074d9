use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, TelemetryConfig};
use crate::errors::{AppError, AppResult};

pub fn init(cfg: &TelemetryConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_new(&cfg.log_level)
        .unwrap_or_else(|_| EnvFilter::new(TelemetryConfig::default().log_level));

    match cfg.format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_ansi(false)
            .with_target(false)
            .try_init()
            .map_err(|e| AppError::Other(e.to_string())),
        LogFormat::Text => fmt::fmt()
            .with_env_filter(env_filter)
            .compact()
            .with_target(false)
            .try_init()
            .map_err(|e| AppError::Other(e.to_string())),
    }
}
