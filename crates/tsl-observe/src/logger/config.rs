use std::io::IsTerminal;

use serde::Deserialize;

use crate::logger::{error::LoggerError, format::LoggerFormat};

/// Overrides [`LoggerConfig::level`]; any `EnvFilter` directive is accepted.
pub const ENV_LOG_LEVEL: &str = "TSL_LOG_LEVEL";
/// Overrides [`LoggerConfig::format`].
pub const ENV_LOG_FORMAT: &str = "TSL_LOG_FORMAT";
/// Overrides [`LoggerConfig::use_color`].
pub const ENV_LOG_COLOR: &str = "TSL_LOG_COLOR";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    /// `EnvFilter` directives, e.g. `info` or `info,tsl_core=debug`.
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color: cfg!(test) || std::io::stdout().is_terminal(),
        }
    }
}

impl LoggerConfig {
    /// Default config with the `TSL_LOG_*` environment overrides applied.
    pub fn from_env() -> Result<Self, LoggerError> {
        Self::default().with_overrides(|var| std::env::var(var).ok())
    }

    /// Applies overrides looked up by variable name; blank values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, LoggerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(level) = get(ENV_LOG_LEVEL) {
            self.level = level.trim().to_string();
        }
        if let Some(format) = get(ENV_LOG_FORMAT) {
            self.format = format.parse()?;
        }
        if let Some(color) = get(ENV_LOG_COLOR) {
            self.use_color = parse_flag(ENV_LOG_COLOR, &color)?;
        }
        Ok(self)
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, LoggerError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(LoggerError::InvalidFlag {
            var,
            value: value.to_string(),
        }),
    }
}
