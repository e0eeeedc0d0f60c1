use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use tsl_core::TableConfig;
use tsl_model::TimeoutMs;
use tsl_observe::LoggerConfig;

/// Path of the optional JSON config file.
pub const ENV_CONFIG: &str = "TSL_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub table: TableConfig,
    pub logger: LoggerConfig,
    /// Interval between slot report log lines.
    pub report_interval_ms: TimeoutMs,
    /// How long a claimed slot may stay unclaimed before the table frees it.
    pub slot_timeout_ms: TimeoutMs,
    /// Claim and activate every static slot for a local job on startup.
    pub claim_static_slots: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            table: TableConfig::default(),
            logger: LoggerConfig::default(),
            report_interval_ms: 30_000,
            slot_timeout_ms: 10_000,
            claim_static_slots: true,
        }
    }
}

impl AgentConfig {
    /// Reads `TSL_CONFIG` if set, then applies the `TSL_LOG_*` overrides.
    pub fn load() -> anyhow::Result<Self> {
        let cfg = match std::env::var_os(ENV_CONFIG) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        cfg.with_env_overrides(|var| std::env::var(var).ok())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.table.validate()?;
        Ok(cfg)
    }

    fn with_env_overrides<F>(mut self, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.logger = self.logger.with_overrides(lookup)?;
        Ok(self)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.max(1))
    }

    pub fn slot_timeout(&self) -> Duration {
        Duration::from_millis(self.slot_timeout_ms)
    }
}
