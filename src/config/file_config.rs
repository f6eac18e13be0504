use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub metrics_port: Option<u16>,
    pub master_domain: Option<String>,
    pub domains: Option<Vec<String>>,
    pub admin_user: Option<String>,
    pub node_id: Option<String>,

    pub scheduler: Option<SchedulerConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often a running job checks for an interrupt request.
    pub interrupt_poll_ms: Option<u64>,
    /// Grace period for running jobs on shutdown.
    pub shutdown_timeout_secs: Option<u64>,
    /// A standby node registers nothing and only answers interrupt requests.
    pub standby: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
