mod file_config;

pub use file_config::{FileConfig, SchedulerConfig};

use crate::job::{JobManagerSettings, SchedulerSettings};
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MASTER_DOMAIN: &str = "Master";
pub const DEFAULT_ADMIN_USER: &str = "admin";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub master_domain: Option<String>,
    pub domains: Vec<String>,
    pub admin_user: Option<String>,
    pub node_id: Option<String>,
    pub standby: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub metrics_port: u16,
    pub master_domain: String,
    /// Always contains `master_domain`, first.
    pub domains: Vec<String>,
    pub admin_user: String,
    /// Owner name written into cluster lock rows.
    pub node_id: String,

    pub scheduler: SchedulerRuntimeSettings,
}

#[derive(Debug, Clone)]
pub struct SchedulerRuntimeSettings {
    pub interrupt_poll: Duration,
    pub shutdown_timeout: Duration,
    pub standby: bool,
}

impl Default for SchedulerRuntimeSettings {
    fn default() -> Self {
        Self {
            interrupt_poll: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_secs(30),
            standby: false,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let master_domain = file
            .master_domain
            .or_else(|| cli.master_domain.clone())
            .unwrap_or_else(|| DEFAULT_MASTER_DOMAIN.to_string());
        if master_domain.trim().is_empty() {
            bail!("master_domain must not be empty");
        }

        let mut domains = vec![master_domain.clone()];
        for domain in file.domains.unwrap_or_else(|| cli.domains.clone()) {
            if domain.trim().is_empty() {
                bail!("Domain names must not be empty");
            }
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }

        let admin_user = file
            .admin_user
            .or_else(|| cli.admin_user.clone())
            .unwrap_or_else(|| DEFAULT_ADMIN_USER.to_string());

        let node_id = file
            .node_id
            .or_else(|| cli.node_id.clone())
            .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4()));

        let defaults = SchedulerRuntimeSettings::default();
        let sched_file = file.scheduler.unwrap_or_default();
        let interrupt_poll_ms = sched_file
            .interrupt_poll_ms
            .unwrap_or(defaults.interrupt_poll.as_millis() as u64);
        if interrupt_poll_ms == 0 {
            bail!("scheduler.interrupt_poll_ms must be greater than 0");
        }
        let scheduler = SchedulerRuntimeSettings {
            interrupt_poll: Duration::from_millis(interrupt_poll_ms),
            shutdown_timeout: sched_file
                .shutdown_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            standby: sched_file.standby.unwrap_or(cli.standby),
        };

        Ok(Self {
            db_dir,
            metrics_port,
            master_domain,
            domains,
            admin_user,
            node_id,
            scheduler,
        })
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.db_dir.join("jobs.db")
    }

    pub fn job_manager_settings(&self) -> JobManagerSettings {
        JobManagerSettings {
            master_domain: self.master_domain.clone(),
            domains: self.domains.clone(),
            standby: self.scheduler.standby,
        }
    }

    pub fn scheduler_settings(&self, shutdown: CancellationToken) -> SchedulerSettings {
        SchedulerSettings {
            interrupt_poll: self.scheduler.interrupt_poll,
            shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            metrics_port: 9091,
            master_domain: None,
            domains: vec!["Two".to_string()],
            admin_user: Some("root".to_string()),
            node_id: Some("node-a".to_string()),
            standby: false,
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.master_domain, "Master");
        assert_eq!(config.domains, vec!["Master".to_string(), "Two".to_string()]);
        assert_eq!(config.admin_user, "root");
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.scheduler.interrupt_poll, Duration::from_secs(1));
        assert!(!config.scheduler.standby);
        assert_eq!(config.jobs_db_path(), temp_dir.path().join("jobs.db"));
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            metrics_port: 9091,
            domains: vec!["Cli".to_string()],
            ..Default::default()
        };

        let file_config = FileConfig {
            db_dir: Some(temp_dir.path().to_string_lossy().to_string()),
            master_domain: Some("Root".to_string()),
            domains: Some(vec!["Root".to_string(), "Toml".to_string()]),
            scheduler: Some(SchedulerConfig {
                interrupt_poll_ms: Some(200),
                shutdown_timeout_secs: Some(5),
                standby: Some(true),
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.master_domain, "Root");
        assert_eq!(config.domains, vec!["Root".to_string(), "Toml".to_string()]);
        assert_eq!(config.scheduler.interrupt_poll, Duration::from_millis(200));
        assert_eq!(config.scheduler.shutdown_timeout, Duration::from_secs(5));
        // CLI value used when TOML doesn't specify
        assert_eq!(config.metrics_port, 9091);

        let settings = config.job_manager_settings();
        assert!(settings.standby);
        assert_eq!(settings.master_domain, "Root");
    }

    #[test]
    fn test_resolve_generates_node_id() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert!(config.node_id.starts_with("node-"));
        assert_eq!(config.domains, vec!["Master".to_string()]);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let cli = CliConfig::default();
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_db_dir_not_directory_error() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(temp_file.path().to_path_buf()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("not a directory"));
    }

    #[test]
    fn test_resolve_rejects_zero_interrupt_poll() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let file_config = FileConfig {
            scheduler: Some(SchedulerConfig {
                interrupt_poll_ms: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, Some(file_config));
        assert!(result.unwrap_err().to_string().contains("interrupt_poll_ms"));
    }
}
