mod file_config;

pub use file_config::FileConfig;

use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub home: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub poll_interval_secs: u64,
    pub purge_interval_secs: u64,
    pub metrics_interval_secs: i64,
    pub vacuum_interval_secs: i64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding the task database and, by default, the control
    /// socket. Must exist.
    pub home: PathBuf,
    pub socket_path: PathBuf,
    pub poll_interval_secs: u64,
    pub purge_interval_secs: u64,

    // Built-in periodic task cadence; 0 disables the task
    pub metrics_interval_secs: i64,
    pub vacuum_interval_secs: i64,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let home = file
            .home
            .map(PathBuf::from)
            .or_else(|| cli.home.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("home must be specified via --home or in config file")
            })?;

        if !home.exists() {
            bail!("Home directory does not exist: {:?}", home);
        }
        if !home.is_dir() {
            bail!("home is not a directory: {:?}", home);
        }

        let socket_path = file
            .socket_path
            .map(PathBuf::from)
            .or_else(|| cli.socket_path.clone())
            .unwrap_or_else(|| home.join("control.sock"));

        let poll_interval_secs = file.poll_interval_secs.unwrap_or(cli.poll_interval_secs);
        if poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        let purge_interval_secs = file.purge_interval_secs.unwrap_or(cli.purge_interval_secs);
        if purge_interval_secs == 0 {
            bail!("purge_interval_secs must be greater than zero");
        }

        let metrics_interval_secs = file
            .metrics_interval_secs
            .unwrap_or(cli.metrics_interval_secs);
        let vacuum_interval_secs = file
            .vacuum_interval_secs
            .unwrap_or(cli.vacuum_interval_secs);
        if metrics_interval_secs < 0 || vacuum_interval_secs < 0 {
            bail!("built-in task intervals cannot be negative");
        }

        Ok(Self {
            home,
            socket_path,
            poll_interval_secs,
            purge_interval_secs,
            metrics_interval_secs,
            vacuum_interval_secs,
        })
    }

    pub fn task_db_path(&self) -> PathBuf {
        self.home.join("tasks.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_cli(home: &TempDir) -> CliConfig {
        CliConfig {
            home: Some(home.path().to_path_buf()),
            socket_path: None,
            poll_interval_secs: 1,
            purge_interval_secs: 60,
            metrics_interval_secs: 300,
            vacuum_interval_secs: 86400,
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = TempDir::new().unwrap();
        let config = AppConfig::resolve(&make_cli(&temp_dir), None).unwrap();

        assert_eq!(config.home, temp_dir.path());
        assert_eq!(config.socket_path, temp_dir.path().join("control.sock"));
        assert_eq!(config.poll_interval_secs, 1);
        assert_eq!(config.purge_interval_secs, 60);
        assert_eq!(config.metrics_interval_secs, 300);
        assert_eq!(config.vacuum_interval_secs, 86400);
        assert_eq!(config.task_db_path(), temp_dir.path().join("tasks.db"));
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = TempDir::new().unwrap();
        let mut cli = make_cli(&temp_dir);
        cli.home = Some(PathBuf::from("/should/be/overridden"));
        cli.poll_interval_secs = 5;

        let file_config = FileConfig {
            home: Some(temp_dir.path().to_string_lossy().to_string()),
            socket_path: Some("/run/steward.sock".to_string()),
            poll_interval_secs: Some(2),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.home, temp_dir.path());
        assert_eq!(config.socket_path, PathBuf::from("/run/steward.sock"));
        assert_eq!(config.poll_interval_secs, 2);
        // CLI value used when TOML doesn't specify
        assert_eq!(config.purge_interval_secs, 60);
    }

    #[test]
    fn test_resolve_missing_home_error() {
        let cli = CliConfig {
            poll_interval_secs: 1,
            purge_interval_secs: 60,
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("home must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_home_error() {
        let cli = CliConfig {
            home: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            poll_interval_secs: 1,
            purge_interval_secs: 60,
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_home_not_directory_error() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let cli = CliConfig {
            home: Some(temp_file.path().to_path_buf()),
            poll_interval_secs: 1,
            purge_interval_secs: 60,
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not a directory"));
    }

    #[test]
    fn test_resolve_zero_poll_interval_error() {
        let temp_dir = TempDir::new().unwrap();
        let mut cli = make_cli(&temp_dir);
        cli.poll_interval_secs = 0;
        assert!(AppConfig::resolve(&cli, None).is_err());
    }

    #[test]
    fn test_resolve_zero_builtin_interval_disables() {
        let temp_dir = TempDir::new().unwrap();
        let mut cli = make_cli(&temp_dir);
        cli.metrics_interval_secs = 0;
        cli.vacuum_interval_secs = 0;

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.metrics_interval_secs, 0);
        assert_eq!(config.vacuum_interval_secs, 0);
    }
}
