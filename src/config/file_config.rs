use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub home: Option<String>,
    pub socket_path: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub purge_interval_secs: Option<u64>,

    // Built-in periodic task cadence; 0 disables the task
    pub metrics_interval_secs: Option<i64>,
    pub vacuum_interval_secs: Option<i64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"
home = "/var/lib/pgsteward"
socket_path = "/run/pgsteward.sock"
poll_interval_secs = 2
purge_interval_secs = 120
metrics_interval_secs = 0
vacuum_interval_secs = 43200
"#,
        )
        .unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.home.as_deref(), Some("/var/lib/pgsteward"));
        assert_eq!(config.socket_path.as_deref(), Some("/run/pgsteward.sock"));
        assert_eq!(config.poll_interval_secs, Some(2));
        assert_eq!(config.purge_interval_secs, Some(120));
        assert_eq!(config.metrics_interval_secs, Some(0));
        assert_eq!(config.vacuum_interval_secs, Some(43200));
    }

    #[test]
    fn test_load_partial_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"home = \"/tmp\"\n").unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.home.as_deref(), Some("/tmp"));
        assert!(config.socket_path.is_none());
        assert!(config.poll_interval_secs.is_none());
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"home = [not toml").unwrap();
        assert!(FileConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(FileConfig::load(Path::new("/nonexistent/pgsteward.toml")).is_err());
    }
}
