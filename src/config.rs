use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config directory not found")]
    NoConfigDir,
    #[error("failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("failed to write config: {0}")]
    WriteError(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    ValidationError(String),
}

/// Which process serves torrent content over local HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeKind {
    #[default]
    Webtorrent,
    Embedded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage_path: PathBuf,
    pub indexer_host: String,
    pub indexer_port: u16,
    pub indexer_api_key: String,
    /// Percentage of an episode that counts as watched
    pub completion_percentage: u8,
    pub save_player_speed: bool,
    /// Use an external dmenu-style picker instead of the built-in list
    pub external_picker: bool,
    pub picker_command: String,
    pub player_command: String,
    pub player_args: Vec<String>,
    pub bridge: BridgeKind,
    pub bridge_command: String,
    pub bridge_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            indexer_host: "127.0.0.1".to_string(),
            indexer_port: 9117,
            indexer_api_key: String::new(),
            completion_percentage: 92,
            save_player_speed: false,
            external_picker: false,
            picker_command: "rofi".to_string(),
            player_command: "mpv".to_string(),
            player_args: Vec::new(),
            bridge: BridgeKind::Webtorrent,
            bridge_command: "webtorrent".to_string(),
            bridge_port: 8000,
        }
    }
}

fn default_storage_path() -> PathBuf {
    ProjectDirs::from("", "", "torrentwatch")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("torrentwatch"))
}

/// Expand a leading `~` to the user's home directory
fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(rest),
        None => path.to_path_buf(),
    }
}

impl Config {
    /// Load the config at `path`, creating it from defaults when absent.
    /// Keys missing from an existing file are filled in and the file is rewritten.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            println!("Config file not found. Creating default config at {}", path.display());
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path)?;
        let mut table: toml::Table = toml::from_str(&contents)?;

        let defaults = match toml::Value::try_from(Self::default())? {
            toml::Value::Table(t) => t,
            _ => toml::Table::new(),
        };

        let mut updated = false;
        for (key, value) in defaults {
            if !table.contains_key(&key) {
                debug!(key = %key, "filling missing config key");
                table.insert(key, value);
                updated = true;
            }
        }

        if updated {
            info!(path = %path.display(), "rewriting config with missing keys");
            std::fs::write(path, toml::to_string(&table)?)?;
        }

        let mut config: Config = toml::Value::Table(table).try_into()?;
        config.storage_path = expand_home(&config.storage_path);
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = toml::to_string(self)?;
        std::fs::write(
            path,
            format!("# torrentwatch configuration\n{body}"),
        )?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("", "", "torrentwatch")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Path of the watch history table
    pub fn history_path(&self) -> PathBuf {
        self.storage_path.join("torrent_history.txt")
    }

    pub fn indexer_base_url(&self) -> String {
        format!("http://{}:{}", self.indexer_host, self.indexer_port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.completion_percentage > 100 {
            return Err(ConfigError::ValidationError(
                "completion_percentage must be between 0 and 100".to_string(),
            ));
        }

        if self.indexer_host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "indexer_host cannot be empty".to_string(),
            ));
        }

        if self.indexer_port == 0 || self.bridge_port == 0 {
            return Err(ConfigError::ValidationError(
                "indexer_port and bridge_port cannot be 0".to_string(),
            ));
        }

        if self.player_command.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "player_command cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_default_config_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();

        assert!(path.exists());
        assert_eq!(config.completion_percentage, 92);
        assert_eq!(config.bridge_port, 8000);
        assert_eq!(config.bridge, BridgeKind::Webtorrent);
    }

    #[test]
    fn test_fills_missing_keys_and_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "# my settings\nindexer_api_key = \"secret\"\ncompletion_percentage = 80\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.indexer_api_key, "secret");
        assert_eq!(config.completion_percentage, 80);
        assert_eq!(config.indexer_port, 9117);

        let rewritten = std::fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("indexer_port"));
        assert!(rewritten.contains("save_player_speed"));
        assert!(rewritten.contains("secret"));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "something_else = true\nbridge = \"embedded\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.bridge, BridgeKind::Embedded);
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "completion_percentage = 150\n").unwrap();

        let result = Config::load_from(&path);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "indexer_port = = 3\n").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_expand_home() {
        let plain = PathBuf::from("/var/lib/torrentwatch");
        assert_eq!(expand_home(&plain), plain);

        if BaseDirs::new().is_some() {
            let expanded = expand_home(Path::new("~/videos"));
            assert!(expanded.ends_with("videos"));
            assert!(!expanded.starts_with("~"));
        }
    }
}
