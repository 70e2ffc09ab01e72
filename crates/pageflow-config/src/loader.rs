use std::path::{Path, PathBuf};

use pageflow_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const CONFIG_FILE_NAMES: [&str; 3] = ["config.yml", "config.yaml", "config.toml"];

/// Environment variables that override file settings.
pub const ENV_DATABASE: &str = "PAGEFLOW_DATABASE";
pub const ENV_MIGRATIONS_DIR: &str = "PAGEFLOW_MIGRATIONS_DIR";
pub const ENV_LOG_LEVEL: &str = "PAGEFLOW_LOG_LEVEL";

/// Locates and parses the Pageflow configuration file.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// `~/.pageflow`, or `./.pageflow` when no home directory is known.
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pageflow")
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Default SQLite file used when the config does not name one.
    pub fn default_database_path(&self) -> PathBuf {
        self.config_dir.join("pageflow.db")
    }

    /// Load the first config file found in the config directory, falling back
    /// to defaults when there is none. Environment overrides are applied and
    /// the result is validated.
    pub fn load(&self) -> Result<AppConfig> {
        let found = CONFIG_FILE_NAMES
            .iter()
            .map(|name| self.config_dir.join(name))
            .find(|path| path.is_file());

        let mut config = match found {
            Some(path) => Self::parse_file(&path)?,
            None => {
                debug!(
                    "no config file in {}, using defaults",
                    self.config_dir.display()
                );
                AppConfig::default()
            }
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load an explicitly named config file. A missing file is an error.
    pub fn load_file(path: &Path) -> Result<AppConfig> {
        let mut config = Self::parse_file(path)?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}")))?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error: {e}")))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config extension: {other}"
                )));
            }
        };

        info!("config loaded from {}", path.display());
        Ok(config)
    }
}

/// Overlay `PAGEFLOW_*` variables onto `config`. `lookup` is injected so
/// tests do not have to mutate the process environment.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(path) = non_empty(ENV_DATABASE) {
        config.database.path = Some(PathBuf::from(path));
    }
    if let Some(dir) = non_empty(ENV_MIGRATIONS_DIR) {
        config.migrations.directory = Some(PathBuf::from(dir));
    }
    if let Some(level) = non_empty(ENV_LOG_LEVEL) {
        config.logging.level = level;
    }
}
