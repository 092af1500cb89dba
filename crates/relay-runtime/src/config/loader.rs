//! Configuration file loader (§4.9): layered defaults, config file, and
//! `${VAR}` environment-variable expansion, built on `figment` rather than a
//! bare `serde_yaml::from_str` call.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Format, Yaml};
use tracing::{debug, info};

use super::error::{ConfigError, ConfigResult};
use super::schema::RelayConfig;
use super::validation::validate_config;

const CONFIG_NAMES: &[&str] = &["relay.yaml", "relay.yml", ".relay.yaml"];

pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { search_paths: Vec::new() }
    }

    pub fn add_search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(cwd) => self.add_search_path(cwd),
            Err(_) => self,
        }
    }

    pub fn with_user_config_dir(self) -> Self {
        match dirs::config_dir() {
            Some(dir) => self.add_search_path(dir.join("relay")),
            None => self,
        }
    }

    /// Loads from the first matching file in the search paths, falling back
    /// to [`RelayConfig::default()`] with a logged notice if none is found.
    pub fn load(&self) -> ConfigResult<RelayConfig> {
        match self.find_config_file() {
            Some(path) => self.load_from_file(&path),
            None => {
                info!("no configuration file found, using defaults");
                Ok(RelayConfig::default())
            }
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<RelayConfig> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        self.load_from_str(&content)
    }

    pub fn load_from_str(&self, yaml: &str) -> ConfigResult<RelayConfig> {
        let expanded = expand_env_vars(yaml);
        let config: RelayConfig = Figment::new().merge(Yaml::string(&expanded)).extract()?;
        validate_config(&config)?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        for search_path in &self.search_paths {
            for name in CONFIG_NAMES {
                let path = search_path.join(name);
                debug!(path = %path.display(), "checking for configuration file");
                if path.exists() {
                    return Some(path);
                }
            }
        }
        None
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new().with_current_dir().with_user_config_dir()
    }
}

/// Expands `${VAR}` / `${VAR:-default}` references before parsing.
fn expand_env_vars(content: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(:-([^}]*))?\}").unwrap();
    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        let full_match = cap.get(0).unwrap().as_str();
        let var_name = cap.get(1).unwrap().as_str();
        let default_value = cap.get(3).map(|m| m.as_str());
        let value = std::env::var(var_name).ok().or_else(|| default_value.map(String::from)).unwrap_or_default();
        result = result.replace(full_match, &value);
    }
    result
}

pub fn load_config() -> ConfigResult<RelayConfig> {
    ConfigLoader::default().load()
}

pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<RelayConfig> {
    ConfigLoader::new().load_from_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_empty_yaml_as_defaults() {
        let loader = ConfigLoader::new();
        let config = loader.load_from_str("").unwrap();
        assert_eq!(config.listener.operation_timeout_secs, 60);
    }

    #[test]
    fn parses_partial_override() {
        let loader = ConfigLoader::new();
        let yaml = "listener:\n  operation_timeout_secs: 120\n";
        let config = loader.load_from_str(yaml).unwrap();
        assert_eq!(config.listener.operation_timeout_secs, 120);
        assert_eq!(config.client.operation_timeout_secs, 70);
    }

    #[test]
    fn expands_env_var_with_default() {
        let loader = ConfigLoader::new();
        let yaml = "listener:\n  operation_timeout_secs: ${RELAY_TIMEOUT:-45}\n";
        let config = loader.load_from_str(yaml).unwrap();
        assert_eq!(config.listener.operation_timeout_secs, 45);
    }

    #[test]
    fn rejects_invalid_override_via_validation() {
        let loader = ConfigLoader::new();
        let yaml = "listener:\n  connection_buffer_bytes: 16\n";
        assert!(loader.load_from_str(yaml).is_err());
    }
}
