//! Configuration File Loading
//!
//! Finds the dispatcher configuration in the usual locations and loads
//! device files from its `devices/` directory.

use super::{DeviceConfig, DispatcherConfig};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit dispatcher config file
pub const CONFIG_ENV: &str = "LAVA_DEPLOY_CONFIG";

const APP_DIR: &str = "lava-deploy";
const DISPATCHER_FILE: &str = "dispatcher.toml";
const DEVICES_DIR: &str = "devices";

/// Configuration file loader
pub struct ConfigLoader {
    /// Directories searched for `dispatcher.toml`
    search_paths: Vec<PathBuf>,
    /// Directory the dispatcher config was loaded from
    current_dir: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            search_paths: Self::get_search_paths(),
            current_dir: None,
        }
    }

    /// Load the dispatcher configuration
    ///
    /// An explicit path must exist. Otherwise `$LAVA_DEPLOY_CONFIG` and the
    /// search paths are tried in order, falling back to defaults.
    pub fn load_dispatcher(&mut self, explicit: Option<&Path>) -> Result<DispatcherConfig> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .or_else(|| self.find_dispatcher_file()),
        };

        let config = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::ConfigLoadFailed {
                        path,
                        reason: "Configuration file does not exist".to_string(),
                    });
                }
                let config: DispatcherConfig = load_toml(&path)?;
                self.current_dir = path.parent().map(Path::to_path_buf);
                info!("Loaded dispatcher configuration from {}", path.display());
                config
            }
            None => {
                warn!("No dispatcher configuration found, using defaults");
                DispatcherConfig::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Load a device configuration by hostname or path
    ///
    /// Anything containing a path separator or ending in `.toml` is read
    /// directly; a bare name is looked up as `devices/<name>.toml` next to
    /// the dispatcher config, then in each search path.
    pub fn load_device(&self, name_or_path: &str) -> Result<DeviceConfig> {
        let direct = Path::new(name_or_path);
        let path = if name_or_path.contains('/') || name_or_path.ends_with(".toml") {
            direct.to_path_buf()
        } else {
            let file = format!("{}.toml", name_or_path);
            self.current_dir
                .iter()
                .chain(self.search_paths.iter())
                .map(|dir| dir.join(DEVICES_DIR).join(&file))
                .find(|candidate| candidate.exists())
                .ok_or(Error::ConfigNotFound)?
        };

        let device: DeviceConfig = load_toml(&path)?;
        device.validate()?;
        info!(
            "Loaded device {} ({}) from {}",
            device.hostname,
            device.device_type,
            path.display()
        );
        Ok(device)
    }

    fn find_dispatcher_file(&self) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .map(|dir| dir.join(DISPATCHER_FILE))
            .find(|path| path.exists())
    }

    /// Get default search paths for configuration files
    fn get_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(xdg_config) = env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg_config).join(APP_DIR));
        }

        if let Some(config_dir) = dirs::config_dir() {
            let candidate = config_dir.join(APP_DIR);
            if !paths.contains(&candidate) {
                paths.push(candidate);
            }
        }

        paths.push(PathBuf::from("/etc").join(APP_DIR));
        paths
    }

    /// Directory the dispatcher config came from, if any
    pub fn current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// List all search paths
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Clear all search paths and add a single path
    pub fn set_search_path(&mut self, path: PathBuf) {
        self.search_paths = vec![path];
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigLoadFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    toml::from_str(&content).map_err(|e| Error::ConfigLoadFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
