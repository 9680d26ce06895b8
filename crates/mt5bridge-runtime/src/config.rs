use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::BridgeError;

const CONFIG_ENV: &str = "MT5BRIDGE_CONFIG";
const HOME_ENV: &str = "MT5BRIDGE_PYTHON_HOME";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
}

/// How the embedded interpreter is brought up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RuntimeConfig {
    /// Interpreter home (the embeddable distribution's root).
    pub home: Option<PathBuf>,
    /// Extra import roots, placed ahead of the default `sys.path`.
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TerminalConfig {
    /// Name of the vendor module imported at handshake.
    #[serde(default = "default_module")]
    pub module: String,
}

fn default_module() -> String {
    "MetaTrader5".into()
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            module: default_module(),
        }
    }
}

impl BridgeConfig {
    pub fn from_file(path: &Path) -> Result<Self, BridgeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            BridgeError::Config(format!("failed to parse {}: {e}", path.display()))
        })
    }

    /// Resolve configuration from the environment.
    ///
    /// `MT5BRIDGE_CONFIG` names an explicit file; otherwise the per-user
    /// `mt5bridge/config.toml` is used when present. `MT5BRIDGE_PYTHON_HOME`
    /// overrides `runtime.home` either way.
    pub fn load() -> Result<Self, BridgeError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        if let Some(home) = std::env::var_os(HOME_ENV) {
            config.runtime.home = Some(PathBuf::from(home));
        }
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mt5bridge").join("config.toml"))
    }

    /// Apply a caller-supplied interpreter home, which wins over the file.
    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        if home.is_some() {
            self.runtime.home = home;
        }
        self
    }
}
