use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::privileged::HelperOptions;
use crate::wireguard::ToolPaths;

const APP_DIR: &str = "wgpanel";
const CONFIG_FILE: &str = "config.toml";

/// Application settings, read from `~/.config/wgpanel/config.toml`.
///
/// ```toml
/// [general]
/// config_dir = "/etc/wireguard"
/// wg_bin = "/usr/bin/wg"
/// wg_quick_bin = "/usr/bin/wg-quick"
///
/// [privileged]
/// tool = "pkexec"
/// helper_path = ""
/// passthrough_env = ["DISPLAY", "WAYLAND_DISPLAY", "XAUTHORITY"]
/// in_process_when_root = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub privileged: PrivilegedConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub config_dir: PathBuf,
    pub wg_bin: PathBuf,
    pub wg_quick_bin: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        let tools = ToolPaths::default();
        Self {
            config_dir: PathBuf::from("/etc/wireguard"),
            wg_bin: tools.wg,
            wg_quick_bin: tools.wg_quick,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivilegedConfig {
    /// Elevation tool; empty spawns the helper directly.
    pub tool: String,
    /// Helper executable; empty means the running binary.
    pub helper_path: String,
    /// Variables kept in the helper's otherwise empty environment.
    pub passthrough_env: Vec<String>,
    pub in_process_when_root: bool,
}

impl Default for PrivilegedConfig {
    fn default() -> Self {
        Self {
            tool: "pkexec".into(),
            helper_path: String::new(),
            passthrough_env: [
                "DISPLAY",
                "WAYLAND_DISPLAY",
                "XAUTHORITY",
                "XDG_RUNTIME_DIR",
                "DBUS_SESSION_BUS_ADDRESS",
                "LANG",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            in_process_when_root: true,
        }
    }
}

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (key, path) in [
            ("general.config_dir", &self.general.config_dir),
            ("general.wg_bin", &self.general.wg_bin),
            ("general.wg_quick_bin", &self.general.wg_quick_bin),
        ] {
            if !path.is_absolute() {
                return Err(AppError::Config(format!(
                    "{} must be an absolute path, got {}",
                    key,
                    path.display()
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn tools(&self) -> ToolPaths {
        ToolPaths {
            wg: self.general.wg_bin.clone(),
            wg_quick: self.general.wg_quick_bin.clone(),
        }
    }

    #[must_use]
    pub fn helper_options(&self) -> HelperOptions {
        HelperOptions {
            config_dir: self.general.config_dir.clone(),
            tools: self.tools(),
        }
    }
}

/// Root config directory: ~/.config/wgpanel/
#[must_use]
pub fn app_config_dir() -> PathBuf {
    xdg_config_home().join(APP_DIR)
}

#[must_use]
pub fn default_config_path() -> PathBuf {
    app_config_dir().join(CONFIG_FILE)
}

fn xdg_config_home() -> PathBuf {
    if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(config)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".config")
    } else {
        PathBuf::from("/tmp")
    }
}

/// Load an explicit config file, or the default one. Only a missing
/// default file falls back to built-in settings.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = default_config_path();
            if !path.exists() {
                return Ok(AppConfig::default());
            }
            path
        }
    };
    let content = std::fs::read_to_string(&path).map_err(|e| {
        AppError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    AppConfig::from_toml(&content)
}
