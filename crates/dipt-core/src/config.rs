//! Layered configuration.
//!
//! Three layers are merged field by field, later layers winning:
//!
//! 1. the user file `~/.dipt_config`
//! 2. the project file `./config.json`
//! 3. `DIPT_*` environment variables
//!
//! Missing files are empty layers. Runtime switches that only affect a
//! single pull (dry run, timeout, extra mirror) live in [`PullOverrides`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::reference::{Platform, SUPPORTED_ARCH, SUPPORTED_OS};

/// File name of the user configuration, relative to the home directory.
pub const USER_CONFIG_FILE: &str = ".dipt_config";

/// File name of the project configuration, relative to the working directory.
pub const PROJECT_CONFIG_FILE: &str = "config.json";

/// Default operating system.
pub const DEFAULT_OS: &str = "linux";

/// Default architecture.
pub const DEFAULT_ARCH: &str = "amd64";

/// Default overall pull timeout.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(120);

const TEMPLATE_MIRRORS: &[&str] = &[
    "https://registry.docker-cn.com",
    "https://docker.mirrors.ustc.edu.cn",
    "http://hub-mirror.c.163.com",
];

/// Registry section of one configuration layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryLayer {
    /// Mirror endpoints, in priority order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirrors: Option<Vec<String>>,
    /// Registry username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Registry password or token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// One configuration layer; unset fields defer to lower layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigLayer {
    /// Default operating system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_os: Option<String>,
    /// Default architecture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_arch: Option<String>,
    /// Default directory for archives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_save_dir: Option<String>,
    /// Registry settings.
    #[serde(default)]
    pub registry: RegistryLayer,
}

impl ConfigLayer {
    /// Overlays `other` on top of `self`.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            default_os: other.default_os.or(self.default_os),
            default_arch: other.default_arch.or(self.default_arch),
            default_save_dir: other.default_save_dir.or(self.default_save_dir),
            registry: RegistryLayer {
                mirrors: other.registry.mirrors.or(self.registry.mirrors),
                username: other.registry.username.or(self.registry.username),
                password: other.registry.password.or(self.registry.password),
            },
        }
    }

    /// Builds the environment layer from a variable lookup.
    pub fn from_env_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            default_os: get("DIPT_DEFAULT_OS"),
            default_arch: get("DIPT_DEFAULT_ARCH"),
            default_save_dir: get("DIPT_SAVE_DIR"),
            registry: RegistryLayer {
                mirrors: get("DIPT_REGISTRY_MIRRORS").map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(ToString::to_string)
                        .collect()
                }),
                username: get("DIPT_REGISTRY_USERNAME"),
                password: get("DIPT_REGISTRY_PASSWORD"),
            },
        }
    }

    /// Builds the environment layer from the process environment.
    pub fn from_env() -> Self {
        Self::from_env_vars(|key| std::env::var(key).ok())
    }

    /// Example project configuration.
    pub fn template() -> Self {
        Self {
            default_os: Some(DEFAULT_OS.to_string()),
            default_arch: Some(DEFAULT_ARCH.to_string()),
            default_save_dir: None,
            registry: RegistryLayer {
                mirrors: Some(TEMPLATE_MIRRORS.iter().map(ToString::to_string).collect()),
                username: Some(String::new()),
                password: Some(String::new()),
            },
        }
    }

    // Empty strings in files mean "unset", as the file format has no nulls.
    fn normalized(self) -> Self {
        let keep = |v: Option<String>| v.filter(|s| !s.is_empty());
        Self {
            default_os: keep(self.default_os),
            default_arch: keep(self.default_arch),
            default_save_dir: keep(self.default_save_dir),
            registry: RegistryLayer {
                mirrors: self.registry.mirrors,
                username: keep(self.registry.username),
                password: keep(self.registry.password),
            },
        }
    }
}

/// Registry settings after merging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySettings {
    /// Mirror endpoints, in priority order.
    pub mirrors: Vec<String>,
    /// Registry username.
    pub username: Option<String>,
    /// Registry password or token.
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

/// Configuration the puller runs with. Read-only once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    /// Default operating system.
    pub default_os: String,
    /// Default architecture.
    pub default_arch: String,
    /// Default directory for archives.
    pub default_save_dir: PathBuf,
    /// Registry settings.
    pub registry: RegistrySettings,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self::from_layer(ConfigLayer::default())
    }
}

impl EffectiveConfig {
    /// Resolves a merged layer against the built-in defaults.
    pub fn from_layer(layer: ConfigLayer) -> Self {
        Self {
            default_os: layer.default_os.unwrap_or_else(|| DEFAULT_OS.to_string()),
            default_arch: layer
                .default_arch
                .unwrap_or_else(|| DEFAULT_ARCH.to_string()),
            default_save_dir: layer
                .default_save_dir
                .map_or_else(|| PathBuf::from("."), PathBuf::from),
            registry: RegistrySettings {
                mirrors: layer.registry.mirrors.unwrap_or_default(),
                username: layer.registry.username,
                password: layer.registry.password,
            },
        }
    }

    /// Sets the mirror list.
    #[must_use]
    pub fn with_mirrors(mut self, mirrors: Vec<String>) -> Self {
        self.registry.mirrors = mirrors;
        self
    }

    /// Sets registry credentials.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.registry.username = Some(username.into());
        self.registry.password = Some(password.into());
        self
    }

    /// Default platform.
    pub fn platform(&self) -> Platform {
        Platform::new(&self.default_os, &self.default_arch)
    }

    /// Returns true when both username and password are set.
    pub fn has_credentials(&self) -> bool {
        matches!(
            (&self.registry.username, &self.registry.password),
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty()
        )
    }
}

/// Locates, reads and writes configuration files.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    user_path: Option<PathBuf>,
    project_path: PathBuf,
}

impl ConfigLoader {
    /// Creates a loader with explicit file locations.
    pub fn new(user_path: Option<PathBuf>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            user_path,
            project_path: project_path.into(),
        }
    }

    /// Uses `~/.dipt_config` and `./config.json`.
    pub fn discover() -> Self {
        Self::new(
            dirs::home_dir().map(|home| home.join(USER_CONFIG_FILE)),
            PROJECT_CONFIG_FILE,
        )
    }

    /// Path of the user file, if a home directory is known.
    pub fn user_path(&self) -> Option<&Path> {
        self.user_path.as_deref()
    }

    /// Path of the project file.
    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Loads all layers, including the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an existing file cannot be read or parsed.
    pub fn load(&self) -> Result<EffectiveConfig, ConfigError> {
        self.load_with_env(ConfigLayer::from_env())
    }

    /// Loads the file layers and overlays the given environment layer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an existing file cannot be read or parsed.
    pub fn load_with_env(&self, env: ConfigLayer) -> Result<EffectiveConfig, ConfigError> {
        let user = self.user_layer()?;
        let project = read_layer(&self.project_path)?;
        Ok(EffectiveConfig::from_layer(user.merge(project).merge(env)))
    }

    /// Reads the user layer alone.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
    pub fn user_layer(&self) -> Result<ConfigLayer, ConfigError> {
        match &self.user_path {
            Some(path) => read_layer(path),
            None => Ok(ConfigLayer::default()),
        }
    }

    /// Writes the user layer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoHomeDir`] without a home directory, or an
    /// I/O error if writing fails.
    pub fn save_user(&self, layer: &ConfigLayer) -> Result<(), ConfigError> {
        let path = self.user_path.as_deref().ok_or(ConfigError::NoHomeDir)?;
        write_layer(path, layer)
    }

    /// Validates and stores a single user setting.
    ///
    /// Keys are `os`, `arch` and `save_dir`. The save directory is created
    /// when missing and stored as an absolute path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unknown keys, invalid values or I/O failures.
    pub fn set_value(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut layer = self.user_layer()?;
        match key {
            "os" => {
                validate_choice(key, value, SUPPORTED_OS)?;
                layer.default_os = Some(value.to_string());
            }
            "arch" => {
                validate_choice(key, value, SUPPORTED_ARCH)?;
                layer.default_arch = Some(value.to_string());
            }
            "save_dir" => {
                let dir = Path::new(value);
                fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
                let absolute = std::path::absolute(dir).map_err(|source| ConfigError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
                layer.default_save_dir = Some(absolute.to_string_lossy().into_owned());
            }
            "mirror" | "mirrors" => {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "use the mirror subcommands (list, add, del, clear)".to_string(),
                });
            }
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        self.save_user(&layer)?;
        debug!(key, value, "Updated user configuration");
        Ok(())
    }

    /// Mirrors configured in the user layer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the user file cannot be read.
    pub fn mirrors(&self) -> Result<Vec<String>, ConfigError> {
        Ok(self.user_layer()?.registry.mirrors.unwrap_or_default())
    }

    /// Appends a mirror to the user layer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateMirror`] if it is already configured.
    pub fn add_mirror(&self, url: &str) -> Result<(), ConfigError> {
        let url = validate_mirror(url)?;
        let mut layer = self.user_layer()?;
        let mirrors = layer.registry.mirrors.get_or_insert_with(Vec::new);
        if mirrors.iter().any(|m| m == url) {
            return Err(ConfigError::DuplicateMirror(url.to_string()));
        }
        mirrors.push(url.to_string());
        self.save_user(&layer)
    }

    /// Removes a mirror from the user layer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownMirror`] if it is not configured.
    pub fn remove_mirror(&self, url: &str) -> Result<(), ConfigError> {
        let mut layer = self.user_layer()?;
        let mirrors = layer.registry.mirrors.get_or_insert_with(Vec::new);
        let before = mirrors.len();
        mirrors.retain(|m| m != url);
        if mirrors.len() == before {
            return Err(ConfigError::UnknownMirror(url.to_string()));
        }
        self.save_user(&layer)
    }

    /// Removes all mirrors from the user layer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the user file cannot be read or written.
    pub fn clear_mirrors(&self) -> Result<(), ConfigError> {
        let mut layer = self.user_layer()?;
        layer.registry.mirrors = Some(Vec::new());
        self.save_user(&layer)
    }

    /// Writes the example project configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::AlreadyExists`] if the project file exists.
    pub fn init_project(&self) -> Result<&Path, ConfigError> {
        if self.project_path.exists() {
            return Err(ConfigError::AlreadyExists(self.project_path.clone()));
        }
        write_layer(&self.project_path, &ConfigLayer::template())?;
        Ok(&self.project_path)
    }
}

fn read_layer(path: &Path) -> Result<ConfigLayer, ConfigError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Config file not found, using empty layer");
            return Ok(ConfigLayer::default());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if data.trim().is_empty() {
        return Ok(ConfigLayer::default());
    }
    let layer: ConfigLayer = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(layer.normalized())
}

fn write_layer(path: &Path, layer: &ConfigLayer) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(layer).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(io_err)
}

fn validate_choice(key: &str, value: &str, allowed: &[&str]) -> Result<(), ConfigError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("'{value}' is not one of {}", allowed.join(", ")),
        })
    }
}

fn validate_mirror(url: &str) -> Result<&str, ConfigError> {
    let url = url.trim();
    if url.is_empty() || url.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidValue {
            key: "mirror".to_string(),
            reason: format!("'{url}' is not a mirror URL"),
        });
    }
    Ok(url)
}

/// Per-invocation switches read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOverrides {
    /// Plan only, transfer nothing (`DIPT_DRY_RUN=1`).
    pub dry_run: bool,
    /// Overall pull deadline (`DIPT_TIMEOUT`, seconds).
    pub timeout: Duration,
    /// Mirror tried before all configured ones (`DIPT_CUSTOM_MIRROR`).
    pub custom_mirror: Option<String>,
}

impl Default for PullOverrides {
    fn default() -> Self {
        Self {
            dry_run: false,
            timeout: DEFAULT_PULL_TIMEOUT,
            custom_mirror: None,
        }
    }
}

impl PullOverrides {
    /// Reads overrides from a variable lookup.
    ///
    /// An unparsable or zero `DIPT_TIMEOUT` falls back to the default.
    pub fn from_env_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let timeout = match lookup("DIPT_TIMEOUT") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    warn!(value = %raw, "Ignoring invalid DIPT_TIMEOUT");
                    DEFAULT_PULL_TIMEOUT
                }
            },
            None => DEFAULT_PULL_TIMEOUT,
        };
        Self {
            dry_run: lookup("DIPT_DRY_RUN").is_some_and(|v| v.trim() == "1"),
            timeout,
            custom_mirror: lookup("DIPT_CUSTOM_MIRROR")
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty()),
        }
    }

    /// Reads overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_env_vars(|key| std::env::var(key).ok())
    }

    /// Sets the dry run flag.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets the overall timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the custom mirror.
    #[must_use]
    pub fn with_custom_mirror(mut self, mirror: impl Into<String>) -> Self {
        self.custom_mirror = Some(mirror.into());
        self
    }

    /// Mirror list with the custom mirror, if any, in front.
    pub fn mirrors(&self, config: &EffectiveConfig) -> Vec<String> {
        let mut mirrors = Vec::with_capacity(config.registry.mirrors.len() + 1);
        if let Some(custom) = &self.custom_mirror {
            mirrors.push(custom.clone());
        }
        for mirror in &config.registry.mirrors {
            if !mirrors.contains(mirror) {
                mirrors.push(mirror.clone());
            }
        }
        mirrors
    }
}
