//! Application configuration.
//!
//! Layered: built-in defaults, then the TOML config file, then `TANDEM__*`
//! environment variables (`TANDEM__SERVER__PORT=9000`).

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "tandem";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub claude: ClaudeConfig,
    pub codex: CodexConfig,
    pub sidecar: SidecarConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the session database. Supports `~` and `$VARS`.
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 41900,
            cors_origins: Vec::new(),
        }
    }
}

/// CLI query provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeConfig {
    pub binary: String,
    pub extra_args: Vec<String>,
    pub default_model: Option<String>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            extra_args: Vec::new(),
            default_model: None,
        }
    }
}

/// Thread API provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodexConfig {
    pub binary: String,
    pub extra_args: Vec<String>,
    pub default_model: Option<String>,
    /// Sandbox policy passed to the provider (`read-only`, `workspace-write`, ...).
    pub sandbox: Option<String>,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            binary: "codex".to_string(),
            extra_args: Vec::new(),
            default_model: None,
            sandbox: Some("workspace-write".to_string()),
        }
    }
}

/// Out-of-process execution of the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    pub enabled: bool,
    /// Binary to spawn. Defaults to the running executable.
    pub binary: Option<String>,
    /// Seconds to wait for the readiness line before proceeding anyway.
    pub ready_timeout_secs: u64,
    /// Run in-process when the sidecar cannot be started.
    pub fallback_in_process: bool,
    /// Directories prepended to the sidecar's `PATH`.
    pub extra_path: Vec<String>,
    /// Proxy URL exported as `HTTP(S)_PROXY` to the sidecar.
    pub proxy: Option<String>,
    /// Host variables copied into the sidecar environment when set.
    pub forward_env: Vec<String>,
    /// Extra `KEY=VALUE` pairs for the sidecar environment.
    pub env: Vec<String>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: None,
            ready_timeout_secs: 10,
            fallback_in_process: true,
            extra_path: Vec::new(),
            proxy: None,
            forward_env: [
                "HOME",
                "ANTHROPIC_API_KEY",
                "ANTHROPIC_BASE_URL",
                "CLAUDE_CODE_OAUTH_TOKEN",
                "OPENAI_API_KEY",
                "OPENAI_BASE_URL",
                "CODEX_HOME",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            env: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load the layered configuration. A missing file is not an error.
    pub fn load(config_file: &Path) -> Result<Self> {
        let defaults = AppConfig::default();
        let built = Config::builder()
            .set_default("logging.level", defaults.logging.level)?
            .set_default("server.host", defaults.server.host)?
            .set_default("server.port", i64::from(defaults.server.port))?
            .add_source(
                File::from(config_file)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(&env_prefix())
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("loading config from {}", config_file.display()))?;

        let config: AppConfig = built.try_deserialize().context("parsing config")?;
        Ok(config)
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match self.paths.data_dir.as_deref() {
            Some(dir) => expand_str_path(dir),
            None => default_data_dir(),
        }
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("sessions.db"))
    }
}

/// Write the default configuration to `path`, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display());
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_file() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}
