//! `lsp.toml`: language server definitions.
//!
//! ```toml
//! [servers.rust]
//! name = "rust-analyzer"
//! command = "rust-analyzer"
//! idle_timeout_secs = 10
//!
//! [[servers.rust.languages]]
//! language_id = "rust"
//! extensions = ["rs"]
//!
//! [servers.ts]
//! command = "typescript-language-server"
//! args = ["--stdio"]
//! env = { TSS_LOG = "-level verbose -file ${HOME}/tss.log" }
//! initialization_options = { preferences = { quotePreference = "single" } }
//!
//! [[servers.ts.languages]]
//! language_id = "typescript"
//! extensions = ["ts", "tsx"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;
use crate::notifier::DEFAULT_EXPIRY;
use crate::transport::{LaunchConfig, TransportKind};

const fn default_true() -> bool {
    true
}

const fn default_idle_timeout_secs() -> u64 {
    5
}

const fn default_max_restart_attempts() -> u32 {
    20
}

const fn default_initialize_timeout_secs() -> u64 {
    30
}

const fn default_request_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LspConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportConfig {
    #[default]
    Stdio,
    /// `transport = { tcp = "127.0.0.1:9257" }`
    Tcp(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Display name. Defaults to the table key.
    pub name: Option<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Start from the current process environment before applying `env`.
    #[serde(default = "default_true")]
    pub include_system_env: bool,
    #[serde(default)]
    pub transport: TransportConfig,
    /// One process shared by every project.
    #[serde(default)]
    pub singleton: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_initialize_timeout_secs")]
    pub initialize_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    pub initialization_options: Option<toml::Value>,
    #[serde(default)]
    pub languages: Vec<LanguageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LanguageConfig {
    pub language_id: String,
    /// Extensions without the dot.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// File name globs, e.g. `Dockerfile*`.
    #[serde(default)]
    pub file_patterns: Vec<String>,
}

impl LspConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };
        Self::parse(&content).map_err(|err| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, err);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            }
        })
    }

    /// Load the per-user file, if there is one.
    pub fn load_default() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load(&path).map(Some)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        Self::parse(content)
    }

    fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

impl ServerConfig {
    /// Launch settings with `${VAR}` references expanded.
    pub fn launch_config(&self, id: &str) -> Result<LaunchConfig, ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            id: id.to_string(),
            message,
        };
        let transport = match &self.transport {
            TransportConfig::Stdio => {
                if self.command.trim().is_empty() {
                    return Err(invalid("command is required for stdio servers".into()));
                }
                TransportKind::Stdio
            }
            TransportConfig::Tcp(address) => {
                if address.trim().is_empty() {
                    return Err(invalid("tcp address is empty".into()));
                }
                TransportKind::Tcp(expand_env_vars(address))
            }
        };
        let initialization_options = self
            .initialization_options
            .as_ref()
            .map(toml_to_json)
            .transpose()
            .map_err(invalid)?;

        Ok(LaunchConfig {
            command: expand_env_vars(&self.command),
            args: self.args.iter().map(|a| expand_env_vars(a)).collect(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), expand_env_vars(v)))
                .collect(),
            include_system_env: self.include_system_env,
            transport,
            initialization_options,
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_secs(self.initialize_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Convert a TOML value to a JSON value.
fn toml_to_json(value: &toml::Value) -> Result<Value, String> {
    match value {
        toml::Value::String(s) => Ok(Value::String(s.clone())),
        toml::Value::Integer(i) => Ok(Value::Number((*i).into())),
        toml::Value::Float(f) => {
            let n = serde_json::Number::from_f64(*f).ok_or_else(|| format!("Invalid float: {f}"))?;
            Ok(Value::Number(n))
        }
        toml::Value::Boolean(b) => Ok(Value::Bool(*b)),
        toml::Value::Array(arr) => {
            let json_arr: Result<Vec<_>, _> = arr.iter().map(toml_to_json).collect();
            Ok(Value::Array(json_arr?))
        }
        toml::Value::Table(table) => {
            let mut map = serde_json::Map::new();
            for (k, v) in table {
                map.insert(k.clone(), toml_to_json(v)?);
            }
            Ok(Value::Object(map))
        }
        toml::Value::Datetime(dt) => Ok(Value::String(dt.to_string())),
    }
}

/// Replace `${VAR}` with the variable's value (empty when unset). An
/// unclosed `${` is kept literally.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(open) = rest.find("${") {
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..open]);
        let var = &after[..close];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("berth").join("lsp.toml"))
}

// ── Runtime settings ─────────────────────────────────────────────────────

/// How the host drives the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeMode {
    /// An editor: changes are flushed when the host commits them, `didOpen`
    /// settles before feature requests, idle servers linger.
    #[default]
    Interactive,
    /// Tests and batch tools: changes are flushed immediately, no settle
    /// delay, idle servers stop at once.
    Headless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub mode: RuntimeMode,
    pub error_notification_expiry: Duration,
    /// Bound on the `shutdown` request during stop.
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Interactive,
            error_notification_expiry: DEFAULT_EXPIRY,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl RuntimeSettings {
    pub fn headless() -> Self {
        Self {
            mode: RuntimeMode::Headless,
            ..Self::default()
        }
    }
}
