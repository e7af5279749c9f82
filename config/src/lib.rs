//! Configuration file loading for tether.
//!
//! The file lives at `$TETHER_CONFIG` or `~/.tether/config.toml`:
//!
//! ```toml
//! [endpoint]
//! url = "ws://${LSP_HOST}/lsp"
//! language = "rust"
//!
//! [session]
//! request_timeout_ms = 60000
//! max_reconnect_attempts = 3
//! ```

use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::Deserialize;
use tether_lsp::SessionConfig;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "TETHER_CONFIG";

#[derive(Debug, Default, Deserialize)]
pub struct TetherConfig {
    pub endpoint: Option<EndpointConfig>,
    pub session: Option<SessionConfig>,
}

/// Where the language server lives.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    /// WebSocket base URL; `?language=` is appended when connecting.
    /// `${VAR}` references are expanded from the environment.
    pub url: Option<String>,
    /// `host:port` of a server speaking `Content-Length` framed LSP over TCP.
    pub tcp: Option<String>,
    /// Default language when none is given on the command line.
    pub language: Option<String>,
}

impl EndpointConfig {
    /// The WebSocket URL with environment references expanded.
    #[must_use]
    pub fn resolved_url(&self) -> Option<String> {
        self.url.as_deref().map(expand_env_vars)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

impl TetherConfig {
    /// Load the config file from its default location.
    ///
    /// A missing file is not an error and yields `Ok(None)`.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            tracing::debug!("No config file at {}", path.display());
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    /// Load an explicitly named config file. Unlike [`TetherConfig::load`],
    /// a missing file is an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {}: {err}", path.display());
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {}: {err}", path.display());
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Session settings, with defaults for anything not configured.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        self.session.clone().unwrap_or_default()
    }
}

/// Replace `${VAR}` with the value of `VAR`. Unset variables become empty;
/// an unclosed `${` is kept as-is.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &rest[start + 2..start + 2 + len];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &rest[start + 2 + len + 1..];
    }

    out.push_str(rest);
    out
}

/// `$TETHER_CONFIG` if set, else `~/.tether/config.toml`.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
}
