//! Session profiles loaded at startup.

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use shellmux_shell::{ConnectionSpec, LocalShellConfig};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "SHELLMUX_CONFIG";

const DEFAULT_PROFILE_NAME: &str = "local";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("duplicate session name {0:?}")]
    DuplicateName(String),
}

/// A named session to open at startup.
#[derive(Clone, Debug, Deserialize)]
pub struct SessionProfile {
    pub name: String,
    #[serde(flatten)]
    pub spec: ConnectionSpec,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ShellmuxConfig {
    #[serde(default)]
    pub sessions: Vec<SessionProfile>,
}

impl ShellmuxConfig {
    /// One local shell with platform defaults.
    pub fn single_local() -> Self {
        Self {
            sessions: vec![SessionProfile {
                name: DEFAULT_PROFILE_NAME.to_string(),
                spec: ConnectionSpec::Local(LocalShellConfig::default()),
            }],
        }
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.sessions.is_empty() {
            return Ok(Self::single_local());
        }
        {
            let mut seen = std::collections::HashSet::new();
            for profile in &self.sessions {
                if !seen.insert(profile.name.as_str()) {
                    return Err(ConfigError::DuplicateName(profile.name.clone()));
                }
            }
        }
        Ok(self)
    }
}

/// Resolve the config path: explicit argument, then `$SHELLMUX_CONFIG`, then
/// `~/.shellmux/sessions.json`.
pub fn config_path(arg: Option<String>) -> Option<PathBuf> {
    arg.map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .or_else(|| home_dir().map(|home| home.join(".shellmux").join("sessions.json")))
}

/// Load profiles from `path`. A missing file yields a single local session.
pub fn load(path: &Path) -> Result<ShellmuxConfig, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::info!("no config at {}, opening a local shell", path.display());
            return Ok(ShellmuxConfig::single_local());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let config: ShellmuxConfig =
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()
}

/// Get the user's home directory.
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
