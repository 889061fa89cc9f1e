//! Viewer configuration, loaded from TOML.

use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error while accessing `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Full application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// DBI host invocation `[launcher]`
    pub launcher: LauncherConfig,
    /// PDB reader settings `[symbols]`
    pub symbols: SymbolConfig,
    /// Receiver and projection settings `[viewer]`
    pub viewer: ViewerConfig,
}

/// `[launcher]`: how the traced target is started.
#[derive(Debug, Deserialize, Clone)]
pub struct LauncherConfig {
    /// Path to the DBI host launcher (`drrun.exe`)
    pub drrun: PathBuf,
    /// Path to the built agent DLL
    pub client_dll: PathBuf,
}

/// `[symbols]`: debug-information access.
#[derive(Debug, Deserialize, Clone)]
pub struct SymbolConfig {
    /// Path to an unregistered PDB reader DLL (`msdia140.dll`)
    pub reader_dll: PathBuf,
    /// Optional Microsoft-style symbol path, e.g. `srv*C:\syms*https://...`
    pub search_path: Option<String>,
}

/// `[viewer]` settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ViewerConfig {
    /// Only hits whose start line lives in a file with this suffix enter
    /// the projection (e.g. `\main.cpp`)
    pub source_filter_suffix: String,
    /// Events drained per receiver iteration
    #[serde(default = "default_batch")]
    pub receive_batch: usize,
}

fn default_batch() -> usize {
    8
}

impl Config {
    /// Load, parse, and validate a `Config` from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&s)
    }

    /// Parse and validate from TOML text.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(s).map_err(ConfigError::Parse)?;

        if cfg.launcher.drrun.as_os_str().is_empty() {
            return Err(ConfigError::Validation("launcher.drrun must be set".into()));
        }
        if cfg.launcher.client_dll.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "launcher.client_dll must be set".into(),
            ));
        }
        if cfg.symbols.reader_dll.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "symbols.reader_dll must be set".into(),
            ));
        }
        if cfg.viewer.source_filter_suffix.is_empty() {
            return Err(ConfigError::Validation(
                "viewer.source_filter_suffix must not be empty".into(),
            ));
        }
        if cfg.viewer.receive_batch == 0 {
            return Err(ConfigError::Validation(
                "viewer.receive_batch must be > 0".into(),
            ));
        }
        Ok(cfg)
    }
}

/// Find the `config.toml` path by checking an override environment
/// variable first and falling back to a file next to the running
/// executable. Never panics; a missing file surfaces as a clean load
/// error at the caller.
pub fn find_config_file() -> PathBuf {
    if let Some(cfg) = env::var_os("BBTRACE_CONFIG") {
        return PathBuf::from(cfg);
    }

    let mut exe_path = env::current_exe().unwrap_or_else(|_| PathBuf::from("."));
    exe_path.pop();
    exe_path.push("config.toml");
    exe_path
}
