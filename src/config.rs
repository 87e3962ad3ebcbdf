//! Configuration loading and validation.
//!
//! `telos.toml` is optional. Every section uses `#[serde(default)]`, so an
//! empty file (or no file) yields the built-in policy.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use telos_engine::{EngineConfig, TaintLevel};

use crate::host::SensitiveFiles;
use crate::protocol::DEFAULT_SOCKET_PATH;
use crate::store::DEFAULT_PIN_DIR;

/// Default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/telos/telos.toml";

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Paths and runtime settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Policy written to the config table at startup.
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Paths and runtime settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Control socket path.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Compiled engine object.
    #[serde(default = "default_bpf_object")]
    pub bpf_object: PathBuf,

    /// Directory on the BPF filesystem where the process table is pinned.
    #[serde(default = "default_pin_dir")]
    pub pin_dir: PathBuf,

    /// Capacity of the channel between the engine and the audit consumer.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// JSON-lines file receiving one entry per blocked action.
    #[serde(default)]
    pub audit_log: Option<PathBuf>,

    /// Directory for rotated daemon logs. Stderr only when unset.
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            bpf_object: default_bpf_object(),
            pin_dir: default_pin_dir(),
            event_queue_capacity: default_event_queue_capacity(),
            audit_log: None,
            logs_dir: None,
        }
    }
}

/// Enforcement policy.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Highest taint allowed to exec (name or number).
    #[serde(default = "default_max_taint_for_exec")]
    pub max_taint_for_exec: String,

    /// Carried in the config table. The file gate keys on `CRITICAL`.
    #[serde(default = "default_max_taint_for_open")]
    pub max_taint_for_open: String,

    /// Deny blocked actions. When false, violations are only reported.
    #[serde(default = "default_true")]
    pub enforce: bool,

    /// Sensitive file name globs: `NAME`, `PREFIX*` or `*SUFFIX`.
    #[serde(default = "default_sensitive_files")]
    pub sensitive_files: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_taint_for_exec: default_max_taint_for_exec(),
            max_taint_for_open: default_max_taint_for_open(),
            enforce: true,
            sensitive_files: default_sensitive_files(),
        }
    }
}

impl PolicyConfig {
    /// The config-table record this policy describes.
    ///
    /// # Errors
    ///
    /// Returns an error if either threshold is not a taint level.
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let exec: TaintLevel = self
            .max_taint_for_exec
            .parse()
            .with_context(|| "policy.max_taint_for_exec")?;
        let open: TaintLevel = self
            .max_taint_for_open
            .parse()
            .with_context(|| "policy.max_taint_for_open")?;
        Ok(EngineConfig::new(exec, open, self.enforce))
    }

    /// Parsed sensitive file patterns.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid glob.
    pub fn sensitive_files(&self) -> anyhow::Result<SensitiveFiles> {
        SensitiveFiles::from_globs(&self.sensitive_files).context("policy.sensitive_files")
    }
}

impl Config {
    /// Validate that values are usable before anything is loaded.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.daemon.event_queue_capacity > 0,
            "daemon.event_queue_capacity must be > 0"
        );
        anyhow::ensure!(
            self.daemon.socket_path.file_name().is_some(),
            "daemon.socket_path must name a file"
        );
        self.policy.engine_config()?;
        self.policy.sensitive_files()?;
        Ok(())
    }
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Load `path` if given, else the default file if it exists, else the
/// built-in defaults.
///
/// # Errors
///
/// Returns an error if a config file exists but is invalid, or if an
/// explicitly given file is missing.
pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                load_config(default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

// Default value functions for serde.

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_bpf_object() -> PathBuf {
    PathBuf::from("bin/bpf_lsm.o")
}

fn default_pin_dir() -> PathBuf {
    PathBuf::from(DEFAULT_PIN_DIR)
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_max_taint_for_exec() -> String {
    TaintLevel::Medium.name().to_owned()
}

fn default_max_taint_for_open() -> String {
    TaintLevel::High.name().to_owned()
}

fn default_true() -> bool {
    true
}

fn default_sensitive_files() -> Vec<String> {
    vec!["id_*".to_owned()]
}
