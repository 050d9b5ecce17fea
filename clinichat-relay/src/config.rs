//! Configuration system for the Clinichat development backend.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/clinichat-relay/config.toml`)
//! 4. Compiled defaults
//!
//! Staff accounts only come from the config file.

use std::path::PathBuf;

use clinichat_proto::message::ParticipantId;

use crate::store::DEFAULT_MAX_HISTORY;

/// Errors that can occur when loading backend configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A `[[staff]]` entry is unusable.
    #[error("invalid staff account {id}: {reason}")]
    InvalidStaff {
        /// Offending account id.
        id: String,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// An authenticated staff member the backend accepts tokens for.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct StaffAccount {
    /// Participant id the token identifies as.
    pub id: ParticipantId,
    /// Name shown in rosters.
    pub display_name: String,
    /// Session token presented on the push channel and as a bearer token.
    pub token: String,
}

impl StaffAccount {
    /// Creates a staff account.
    pub fn new(id: &str, display_name: &str, token: &str) -> Self {
        Self {
            id: ParticipantId::new(id),
            display_name: display_name.to_string(),
            token: token.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the backend.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    staff: Vec<StaffAccount>,
}

/// `[server]` section of the backend config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_body_size: Option<usize>,
    max_history: Option<usize>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the backend.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Clinichat development backend")]
pub struct RelayCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "CLINICHAT_RELAY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/clinichat-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum message body size in bytes.
    #[arg(long)]
    pub max_body_size: Option<usize>,

    /// Maximum archived messages per conversation.
    #[arg(long)]
    pub max_history: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CLINICHAT_RELAY_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved backend configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Maximum accepted message body size in bytes.
    pub max_body_size: usize,
    /// Maximum number of archived messages per conversation.
    pub max_history: usize,
    /// Accepted staff accounts.
    pub staff: Vec<StaffAccount>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            max_body_size: clinichat_proto::message::MAX_BODY_SIZE,
            max_history: DEFAULT_MAX_HISTORY,
            staff: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or a staff account is invalid.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, file)
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &RelayCliArgs, file: RelayConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        validate_staff(&file.staff)?;

        Ok(Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            max_body_size: cli
                .max_body_size
                .or(file.server.max_body_size)
                .unwrap_or(defaults.max_body_size),
            max_history: cli
                .max_history
                .or(file.server.max_history)
                .unwrap_or(defaults.max_history),
            staff: file.staff,
            log_level: cli.log_level.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn validate_staff(staff: &[StaffAccount]) -> Result<(), ConfigError> {
    for (i, account) in staff.iter().enumerate() {
        let invalid = |reason| ConfigError::InvalidStaff {
            id: account.id.to_string(),
            reason,
        };
        if account.id.is_empty() {
            return Err(invalid("empty id"));
        }
        if account.id.is_guest() {
            return Err(invalid("staff ids must not use the guest prefix"));
        }
        if account.token.is_empty() {
            return Err(invalid("empty token"));
        }
        if staff[..i]
            .iter()
            .any(|other| other.id == account.id || other.token == account.token)
        {
            return Err(invalid("duplicate id or token"));
        }
    }
    Ok(())
}

/// Load and parse a TOML config file for the backend.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("clinichat-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
