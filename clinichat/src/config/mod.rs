//! Configuration system for the `clinichat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/clinichat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use clinichat_proto::message::ParticipantId;
use clinichat_proto::push::Credential;
use clinichat_proto::scope::Universe;

use crate::channel::relay::RelaySettings;
use crate::identity;
use crate::sync::SyncConfig;

/// Errors that can occur when loading configuration.
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

    /// A setting has a value that cannot be used.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Name of the setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The guest identity could not be loaded or stored.
    #[error("guest identity unavailable: {0}")]
    Identity(#[source] std::io::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    sync: SyncFileConfig,
    storage: StorageFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    relay_url: Option<String>,
    api_url: Option<String>,
    identity: Option<String>,
    token: Option<String>,
    universe: Option<String>,
    connect_timeout_secs: Option<u64>,
    identify_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    coalesce_window_ms: Option<u64>,
    ledger_capacity: Option<usize>,
    read_receipt_delay_ms: Option<u64>,
    event_buffer: Option<usize>,
    tick_interval_ms: Option<u64>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    session_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Push channel WebSocket URL.
    pub relay_url: String,
    /// Base URL of the backend's HTTP API.
    pub api_url: String,
    /// Guest id to use instead of the stored one.
    pub identity: Option<String>,
    /// Staff session token. Without one the client runs as a guest.
    pub token: Option<String>,
    /// Universe shown first.
    pub universe: Universe,
    /// Timeout for opening the push channel.
    pub connect_timeout: Duration,
    /// Timeout for the identify handshake.
    pub identify_timeout: Duration,
    /// Timeout for HTTP requests.
    pub request_timeout: Duration,
    /// Channel capacity for command/event mpsc channels.
    pub channel_capacity: usize,

    // -- Sync --
    /// Synchronization engine settings.
    pub sync: SyncConfig,
    /// How often due read receipts are applied.
    pub tick_interval: Duration,

    // -- Storage --
    /// Directory holding session records and the guest id.
    pub session_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9000/ws".to_string(),
            api_url: "http://127.0.0.1:9000/".to_string(),
            identity: None,
            token: None,
            universe: Universe::Guest,
            connect_timeout: Duration::from_secs(10),
            identify_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            sync: SyncConfig::default(),
            tick_interval: Duration::from_millis(250),
            session_dir: default_session_dir(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/clinichat/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if a setting has an unusable value.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let universe = match cli.universe.as_ref().or(file.network.universe.as_ref()) {
            Some(name) => name.parse().map_err(|e| ConfigError::InvalidValue {
                field: "universe",
                reason: format!("{e}"),
            })?,
            None => defaults.universe,
        };
        let channel_capacity = file
            .network
            .channel_capacity
            .unwrap_or(defaults.channel_capacity);
        if channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "channel_capacity",
                reason: "must be at least 1".to_string(),
            });
        }

        let sync = SyncConfig {
            coalesce_window_ms: file
                .sync
                .coalesce_window_ms
                .unwrap_or(defaults.sync.coalesce_window_ms),
            ledger_capacity: file
                .sync
                .ledger_capacity
                .unwrap_or(defaults.sync.ledger_capacity),
            read_receipt_delay: match file.sync.read_receipt_delay_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.sync.read_receipt_delay,
            },
            event_buffer: file
                .sync
                .event_buffer
                .unwrap_or(defaults.sync.event_buffer),
        };

        Ok(Self {
            relay_url: cli
                .relay_url
                .clone()
                .or_else(|| file.network.relay_url.clone())
                .unwrap_or(defaults.relay_url),
            api_url: cli
                .api_url
                .clone()
                .or_else(|| file.network.api_url.clone())
                .unwrap_or(defaults.api_url),
            identity: cli
                .identity
                .clone()
                .or_else(|| file.network.identity.clone()),
            token: cli.token.clone().or_else(|| file.network.token.clone()),
            universe,
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            identify_timeout: file
                .network
                .identify_timeout_secs
                .map_or(defaults.identify_timeout, Duration::from_secs),
            request_timeout: file
                .network
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            channel_capacity,
            sync,
            tick_interval: file
                .sync
                .tick_interval_ms
                .map_or(defaults.tick_interval, Duration::from_millis),
            session_dir: cli
                .session_dir
                .clone()
                .or_else(|| file.storage.session_dir.clone())
                .unwrap_or(defaults.session_dir),
        })
    }

    /// Push channel settings derived from this configuration.
    #[must_use]
    pub const fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            connect_timeout: self.connect_timeout,
            identify_timeout: self.identify_timeout,
            capacity: self.channel_capacity,
        }
    }

    /// The credential to connect with.
    ///
    /// A configured token wins. Otherwise the configured guest id is used,
    /// or the one stored in the session directory, minting it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the configured identity is
    /// not a guest id, and [`ConfigError::Identity`] if the stored guest id
    /// cannot be read or written.
    pub fn credential(&self) -> Result<Credential, ConfigError> {
        if let Some(token) = &self.token {
            return Ok(Credential::Token(token.clone()));
        }
        if let Some(identity) = &self.identity {
            let id = ParticipantId::new(identity.as_str());
            if !id.is_guest() {
                return Err(ConfigError::InvalidValue {
                    field: "identity",
                    reason: format!("{id} is not a guest id; staff connect with a token"),
                });
            }
            return Ok(Credential::Guest(id));
        }
        identity::load_or_mint_guest(&self.session_dir)
            .map(Credential::Guest)
            .map_err(ConfigError::Identity)
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Clinic chat client")]
pub struct CliArgs {
    /// WebSocket URL of the push channel.
    #[arg(long, env = "CLINICHAT_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Base URL of the backend HTTP API.
    #[arg(long, env = "CLINICHAT_API_URL")]
    pub api_url: Option<String>,

    /// Staff session token.
    #[arg(long, env = "CLINICHAT_TOKEN")]
    pub token: Option<String>,

    /// Guest id to chat as (default: stored or freshly minted).
    #[arg(long, env = "CLINICHAT_IDENTITY")]
    pub identity: Option<String>,

    /// Universe shown first (`guest` or `internal`).
    #[arg(long)]
    pub universe: Option<String>,

    /// Directory for session records.
    #[arg(long, env = "CLINICHAT_SESSION_DIR")]
    pub session_dir: Option<PathBuf>,

    /// Path to config file (default: `~/.config/clinichat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CLINICHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/clinichat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_session_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("clinichat")
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("clinichat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
