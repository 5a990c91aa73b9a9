use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Idle read deadline: a connection that sends nothing (not even a pong)
/// for this long is dropped.
pub const DEFAULT_PONG_WAIT_SECS: u64 = 60;
/// Upper bound on a single transport write.
pub const DEFAULT_WRITE_WAIT_SECS: u64 = 10;
/// Largest inbound message accepted (512 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512 * 1024;
/// Outbound queue capacity per connection, in frames.
pub const DEFAULT_SEND_BUFFER: usize = 256;

/// MMS real-time hub server
///
/// Only flags given explicitly on the command line override the file and
/// environment layers.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "mms-realtime", version, about = "MMS real-time connection hub")]
pub struct Cli {
    /// Port to listen on
    #[arg(long, env = "MMS_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long, env = "MMS_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./mms.toml")]
    #[serde(skip)]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Shared HS256 secret used to verify access tokens
    #[arg(long, env = "MMS_JWT_SECRET", hide_env_values = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] Box<figment::Error>),
    #[error("jwt_secret must be set (MMS_JWT_SECRET or --jwt-secret)")]
    MissingJwtSecret,
    #[error("websocket.{0} must be greater than zero")]
    Zero(&'static str),
}

/// Resolved server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub json_logs: bool,
    pub jwt_secret: String,
    #[serde(default)]
    pub websocket: WsConfig,
}

/// Connection timing and sizing (`[websocket]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,
    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            pong_wait_secs: DEFAULT_PONG_WAIT_SECS,
            write_wait_secs: DEFAULT_WRITE_WAIT_SECS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_buffer: DEFAULT_SEND_BUFFER,
        }
    }
}

fn default_pong_wait() -> u64 {
    DEFAULT_PONG_WAIT_SECS
}

fn default_write_wait() -> u64 {
    DEFAULT_WRITE_WAIT_SECS
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_send_buffer() -> usize {
    DEFAULT_SEND_BUFFER
}

impl WsConfig {
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    /// Liveness probe period: 9/10 of the read deadline, so a quiet peer is
    /// pinged before it times out.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pong_wait_secs == 0 {
            return Err(ConfigError::Zero("pong_wait_secs"));
        }
        if self.write_wait_secs == 0 {
            return Err(ConfigError::Zero("write_wait_secs"));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Zero("max_message_size"));
        }
        if self.send_buffer == 0 {
            return Err(ConfigError::Zero("send_buffer"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            jwt_secret: String::new(),
            websocket: WsConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (MMS_*) < CLI args
    pub fn load_with(cli: &Cli) -> Result<Self, ConfigError> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("MMS_").split("__"))
            .merge(Serialized::defaults(cli))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::MissingJwtSecret);
        }
        self.websocket.validate()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# MMS Real-time Hub Configuration
# Place this file at ./mms.toml or specify with --config <path>
# All settings can be overridden via environment variables (MMS_PORT,
# MMS_WEBSOCKET__SEND_BUFFER, etc.) or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# HS256 secret shared with the auth service that issues access tokens.
# Required. Prefer MMS_JWT_SECRET over writing it here.
# jwt_secret = ""

# ---- WebSocket connections ----
# [websocket]

# Seconds without any inbound frame before a connection is dropped (default: 60)
# Pings are sent every 9/10 of this value.
# pong_wait_secs = 60

# Seconds allowed for a single write to the client (default: 10)
# write_wait_secs = 10

# Maximum inbound message size in bytes (default: 524288 = 512 KiB)
# max_message_size = 524288

# Outbound queue capacity per connection; a client whose queue fills up is
# disconnected (default: 256)
# send_buffer = 256
"#
    .to_string()
}
