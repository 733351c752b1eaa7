//! Configuration for clients, servers and the `tcp-events` binary.
//!
//! Library users build [`SocketOptions`] / [`ServerOptions`] directly. The
//! binary resolves a [`Config`] from command-line arguments and an optional
//! TOML file; CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default listen/connect port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default kernel receive and send buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT: i64 = 3;

/// Per-socket settings shared by clients and servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// Receive buffer size; also the largest chunk taken per read, up to 1 MiB.
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    /// Connect timeout in seconds. Values `<= 0` mean one second.
    pub connect_timeout: i64,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            receive_buffer_size: DEFAULT_BUFFER_SIZE,
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl SocketOptions {
    /// Effective connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        effective_timeout(self.connect_timeout)
    }
}

pub(crate) fn effective_timeout(secs: i64) -> Duration {
    if secs <= 0 {
        Duration::from_secs(1)
    } else {
        Duration::from_secs(secs.unsigned_abs())
    }
}

/// Settings for an [`EventServer`](crate::EventServer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    /// Address to listen on.
    pub host: IpAddr,
    pub port: u16,
    pub socket: SocketOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            socket: SocketOptions::default(),
        }
    }
}

impl ServerOptions {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Which side the binary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
}

/// Command-line arguments for the binary
#[derive(Parser, Debug)]
#[command(name = "tcp-events")]
#[command(version)]
#[command(about = "Event-driven TCP messaging client and server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run as server or client
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Address to listen on in server mode
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Port to listen on in server mode
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Server to connect to in client mode (e.g., 127.0.0.1:3000)
    #[arg(long)]
    pub connect: Option<SocketAddr>,

    /// Socket receive buffer size in bytes
    #[arg(long)]
    pub receive_buffer_size: Option<usize>,

    /// Socket send buffer size in bytes
    #[arg(long)]
    pub send_buffer_size: Option<usize>,

    /// Connect timeout in seconds (values <= 0 mean 1)
    #[arg(short, long, allow_negative_numbers = true)]
    pub timeout: Option<i64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub socket: SocketOptions,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[server]` table
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Server address for client mode
    pub connect: Option<SocketAddr>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            host: default_host(),
            port: default_port(),
            connect: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_mode() -> Mode {
    Mode::Server
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub server: ServerOptions,
    /// Server address used in client mode.
    pub connect: SocketAddr,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they point to.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let socket = SocketOptions {
            receive_buffer_size: cli
                .receive_buffer_size
                .unwrap_or(toml_config.socket.receive_buffer_size),
            send_buffer_size: cli
                .send_buffer_size
                .unwrap_or(toml_config.socket.send_buffer_size),
            connect_timeout: cli.timeout.unwrap_or(toml_config.socket.connect_timeout),
        };

        let server = ServerOptions {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            socket,
        };

        let connect = cli
            .connect
            .or(toml_config.server.connect)
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), server.port));

        Ok(Config {
            mode: cli.mode.unwrap_or(toml_config.server.mode),
            server,
            connect,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
