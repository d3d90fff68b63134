//! Configuration for the framecast server and client binaries.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. The resolved
//! [`Config`] is built once at startup and handed by reference into the
//! engine constructors; there is no ambient global configuration.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments shared by the server and client binaries.
#[derive(Parser, Debug)]
#[command(name = "framecast")]
#[command(version = "0.1.0")]
#[command(about = "Framed TCP messaging with chunked file transfer", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address the server binds to (e.g., 127.0.0.1:8990)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Address the client dials
    #[arg(long)]
    pub connect: Option<String>,

    /// Number of client connections to open
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// Directory to save downloaded files into (omit to discard received bytes)
    #[arg(long)]
    pub save_dir: Option<PathBuf>,

    /// Mean wait between file requests in seconds
    #[arg(long)]
    pub mean_wait: Option<f64>,

    /// Largest samplable wait between file requests in seconds
    #[arg(long)]
    pub max_wait: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-side listen settings.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Sockets accepted beyond this count are closed immediately
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

/// Frame and chunk size bounds.
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Largest declared payload for ordinary messages, in bytes
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
    /// Largest file chunk per FILE_RESPOND frame, in bytes
    #[serde(default = "default_max_chunk_len")]
    pub max_chunk_len: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
            max_chunk_len: default_max_chunk_len(),
        }
    }
}

/// Heartbeat send-interval jitter window, in seconds.
///
/// Each connection picks one interval in `[min, max)`, seeded by its id, so
/// heartbeats stay desynchronized across many connections.
#[derive(Debug, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_min")]
    pub min_interval_secs: u64,
    #[serde(default = "default_heartbeat_max")]
    pub max_interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_heartbeat_min(),
            max_interval_secs: default_heartbeat_max(),
        }
    }
}

/// File-transfer settings for both roles.
#[derive(Debug, Deserialize)]
pub struct TransferConfig {
    /// Directory the server serves requested files from
    #[serde(default = "default_file_root")]
    pub file_root: PathBuf,
    /// Initial state of the transfers-allowed gate
    #[serde(default = "default_true")]
    pub allow_on_start: bool,
    /// Catalog of files known to both sides (name + declared size)
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Additive floor on every sampled wait, in seconds
    #[serde(default = "default_min_wait")]
    pub min_wait_secs: u64,
    /// Mean of the exponential inter-request wait, in seconds
    #[serde(default = "default_mean_wait")]
    pub mean_wait_secs: f64,
    /// Largest samplable wait bucket, in seconds
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            file_root: default_file_root(),
            allow_on_start: true,
            files: Vec::new(),
            min_wait_secs: default_min_wait(),
            mean_wait_secs: default_mean_wait(),
            max_wait_secs: default_max_wait(),
        }
    }
}

/// One catalog entry: both sides are assumed to know the name and the
/// total size out of band; completion is inferred by byte counting.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

/// Client-side dial settings.
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Server address to dial
    #[serde(default = "default_connect")]
    pub connect: String,
    /// Number of connections to open
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Directory to save downloads into; omit to receive and discard
    pub save_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            connections: default_connections(),
            save_dir: None,
        }
    }
}

/// Logging configuration.
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

fn default_listen() -> String {
    "127.0.0.1:8990".to_string()
}

fn default_connect() -> String {
    "127.0.0.1:8990".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_frame_len() -> u32 {
    1024
}

fn default_max_chunk_len() -> u32 {
    32 * 1024
}

fn default_heartbeat_min() -> u64 {
    100
}

fn default_heartbeat_max() -> u64 {
    200
}

fn default_file_root() -> PathBuf {
    PathBuf::from("files")
}

fn default_min_wait() -> u64 {
    2
}

fn default_mean_wait() -> f64 {
    30.0
}

fn default_max_wait() -> usize {
    60
}

fn default_connections() -> usize {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub connect: String,
    pub connections: usize,
    pub max_connections: usize,
    pub max_frame_len: u32,
    pub max_chunk_len: u32,
    pub heartbeat_min_secs: u64,
    pub heartbeat_max_secs: u64,
    pub file_root: PathBuf,
    pub allow_on_start: bool,
    pub files: Vec<FileEntry>,
    pub min_wait_secs: u64,
    pub mean_wait_secs: f64,
    pub max_wait_secs: usize,
    pub save_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::from_parts(TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut config = Config::from_parts(toml_config);

        // CLI overrides.
        if let Some(listen) = cli.listen {
            config.listen = listen;
        }
        if let Some(connect) = cli.connect {
            config.connect = connect;
        }
        if let Some(connections) = cli.connections {
            config.connections = connections;
        }
        if let Some(save_dir) = cli.save_dir {
            config.save_dir = Some(save_dir);
        }
        if let Some(mean_wait) = cli.mean_wait {
            config.mean_wait_secs = mean_wait;
        }
        if let Some(max_wait) = cli.max_wait {
            config.max_wait_secs = max_wait;
        }
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }

        config.validate()?;
        Ok(config)
    }

    fn from_parts(toml_config: TomlConfig) -> Self {
        Config {
            listen: toml_config.server.listen,
            connect: toml_config.client.connect,
            connections: toml_config.client.connections,
            max_connections: toml_config.server.max_connections,
            max_frame_len: toml_config.limits.max_frame_len,
            max_chunk_len: toml_config.limits.max_chunk_len,
            heartbeat_min_secs: toml_config.heartbeat.min_interval_secs,
            heartbeat_max_secs: toml_config.heartbeat.max_interval_secs,
            file_root: toml_config.transfer.file_root,
            allow_on_start: toml_config.transfer.allow_on_start,
            files: toml_config.transfer.files,
            min_wait_secs: toml_config.transfer.min_wait_secs,
            mean_wait_secs: toml_config.transfer.mean_wait_secs,
            max_wait_secs: toml_config.transfer.max_wait_secs,
            save_dir: toml_config.client.save_dir,
            log_level: toml_config.logging.level,
        }
    }

    /// Reject value combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_len == 0 || self.max_chunk_len == 0 {
            return Err(ConfigError::Invalid(
                "max_frame_len and max_chunk_len must be positive".into(),
            ));
        }
        if self.heartbeat_min_secs >= self.heartbeat_max_secs {
            return Err(ConfigError::Invalid(format!(
                "heartbeat interval window is empty: [{}, {})",
                self.heartbeat_min_secs, self.heartbeat_max_secs
            )));
        }
        if self.mean_wait_secs <= 0.0 {
            return Err(ConfigError::Invalid(
                "mean_wait_secs must be positive".into(),
            ));
        }
        if self.max_wait_secs < 2 {
            return Err(ConfigError::Invalid(
                "max_wait_secs must be at least 2".into(),
            ));
        }
        Ok(())
    }

    /// Bound for the oversize check: the larger of the ordinary-message
    /// and file-chunk limits, since both kinds arrive on the same socket.
    pub fn frame_limit(&self) -> u32 {
        self.max_frame_len.max(self.max_chunk_len)
    }

    /// Exponential rate parameter: the reciprocal of the mean wait.
    pub fn lambda(&self) -> f64 {
        1.0 / self.mean_wait_secs
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen, "127.0.0.1:8990");
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.max_frame_len, 1024);
        assert_eq!(config.max_chunk_len, 32 * 1024);
        assert_eq!(config.frame_limit(), 32 * 1024);
        assert!(config.allow_on_start);
        assert!(config.save_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:8990"
            max_connections = 64

            [limits]
            max_frame_len = 512
            max_chunk_len = 16384

            [heartbeat]
            min_interval_secs = 30
            max_interval_secs = 60

            [transfer]
            file_root = "srv/files"
            allow_on_start = false
            min_wait_secs = 1
            mean_wait_secs = 10.0
            max_wait_secs = 20

            [[transfer.files]]
            name = "bigfile.bin"
            size = 2147479552

            [client]
            connect = "10.0.0.1:8990"
            connections = 5

            [logging]
            level = "debug"
        "#;

        let parsed: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::from_parts(parsed);
        assert_eq!(config.listen, "0.0.0.0:8990");
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.max_chunk_len, 16384);
        assert!(!config.allow_on_start);
        assert_eq!(
            config.files,
            vec![FileEntry {
                name: "bigfile.bin".to_string(),
                size: 2147479552,
            }]
        );
        assert_eq!(config.connections, 5);
        assert_eq!(config.log_level, "debug");
        assert!((config.lambda() - 0.1).abs() < 1e-12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_heartbeat_window() {
        let config = Config {
            heartbeat_min_secs: 200,
            heartbeat_max_secs: 200,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_degenerate_wait_table() {
        let config = Config {
            max_wait_secs: 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
