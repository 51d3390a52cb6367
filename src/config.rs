//! Configuration for the web server.
//!
//! Supports positional command-line arguments and a TOML configuration
//! file. CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the web server
#[derive(Parser, Debug)]
#[command(name = "serve-a-page")]
#[command(author = "serve-a-page authors")]
#[command(version = "0.1.0")]
#[command(about = "An epoll-based multi-threaded static web server", long_about = None)]
pub struct CliArgs {
    /// Port to listen on, above the well-known range
    #[arg(value_parser = clap::value_parser!(u16).range(1025..))]
    pub port: Option<u16>,

    /// Worker threads handling connection I/O
    pub workers: Option<usize>,

    /// Concurrent credential-check slots
    pub credential_slots: Option<usize>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

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
    pub site: SiteSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub credentials: CredentialSection,
}

/// Listener and event-loop configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Worker threads handling connection I/O
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Idle-connection timeout in milliseconds (0 disables eviction)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Trigger mode: 0 = level, 1 = connections edge, 2 = listener edge,
    /// 3 = both edge
    #[serde(default = "default_trig_mode")]
    pub trig_mode: u8,
    /// Linger on close so unsent data gets a second to drain
    #[serde(default)]
    pub linger: bool,
    /// Connection ceiling; clients beyond it get the busy response
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            workers: default_workers(),
            timeout_ms: default_timeout_ms(),
            trig_mode: default_trig_mode(),
            linger: false,
            max_clients: default_max_clients(),
            backlog: default_backlog(),
        }
    }
}

/// Served content configuration
#[derive(Debug, Deserialize, Default)]
pub struct SiteSection {
    /// Document root; `<working dir>/resources` when omitted
    pub root: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LogSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for rolling log files; console logging when omitted
    pub dir: Option<PathBuf>,
    /// Lines per log file before rolling to a numbered sibling
    #[serde(default = "default_log_max_lines")]
    pub max_lines: usize,
    /// Bounded queue between workers and the log writer thread
    #[serde(default = "default_log_queue_depth")]
    pub queue_depth: usize,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            max_lines: default_log_max_lines(),
            queue_depth: default_log_queue_depth(),
        }
    }
}

/// Credential store configuration
#[derive(Debug, Deserialize)]
pub struct CredentialSection {
    /// Concurrent credential-check slots
    #[serde(default = "default_credential_slots")]
    pub slots: usize,
    /// Seed accounts, each `user:password`
    #[serde(default)]
    pub users: Vec<String>,
}

impl Default for CredentialSection {
    fn default() -> Self {
        Self {
            slots: default_credential_slots(),
            users: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    1316
}

fn default_workers() -> usize {
    6
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_trig_mode() -> u8 {
    3
}

fn default_max_clients() -> usize {
    65536
}

fn default_backlog() -> i32 {
    6
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_lines() -> usize {
    50_000
}

fn default_log_queue_depth() -> usize {
    1024
}

fn default_credential_slots() -> usize {
    12
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub workers: usize,
    pub credential_slots: usize,
    pub trig_mode: u8,
    pub timeout_ms: u64,
    pub linger: bool,
    pub max_clients: usize,
    pub backlog: i32,
    pub root: PathBuf,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub log_max_lines: usize,
    pub log_queue_depth: usize,
    pub seed_users: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            workers: default_workers(),
            credential_slots: default_credential_slots(),
            trig_mode: default_trig_mode(),
            timeout_ms: default_timeout_ms(),
            linger: false,
            max_clients: default_max_clients(),
            backlog: default_backlog(),
            root: PathBuf::from("resources"),
            log_level: default_log_level(),
            log_dir: None,
            log_max_lines: default_log_max_lines(),
            log_queue_depth: default_log_queue_depth(),
            seed_users: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        resolve(cli, toml_config)
    }
}

/// Merge CLI args with TOML config (CLI takes precedence) and validate.
fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Config, ConfigError> {
    let root = match toml_config.site.root {
        Some(root) => root,
        None => std::env::current_dir()
            .map_err(ConfigError::WorkingDir)?
            .join("resources"),
    };

    let config = Config {
        port: cli.port.unwrap_or(toml_config.server.port),
        workers: cli.workers.unwrap_or(toml_config.server.workers),
        credential_slots: cli
            .credential_slots
            .unwrap_or(toml_config.credentials.slots),
        trig_mode: toml_config.server.trig_mode,
        timeout_ms: toml_config.server.timeout_ms,
        linger: toml_config.server.linger,
        max_clients: toml_config.server.max_clients,
        backlog: toml_config.server.backlog,
        root,
        log_level: if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.log.level
        },
        log_dir: toml_config.log.dir,
        log_max_lines: toml_config.log.max_lines,
        log_queue_depth: toml_config.log.queue_depth,
        seed_users: toml_config.credentials.users,
    };

    if config.workers == 0 {
        return Err(ConfigError::Invalid("workers must be at least 1"));
    }
    if config.credential_slots == 0 {
        return Err(ConfigError::Invalid(
            "credential_slots must be at least 1",
        ));
    }
    if config.trig_mode > 3 {
        return Err(ConfigError::Invalid("trig_mode must be 0 through 3"));
    }

    Ok(config)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    WorkingDir(std::io::Error),
    Invalid(&'static str),
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
            ConfigError::WorkingDir(e) => {
                write!(f, "Failed to resolve working directory: {}", e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}
