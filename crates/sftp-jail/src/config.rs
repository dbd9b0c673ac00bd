//! Configuration for the SFTP jail server
//!
//! Loaded once at startup from TOML, or from JSON when the file name ends in
//! `.json`. The JSON form also accepts the legacy PascalCase keys
//! (`Accounts`, `BasePath`, `SSHKeyPath`, `Address`, `Port`,
//! `SftpAuthorizedKeysFile`).

use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::sandbox::Sandbox;

/// One login account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Login name; also the name of the user's sandbox directory
    #[serde(alias = "Username")]
    pub username: String,
    /// Plaintext secret compared on password authentication
    #[serde(alias = "Password")]
    pub password: String,
}

/// SFTP jail server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address
    #[serde(default = "default_address", alias = "Address")]
    pub address: String,

    /// Server port; the legacy JSON form stores it as a string
    #[serde(
        default = "default_port",
        alias = "Port",
        deserialize_with = "deserialize_port"
    )]
    pub port: u16,

    /// Directory holding one sandbox root per account
    #[serde(default = "default_base_path", alias = "BasePath")]
    pub base_path: PathBuf,

    /// SSH host private key (OpenSSH format)
    #[serde(default = "default_host_key_path", alias = "SSHKeyPath")]
    pub host_key_path: PathBuf,

    /// Authorized keys file; public-key authentication is off when unset
    #[serde(
        default,
        alias = "SftpAuthorizedKeysFile",
        deserialize_with = "deserialize_optional_path"
    )]
    pub authorized_keys_path: Option<PathBuf>,

    /// Accounts allowed to log in
    #[serde(default, alias = "Accounts")]
    pub accounts: Vec<Account>,

    /// SSH identification string sent to clients
    #[serde(default = "default_server_id")]
    pub server_id: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            base_path: default_base_path(),
            host_key_path: default_host_key_path(),
            authorized_keys_path: None,
            accounts: Vec::new(),
            server_id: default_server_id(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML or JSON file
    ///
    /// # Errors
    ///
    /// Returns `Config` errors when the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns a `Config` error on malformed input.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Parse configuration from JSON text
    ///
    /// # Errors
    ///
    /// Returns a `Config` error on malformed input.
    pub fn from_json_str(content: &str) -> crate::Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// `<address>:<port>` to listen on
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Path resolver rooted at the configured base path
    pub fn sandbox(&self) -> Sandbox {
        Sandbox::new(self.base_path.clone())
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns a `Config` error naming the first problem found.
    pub fn validate(&self) -> crate::Result<()> {
        if self.port == 0 {
            return Err(crate::Error::Config("port must be non-zero".to_string()));
        }

        if self.base_path.as_os_str().is_empty() {
            return Err(crate::Error::Config("base_path must be set".to_string()));
        }

        if self.accounts.is_empty() {
            return Err(crate::Error::Config(
                "at least one account must be configured".to_string(),
            ));
        }

        let sandbox = self.sandbox();
        let mut seen = HashSet::new();
        for account in &self.accounts {
            sandbox.root_for(&account.username).map_err(|_| {
                crate::Error::Config(format!(
                    "Username is not a valid directory name: {:?}",
                    account.username
                ))
            })?;

            if !seen.insert(account.username.as_str()) {
                return Err(crate::Error::Config(format!(
                    "Duplicate account: {}",
                    account.username
                )));
            }
        }

        Ok(())
    }

    /// Create the base path and every account's sandbox root if missing
    ///
    /// # Errors
    ///
    /// Fails when a directory cannot be created.
    pub fn prepare_sandboxes(&self) -> crate::Result<()> {
        self.sandbox()
            .prepare(self.accounts.iter().map(|a| a.username.as_str()))
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2022
}

fn default_base_path() -> PathBuf {
    PathBuf::from("/srv/sftp")
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("/etc/ssh/ssh_host_ed25519_key")
}

fn default_server_id() -> String {
    "SSH-2.0-SFTP".to_string()
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        Text(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(port) => Ok(port),
        PortValue::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {:?}", text))),
    }
}

// The legacy JSON form writes "" for "no authorized keys file".
fn deserialize_optional_path<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()).map(PathBuf::from))
}
