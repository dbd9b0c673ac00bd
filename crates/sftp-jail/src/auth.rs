//! Authentication and session identity
//!
//! The [`IdentityProvider`] decides whether offered credentials authenticate to
//! a configured account. A successful check yields a [`SessionIdentity`], which
//! is owned by one connection and handed down to everything serving it.

use crate::config::Account;
use crate::{Error, Result};
use russh::keys::{HashAlg, PublicKey};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Extension key carrying the SHA-256 fingerprint of the key used to log in
pub const PUBKEY_FINGERPRINT_EXTENSION: &str = "pubkey-fp";

/// How a session authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Username and plaintext secret
    Password,
    /// Public key from the authorized keys file
    PublicKey,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password => f.write_str("password"),
            AuthMethod::PublicKey => f.write_str("publickey"),
        }
    }
}

/// Authenticated identity bound to one transport connection
///
/// Built once during the handshake and never changed afterwards. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    username: Arc<str>,
    method: AuthMethod,
    extensions: Vec<(String, String)>,
}

impl SessionIdentity {
    /// Identity for `username` authenticated with `method`
    pub fn new(username: impl Into<Arc<str>>, method: AuthMethod) -> Self {
        Self {
            username: username.into(),
            method,
            extensions: Vec::new(),
        }
    }

    /// Attach a permission extension
    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.push((key.into(), value.into()));
        self
    }

    /// Authenticated username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Method used to authenticate
    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// Permission extension value for `key`
    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Why an authentication attempt was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthRejection {
    /// No configured account with this username
    #[error("user not found")]
    UserNotFound,
    /// Account exists, secret differs
    #[error("password not matched")]
    PasswordMismatch,
    /// Offered key is not in the authorized keys set
    #[error("unknown public key for {0:?}")]
    UnknownPublicKey(String),
}

/// Public key offered by a client, reduced to what the provider compares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedKey {
    /// Marshaled (SSH wire format) key bytes
    pub blob: Vec<u8>,
    /// SHA-256 fingerprint, `SHA256:<base64>`
    pub fingerprint: String,
}

impl OfferedKey {
    /// Reduce a parsed SSH public key
    ///
    /// # Errors
    ///
    /// Fails if the key cannot be encoded in wire format.
    pub fn from_ssh(key: &PublicKey) -> Result<Self> {
        let blob = key
            .to_bytes()
            .map_err(|e| Error::Ssh(format!("Failed to encode public key: {}", e)))?;
        Ok(Self {
            blob,
            fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
        })
    }
}

/// Decides whether credentials authenticate to a known account
pub trait IdentityProvider: Send + Sync {
    /// Check a username and plaintext secret
    ///
    /// # Errors
    ///
    /// Returns the rejection reason when the credentials do not match.
    fn verify_password(
        &self,
        username: &str,
        secret: &str,
    ) -> std::result::Result<SessionIdentity, AuthRejection>;

    /// Check a username and offered public key
    ///
    /// # Errors
    ///
    /// Returns the rejection reason when the key is not authorized.
    fn verify_public_key(
        &self,
        username: &str,
        key: &OfferedKey,
    ) -> std::result::Result<SessionIdentity, AuthRejection>;
}

/// Authorized keys set
///
/// Keys are kept as marshaled wire bytes; a login matches on exact byte equality.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    /// Path the keys were loaded from, if any
    keys_file: Option<PathBuf>,
    keys: Vec<Vec<u8>>,
}

impl AuthorizedKeys {
    /// Empty set; public-key authentication always fails
    pub fn empty() -> Self {
        Self::default()
    }

    /// Set built from already-marshaled key blobs
    pub fn from_blobs(keys: Vec<Vec<u8>>) -> Self {
        Self {
            keys_file: None,
            keys,
        }
    }

    /// Load keys from an OpenSSH `authorized_keys` file
    ///
    /// Blank lines and `#` comments are skipped.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the file does not exist, cannot be read, or
    /// has a line that does not parse as a public key.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            warn!("Authorized keys file not found: {:?}", path);
            return Err(Error::Config(format!(
                "Authorized keys file not found: {:?}",
                path
            )));
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read authorized_keys: {}", e)))?;

        let mut keys = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let blob = parse_key_line(trimmed).map_err(|e| {
                Error::Config(format!(
                    "Failed to parse authorized key at {:?} line {}: {}",
                    path,
                    index + 1,
                    e
                ))
            })?;
            debug!("Loaded public key from line {}", index + 1);
            keys.push(blob);
        }

        info!("Loaded {} authorized keys from {:?}", keys.len(), path);

        Ok(Self {
            keys_file: Some(path.to_path_buf()),
            keys,
        })
    }

    /// `true` if `blob` matches an authorized key byte for byte
    pub fn is_authorized(&self, blob: &[u8]) -> bool {
        self.keys.iter().any(|k| k.as_slice() == blob)
    }

    /// Number of loaded keys
    pub fn count(&self) -> usize {
        self.keys.len()
    }

    /// File the keys came from
    pub fn source(&self) -> Option<&Path> {
        self.keys_file.as_deref()
    }
}

/// Parse one `authorized_keys` line into marshaled key bytes
///
/// Accepts `[options] <type> <base64> [comment]`; the first `<type> <base64>`
/// pair that parses wins.
pub fn parse_key_line(line: &str) -> Result<Vec<u8>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(Error::Config(
            "Invalid key format: expected at least <type> <key>".into(),
        ));
    }

    for pair in parts.windows(2) {
        if let Ok(key) = PublicKey::from_openssh(&format!("{} {}", pair[0], pair[1])) {
            return key
                .to_bytes()
                .map_err(|e| Error::Config(format!("Failed to encode public key: {}", e)));
        }
    }

    Err(Error::Config("No parseable public key on line".into()))
}

/// Configured accounts plus authorized keys, read-only after startup
#[derive(Debug, Clone)]
pub struct AccountStore {
    accounts: HashMap<String, Account>,
    authorized_keys: AuthorizedKeys,
}

impl AccountStore {
    /// Build the store from configured accounts and an authorized keys set
    pub fn new(accounts: impl IntoIterator<Item = Account>, authorized_keys: AuthorizedKeys) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|a| (a.username.clone(), a))
                .collect(),
            authorized_keys,
        }
    }

    /// `true` if `username` is a configured account
    pub fn contains(&self, username: &str) -> bool {
        self.accounts.contains_key(username)
    }

    /// Usernames of every configured account
    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.accounts.keys().map(String::as_str)
    }
}

impl IdentityProvider for AccountStore {
    fn verify_password(
        &self,
        username: &str,
        secret: &str,
    ) -> std::result::Result<SessionIdentity, AuthRejection> {
        let account = self
            .accounts
            .get(username)
            .ok_or(AuthRejection::UserNotFound)?;

        if account.password != secret {
            return Err(AuthRejection::PasswordMismatch);
        }

        Ok(SessionIdentity::new(username, AuthMethod::Password))
    }

    fn verify_public_key(
        &self,
        username: &str,
        key: &OfferedKey,
    ) -> std::result::Result<SessionIdentity, AuthRejection> {
        if !self.authorized_keys.is_authorized(&key.blob) {
            return Err(AuthRejection::UnknownPublicKey(username.to_string()));
        }

        if !self.contains(username) {
            return Err(AuthRejection::UserNotFound);
        }

        Ok(SessionIdentity::new(username, AuthMethod::PublicKey)
            .with_extension(PUBKEY_FINGERPRINT_EXTENSION, key.fingerprint.clone()))
    }
}
