//! # SFTP Jail
//!
//! Multi-account SFTP server confining every account to its own directory.
//!
//! - [`server`] accepts TCP connections and hands each to a [`server::Transport`]
//! - [`ssh`] runs the SSH handshake with `russh` and authenticates through an
//!   [`auth::IdentityProvider`]
//! - [`mux`] accepts `session` channels on an authenticated connection and
//!   refuses the rest
//! - [`session`] answers per-channel requests; only the `sftp` subsystem succeeds
//! - [`request_server`] speaks SFTP v3 on a channel stream
//! - [`handler`] serves file operations one at a time per channel
//! - [`sandbox`] maps every client path under `<base_path>/<username>`
//!
//! Rename, mkdir, rmdir, symlink, setstat and readlink are always refused.

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod handler;
pub mod listing;
pub mod mux;
pub mod protocol;
pub mod request_server;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod ssh;

pub use auth::{AccountStore, AuthorizedKeys, IdentityProvider, SessionIdentity};
pub use config::{Config, LogFormat};
pub use error::{Error, Result};
pub use handler::{FileHandler, Operation, Outcome};
pub use sandbox::Sandbox;
pub use server::{Server, Transport};
pub use ssh::{load_host_key, ssh_config, SshTransport};
