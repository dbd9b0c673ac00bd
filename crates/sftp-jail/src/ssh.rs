//! SSH transport built on `russh`
//!
//! `russh` runs the handshake and the connection protocol. This module only
//! translates its callbacks: authentication goes to the [`IdentityProvider`],
//! and channel opens, channel requests and global requests are forwarded into
//! the multiplexer queues of the authenticated [`Connection`].

use crate::audit::{AuditEvent, SessionInfo};
use crate::auth::{AuthMethod, AuthRejection, IdentityProvider, OfferedKey, SessionIdentity};
use crate::mux::{
    serve_connection, ChannelDecision, ChannelOpen, Connection, ConnectionHandle, GlobalRequest,
    SESSION_CHANNEL,
};
use crate::sandbox::Sandbox;
use crate::server::Transport;
use crate::session::SessionRequest;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, ChannelStream, SshId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, Instrument};

/// Stream type of an accepted SSH channel
pub type SshChannelStream = ChannelStream<Msg>;

/// Queue depth for one channel's session requests
const REQUEST_QUEUE_DEPTH: usize = 8;

/// Load an OpenSSH-format host private key
///
/// # Errors
///
/// Returns a `Config` error when the key cannot be read or decoded.
pub fn load_host_key(path: impl AsRef<Path>) -> Result<PrivateKey> {
    let path = path.as_ref();
    let key = russh::keys::load_secret_key(path, None)
        .map_err(|e| Error::Config(format!("Failed to load host key {:?}: {}", path, e)))?;
    info!(
        event = "host_key_loaded",
        path = ?path,
        algorithm = %key.algorithm(),
        "Host key loaded"
    );
    Ok(key)
}

/// `russh` server configuration
///
/// No inactivity timeout: connections live until the client closes them.
pub fn ssh_config(server_id: &str, host_key: PrivateKey) -> russh::server::Config {
    russh::server::Config {
        server_id: SshId::Standard(server_id.to_string()),
        inactivity_timeout: None,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![host_key],
        ..Default::default()
    }
}

/// [`Transport`] speaking SSH on every accepted socket
pub struct SshTransport {
    config: Arc<russh::server::Config>,
    identities: Arc<dyn IdentityProvider>,
    sandbox: Arc<Sandbox>,
}

impl SshTransport {
    /// Transport authenticating against `identities` and serving files from `sandbox`
    pub fn new(
        config: russh::server::Config,
        identities: Arc<dyn IdentityProvider>,
        sandbox: Arc<Sandbox>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            identities,
            sandbox,
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn serve(&self, socket: TcpStream, peer: SocketAddr, connection_id: String) -> Result<()> {
        let handler = ConnectionHandler {
            peer,
            connection_id,
            identities: self.identities.clone(),
            sandbox: self.sandbox.clone(),
            connection: None,
            channel_requests: HashMap::new(),
        };

        let session = russh::server::run_stream(self.config.clone(), socket, handler).await?;
        session.await
    }
}

/// `russh` handler for one TCP connection
struct ConnectionHandler {
    peer: SocketAddr,
    connection_id: String,
    identities: Arc<dyn IdentityProvider>,
    sandbox: Arc<Sandbox>,
    /// Set once authentication succeeds
    connection: Option<ConnectionHandle<SshChannelStream>>,
    channel_requests: HashMap<ChannelId, mpsc::Sender<SessionRequest>>,
}

impl ConnectionHandler {
    fn finish_auth(
        &mut self,
        username: &str,
        method: AuthMethod,
        outcome: std::result::Result<SessionIdentity, AuthRejection>,
    ) -> Auth {
        let method_name = method.to_string();
        match outcome {
            Ok(identity) => {
                AuditEvent::auth_attempt(Some(self.peer.ip()), username, &method_name, Ok(()))
                    .log();
                self.start_connection(identity);
                Auth::Accept
            }
            Err(rejection) => {
                AuditEvent::auth_attempt(
                    Some(self.peer.ip()),
                    username,
                    &method_name,
                    Err(rejection.to_string()),
                )
                .log();
                reject()
            }
        }
    }

    fn start_connection(&mut self, identity: SessionIdentity) {
        let info = SessionInfo::new(
            Some(self.connection_id.clone()),
            Some(self.peer),
            identity.username(),
        );
        let (handle, connection) = Connection::new(identity, info);
        tokio::spawn(serve_connection(connection, self.sandbox.clone()).in_current_span());
        self.connection = Some(handle);
    }

    async fn open_channel(&mut self, channel_type: &str, channel: Channel<Msg>) -> Result<bool> {
        let Some(connection) = self.connection.clone() else {
            debug!(channel_type, "Channel open before authentication");
            return Ok(false);
        };

        let id = channel.id();
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (open, decision) = ChannelOpen::new(channel_type, channel.into_stream(), requests_rx);
        connection.open_channel(open).await?;

        match decision.await {
            Ok(ChannelDecision::Accept) => {
                self.channel_requests.insert(id, requests_tx);
                Ok(true)
            }
            // russh answers every refused open with ADMINISTRATIVELY_PROHIBITED
            Ok(ChannelDecision::Reject { reason, message }) => {
                debug!(channel_type, ?reason, reason_text = %message, "Channel refused");
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    async fn forward_request(
        &mut self,
        channel: ChannelId,
        request_type: &str,
        payload: Bytes,
        session: &mut Session,
    ) -> Result<()> {
        let accepted = match self.channel_requests.get(&channel) {
            Some(requests) => {
                let (request, reply) = SessionRequest::new(request_type, payload);
                if requests.send(request).await.is_ok() {
                    reply.await.unwrap_or(false)
                } else {
                    false
                }
            }
            None => false,
        };

        if accepted {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn forward_global(&self, request_type: &str) -> Result<bool> {
        let Some(connection) = &self.connection else {
            return Ok(false);
        };
        let (request, reply) = GlobalRequest::new(request_type);
        connection.global_request(request).await?;
        Ok(reply.await.unwrap_or(false))
    }
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

fn string_payload(parts: &[&[u8]]) -> Bytes {
    let mut payload = BytesMut::new();
    for part in parts {
        payload.put_u32(u32::try_from(part.len()).unwrap_or(u32::MAX));
        payload.put_slice(part);
    }
    payload.freeze()
}

impl Handler for ConnectionHandler {
    type Error = Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        let outcome = self.identities.verify_password(user, password);
        Ok(self.finish_auth(user, AuthMethod::Password, outcome))
    }

    async fn auth_publickey_offered(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth> {
        let offered = OfferedKey::from_ssh(public_key)?;
        match self.identities.verify_public_key(user, &offered) {
            Ok(_) => Ok(Auth::Accept),
            Err(rejection) => {
                debug!(username = %user, reason = %rejection, "Public key offer declined");
                Ok(reject())
            }
        }
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth> {
        let offered = OfferedKey::from_ssh(public_key)?;
        let outcome = self.identities.verify_public_key(user, &offered);
        Ok(self.finish_auth(user, AuthMethod::PublicKey, outcome))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        self.open_channel(SESSION_CHANNEL, channel).await
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        self.open_channel("direct-tcpip", channel).await
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        self.open_channel("x11", channel).await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        let payload = SessionRequest::subsystem_payload(name);
        self.forward_request(channel, "subsystem", payload, session).await
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<()> {
        self.forward_request(channel, "shell", Bytes::new(), session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        let payload = string_payload(&[data]);
        self.forward_request(channel, "exec", payload, session).await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<()> {
        let payload = string_payload(&[variable_name.as_bytes(), variable_value.as_bytes()]);
        self.forward_request(channel, "env", payload, session).await
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<()> {
        let payload = string_payload(&[term.as_bytes()]);
        self.forward_request(channel, "pty-req", payload, session).await
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        // dropping the sender ends that channel's dispatcher
        self.channel_requests.remove(&channel);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        _address: &str,
        _port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool> {
        self.forward_global("tcpip-forward").await
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        self.forward_global("cancel-tcpip-forward").await
    }
}
