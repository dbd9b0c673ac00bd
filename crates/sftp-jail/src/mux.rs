//! Channel multiplexer for one authenticated connection
//!
//! The transport feeds channel-open requests and connection-level (global)
//! requests into the queues of a [`Connection`]. Only `session` channels are
//! accepted; each one gets a session request dispatcher and an SFTP request
//! loop bound to a fresh [`FileHandler`].

use crate::audit::{AuditEvent, SessionInfo};
use crate::auth::SessionIdentity;
use crate::handler::FileHandler;
use crate::request_server::RequestServer;
use crate::sandbox::Sandbox;
use crate::session::{dispatch_requests, SessionRequest};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

/// The only channel type the multiplexer accepts
pub const SESSION_CHANNEL: &str = "session";

/// Queue depth for channel opens and global requests
const QUEUE_DEPTH: usize = 32;

/// Why a channel open was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Channel type other than `session`
    UnknownChannelType,
}

/// Answer to a channel-open request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelDecision {
    /// Channel accepted and being served
    Accept,
    /// Channel refused
    Reject {
        /// Failure reason sent to the client
        reason: RejectReason,
        /// Human-readable description
        message: String,
    },
}

/// A channel-open request handed over by the transport
pub struct ChannelOpen<S> {
    channel_type: String,
    stream: S,
    requests: mpsc::Receiver<SessionRequest>,
    decision: oneshot::Sender<ChannelDecision>,
}

impl<S> ChannelOpen<S> {
    /// Channel-open request over `stream`, with its session requests on `requests`
    pub fn new(
        channel_type: impl Into<String>,
        stream: S,
        requests: mpsc::Receiver<SessionRequest>,
    ) -> (Self, oneshot::Receiver<ChannelDecision>) {
        let (tx, rx) = oneshot::channel();
        let open = Self {
            channel_type: channel_type.into(),
            stream,
            requests,
            decision: tx,
        };
        (open, rx)
    }

    /// Requested channel type
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }
}

/// A connection-level request (`tcpip-forward`, `keepalive@openssh.com`, ...)
#[derive(Debug)]
pub struct GlobalRequest {
    request_type: String,
    reply: Option<oneshot::Sender<bool>>,
}

impl GlobalRequest {
    /// Global request whose sender waits for an answer
    pub fn new(request_type: impl Into<String>) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            request_type: request_type.into(),
            reply: Some(tx),
        };
        (request, rx)
    }

    /// Global request sent with `want_reply` unset
    pub fn without_reply(request_type: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            reply: None,
        }
    }

    /// Request type
    pub fn request_type(&self) -> &str {
        &self.request_type
    }
}

/// Transport side of a connection's queues
pub struct ConnectionHandle<S> {
    channels: mpsc::Sender<ChannelOpen<S>>,
    global_requests: mpsc::Sender<GlobalRequest>,
}

impl<S> Clone for ConnectionHandle<S> {
    fn clone(&self) -> Self {
        Self {
            channels: self.channels.clone(),
            global_requests: self.global_requests.clone(),
        }
    }
}

impl<S> ConnectionHandle<S> {
    /// Hand a channel-open request to the multiplexer
    ///
    /// # Errors
    ///
    /// Fails with `ChannelClosed` once the multiplexer has stopped.
    pub async fn open_channel(&self, open: ChannelOpen<S>) -> crate::Result<()> {
        self.channels
            .send(open)
            .await
            .map_err(|_| crate::Error::channel_closed("multiplexer stopped"))
    }

    /// Hand a global request to the drain task
    ///
    /// # Errors
    ///
    /// Fails with `ChannelClosed` once the drain task has stopped.
    pub async fn global_request(&self, request: GlobalRequest) -> crate::Result<()> {
        self.global_requests
            .send(request)
            .await
            .map_err(|_| crate::Error::channel_closed("global request drain stopped"))
    }
}

/// Multiplexer side of an authenticated connection
pub struct Connection<S> {
    identity: SessionIdentity,
    info: SessionInfo,
    channels: mpsc::Receiver<ChannelOpen<S>>,
    global_requests: mpsc::Receiver<GlobalRequest>,
}

impl<S> Connection<S> {
    /// Queues for a connection authenticated as `identity`
    pub fn new(identity: SessionIdentity, info: SessionInfo) -> (ConnectionHandle<S>, Self) {
        let (channel_tx, channel_rx) = mpsc::channel(QUEUE_DEPTH);
        let (global_tx, global_rx) = mpsc::channel(QUEUE_DEPTH);
        let handle = ConnectionHandle {
            channels: channel_tx,
            global_requests: global_tx,
        };
        let connection = Self {
            identity,
            info,
            channels: channel_rx,
            global_requests: global_rx,
        };
        (handle, connection)
    }

    /// Identity bound to this connection
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }
}

/// Channel counts for one served connection
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MuxSummary {
    /// `session` channels served
    pub accepted: usize,
    /// Channels refused
    pub rejected: usize,
}

/// Serve one authenticated connection until the transport closes its queues
///
/// Returns after the channel queue closes and every channel task has ended.
pub async fn serve_connection<S>(connection: Connection<S>, sandbox: Arc<Sandbox>) -> MuxSummary
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Connection {
        identity,
        info,
        mut channels,
        global_requests,
    } = connection;

    info.opened().log();
    let drain = tokio::spawn(drain_global_requests(global_requests));

    let mut summary = MuxSummary::default();
    let mut tasks = JoinSet::new();

    while let Some(open) = channels.recv().await {
        reap_finished(&mut tasks);

        let ChannelOpen {
            channel_type,
            stream,
            requests,
            decision,
        } = open;

        if channel_type != SESSION_CHANNEL {
            AuditEvent::channel_rejected(identity.username(), &channel_type).log();
            let _ = decision.send(ChannelDecision::Reject {
                reason: RejectReason::UnknownChannelType,
                message: "unknown channel type".to_string(),
            });
            summary.rejected += 1;
            continue;
        }

        if decision.send(ChannelDecision::Accept).is_err() {
            debug!(username = %identity.username(), "Channel open abandoned by transport");
            continue;
        }
        summary.accepted += 1;

        let username = identity.username().to_string();
        tasks.spawn(async move {
            dispatch_requests(&username, requests).await;
        });

        let handler = Arc::new(FileHandler::new(identity.clone(), sandbox.clone()));
        tasks.spawn(async move {
            let username = handler.identity().username().to_string();
            match RequestServer::new(stream, handler).serve().await {
                Ok(()) => debug!(username = %username, "sftp client exited session"),
                Err(e) => warn!(username = %username, error = %e, "sftp server completed with error"),
            }
        });
    }

    while let Some(finished) = tasks.join_next().await {
        log_task_exit(finished);
    }
    if let Err(e) = drain.await {
        warn!(error = %e, "Global request drain failed");
    }

    info.closed().log();
    summary
}

/// Collect channel tasks that already ended; returns how many
fn reap_finished(tasks: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while let Some(finished) = tasks.try_join_next() {
        log_task_exit(finished);
        reaped += 1;
    }
    reaped
}

fn log_task_exit(finished: Result<(), JoinError>) {
    if let Err(e) = finished {
        warn!(error = %e, "Channel task failed");
    }
}

async fn drain_global_requests(mut requests: mpsc::Receiver<GlobalRequest>) {
    while let Some(request) = requests.recv().await {
        debug!(request_type = %request.request_type, "Declined global request");
        if let Some(reply) = request.reply {
            let _ = reply.send(false);
        }
    }
}
