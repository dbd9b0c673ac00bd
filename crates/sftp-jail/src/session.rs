//! Per-channel session request dispatcher
//!
//! A session channel carries out-of-band requests (`subsystem`, `shell`,
//! `exec`, `pty-req`, `env`, ...) next to its data stream. Only a `subsystem`
//! request naming `sftp` is accepted; everything else is answered with failure.

use crate::protocol::SFTP_SUBSYSTEM;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// One request received on a session channel
#[derive(Debug)]
pub struct SessionRequest {
    request_type: String,
    payload: Bytes,
    reply: Option<oneshot::Sender<bool>>,
}

impl SessionRequest {
    /// Request whose sender waits for the success/failure answer
    pub fn new(
        request_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            request_type: request_type.into(),
            payload: payload.into(),
            reply: Some(tx),
        };
        (request, rx)
    }

    /// Request sent with `want_reply` unset
    pub fn without_reply(request_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            request_type: request_type.into(),
            payload: payload.into(),
            reply: None,
        }
    }

    /// Wire payload for a `subsystem` request: 4-byte length, then the name
    pub fn subsystem_payload(name: &str) -> Bytes {
        let mut payload = Vec::with_capacity(4 + name.len());
        payload.extend_from_slice(&u32::try_from(name.len()).unwrap_or(u32::MAX).to_be_bytes());
        payload.extend_from_slice(name.as_bytes());
        Bytes::from(payload)
    }

    /// Request type (`subsystem`, `shell`, `exec`, ...)
    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    /// Subsystem name: the bytes after the 4-byte length prefix
    ///
    /// `None` for other request types and for payloads shorter than the prefix.
    pub fn subsystem_name(&self) -> Option<&[u8]> {
        if self.request_type != "subsystem" {
            return None;
        }
        self.payload.get(4..)
    }

    /// `true` only for a `subsystem` request naming `sftp`
    pub fn is_sftp_subsystem(&self) -> bool {
        self.subsystem_name() == Some(SFTP_SUBSYSTEM.as_bytes())
    }

    fn respond(self, ok: bool) {
        if let Some(reply) = self.reply {
            // the requester may have given up waiting
            let _ = reply.send(ok);
        }
    }
}

/// What a dispatcher did over its lifetime
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Requests answered with success
    pub accepted: usize,
    /// Requests answered with failure
    pub rejected: usize,
}

/// Answer every request on one channel until its queue closes
pub async fn dispatch_requests(
    username: &str,
    mut requests: mpsc::Receiver<SessionRequest>,
) -> DispatchSummary {
    let mut summary = DispatchSummary::default();

    while let Some(request) = requests.recv().await {
        let ok = request.is_sftp_subsystem();
        if ok {
            debug!(username = %username, "SFTP subsystem requested");
            summary.accepted += 1;
        } else {
            warn!(
                username = %username,
                request_type = %request.request_type(),
                subsystem = ?request.subsystem_name().map(String::from_utf8_lossy),
                "Declined session request"
            );
            summary.rejected += 1;
        }
        request.respond(ok);
    }

    summary
}
