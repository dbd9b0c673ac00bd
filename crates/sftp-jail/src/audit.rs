//! Audit events and per-connection session records
//!
//! Audit events go through `tracing` with a stable `event` field so they can be
//! filtered out of the regular log stream, and serialize to JSON for export.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use tracing::{info, warn};
use uuid::Uuid;

/// Security-relevant event, one per audit log line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    /// Password or public-key check finished
    AuthAttempt {
        /// Peer address, when known
        client_ip: Option<IpAddr>,
        /// Username the client asked for
        username: String,
        /// `password` or `publickey`
        method: String,
        /// When it happened
        timestamp: DateTime<Utc>,
        /// `true` if access was granted
        success: bool,
        /// Rejection reason (`user not found`, `password not matched`, ...)
        reason: Option<String>,
    },
    /// Authenticated connection started serving channels
    SessionOpened {
        /// Connection identifier
        connection_id: String,
        /// Peer address, when known
        client_ip: Option<IpAddr>,
        /// Session owner
        username: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// Authenticated connection ended
    SessionClosed {
        /// Connection identifier
        connection_id: String,
        /// Peer address, when known
        client_ip: Option<IpAddr>,
        /// Session owner
        username: String,
        /// When it happened
        timestamp: DateTime<Utc>,
        /// Seconds from open to close
        duration_secs: i64,
    },
    /// Channel of a type other than "session" refused
    ChannelRejected {
        /// Session owner
        username: String,
        /// Requested channel type
        channel_type: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// File method the handler does not serve
    UnsupportedOperation {
        /// Session owner
        username: String,
        /// Method name (Rename, Mkdir, Readlink, ...)
        operation: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
}

impl AuditEvent {
    /// Authentication attempt, stamped now
    pub fn auth_attempt(
        client_ip: Option<IpAddr>,
        username: &str,
        method: &str,
        result: Result<(), String>,
    ) -> Self {
        let (success, reason) = match result {
            Ok(()) => (true, None),
            Err(reason) => (false, Some(reason)),
        };
        AuditEvent::AuthAttempt {
            client_ip,
            username: username.to_string(),
            method: method.to_string(),
            timestamp: Utc::now(),
            success,
            reason,
        }
    }

    /// Rejected channel open, stamped now
    pub fn channel_rejected(username: &str, channel_type: &str) -> Self {
        AuditEvent::ChannelRejected {
            username: username.to_string(),
            channel_type: channel_type.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Unsupported file method, stamped now
    pub fn unsupported_operation(username: &str, operation: &str) -> Self {
        AuditEvent::UnsupportedOperation {
            username: username.to_string(),
            operation: operation.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Emit through `tracing`, warn level for refusals
    pub fn log(&self) {
        match self {
            AuditEvent::AuthAttempt {
                username,
                method,
                success,
                reason,
                ..
            } => {
                if *success {
                    info!(
                        event = "auth_success",
                        username,
                        method,
                        audit = ?self,
                        "Access granted"
                    );
                } else {
                    warn!(
                        event = "auth_failure",
                        username,
                        method,
                        reason = ?reason,
                        audit = ?self,
                        "Access refused"
                    );
                }
            }
            AuditEvent::SessionOpened {
                connection_id,
                username,
                ..
            } => {
                info!(
                    event = "session_opened",
                    connection_id,
                    username,
                    audit = ?self,
                    "logged in"
                );
            }
            AuditEvent::SessionClosed {
                connection_id,
                username,
                duration_secs,
                ..
            } => {
                info!(
                    event = "session_closed",
                    connection_id,
                    username,
                    duration_secs,
                    audit = ?self,
                    "logged out"
                );
            }
            AuditEvent::ChannelRejected {
                username,
                channel_type,
                ..
            } => {
                warn!(
                    event = "channel_rejected",
                    username,
                    channel_type,
                    audit = ?self,
                    "Rejected channel"
                );
            }
            AuditEvent::UnsupportedOperation {
                username, operation, ..
            } => {
                warn!(
                    event = "unsupported_operation",
                    username,
                    operation,
                    audit = ?self,
                    "Unsupported file operation"
                );
            }
        }
    }

    /// Single-line JSON form
    ///
    /// # Errors
    ///
    /// Propagates `serde_json` serialization errors.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Record of one authenticated connection
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique connection identifier
    pub connection_id: String,
    /// Client address
    pub peer: Option<SocketAddr>,
    /// Session owner
    pub username: String,
    /// When authentication completed
    pub start_time: DateTime<Utc>,
}

impl SessionInfo {
    /// Start a session record; `connection_id` is generated when `None`
    pub fn new(connection_id: Option<String>, peer: Option<SocketAddr>, username: &str) -> Self {
        Self {
            connection_id: connection_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            peer,
            username: username.to_string(),
            start_time: Utc::now(),
        }
    }

    /// Whole seconds since the record was created
    pub fn duration_secs(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }

    /// `SessionOpened` event for this record
    pub fn opened(&self) -> AuditEvent {
        AuditEvent::SessionOpened {
            connection_id: self.connection_id.clone(),
            client_ip: self.peer.map(|p| p.ip()),
            username: self.username.clone(),
            timestamp: Utc::now(),
        }
    }

    /// `SessionClosed` event for this record
    pub fn closed(&self) -> AuditEvent {
        AuditEvent::SessionClosed {
            connection_id: self.connection_id.clone(),
            client_ip: self.peer.map(|p| p.ip()),
            username: self.username.clone(),
            timestamp: Utc::now(),
            duration_secs: self.duration_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_attempt_json() {
        let event = AuditEvent::auth_attempt(
            "127.0.0.1".parse().ok(),
            "alice",
            "password",
            Err("password not matched".to_string()),
        );

        let json = event.to_json().unwrap();
        assert!(json.contains("\"event_type\":\"AuthAttempt\""));
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("password not matched"));
        event.log();
    }

    #[test]
    fn test_session_info() {
        let session = SessionInfo::new(None, "10.1.2.3:50000".parse().ok(), "alice");
        assert!(Uuid::parse_str(&session.connection_id).is_ok());
        assert!(session.duration_secs() >= 0);

        match session.closed() {
            AuditEvent::SessionClosed {
                username,
                client_ip,
                duration_secs,
                ..
            } => {
                assert_eq!(username, "alice");
                assert_eq!(client_ip, "10.1.2.3".parse().ok());
                assert!(duration_secs >= 0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_keeps_given_connection_id() {
        let session = SessionInfo::new(Some("conn-1".into()), None, "bob");
        assert_eq!(session.connection_id, "conn-1");
        assert!(session.opened().to_json().unwrap().contains("conn-1"));
    }
}
