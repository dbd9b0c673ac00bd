//! Connection acceptor
//!
//! Owns the TCP listener. Each accepted socket is handed to a [`Transport`] on
//! its own task, inside a `connection` span carrying a generated connection id
//! and the peer address. The accept loop never waits on a connection.

use crate::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Per-connection protocol driver
///
/// `serve` runs the handshake and then everything the connection carries,
/// returning when the connection ends.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Serve one accepted socket to completion
    async fn serve(&self, socket: TcpStream, peer: SocketAddr, connection_id: String) -> Result<()>;
}

/// Accept loop bound to one listen address
pub struct Server<T> {
    listen_addr: String,
    transport: Arc<T>,
}

impl<T: Transport> Server<T> {
    /// Acceptor for `listen_addr` (`host:port`) driving `transport`
    pub fn new(listen_addr: impl Into<String>, transport: T) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            transport: Arc::new(transport),
        }
    }

    /// Bind the listener
    ///
    /// # Errors
    ///
    /// Returns a `Connection` error when the address cannot be bound.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.listen_addr).await.map_err(|e| {
            Error::Connection(format!("Failed to listen on {}: {}", self.listen_addr, e))
        })?;
        info!(
            event = "server_listening",
            address = %self.listen_addr,
            "Listening on {}",
            self.listen_addr
        );
        Ok(listener)
    }

    /// Bind and accept forever
    ///
    /// # Errors
    ///
    /// Only a bind failure is returned; accept errors are logged and skipped.
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accept on `listener` until `shutdown` resolves
    ///
    /// Connections already handed off keep running after shutdown.
    ///
    /// # Errors
    ///
    /// Currently never fails; the signature leaves room for fatal listener errors.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                () = &mut shutdown => {
                    info!(event = "server_stopping", "Accept loop stopped");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Failed to accept incoming connection");
                    continue;
                }
            };

            self.spawn_connection(socket, peer);
        }
    }

    fn spawn_connection(&self, socket: TcpStream, peer: SocketAddr) {
        let connection_id = Uuid::new_v4().to_string();
        let span = info_span!("connection", connection_id = %connection_id, peer = %peer);
        let transport = self.transport.clone();

        tokio::spawn(
            async move {
                debug!("Connection accepted");
                if let Err(e) = socket.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                match transport.serve(socket, peer, connection_id).await {
                    Ok(()) => debug!("Connection closed"),
                    Err(e) if e.is_client_error() || matches!(e, Error::Ssh(_) | Error::Authentication(_)) => {
                        warn!(error = %e, "Connection ended with error");
                    }
                    Err(e) => error!(error = %e, "Connection failed"),
                }
            }
            .instrument(span),
        );
    }
}
