//! TCP listener for chat clients.
//!
//! Accepts connections, numbers them, and runs each one as its own task in a
//! [`JoinSet`] so the server can tear all of them down when it stops.

use crate::config::Config;
use crate::connection::{handle_connection, ClientId, Session};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pending connection queue length for the listening socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept so errors like EMFILE do not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Hands out client IDs in accept order, starting at 1.
///
/// Owned by the accept loop alone, so no synchronization is needed.
#[derive(Debug)]
struct ClientIds {
    next: ClientId,
}

impl ClientIds {
    fn new() -> Self {
        ClientIds { next: 1 }
    }

    fn next_id(&mut self) -> ClientId {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Server instance
pub struct Server {
    config: Config,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let permits = config.max_connections.clamp(1, Semaphore::MAX_PERMITS);
        let connection_limit = Arc::new(Semaphore::new(permits));

        Server {
            config,
            connection_limit,
        }
    }

    /// Bind the listening socket. Must be called from within a Tokio runtime.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.listen;
        create_listener(addr)
            .and_then(TcpListener::from_std)
            .map_err(|e| ServerError::Bind(addr, e))
    }

    /// Serve clients until Ctrl+C is received.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C, serving until killed");
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C");
        })
        .await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then
    /// abort every client still connected.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "Listening");
        }

        let mut client_ids = ClientIds::new();
        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Connection handler panicked");
                        }
                    }
                }

                accepted = accept_with_permit(&listener, &self.connection_limit) => {
                    let (permit, accepted) = accepted?;

                    match accepted {
                        Ok((stream, addr)) => {
                            let client_id = client_ids.next_id();
                            debug!(client_id, peer = %addr, "New connection");

                            let session =
                                Session::new(client_id, stream, addr, self.config.idle_timeout);

                            handlers.spawn(async move {
                                let client_id = session.id();
                                if let Err(e) = handle_connection(session).await {
                                    debug!(client_id, error = %e, "Connection error");
                                }
                                drop(permit);
                            });
                        }
                        Err(e) => back_off_after_accept_error(&e).await,
                    }
                }
            }
        }

        if !handlers.is_empty() {
            warn!(clients = handlers.len(), "Closing connected clients");
        }
        handlers.shutdown().await;
        info!("Server stopped");

        Ok(())
    }
}

/// Wait for a connection slot, then for the next connection.
async fn accept_with_permit(
    listener: &TcpListener,
    connection_limit: &Arc<Semaphore>,
) -> Result<
    (
        OwnedSemaphorePermit,
        io::Result<(tokio::net::TcpStream, SocketAddr)>,
    ),
    ServerError,
> {
    let permit = Arc::clone(connection_limit)
        .acquire_owned()
        .await
        .map_err(|_| ServerError::LimiterClosed)?;

    Ok((permit, listener.accept().await))
}

async fn back_off_after_accept_error(e: &io::Error) {
    error!(error = %e, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Listener errors
#[derive(Debug)]
pub enum ServerError {
    Bind(SocketAddr, io::Error),
    LimiterClosed,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            ServerError::LimiterClosed => write!(f, "Connection limiter closed"),
        }
    }
}

impl std::error::Error for ServerError {}
