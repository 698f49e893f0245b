//! Per-client connection handling.
//!
//! Each accepted socket becomes a [`Session`] driven by [`handle_connection`]:
//! send the welcome text, then answer every read with one JSON response until
//! the client sends the shutdown keyword, hangs up, or errors out. The socket
//! is closed exactly once on every one of those paths.

use crate::protocol::{self, CodecError, Request, Response, READ_BUFFER_SIZE, WELCOME_TEXT};
use socket2::SockRef;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Identifier handed out by the listener, starting at 1.
pub type ClientId = u64;

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, welcome text not yet sent.
    Connected,
    /// Waiting for the next read to complete.
    AwaitingMessage,
    /// Building and writing a response.
    Processing,
    /// Shutting the socket down.
    Closing,
    /// Socket released.
    Closed,
}

/// Why a session stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The client sent the shutdown keyword.
    Command,
    /// The client closed its end (read returned zero bytes).
    PeerClosed,
    /// No data arrived within the idle timeout.
    IdleTimeout,
}

/// A single client connection.
#[derive(Debug)]
pub struct Session {
    id: ClientId,
    peer: SocketAddr,
    stream: TcpStream,
    state: ConnState,
    idle_timeout: Option<Duration>,
}

impl Session {
    /// Wrap a freshly accepted socket.
    pub fn new(
        id: ClientId,
        stream: TcpStream,
        peer: SocketAddr,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Session {
            id,
            peer,
            stream,
            state: ConnState::Connected,
            idle_timeout,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    fn transition(&mut self, next: ConnState) {
        trace!(client_id = self.id, from = ?self.state, to = ?next, "State change");
        self.state = next;
    }

    /// Run the request/response loop until the client leaves.
    async fn serve(&mut self) -> Result<Disconnect, ConnectionError> {
        self.stream.write_all(WELCOME_TEXT.as_bytes()).await?;
        self.transition(ConnState::AwaitingMessage);

        let mut buffer = [0u8; READ_BUFFER_SIZE];

        loop {
            // One read is one message: nothing is carried over between reads.
            let n = match self.read(&mut buffer).await? {
                Some(n) => n,
                None => return Ok(Disconnect::IdleTimeout),
            };
            if n == 0 {
                return Ok(Disconnect::PeerClosed);
            }

            let response = match protocol::decode_request(&buffer[..n]) {
                Request::Shutdown => return Ok(Disconnect::Command),
                Request::Text(text) => {
                    info!(client_id = self.id, text = %text, "Message received");
                    respond(text)
                }
                Request::Malformed => {
                    warn!(client_id = self.id, bytes = n, "Message is not valid UTF-8");
                    Response::invalid_input()
                }
            };

            self.transition(ConnState::Processing);
            self.send(&response).await?;
            self.transition(ConnState::AwaitingMessage);
        }
    }

    /// Read once. `None` means the idle timeout elapsed first.
    async fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<Option<usize>> {
        match self.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.stream.read(buffer)).await {
                Ok(result) => result.map(Some),
                Err(_) => Ok(None),
            },
            None => self.stream.read(buffer).await.map(Some),
        }
    }

    async fn send(&mut self, response: &Response) -> Result<(), ConnectionError> {
        let payload = protocol::encode_response(response)?;

        info!(
            client_id = self.id,
            text = ?response.message,
            error = ?response.error,
            status = response.status,
            code = response.code,
            "Response"
        );

        self.stream.write_all(&payload).await?;
        debug!(
            client_id = self.id,
            response = %String::from_utf8_lossy(&payload),
            "Sending response"
        );
        Ok(())
    }

    /// Shut down both directions and release the socket.
    ///
    /// Errors from the shutdown call are ignored; the socket is dropped
    /// either way.
    fn close(mut self) {
        self.transition(ConnState::Closing);

        if let Err(e) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            trace!(client_id = self.id, error = %e, "Ignoring socket shutdown error");
        }

        self.transition(ConnState::Closed);
    }
}

/// Build the response for one text message.
pub fn respond(message: &str) -> Response {
    if message.trim().is_empty() {
        Response::invalid_input()
    } else {
        Response::received(message)
    }
}

/// Handle a single client connection from welcome to close.
pub async fn handle_connection(mut session: Session) -> Result<Disconnect, ConnectionError> {
    let client_id = session.id;
    info!(client_id, peer = %session.peer, "Client connected");

    let outcome = session.serve().await;
    match &outcome {
        Ok(Disconnect::Command) => debug!(client_id, "Shutdown command received"),
        Ok(Disconnect::PeerClosed) => trace!(client_id, "Connection closed by client"),
        Ok(Disconnect::IdleTimeout) => debug!(client_id, "Idle timeout elapsed"),
        Err(_) => {}
    }

    session.close();
    info!(client_id, "Client disconnected");

    outcome
}

/// Errors that end a single connection
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Codec(CodecError),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "Socket error: {}", e),
            ConnectionError::Codec(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<CodecError> for ConnectionError {
    fn from(e: CodecError) -> Self {
        ConnectionError::Codec(e)
    }
}
