//! Chat wire protocol: request decoding and JSON response encoding.
//!
//! The protocol has no framing. Whatever bytes a single read returns are one
//! request, and every reply is a single JSON document written in one send:
//!
//! ```text
//! server -> client: Welcome to the chat server!
//! client -> server: hello
//! server -> client: {"Message":"Server received: hello","Error":null,"Status":true,"Code":200}
//! client -> server: EXIT
//! (server closes the connection)
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::str;

/// Port the server listens on unless configured otherwise.
pub const DEFAULT_CHAT_PORT: u16 = 8888;

/// Sent to every client right after it connects.
pub const WELCOME_TEXT: &str = "Welcome to the chat server!";

/// Closes the connection without a response. Matched ignoring ASCII case.
pub const COMMAND_SHUTDOWN: &str = "exit";

/// Maximum number of bytes taken from the socket per request.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Status code for an accepted message.
pub const CODE_OK: u16 = 200;

/// Status code for an empty or undecodable message.
pub const CODE_INVALID: u16 = 400;

/// A decoded client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    /// The shutdown keyword.
    Shutdown,
    /// Any other valid UTF-8 text, possibly empty.
    Text(&'a str),
    /// Bytes that are not valid UTF-8.
    Malformed,
}

/// Decode the bytes of one read into a request.
pub fn decode_request(input: &[u8]) -> Request<'_> {
    match str::from_utf8(input) {
        Ok(text) if text.eq_ignore_ascii_case(COMMAND_SHUTDOWN) => Request::Shutdown,
        Ok(text) => Request::Text(text),
        Err(_) => Request::Malformed,
    }
}

/// Reply sent for every request other than the shutdown keyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    pub message: Option<String>,
    pub error: Option<String>,
    pub status: bool,
    pub code: u16,
}

impl Response {
    /// Acknowledge a message, echoing it back.
    pub fn received(message: &str) -> Self {
        Response {
            message: Some(format!("Server received: {message}")),
            error: None,
            status: true,
            code: CODE_OK,
        }
    }

    /// Reject an empty, blank or undecodable message.
    pub fn invalid_input() -> Self {
        Response {
            message: Some("Empty message received.".to_string()),
            error: Some("Invalid input.".to_string()),
            status: false,
            code: CODE_INVALID,
        }
    }
}

/// Serialize a response as compact JSON.
pub fn encode_response(response: &Response) -> Result<Bytes, CodecError> {
    serde_json::to_vec(response)
        .map(Bytes::from)
        .map_err(CodecError::Json)
}

/// Response encoding errors
#[derive(Debug)]
pub enum CodecError {
    Json(serde_json::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Json(e) => write!(f, "Failed to encode response: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}
