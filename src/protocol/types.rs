//! Wire Protocol Types
//!
//! This module defines the token encoding and reply types for the sstash
//! protocol. The protocol is length-prefixed: every unit on the wire
//! (command verbs, arguments, reply markers, payloads) is a *token* of the
//! form:
//!
//! ```text
//! <decimal_length>\r\n<bytes>
//! ```
//!
//! Requests are a sequence of tokens forming one command. Replies are one of
//! three shapes, each element encoded as its own token:
//!
//! - `OK`: success with no value
//! - `VALUE <payload>`: success carrying a payload
//! - `ERROR <message>`: failure carrying a message
//!
//! ## Examples
//!
//! `SET foo bar 0` on the wire: `3\r\nSET3\r\nfoo3\r\nbar1\r\n0`
//!
//! `VALUE bar` reply: `5\r\nVALUE3\r\nbar`

use std::fmt;

/// The CRLF separator between a token's length line and its payload.
pub const CRLF: &[u8] = b"\r\n";

/// Reply marker tokens.
pub mod marker {
    pub const OK: &str = "OK";
    pub const VALUE: &str = "VALUE";
    pub const ERROR: &str = "ERROR";
}

/// A reply sent to a client. Every command yields exactly one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Success with no value.
    Ok,
    /// Success carrying a payload.
    Value(String),
    /// Failure carrying a message. The connection stays open.
    Error(String),
}

impl Reply {
    /// Creates a value reply.
    pub fn value(s: impl Into<String>) -> Self {
        Reply::Value(s.into())
    }

    /// Creates an error reply.
    pub fn error(s: impl Into<String>) -> Self {
        Reply::Error(s.into())
    }

    /// Returns true if this reply is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Serializes the reply to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the reply into an existing buffer.
    ///
    /// This is more efficient than `serialize()` when reusing a buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Ok => encode_token(buf, marker::OK.as_bytes()),
            Reply::Value(payload) => {
                encode_token(buf, marker::VALUE.as_bytes());
                encode_token(buf, payload.as_bytes());
            }
            Reply::Error(msg) => {
                encode_token(buf, marker::ERROR.as_bytes());
                encode_token(buf, msg.as_bytes());
            }
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => write!(f, "OK"),
            Reply::Value(payload) => write!(f, "{}", payload),
            Reply::Error(msg) => write!(f, "(error) {}", msg),
        }
    }
}

/// Appends one token (`<len>\r\n<bytes>`) to the buffer.
pub fn encode_token(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(bytes);
}

/// Encodes a whole command as a token sequence.
///
/// Used by the leader's replication re-encoder and by the CLI client.
pub fn encode_tokens<I, T>(tokens: I) -> Vec<u8>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut buf = Vec::new();
    for token in tokens {
        encode_token(&mut buf, token.as_ref());
    }
    buf
}
