//! Incremental Token Framer
//!
//! Decodes the request byte stream into length-prefixed tokens. TCP is a
//! stream protocol, so a read may deliver a partial token, or several tokens
//! plus the front of the next one. The framer handles this by parsing from a
//! caller-owned buffer and reporting how many bytes each complete token
//! consumed:
//!
//! - `Ok(Some((token, consumed)))`: a complete token, advance the buffer by
//!   `consumed` bytes
//! - `Ok(None)`: incomplete data, wait for more bytes
//! - `Err(FrameError)`: the stream is malformed
//!
//! A partial trailing token is simply left in the buffer; the next call
//! resumes from the same bytes. No input is ever dropped.

use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while framing the token stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The length line contains a non-digit byte.
    #[error("invalid token length: {0:?}")]
    InvalidLength(String),

    /// The length line is longer than any valid length could be.
    #[error("token length line too long")]
    LengthLineTooLong,

    /// The declared token length exceeds the allowed maximum.
    #[error("token too large: {size} bytes (max: {max})")]
    TokenTooLarge { size: usize, max: usize },
}

/// Result type for framing operations.
pub type FrameResult<T> = Result<T, FrameError>;

/// Maximum payload of a single token. Values are capped at 64 KiB, so
/// anything larger than this is a malformed stream rather than a big value.
pub const MAX_TOKEN_SIZE: usize = 64 * 1024 + 256;

/// Longest permissible length line; `MAX_TOKEN_SIZE` needs 6 digits.
const MAX_LENGTH_DIGITS: usize = 10;

/// Decodes one token from the front of `buf`.
///
/// Returns the token payload and the total number of bytes consumed
/// (length line + CRLF + payload), or `None` if `buf` does not yet hold a
/// complete token.
pub fn decode_token(buf: &[u8]) -> FrameResult<Option<(Bytes, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let crlf = match find_crlf(buf) {
        Some(pos) => pos,
        None => {
            // No CRLF yet. If the run of bytes is already longer than any
            // valid length line, the stream is garbage, not just slow.
            if buf.len() > MAX_LENGTH_DIGITS {
                return Err(FrameError::LengthLineTooLong);
            }
            return Ok(None);
        }
    };

    if crlf > MAX_LENGTH_DIGITS {
        return Err(FrameError::LengthLineTooLong);
    }

    let line = &buf[..crlf];
    if line.is_empty() || !line.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::InvalidLength(
            String::from_utf8_lossy(line).into_owned(),
        ));
    }

    // All digits and at most 10 of them, so this cannot overflow u64.
    let len: usize = std::str::from_utf8(line)
        .expect("digits are ascii")
        .parse()
        .map_err(|_| FrameError::InvalidLength(String::from_utf8_lossy(line).into_owned()))?;

    if len > MAX_TOKEN_SIZE {
        return Err(FrameError::TokenTooLarge {
            size: len,
            max: MAX_TOKEN_SIZE,
        });
    }

    let payload_start = crlf + 2;
    let total = payload_start + len;
    if buf.len() < total {
        return Ok(None);
    }

    let token = Bytes::copy_from_slice(&buf[payload_start..total]);
    Ok(Some((token, total)))
}

/// Decodes every complete token at the front of `buf`, returning the tokens
/// and the total bytes consumed. A partial trailing token consumes nothing.
pub fn decode_tokens(buf: &[u8]) -> FrameResult<(Vec<Bytes>, usize)> {
    let mut tokens = Vec::new();
    let mut consumed = 0;

    while let Some((token, n)) = decode_token(&buf[consumed..])? {
        tokens.push(token);
        consumed += n;
    }

    Ok((tokens, consumed))
}

/// Finds the position of `\r` in the leading `\r\n` pair, if present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    for i in 0..buf.len().saturating_sub(1) {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some(i);
        }
    }
    None
}
