//! Wire Protocol Implementation
//!
//! The sstash protocol frames a byte stream into length-prefixed tokens and
//! encodes replies as small token sequences.
//!
//! ## Modules
//!
//! - `types`: the [`Reply`] type, token encoding helpers
//! - `framing`: incremental decoder for the inbound token stream
//!
//! ## Example
//!
//! ```
//! use sstash::protocol::{decode_tokens, encode_tokens, Reply};
//!
//! let wire = encode_tokens(["GET", "name", "0"]);
//! let (tokens, consumed) = decode_tokens(&wire).unwrap();
//! assert_eq!(consumed, wire.len());
//! assert_eq!(tokens.len(), 3);
//!
//! let reply = Reply::value("Ariz");
//! assert_eq!(reply.serialize(), b"5\r\nVALUE4\r\nAriz");
//! ```

pub mod framing;
pub mod types;

pub use framing::{decode_token, decode_tokens, FrameError, FrameResult, MAX_TOKEN_SIZE};
pub use types::{encode_token, encode_tokens, marker, Reply};
