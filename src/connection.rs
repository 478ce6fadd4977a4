//! Connection Handler
//!
//! Each client connection runs in its own task: read bytes, frame them into
//! tokens, consume complete commands, send one reply per command.
//!
//! ## Buffer Management
//!
//! TCP is a stream protocol: a read may deliver part of a command or
//! several commands at once. Incoming bytes accumulate in a `BytesMut`
//! buffer; complete tokens move onto the connection's token queue, and a
//! partial trailing token stays buffered. The dispatcher only drains the
//! queue when a whole command is present, so fragmented input is never
//! lost and pipelined input is drained command by command.
//!
//! ## Replica Promotion
//!
//! A connection on the primary port whose next command is the internal
//! `REPLICA` verb stops being a client: its socket is handed to the
//! replication fan-out as a follower sink and this handler ends.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use crate::commands::Dispatcher;
use crate::protocol::{decode_tokens, FrameError, Reply};
use crate::replication::{ReplicationFanout, REPLICA_VERB};

/// Maximum bytes buffered for one connection. Must fit a maximal token
/// plus pipelining slack.
const MAX_BUFFER_SIZE: usize = 256 * 1024;

/// Initial buffer capacity.
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("client sent a non-UTF-8 token")]
    InvalidUtf8,

    #[error("client disconnected")]
    ClientDisconnected,

    /// The client vanished mid-command; buffered tokens are discarded.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("buffer size limit exceeded")]
    BufferFull,
}

/// What the main loop ended with.
enum LoopExit {
    /// Normal termination (disconnect or error propagated separately).
    Closed,
    /// The connection identified itself as a replica.
    Promote,
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    tokens: VecDeque<String>,
    dispatcher: Arc<Dispatcher>,
    fanout: Arc<ReplicationFanout>,
    read_only: bool,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        fanout: Arc<ReplicationFanout>,
        read_only: bool,
    ) -> Self {
        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            tokens: VecDeque::new(),
            dispatcher,
            fanout,
            read_only,
        }
    }

    /// Runs the connection to completion.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        debug!(client = %self.addr, read_only = self.read_only, "Client connected");

        let result = self.main_loop().await;

        match result {
            Ok(LoopExit::Promote) => {
                info!(client = %self.addr, "Connection promoted to replica sink");
                let Self { stream, fanout, .. } = self;
                fanout.register(stream.into_inner());
                Ok(())
            }
            Ok(LoopExit::Closed) | Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.addr, "Client disconnected");
                Ok(())
            }
            Err(ConnectionError::IoError(ref io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "Connection reset by client");
                Ok(())
            }
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Connection error");
                Err(e)
            }
        }
    }

    async fn main_loop(&mut self) -> Result<LoopExit, ConnectionError> {
        loop {
            // Drain every complete command currently queued.
            loop {
                if !self.read_only && self.tokens.front().map(String::as_str) == Some(REPLICA_VERB)
                {
                    return Ok(LoopExit::Promote);
                }

                match self.dispatcher.dispatch(&mut self.tokens, self.read_only) {
                    Some(reply) => self.send_reply(&reply).await?,
                    None => break,
                }
            }

            self.read_more_data().await?;

            match self.drain_tokens() {
                Ok(()) => {}
                Err(e @ (ConnectionError::Frame(_) | ConnectionError::InvalidUtf8)) => {
                    // The stream can't be re-synchronized after a framing
                    // error; report it and hang up.
                    let reply = Reply::error(format!("protocol error: {}", e));
                    self.send_reply(&reply).await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Moves complete tokens from the byte buffer onto the token queue.
    fn drain_tokens(&mut self) -> Result<(), ConnectionError> {
        let (tokens, consumed) = decode_tokens(&self.buffer)?;
        if consumed == 0 {
            return Ok(());
        }
        let _ = self.buffer.split_to(consumed);

        for token in tokens {
            let token =
                String::from_utf8(token.to_vec()).map_err(|_| ConnectionError::InvalidUtf8)?;
            self.tokens.push_back(token);
        }

        trace!(
            client = %self.addr,
            queued = self.tokens.len(),
            buffered = self.buffer.len(),
            "Framed tokens"
        );
        Ok(())
    }

    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            warn!(client = %self.addr, size = self.buffer.len(), "Buffer size limit exceeded");
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;
        if n == 0 {
            // On close, buffered partial state is simply discarded.
            if self.buffer.is_empty() && self.tokens.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            }
            return Err(ConnectionError::UnexpectedEof);
        }

        Ok(())
    }

    async fn send_reply(&mut self, reply: &Reply) -> Result<(), ConnectionError> {
        let bytes = reply.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Convenience wrapper: builds a handler and runs it, swallowing the error
/// cases `run` already logged.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    fanout: Arc<ReplicationFanout>,
    read_only: bool,
) {
    let handler = ConnectionHandler::new(stream, addr, dispatcher, fanout, read_only);
    let _ = handler.run().await;
}
