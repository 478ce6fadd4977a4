//! Follower-Side Replication Loop
//!
//! A follower connects to its leader's primary port, identifies itself
//! with the internal `REPLICA` handshake, and then consumes the leader's
//! write stream: inbound bytes go through the same framer and dispatcher
//! that serve clients, with the read-only gate bypassed for this single
//! internal channel. Replies are discarded; the leader never reads them.
//!
//! On disconnect the follower reconnects with exponential backoff. There is
//! no log or offset: reconnection rejoins the live stream, and writes that
//! happened while the follower was away are silently missed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::commands::Dispatcher;
use crate::protocol::{decode_tokens, encode_tokens};

/// The internal verb a follower sends to register itself as a sink.
pub const REPLICA_VERB: &str = "REPLICA";

/// First reconnect delay after a disconnect.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect delay cap.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A handle to the running follower task. Dropping the handle stops it.
pub struct FollowerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl FollowerHandle {
    /// Starts the follower loop against `master_ip:master_port`.
    pub fn start(dispatcher: Arc<Dispatcher>, master_ip: String, master_port: u16) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(follower_loop(
            dispatcher,
            format!("{}:{}", master_ip, master_port),
            shutdown_rx,
        ));
        Self { shutdown_tx }
    }

    /// Stops the follower loop. Called automatically on drop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for FollowerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn follower_loop(
    dispatcher: Arc<Dispatcher>,
    master_addr: String,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match TcpStream::connect(&master_addr).await {
            Ok(stream) => {
                info!(master = %master_addr, "Connected to leader");
                backoff = INITIAL_BACKOFF;

                tokio::select! {
                    result = apply_stream(stream, &dispatcher) => {
                        match result {
                            Ok(()) => info!(master = %master_addr, "Leader closed the stream"),
                            Err(e) => warn!(master = %master_addr, error = %e, "Replication stream failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Follower loop stopped");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(master = %master_addr, error = %e, "Leader connect failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => {
                debug!("Follower loop stopped");
                return;
            }
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Sends the handshake, then applies the leader's command stream until the
/// connection ends.
async fn apply_stream(mut stream: TcpStream, dispatcher: &Dispatcher) -> std::io::Result<()> {
    stream.write_all(&encode_tokens([REPLICA_VERB])).await?;

    let mut buffer = BytesMut::with_capacity(4096);
    let mut queue: VecDeque<String> = VecDeque::new();

    loop {
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }

        let (tokens, consumed) = decode_tokens(&buffer)
            .map_err(|e| std::io::Error::other(format!("bad replication frame: {}", e)))?;
        let _ = buffer.split_to(consumed);

        for token in tokens {
            let token = String::from_utf8(token.to_vec())
                .map_err(|_| std::io::Error::other("non-UTF-8 replication token"))?;
            queue.push_back(token);
        }

        // Apply every complete command; the read-only gate is bypassed for
        // this internal channel, and replies go nowhere.
        while let Some(reply) = dispatcher.dispatch(&mut queue, false) {
            if reply.is_error() {
                warn!(reply = %reply, "Replicated command failed locally");
            }
        }
    }
}
