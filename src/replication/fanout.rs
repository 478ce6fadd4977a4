//! Leader-Side Replication Fan-Out
//!
//! The leader keeps one sink per connected follower. Every write command,
//! after successful local application, is re-encoded in its wire form and
//! appended to every sink. Fan-out is best-effort and the leader never
//! blocks on a slow follower: each sink has a bounded buffer, and a sink
//! whose buffer fills (or whose connection dies) is dropped from the set
//! and closed.
//!
//! Each sink is a bounded mpsc channel drained by a dedicated writer task
//! that owns the follower's socket. Dropping the sender ends the writer
//! task, which closes the socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Frames buffered per follower before the leader gives up on it.
const SINK_BUFFER: usize = 1024;

struct FollowerSink {
    id: u64,
    peer: String,
    tx: mpsc::Sender<Bytes>,
}

/// The set of follower sinks fed by a leader.
///
/// A follower node keeps an empty fan-out; forwarding to it is a no-op.
#[derive(Default)]
pub struct ReplicationFanout {
    sinks: Mutex<Vec<FollowerSink>>,
    next_id: AtomicU64,
}

impl ReplicationFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a follower connection. The stream becomes a pure sink:
    /// a writer task drains the frame channel into it until the channel
    /// closes or a write fails.
    pub fn register(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SINK_BUFFER);

        info!(follower = %peer, "Follower registered");

        tokio::spawn(sink_writer(stream, rx, peer.clone()));

        self.sinks.lock().unwrap().push(FollowerSink { id, peer, tx });
    }

    /// Appends an encoded write command to every follower sink. Sinks that
    /// are full or whose writer has died are removed and closed.
    pub fn forward(&self, frame: &Bytes) {
        let mut sinks = self.sinks.lock().unwrap();
        if sinks.is_empty() {
            return;
        }

        sinks.retain(|sink| match sink.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(follower = %sink.peer, id = sink.id, "Follower too slow, dropping sink");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(follower = %sink.peer, id = sink.id, "Follower sink closed, removing");
                false
            }
        });
    }

    /// Number of live follower sinks.
    pub fn len(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every sink, closing all follower connections.
    pub fn clear(&self) {
        self.sinks.lock().unwrap().clear();
    }
}

/// Drains frames into the follower socket. Ends (closing the socket) when
/// the sink is dropped or a write fails; a failed sink is purged from the
/// set on the next `forward`.
async fn sink_writer(mut stream: TcpStream, mut rx: mpsc::Receiver<Bytes>, peer: String) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = stream.write_all(&frame).await {
            warn!(follower = %peer, error = %e, "Follower write failed, closing sink");
            rx.close();
            return;
        }
    }
    debug!(follower = %peer, "Follower sink writer stopped");
}
