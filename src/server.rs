//! Server Wiring
//!
//! Builds the whole node from a [`ServerConfig`]: stash manager, snapshot
//! restore, the two listeners (primary read-write, read-only), the shared
//! TTL sweep timer, and on follower nodes the replication loop against
//! the configured leader.
//!
//! Everything is constructed here and passed down explicitly; process-wide
//! state is limited to the manager and the listener handles, created at
//! startup and torn down by the single shutdown routine.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::commands::Dispatcher;
use crate::connection::handle_connection;
use crate::replication::{FollowerHandle, ReplicationFanout};
use crate::snapshot::{self, DEFAULT_SNAPSHOT_INTERVAL};
use crate::stash::{StashManager, TtlSweeper, TtlSweeperConfig};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "SSTASH_DATA_DIR";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port of the read-write listener.
    pub primary_port: u16,
    /// Port of the read-only listener.
    pub read_only_port: u16,
    /// Leader to follow; `None` makes this node a leader.
    pub master: Option<(String, u16)>,
    /// Directory for snapshot files and mapped pools.
    pub data_dir: PathBuf,
    /// Fixed delay between snapshot ticks.
    pub snapshot_interval: Duration,
    /// Interval of the shared TTL sweep timer.
    pub ttl_sweep_interval: Duration,
}

impl ServerConfig {
    /// A leader on the given ports, data dir from `SSTASH_DATA_DIR` or the
    /// working directory.
    pub fn new(primary_port: u16, read_only_port: u16) -> Self {
        let data_dir = std::env::var(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            primary_port,
            read_only_port,
            master: None,
            data_dir,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            ttl_sweep_interval: TtlSweeperConfig::default().interval,
        }
    }

    /// Makes this node a follower of the given leader.
    pub fn with_master(mut self, ip: String, port: u16) -> Self {
        self.master = Some((ip, port));
        self
    }
}

/// Errors that prevent the server from starting. These are fatal.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("failed to prepare data directory: {0}")]
    DataDir(#[source] std::io::Error),

    #[error("startup restore failed: {0}")]
    Restore(#[source] std::io::Error),

    #[error("failed to create the stash manager: {0}")]
    Manager(String),
}

/// A fully wired, bound server, ready to accept connections.
pub struct Server {
    manager: Arc<StashManager>,
    dispatcher: Arc<Dispatcher>,
    fanout: Arc<ReplicationFanout>,
    primary: TcpListener,
    read_only: TcpListener,
    primary_addr: SocketAddr,
    read_only_addr: SocketAddr,
    sweeper: TtlSweeper,
    follower: Option<FollowerHandle>,
    is_follower: bool,
}

impl Server {
    /// Restores state, binds both listeners, and starts the background
    /// tasks. Bind or restore failure is fatal to the process.
    pub async fn bind(config: ServerConfig) -> Result<Server, ServerError> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(ServerError::DataDir)?;

        let fanout = Arc::new(ReplicationFanout::new());
        let manager = Arc::new(
            StashManager::new(
                config.data_dir.clone(),
                Arc::clone(&fanout),
                config.snapshot_interval,
            )
            .map_err(|e| ServerError::Manager(e.to_string()))?,
        );

        let restored = snapshot::restore_all(&manager, &config.data_dir)
            .await
            .map_err(ServerError::Restore)?;
        if restored > 0 {
            info!(snapshots = restored, "Startup restore complete");
        }

        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&manager)));

        let primary = TcpListener::bind(("0.0.0.0", config.primary_port))
            .await
            .map_err(|e| ServerError::Bind {
                port: config.primary_port,
                source: e,
            })?;
        let read_only = TcpListener::bind(("0.0.0.0", config.read_only_port))
            .await
            .map_err(|e| ServerError::Bind {
                port: config.read_only_port,
                source: e,
            })?;
        let primary_addr = primary.local_addr().map_err(|e| ServerError::Bind {
            port: config.primary_port,
            source: e,
        })?;
        let read_only_addr = read_only.local_addr().map_err(|e| ServerError::Bind {
            port: config.read_only_port,
            source: e,
        })?;

        let sweeper = TtlSweeper::start(
            Arc::clone(&manager),
            TtlSweeperConfig {
                interval: config.ttl_sweep_interval,
            },
        );

        let follower = config.master.as_ref().map(|(ip, port)| {
            info!(master = %format!("{}:{}", ip, port), "Starting as follower");
            FollowerHandle::start(Arc::clone(&dispatcher), ip.clone(), *port)
        });

        info!(primary = %primary_addr, read_only = %read_only_addr, "Listening");

        Ok(Server {
            manager,
            dispatcher,
            fanout,
            primary,
            read_only,
            primary_addr,
            read_only_addr,
            sweeper,
            is_follower: follower.is_some(),
            follower,
        })
    }

    pub fn primary_addr(&self) -> SocketAddr {
        self.primary_addr
    }

    pub fn read_only_addr(&self) -> SocketAddr {
        self.read_only_addr
    }

    pub fn manager(&self) -> &Arc<StashManager> {
        &self.manager
    }

    /// Serves until `shutdown` resolves, then tears the node down: stops
    /// the timers and the follower loop, takes a final best-effort
    /// snapshot of every dirty stash, and closes each stash once.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) {
        // Client writes on a follower's primary port would silently
        // diverge from the leader, so a follower treats both ports as
        // read-only; only the internal apply channel mutates.
        let primary_read_only = self.is_follower;

        tokio::select! {
            _ = accept_loop(
                self.primary,
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.fanout),
                primary_read_only,
            ) => {}
            _ = accept_loop(
                self.read_only,
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.fanout),
                true,
            ) => {}
            _ = shutdown => {
                info!("Shutdown requested");
            }
        }

        self.sweeper.stop();
        if let Some(follower) = &self.follower {
            follower.stop();
        }
        self.fanout.clear();
        self.manager.shutdown().await;
        info!("Server shutdown complete");
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    fanout: Arc<ReplicationFanout>,
    read_only: bool,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(handle_connection(
                    stream,
                    addr,
                    Arc::clone(&dispatcher),
                    Arc::clone(&fanout),
                    read_only,
                ));
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_tokens;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::watch;

    struct TestNode {
        primary: SocketAddr,
        read_only: SocketAddr,
        shutdown_tx: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn spawn_node(config: ServerConfig) -> TestNode {
        let server = Server::bind(config).await.unwrap();
        let primary = server.primary_addr();
        let read_only = server.read_only_addr();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            server
                .run(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await;
        });

        TestNode {
            primary,
            read_only,
            shutdown_tx,
            task,
        }
    }

    impl TestNode {
        async fn stop(self) {
            let _ = self.shutdown_tx.send(true);
            let _ = self.task.await;
        }
    }

    fn test_config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            primary_port: 0,
            read_only_port: 0,
            master: None,
            data_dir: dir.to_path_buf(),
            snapshot_interval: Duration::from_secs(60),
            ttl_sweep_interval: Duration::from_millis(50),
        }
    }

    async fn send(client: &mut TcpStream, tokens: &[&str]) -> Vec<u8> {
        client.write_all(&encode_tokens(tokens)).await.unwrap();
        let mut buf = vec![0u8; 128 * 1024];
        let n = client.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let dir = tempdir().unwrap();
        let node = spawn_node(test_config(dir.path())).await;
        let mut client = TcpStream::connect(node.primary).await.unwrap();

        assert_eq!(send(&mut client, &["SET", "foo", "bar", "0"]).await, b"2\r\nOK");
        assert_eq!(
            send(&mut client, &["GET", "foo", "0"]).await,
            b"5\r\nVALUE3\r\nbar"
        );

        node.stop().await;
    }

    #[tokio::test]
    async fn test_ttl_expiry_differs_by_port() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        // Keep the sweeper quiet so only lazy expiry acts.
        config.ttl_sweep_interval = Duration::from_secs(3600);
        let node = spawn_node(config).await;

        let mut primary = TcpStream::connect(node.primary).await.unwrap();
        let mut replica_port = TcpStream::connect(node.read_only).await.unwrap();

        assert_eq!(
            send(&mut primary, &["SETTTL", "x", "y", "100", "0"]).await,
            b"2\r\nOK"
        );
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Read-only port: absent, but the key stays in place.
        assert_eq!(send(&mut replica_port, &["GET", "x", "0"]).await, b"2\r\nOK");
        let info = send(&mut primary, &["INFO", "0"]).await;
        assert!(String::from_utf8_lossy(&info).contains("Number of keys: 1"));

        // Primary: absent and lazily removed.
        assert_eq!(send(&mut primary, &["GET", "x", "0"]).await, b"2\r\nOK");
        let info = send(&mut primary, &["INFO", "0"]).await;
        assert!(String::from_utf8_lossy(&info).contains("Number of keys: 0"));

        node.stop().await;
    }

    #[tokio::test]
    async fn test_capacity_scenario() {
        let dir = tempdir().unwrap();
        let node = spawn_node(test_config(dir.path())).await;
        let mut client = TcpStream::connect(node.primary).await.unwrap();

        assert_eq!(
            send(&mut client, &["CREATE", "s", "2", "false"]).await,
            b"2\r\nOK"
        );
        assert_eq!(send(&mut client, &["SET", "a", "1", "1", "NAME=s"]).await, b"2\r\nOK");
        assert_eq!(send(&mut client, &["SET", "b", "2", "1", "NAME=s"]).await, b"2\r\nOK");

        let reply = send(&mut client, &["SET", "c", "3", "1", "NAME=s"]).await;
        assert!(String::from_utf8_lossy(&reply).contains("max capacity"));

        node.stop().await;
    }

    #[tokio::test]
    async fn test_drop_default_scenario() {
        let dir = tempdir().unwrap();
        let node = spawn_node(test_config(dir.path())).await;
        let mut client = TcpStream::connect(node.primary).await.unwrap();

        let reply = send(&mut client, &["DROP", "default"]).await;
        assert!(String::from_utf8_lossy(&reply).contains("cannot drop the default stash"));

        node.stop().await;
    }

    #[tokio::test]
    async fn test_leader_follower_replication() {
        let leader_dir = tempdir().unwrap();
        let follower_dir = tempdir().unwrap();

        let leader = spawn_node(test_config(leader_dir.path())).await;

        let follower_config = test_config(follower_dir.path()).with_master(
            leader.primary.ip().to_string(),
            leader.primary.port(),
        );
        let follower = spawn_node(follower_config).await;

        // Give the follower a moment to register with the leader.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut client = TcpStream::connect(leader.primary).await.unwrap();
        assert_eq!(send(&mut client, &["SET", "k", "v", "0"]).await, b"2\r\nOK");
        assert_eq!(
            send(&mut client, &["CREATE", "repl", "10", "false"]).await,
            b"2\r\nOK"
        );
        assert_eq!(
            send(&mut client, &["SET", "r", "1", "1", "NAME=repl"]).await,
            b"2\r\nOK"
        );

        // Within a second the follower's read-only port serves the writes.
        let mut ro = TcpStream::connect(follower.read_only).await.unwrap();
        let mut replicated = false;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if send(&mut ro, &["GET", "k", "0"]).await == b"5\r\nVALUE1\r\nv" {
                replicated = true;
                break;
            }
        }
        assert!(replicated, "write never reached the follower");
        assert_eq!(
            send(&mut ro, &["GET", "r", "1", "NAME=repl"]).await,
            b"5\r\nVALUE1\r\n1"
        );

        // The follower's ports reject client writes.
        let mut follower_primary = TcpStream::connect(follower.primary).await.unwrap();
        let reply = send(&mut follower_primary, &["SET", "w", "1", "0"]).await;
        assert!(String::from_utf8_lossy(&reply).contains("read-only"));

        follower.stop().await;
        leader.stop().await;
    }

    #[tokio::test]
    async fn test_restart_restores_snapshots() {
        let dir = tempdir().unwrap();

        {
            let node = spawn_node(test_config(dir.path())).await;
            let mut client = TcpStream::connect(node.primary).await.unwrap();
            for i in 0..100 {
                let key = format!("key{}", i);
                let value = format!("value{}", i);
                assert_eq!(
                    send(&mut client, &["SET", &key, &value, "0"]).await,
                    b"2\r\nOK"
                );
            }
            assert_eq!(
                send(&mut client, &["SETTTL", "gone", "x", "50", "0"]).await,
                b"2\r\nOK"
            );
            // Shutdown takes the final snapshot.
            node.stop().await;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;

        let node = spawn_node(test_config(dir.path())).await;
        let mut client = TcpStream::connect(node.primary).await.unwrap();

        for i in (0..100).step_by(17) {
            let key = format!("key{}", i);
            let reply = send(&mut client, &["GET", &key, "0"]).await;
            let expected = format!("VALUE{}\r\nvalue{}", format!("value{}", i).len(), i);
            assert!(
                String::from_utf8_lossy(&reply).contains(&expected),
                "key{} not restored: {:?}",
                i,
                String::from_utf8_lossy(&reply)
            );
        }

        // The TTL'd key's absolute expiration passed during the restart.
        assert_eq!(send(&mut client, &["GET", "gone", "0"]).await, b"2\r\nOK");

        node.stop().await;
    }

    #[tokio::test]
    async fn test_active_expiry_runs_in_background() {
        let dir = tempdir().unwrap();
        let node = spawn_node(test_config(dir.path())).await;
        let mut client = TcpStream::connect(node.primary).await.unwrap();

        assert_eq!(
            send(&mut client, &["SETTTL", "bg", "v", "80", "0"]).await,
            b"2\r\nOK"
        );

        // No reads drive lazy expiry; the sweeper alone must reclaim it.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let info = send(&mut client, &["INFO", "0"]).await;
        assert!(String::from_utf8_lossy(&info).contains("Number of keys: 0"));

        node.stop().await;
    }
}
