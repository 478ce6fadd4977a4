//! Command Dispatcher
//!
//! Routes parsed commands to their target stash (or the manager for
//! directory-level commands) and turns the outcome into exactly one
//! [`Reply`]. Two entry points share the implementation: the read-write
//! path used by the primary port and the follower's internal apply channel,
//! and the read-only path that rejects every write verb.
//!
//! After a write command succeeds locally it is re-encoded in wire form and
//! forwarded to the follower sinks. For key-scoped writes the stash does
//! the forwarding while the key's stripe lock is still held, so followers
//! observe each key's mutations in the leader's order; `CREATE` and `DROP`
//! forward here after the manager call succeeds.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::commands::{Command, CommandError};
use crate::protocol::{encode_tokens, Reply};
use crate::stash::{Stash, StashManager, DEFAULT_STASH_NAME};

/// Executes commands against the stash directory.
pub struct Dispatcher {
    manager: Arc<StashManager>,
}

impl Dispatcher {
    pub fn new(manager: Arc<StashManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<StashManager> {
        &self.manager
    }

    /// Consumes and executes one command from the token queue.
    ///
    /// Returns `None` if the queue doesn't hold a complete command yet (no
    /// tokens are lost; the caller reads more input and retries).
    pub fn dispatch(&self, queue: &mut VecDeque<String>, read_only: bool) -> Option<Reply> {
        let command = match Command::consume(queue)? {
            Ok(command) => command,
            Err(e) => return Some(Reply::error(e.to_string())),
        };

        if read_only && command.is_write() {
            return Some(Reply::error(CommandError::ReadOnlyMode.to_string()));
        }

        let reply = match self.execute(command, read_only) {
            Ok(reply) => reply,
            Err(e) => Reply::error(e.to_string()),
        };
        Some(reply)
    }

    fn execute(&self, command: Command, read_only: bool) -> Result<Reply, CommandError> {
        // Write commands carry their wire form to the follower sinks.
        let frame = command
            .is_write()
            .then(|| Bytes::from(encode_tokens(command.to_tokens())));
        let frame = frame.as_ref();

        match command {
            Command::Get { key, name } => {
                let stash = self.stash(name.as_deref())?;
                Ok(match stash.get(&key, read_only)? {
                    Some(value) => Reply::Value(value),
                    None => Reply::Ok,
                })
            }
            Command::Info { name } => {
                let stash = self.stash(name.as_deref())?;
                Ok(Reply::Value(stash.info()?))
            }
            Command::Set { key, value, name } => {
                let stash = self.stash(name.as_deref())?;
                stash.set(&key, &value, frame)?;
                Ok(Reply::Ok)
            }
            Command::SetTtl {
                key,
                value,
                ttl_ms,
                name,
            } => {
                let stash = self.stash(name.as_deref())?;
                stash.set_with_ttl(&key, &value, ttl_ms, frame)?;
                Ok(Reply::Ok)
            }
            Command::Delete { key, name } => {
                let stash = self.stash(name.as_deref())?;
                stash.delete(&key, frame)?;
                Ok(Reply::Ok)
            }
            Command::UpdateTtl { key, ttl_ms, name } => {
                let stash = self.stash(name.as_deref())?;
                if stash.update_ttl(&key, ttl_ms, frame)? {
                    Ok(Reply::Ok)
                } else {
                    Err(CommandError::KeyNotFound)
                }
            }
            Command::Create {
                name,
                max_key_count,
                off_heap,
            } => {
                self.manager.create_stash(&name, off_heap, max_key_count)?;
                self.forward(frame);
                Ok(Reply::Ok)
            }
            Command::Drop { name } => {
                self.manager.drop_stash(&name)?;
                self.forward(frame);
                Ok(Reply::Ok)
            }
        }
    }

    fn stash(&self, name: Option<&str>) -> Result<Arc<Stash>, CommandError> {
        let name = name.unwrap_or(DEFAULT_STASH_NAME);
        self.manager
            .get_stash(name)
            .ok_or(CommandError::StashNotFound)
    }

    fn forward(&self, frame: Option<&Bytes>) {
        if let Some(frame) = frame {
            self.manager.fanout().forward(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicationFanout;
    use std::time::Duration;
    use tempfile::tempdir;

    fn dispatcher(dir: &std::path::Path) -> Dispatcher {
        let manager = StashManager::new(
            dir.to_path_buf(),
            Arc::new(ReplicationFanout::new()),
            Duration::from_secs(60),
        )
        .unwrap();
        Dispatcher::new(Arc::new(manager))
    }

    fn queue(tokens: &[&str]) -> VecDeque<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    fn run(dispatcher: &Dispatcher, tokens: &[&str], read_only: bool) -> Reply {
        let mut q = queue(tokens);
        dispatcher.dispatch(&mut q, read_only).expect("complete command")
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());

        assert_eq!(run(&d, &["SET", "foo", "bar", "0"], false), Reply::Ok);
        assert_eq!(
            run(&d, &["GET", "foo", "0"], false),
            Reply::value("bar")
        );
    }

    #[tokio::test]
    async fn test_get_absent_key_is_ok_without_value() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        assert_eq!(run(&d, &["GET", "nothing", "0"], false), Reply::Ok);
    }

    #[tokio::test]
    async fn test_named_stash_routing() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());

        assert_eq!(run(&d, &["CREATE", "s", "10", "false"], false), Reply::Ok);
        assert_eq!(run(&d, &["SET", "a", "1", "1", "NAME=s"], false), Reply::Ok);

        // The key lives in "s", not in the default stash.
        assert_eq!(run(&d, &["GET", "a", "1", "NAME=s"], false), Reply::value("1"));
        assert_eq!(run(&d, &["GET", "a", "0"], false), Reply::Ok);
    }

    #[tokio::test]
    async fn test_unknown_stash() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());

        let reply = run(&d, &["GET", "a", "1", "NAME=ghost"], false);
        assert_eq!(
            reply,
            Reply::error("the specified stash doesn't exist")
        );
    }

    #[tokio::test]
    async fn test_read_only_gate() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());

        for write in [
            vec!["SET", "k", "v", "0"],
            vec!["SETTTL", "k", "v", "100", "0"],
            vec!["DELETE", "k", "0"],
            vec!["UPDATETTL", "k", "100", "0"],
            vec!["CREATE", "s", "10", "false"],
            vec!["DROP", "s"],
        ] {
            let reply = run(&d, &write, true);
            assert!(
                matches!(&reply, Reply::Error(msg) if msg.contains("read-only")),
                "expected read-only error for {:?}, got {:?}",
                write,
                reply
            );
        }

        // Reads pass.
        assert_eq!(run(&d, &["GET", "k", "0"], true), Reply::Ok);
        assert!(matches!(run(&d, &["INFO", "0"], true), Reply::Value(_)));
    }

    #[tokio::test]
    async fn test_capacity_full_reply() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());

        run(&d, &["CREATE", "s", "2", "false"], false);
        assert_eq!(run(&d, &["SET", "a", "1", "1", "NAME=s"], false), Reply::Ok);
        assert_eq!(run(&d, &["SET", "b", "2", "1", "NAME=s"], false), Reply::Ok);
        assert_eq!(
            run(&d, &["SET", "c", "3", "1", "NAME=s"], false),
            Reply::error("stash is at max capacity")
        );
    }

    #[tokio::test]
    async fn test_cannot_drop_default() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        assert_eq!(
            run(&d, &["DROP", "default"], false),
            Reply::error("cannot drop the default stash")
        );
    }

    #[tokio::test]
    async fn test_drop_then_access_reports_missing_stash() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());

        run(&d, &["CREATE", "s", "10", "false"], false);
        run(&d, &["SET", "a", "1", "1", "NAME=s"], false);
        assert_eq!(run(&d, &["DROP", "s"], false), Reply::Ok);

        assert_eq!(
            run(&d, &["GET", "a", "1", "NAME=s"], false),
            Reply::error("the specified stash doesn't exist")
        );
    }

    #[tokio::test]
    async fn test_update_ttl_on_absent_key() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        assert_eq!(
            run(&d, &["UPDATETTL", "ghost", "100", "0"], false),
            Reply::error("key doesn't exist")
        );
    }

    #[tokio::test]
    async fn test_setttl_expires() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());

        assert_eq!(run(&d, &["SETTTL", "x", "y", "40", "0"], false), Reply::Ok);
        assert_eq!(run(&d, &["GET", "x", "0"], false), Reply::value("y"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(run(&d, &["GET", "x", "0"], false), Reply::Ok);
    }

    #[tokio::test]
    async fn test_info_reply() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());

        run(&d, &["SET", "k", "v", "0"], false);
        let reply = run(&d, &["INFO", "0"], false);
        match reply {
            Reply::Value(info) => {
                assert!(info.contains("Name: default"));
                assert!(info.contains("Number of keys: 1"));
            }
            other => panic!("expected INFO value, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_incomplete_command_returns_none() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());

        let mut q = queue(&["SET", "foo"]);
        assert!(d.dispatch(&mut q, false).is_none());
        assert_eq!(q.len(), 2);

        q.push_back("bar".to_string());
        q.push_back("0".to_string());
        assert_eq!(d.dispatch(&mut q, false), Some(Reply::Ok));
    }

    #[tokio::test]
    async fn test_invalid_verb_reply() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        let reply = run(&d, &["FETCH", "x", "0"], false);
        assert!(matches!(&reply, Reply::Error(msg) if msg.contains("invalid command")));
    }
}
