//! Command Model
//!
//! Parses the token stream into typed commands and re-encodes write
//! commands for replication.
//!
//! ## Command Grammar
//!
//! Every stash-targeted command carries its required positional arguments,
//! then a `num_opt_args` decimal, then up to that many `KEY=VALUE` optional
//! argument tokens. `NAME=<stash>` is the only recognized optional key.
//!
//! ```text
//! GET <key> <num_opt_args> [NAME=<name>]
//! INFO <num_opt_args> [NAME=<name>]
//! SET <key> <value> <num_opt_args> [NAME=<name>]
//! SETTTL <key> <value> <ttl_ms> <num_opt_args> [NAME=<name>]
//! DELETE <key> <num_opt_args> [NAME=<name>]
//! UPDATETTL <key> <ttl_ms> <num_opt_args> [NAME=<name>]
//! CREATE <name> <max_key_count> <off_heap>
//! DROP <name>
//! ```
//!
//! ## Resumable Consumption
//!
//! [`Command::consume`] pulls one command off the front of a connection's
//! token queue. If the queue doesn't yet hold every token the command
//! needs, nothing is consumed and the caller waits for more input, so a slow
//! or fragmented client never loses tokens and the server never advances
//! past a partial command. Tokens are only drained once the whole command
//! (including its declared optional arguments) is present.

pub mod dispatcher;

pub use dispatcher::Dispatcher;

use std::collections::VecDeque;

use thiserror::Error;

use crate::stash::manager::ManagerError;
use crate::stash::StashError;

/// Upper bound on `num_opt_args`.
pub const MAX_OPT_ARGS: usize = 8;

/// The key of the stash-name optional argument.
pub const OPT_NAME: &str = "NAME";

/// Errors surfaced to clients as `ERROR <msg>` replies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Malformed framing or argument structure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unknown verb.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Write verb on a read-only connection.
    #[error("cannot execute a write command on a read-only connection")]
    ReadOnlyMode,

    /// The named stash doesn't exist.
    #[error("the specified stash doesn't exist")]
    StashNotFound,

    /// TTL update on an absent key.
    #[error("key doesn't exist")]
    KeyNotFound,

    #[error(transparent)]
    Stash(#[from] StashError),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get {
        key: String,
        name: Option<String>,
    },
    Info {
        name: Option<String>,
    },
    Set {
        key: String,
        value: String,
        name: Option<String>,
    },
    SetTtl {
        key: String,
        value: String,
        ttl_ms: u64,
        name: Option<String>,
    },
    Delete {
        key: String,
        name: Option<String>,
    },
    UpdateTtl {
        key: String,
        ttl_ms: u64,
        name: Option<String>,
    },
    Create {
        name: String,
        max_key_count: u64,
        off_heap: bool,
    },
    Drop {
        name: String,
    },
}

/// Per-verb argument shape.
struct Shape {
    /// Required positional arguments after the verb.
    positionals: usize,
    /// Whether a `num_opt_args` token (and optional args) follows.
    takes_opts: bool,
}

fn shape_of(verb: &str) -> Option<Shape> {
    let shape = match verb {
        "GET" => Shape { positionals: 1, takes_opts: true },
        "INFO" => Shape { positionals: 0, takes_opts: true },
        "SET" => Shape { positionals: 2, takes_opts: true },
        "SETTTL" => Shape { positionals: 3, takes_opts: true },
        "DELETE" => Shape { positionals: 1, takes_opts: true },
        "UPDATETTL" => Shape { positionals: 2, takes_opts: true },
        "CREATE" => Shape { positionals: 3, takes_opts: false },
        "DROP" => Shape { positionals: 1, takes_opts: false },
        _ => return None,
    };
    Some(shape)
}

impl Command {
    /// Attempts to consume one command from the front of the token queue.
    ///
    /// - `None`: the queue doesn't hold a complete command yet; nothing was
    ///   consumed.
    /// - `Some(Ok(cmd))`: a command was parsed; its tokens were drained.
    /// - `Some(Err(e))`: the tokens formed an invalid command; the offending
    ///   tokens were drained so the stream can continue.
    pub fn consume(queue: &mut VecDeque<String>) -> Option<Result<Command, CommandError>> {
        let verb = queue.front()?.to_uppercase();

        let shape = match shape_of(&verb) {
            Some(shape) => shape,
            None => {
                let raw = queue.pop_front().expect("front was just peeked");
                return Some(Err(CommandError::InvalidCommand(raw)));
            }
        };

        let base = 1 + shape.positionals;
        let num_opts = if shape.takes_opts {
            if queue.len() < base + 1 {
                return None;
            }
            match parse_num_opt_args(&queue[base]) {
                Ok(n) => n,
                Err(e) => {
                    queue.drain(..base + 1);
                    return Some(Err(e));
                }
            }
        } else {
            if queue.len() < base {
                return None;
            }
            0
        };

        let total = base + usize::from(shape.takes_opts) + num_opts;
        if queue.len() < total {
            return None;
        }

        let tokens: Vec<String> = queue.drain(..total).collect();
        Some(Self::from_tokens(&verb, &shape, &tokens))
    }

    fn from_tokens(
        verb: &str,
        shape: &Shape,
        tokens: &[String],
    ) -> Result<Command, CommandError> {
        let positionals = &tokens[1..1 + shape.positionals];
        let name = if shape.takes_opts {
            parse_opt_name(&tokens[2 + shape.positionals..])?
        } else {
            None
        };

        let command = match verb {
            "GET" => Command::Get {
                key: positionals[0].clone(),
                name,
            },
            "INFO" => Command::Info { name },
            "SET" => Command::Set {
                key: positionals[0].clone(),
                value: positionals[1].clone(),
                name,
            },
            "SETTTL" => Command::SetTtl {
                key: positionals[0].clone(),
                value: positionals[1].clone(),
                ttl_ms: parse_u64(&positionals[2], "ttl_ms")?,
                name,
            },
            "DELETE" => Command::Delete {
                key: positionals[0].clone(),
                name,
            },
            "UPDATETTL" => Command::UpdateTtl {
                key: positionals[0].clone(),
                ttl_ms: parse_u64(&positionals[1], "ttl_ms")?,
                name,
            },
            "CREATE" => Command::Create {
                name: positionals[0].clone(),
                max_key_count: parse_max_key_count(&positionals[1])?,
                off_heap: parse_bool(&positionals[2], "off_heap")?,
            },
            "DROP" => Command::Drop {
                name: positionals[0].clone(),
            },
            _ => unreachable!("shape_of accepted the verb"),
        };
        Ok(command)
    }

    /// Whether this command mutates a stash or the stash directory.
    pub fn is_write(&self) -> bool {
        !matches!(self, Command::Get { .. } | Command::Info { .. })
    }

    /// Re-encodes the command as wire tokens (verb, positionals,
    /// `num_opt_args`, optional args). The leader forwards this form to its
    /// followers; a follower's dispatcher parses it back to an equivalent
    /// command.
    pub fn to_tokens(&self) -> Vec<String> {
        fn with_opts(mut tokens: Vec<String>, name: &Option<String>) -> Vec<String> {
            match name {
                Some(name) => {
                    tokens.push("1".to_string());
                    tokens.push(format!("{}={}", OPT_NAME, name));
                }
                None => tokens.push("0".to_string()),
            }
            tokens
        }

        match self {
            Command::Get { key, name } => {
                with_opts(vec!["GET".into(), key.clone()], name)
            }
            Command::Info { name } => with_opts(vec!["INFO".into()], name),
            Command::Set { key, value, name } => {
                with_opts(vec!["SET".into(), key.clone(), value.clone()], name)
            }
            Command::SetTtl {
                key,
                value,
                ttl_ms,
                name,
            } => with_opts(
                vec![
                    "SETTTL".into(),
                    key.clone(),
                    value.clone(),
                    ttl_ms.to_string(),
                ],
                name,
            ),
            Command::Delete { key, name } => {
                with_opts(vec!["DELETE".into(), key.clone()], name)
            }
            Command::UpdateTtl { key, ttl_ms, name } => with_opts(
                vec!["UPDATETTL".into(), key.clone(), ttl_ms.to_string()],
                name,
            ),
            Command::Create {
                name,
                max_key_count,
                off_heap,
            } => vec![
                "CREATE".into(),
                name.clone(),
                max_key_count.to_string(),
                off_heap.to_string(),
            ],
            Command::Drop { name } => vec!["DROP".into(), name.clone()],
        }
    }
}

fn parse_num_opt_args(token: &str) -> Result<usize, CommandError> {
    let n: usize = token.parse().map_err(|_| {
        CommandError::Protocol(format!("num_opt_args is not a non-negative integer: {}", token))
    })?;
    if n > MAX_OPT_ARGS {
        return Err(CommandError::Protocol(format!(
            "num_opt_args exceeds the max of {}",
            MAX_OPT_ARGS
        )));
    }
    Ok(n)
}

fn parse_opt_name(opt_tokens: &[String]) -> Result<Option<String>, CommandError> {
    let mut name = None;
    for token in opt_tokens {
        let (key, value) = token.split_once('=').ok_or_else(|| {
            CommandError::Protocol(format!("malformed optional argument: {}", token))
        })?;
        match key {
            OPT_NAME => name = Some(value.to_string()),
            _ => {
                return Err(CommandError::Protocol(format!(
                    "unknown optional argument: {}",
                    key
                )))
            }
        }
    }
    Ok(name)
}

fn parse_u64(token: &str, what: &str) -> Result<u64, CommandError> {
    token
        .parse()
        .map_err(|_| CommandError::Protocol(format!("{} is not a non-negative integer: {}", what, token)))
}

fn parse_max_key_count(token: &str) -> Result<u64, CommandError> {
    let n = parse_u64(token, "max_key_count")?;
    if n == 0 {
        return Err(CommandError::Protocol(
            "max_key_count must be positive".to_string(),
        ));
    }
    Ok(n)
}

fn parse_bool(token: &str, what: &str) -> Result<bool, CommandError> {
    match token {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(CommandError::Protocol(format!(
            "{} is not a boolean: {}",
            what, token
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(tokens: &[&str]) -> VecDeque<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_consume_set() {
        let mut q = queue(&["SET", "foo", "bar", "0"]);
        let cmd = Command::consume(&mut q).unwrap().unwrap();
        assert_eq!(
            cmd,
            Command::Set {
                key: "foo".to_string(),
                value: "bar".to_string(),
                name: None,
            }
        );
        assert!(q.is_empty());
    }

    #[test]
    fn test_consume_set_with_name() {
        let mut q = queue(&["SET", "a", "1", "1", "NAME=s"]);
        let cmd = Command::consume(&mut q).unwrap().unwrap();
        assert_eq!(
            cmd,
            Command::Set {
                key: "a".to_string(),
                value: "1".to_string(),
                name: Some("s".to_string()),
            }
        );
    }

    #[test]
    fn test_consume_partial_command_leaves_queue_untouched() {
        let mut q = queue(&["SET", "foo"]);
        assert!(Command::consume(&mut q).is_none());
        assert_eq!(q.len(), 2);
        assert_eq!(q[0], "SET");

        // The num_opt_args token arrives but declares a pair that hasn't.
        let mut q = queue(&["SET", "foo", "bar", "1"]);
        assert!(Command::consume(&mut q).is_none());
        assert_eq!(q.len(), 4);

        // Once everything is there, the command parses.
        q.push_back("NAME=s".to_string());
        let cmd = Command::consume(&mut q).unwrap().unwrap();
        assert!(matches!(cmd, Command::Set { name: Some(ref n), .. } if n == "s"));
        assert!(q.is_empty());
    }

    #[test]
    fn test_consume_token_by_token() {
        // Feed the tokens one at a time; exactly one command comes out at
        // the end, in one piece.
        let tokens = ["SETTTL", "k", "v", "1500", "1", "NAME=s"];
        let mut q = VecDeque::new();
        let mut parsed = Vec::new();

        for (i, token) in tokens.iter().enumerate() {
            q.push_back(token.to_string());
            if let Some(result) = Command::consume(&mut q) {
                parsed.push(result.unwrap());
                assert_eq!(i, tokens.len() - 1);
            }
        }

        assert_eq!(parsed.len(), 1);
        assert_eq!(
            parsed[0],
            Command::SetTtl {
                key: "k".to_string(),
                value: "v".to_string(),
                ttl_ms: 1500,
                name: Some("s".to_string()),
            }
        );
    }

    #[test]
    fn test_unknown_verb() {
        let mut q = queue(&["NOPE", "foo"]);
        let err = Command::consume(&mut q).unwrap().unwrap_err();
        assert_eq!(err, CommandError::InvalidCommand("NOPE".to_string()));
        // Only the verb was consumed.
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_invalid_num_opt_args() {
        let mut q = queue(&["GET", "key", "x"]);
        let err = Command::consume(&mut q).unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Protocol(_)));
        assert!(q.is_empty());

        let mut q = queue(&["GET", "key", "99"]);
        let err = Command::consume(&mut q).unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Protocol(_)));
    }

    #[test]
    fn test_malformed_optional_pair() {
        let mut q = queue(&["GET", "key", "1", "NAMEs"]);
        let err = Command::consume(&mut q).unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Protocol(_)));

        let mut q = queue(&["GET", "key", "1", "COLOR=red"]);
        let err = Command::consume(&mut q).unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Protocol(_)));
    }

    #[test]
    fn test_invalid_ttl() {
        let mut q = queue(&["SETTTL", "k", "v", "soon", "0"]);
        let err = Command::consume(&mut q).unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Protocol(_)));
    }

    #[test]
    fn test_create_and_drop() {
        let mut q = queue(&["CREATE", "s", "2", "false"]);
        assert_eq!(
            Command::consume(&mut q).unwrap().unwrap(),
            Command::Create {
                name: "s".to_string(),
                max_key_count: 2,
                off_heap: false,
            }
        );

        let mut q = queue(&["DROP", "s"]);
        assert_eq!(
            Command::consume(&mut q).unwrap().unwrap(),
            Command::Drop {
                name: "s".to_string()
            }
        );
    }

    #[test]
    fn test_create_validation() {
        let mut q = queue(&["CREATE", "s", "0", "false"]);
        assert!(matches!(
            Command::consume(&mut q).unwrap().unwrap_err(),
            CommandError::Protocol(_)
        ));

        let mut q = queue(&["CREATE", "s", "2", "maybe"]);
        assert!(matches!(
            Command::consume(&mut q).unwrap().unwrap_err(),
            CommandError::Protocol(_)
        ));
    }

    #[test]
    fn test_lowercase_verb_accepted() {
        let mut q = queue(&["get", "key", "0"]);
        let cmd = Command::consume(&mut q).unwrap().unwrap();
        assert!(matches!(cmd, Command::Get { .. }));
    }

    #[test]
    fn test_is_write() {
        assert!(!Command::Get { key: "k".into(), name: None }.is_write());
        assert!(!Command::Info { name: None }.is_write());
        assert!(Command::Set { key: "k".into(), value: "v".into(), name: None }.is_write());
        assert!(Command::Drop { name: "s".into() }.is_write());
    }

    #[test]
    fn test_reencode_roundtrip() {
        let commands = vec![
            Command::Set {
                key: "k".to_string(),
                value: "v".to_string(),
                name: None,
            },
            Command::SetTtl {
                key: "k".to_string(),
                value: "v".to_string(),
                ttl_ms: 250,
                name: Some("s".to_string()),
            },
            Command::Delete {
                key: "k".to_string(),
                name: Some("s".to_string()),
            },
            Command::UpdateTtl {
                key: "k".to_string(),
                ttl_ms: 99,
                name: None,
            },
            Command::Create {
                name: "s".to_string(),
                max_key_count: 42,
                off_heap: true,
            },
            Command::Drop {
                name: "s".to_string(),
            },
        ];

        for original in commands {
            let mut q: VecDeque<String> = original.to_tokens().into();
            let reparsed = Command::consume(&mut q).unwrap().unwrap();
            assert_eq!(reparsed, original);
            assert!(q.is_empty());
        }
    }

    #[test]
    fn test_multiple_commands_in_queue() {
        let mut q = queue(&["SET", "a", "1", "0", "GET", "a", "0"]);

        let first = Command::consume(&mut q).unwrap().unwrap();
        assert!(matches!(first, Command::Set { .. }));

        let second = Command::consume(&mut q).unwrap().unwrap();
        assert!(matches!(second, Command::Get { .. }));

        assert!(Command::consume(&mut q).is_none());
    }
}
