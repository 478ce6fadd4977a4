//! # sstash - An In-Memory Key-Value Store with Stashes
//!
//! sstash serves string values over a line-oriented TCP protocol. Keys live
//! in *stashes*, independently managed named tables with their own key
//! limit and storage variant, with optional per-key TTL, periodic on-disk
//! snapshots, and single-leader replication to read-only followers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               sstash                                 │
//! │                                                                      │
//! │  ┌────────────┐   ┌────────────┐   ┌────────────┐                    │
//! │  │ primary    │──>│ Connection │──>│ Dispatcher │                    │
//! │  │ listener   │   │  Handler   │   │            │                    │
//! │  └────────────┘   └────────────┘   └─────┬──────┘                    │
//! │  ┌────────────┐        ▲                 │                           │
//! │  │ read-only  │────────┘                 ▼                           │
//! │  │ listener   │            ┌──────────────────────────────┐          │
//! │  └────────────┘            │        StashManager          │          │
//! │                            │  ┌────────┐  ┌────────┐      │          │
//! │  ┌────────────┐            │  │ Stash  │  │ Stash  │ ...  │          │
//! │  │ follower   │── applies ─►  │ stripe │  │ stripe │      │          │
//! │  │ loop       │   stream   │  │ locks  │  │ locks  │      │          │
//! │  └────────────┘            │  │ + TTL  │  │ + TTL  │      │          │
//! │                            │  └───┬────┘  └────────┘      │          │
//! │                            └──────┼───────────────────────┘          │
//! │                                   │ writes fan out                   │
//! │                                   ▼                                  │
//! │                       ┌─────────────────────┐   ┌──────────────────┐ │
//! │                       │ ReplicationFanout   │   │ snapshot         │ │
//! │                       │ (follower sinks)    │   │ scheduler/writer │ │
//! │                       └─────────────────────┘   └──────────────────┘ │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Highlights
//!
//! ### Stripe Locking
//!
//! Each stash guards its keys with a fixed array of 16 mutexes selected by
//! key hash, so concurrent operations on different keys rarely contend
//! while a single key's operations stay linearizable. Replication frames
//! are forwarded while the stripe lock is held, which keeps follower order
//! consistent with the leader per key.
//!
//! ### Lazy + Active Expiry
//!
//! Expired keys are reclaimed when accessed through a read-write entry
//! point, and a shared background timer sweeps every stash's time wheel
//! in bounded batches. Read-only entry points report expired keys as
//! absent without mutating anything.
//!
//! ### Crash-Safe Snapshots
//!
//! Each stash's snapshot is written to a staging file and committed by an
//! atomic rename, so a crash never corrupts the previous snapshot. Startup
//! restores every committed snapshot, recomputing remaining TTLs.
//!
//! ## Module Overview
//!
//! - [`protocol`]: token framing and reply encoding
//! - [`commands`]: command parsing and dispatch
//! - [`stash`]: the stash engine, keyspace variants, and manager
//! - [`ttl`]: the TTL time wheel
//! - [`snapshot`]: snapshot format, writer, reader, and scheduler
//! - [`replication`]: leader fan-out and the follower loop
//! - [`connection`]: per-connection read/dispatch/reply loop
//! - [`server`]: configuration and node wiring

pub mod commands;
pub mod connection;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod snapshot;
pub mod stash;
pub mod ttl;

pub use commands::{Command, CommandError, Dispatcher};
pub use connection::{handle_connection, ConnectionHandler};
pub use protocol::Reply;
pub use server::{Server, ServerConfig, ServerError};
pub use stash::{Stash, StashError, StashManager};

/// Version of sstash.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
