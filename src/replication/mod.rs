//! Replication Pipeline
//!
//! Single-leader replication of the write stream to read-only followers.
//!
//! ```text
//!  leader                                    follower
//!  ┌─────────────────┐   encoded writes    ┌──────────────────┐
//!  │ stash write ops │ ──► fan-out ──────► │ framer +         │
//!  │ (stripe-locked) │     (per-sink       │ dispatcher       │
//!  └─────────────────┘      buffers)       │ (read-only gate  │
//!                                          │  bypassed)       │
//!                                          └──────────────────┘
//! ```
//!
//! Ordering: per key, forwarding happens under the same stripe lock as the
//! local mutation; per sink, a single writer task preserves enqueue order.
//! Delivery is best-effort: a slow or dead follower is dropped, and a
//! reconnecting follower rejoins the live stream with no catch-up.
//!
//! ## Modules
//!
//! - `fanout`: the leader's sink set
//! - `follower`: the follower's connect/apply loop

pub mod fanout;
pub mod follower;

pub use fanout::ReplicationFanout;
pub use follower::{FollowerHandle, REPLICA_VERB};
