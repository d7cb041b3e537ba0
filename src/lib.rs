//! A fault-tolerant, linearizable in-memory filesystem replicated over
//! raft across a small cluster of servers (spec.md 1-2).
//!
//! The crate is layered in three pieces, each its own module:
//! [`raft`] is the consensus engine, transport-agnostic and unaware
//! that what it's replicating happens to be filesystem operations;
//! [`server`] is the dispatcher that turns committed log entries into
//! calls against a [`fs::MemoryFS`] and routes replies back to waiting
//! callers; [`clerk`] is the client that talks to that cluster. [`ops`]
//! is the operation codec shared by the dispatcher and the clerk, and
//! [`transport`]/[`persister`] are the pluggable boundaries (network and
//! disk) that let the other three stay unit-testable without either.

pub mod clerk;
pub mod fs;
pub mod ops;
pub mod persister;
pub mod raft;
pub mod server;
pub mod transport;

/// Default port offsets used by the two binaries when no explicit
/// addresses are given: raft-to-raft RPCs on `BASE_RAFT_PORT + i`,
/// clerk-to-server RPCs on `BASE_CLIENT_PORT + i`, for the i-th server
/// in a cluster.
pub const BASE_RAFT_PORT: u16 = 7100;
pub const BASE_CLIENT_PORT: u16 = 7200;
