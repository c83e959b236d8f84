//! This crate provides client-side coordination recipes -- distributed locks
//! and leader election -- for hierarchical coordination services in the style
//! of [Apache ZooKeeper](https://zookeeper.apache.org/): a tree of nodes with
//! ephemeral and sequential creation modes, one-shot watches, and sessions
//! whose death reclaims the ephemeral nodes they created.
//!
//! # Locks
//!
//! A [`Locker`] contends for a named lock by creating a sequential ephemeral
//! node under the lock's parent and never polls: ownership is decided from
//! the sequence-ordered sibling list, and a contender that must wait watches
//! the single predecessor whose deletion can promote it. Two policies are
//! provided: exclusive (the lowest sequence owns the lock) and shared (any
//! request not preceded by an exclusive one owns it), giving fair,
//! FIFO-ordered read/write locking. Crashed holders are cleaned up by the
//! server through ephemerality, and cleanup is guarded by the parent node's
//! creation time so that a parent deleted and recreated by someone else is
//! never touched.
//!
//! # Elections
//!
//! A [`Candidate`] votes with the same queueing primitive under a dedicated
//! election path. The first vote in sequence order wins, runs its
//! `on_winning_election` callbacks, and only then publishes the election's
//! `leader_ack` node; the remaining candidates run `on_losing_election` once
//! that ack exists, so losers never act before the leader has finished
//! initializing. An [`Observer`] follows the election without voting and
//! surfaces strictly alternating new-leader / leader-death transitions.
//!
//! # The coordination client
//!
//! The recipes do not speak a wire protocol. They are written against the
//! [`ZkClient`] trait ([`client`]), which any session-oriented coordination
//! client can implement; [`memory`] ships a deterministic in-process
//! implementation used by this crate's own tests and suitable for local
//! development.
//!
//! # Interaction with Tokio
//!
//! The futures in this crate expect to be running under a `tokio::Runtime`;
//! candidates and observers additionally spawn a background task to drive
//! resolution and callbacks. User callbacks run on the blocking thread pool
//! and may block, but must not call `&mut self` methods of their own
//! instance.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_zk_recipes::memory::MemoryCluster;
//! use tokio_zk_recipes::LockerBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), tokio_zk_recipes::Error> {
//! let cluster = MemoryCluster::new();
//! let client = Arc::new(cluster.client());
//!
//! let mut locker = LockerBuilder::new(client).exclusive("migrations")?;
//! let applied = locker
//!     .with_lock(|| async {
//!         // at most one process runs this at a time
//!         42
//!     })
//!     .await?;
//! assert_eq!(applied, 42);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![deny(missing_copy_implementations)]

pub mod client;
mod election;
/// Typed failures of the recipes and the client contract.
pub mod error;
mod locker;
pub mod memory;
pub mod paths;
mod watcher;

pub use crate::client::{
    CreateMode, SessionState, Stat, WatchedEvent, WatchedEventType, ZkClient,
};
pub use crate::election::{Candidate, CandidatePhase, ElectionBuilder, Observer};
pub use crate::error::Error;
pub use crate::locker::{LockKind, Locker, LockerBuilder, LockerHandle, LockerStatus};
pub use crate::watcher::{NodeDeletionWatcher, WaitProbe};
