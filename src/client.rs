//! The contract the recipes require from a coordination-service client.
//!
//! The recipes in this crate never speak a wire protocol themselves. They are
//! written against [`ZkClient`], a thin trait over the operations every
//! ZooKeeper-style service exposes: a tree of nodes with persistent and
//! ephemeral lifetimes, server-assigned sequence suffixes, one-shot watches,
//! and a session whose death reclaims the ephemerals it created.
//!
//! An in-process implementation suitable for tests and local development is
//! provided in [`crate::memory`].

use async_trait::async_trait;
use futures::channel::oneshot;
use tokio::sync::watch;

use crate::error;
use crate::Error;

/// Statistics about a node, reduced to the fields the recipes read.
///
/// The `ctime` of a lock's parent node is the *parent-identity token*: a
/// requester remembers it when it enqueues and re-checks it before cleanup,
/// so that it never deletes a parent that was removed and recreated by
/// someone else in the meantime.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Stat {
    /// The transaction ID that created the node.
    pub czxid: i64,
    /// Milliseconds since epoch when the node was created.
    pub ctime: i64,
    /// The number of changes to the data of the node.
    pub version: i32,
    /// The session ID of the owner of this node, if it is an ephemeral entry.
    pub ephemeral_owner: i64,
    /// The number of children this node has.
    pub num_children: i32,
}

/// CreateMode value determines how the node is created on the server.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// The node will not be automatically deleted upon client's disconnect.
    Persistent = 0,
    /// The node will be deleted upon the client's disconnect.
    Ephemeral = 1,
    /// The name of the node will be appended with a monotonically increasing
    /// number. The actual path name of a sequential node will be the given
    /// path plus a suffix `i` where *i* is the current sequential number of
    /// the node. The sequence number is always fixed length of 10 digits, 0
    /// padded.
    PersistentSequential = 2,
    /// The node will be deleted upon the client's disconnect, and its name
    /// will be appended with a monotonically increasing number.
    EphemeralSequential = 3,
}

impl CreateMode {
    /// Does a node created with this mode die with its session?
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    /// Does the server append a sequence suffix to the requested name?
    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// A change to a watched node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedEvent {
    /// The trigger that caused the watch to hit.
    pub event_type: WatchedEventType,
    /// The path of the node that was involved.
    pub path: String,
}

/// Enumeration of types of events that may occur on a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchedEventType {
    /// Issued when a node at a given path is created.
    NodeCreated,
    /// Issued when a node at a given path is deleted.
    NodeDeleted,
    /// Issued when the data of a watched node is altered.
    NodeDataChanged,
    /// Issued when the children of a watched node are created or deleted.
    NodeChildrenChanged,
}

/// The lifecycle state of a client's session.
///
/// A session that has left [`SessionState::Connected`] never returns to it;
/// ephemeral nodes it created are gone and a new client must be built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// The session is live and requests can be issued.
    Connected,
    /// The server expired the session.
    Expired,
    /// The client was closed locally.
    Closed,
}

impl SessionState {
    /// Whether requests can still be issued on this session.
    pub fn is_alive(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

/// The coordination-service operations the recipes are built on.
///
/// Recoverable per-operation failures (node exists, no node, not empty) are
/// the `Err` arm of the *inner* result, mirroring how per-operation error
/// enums are separated from transport-level failure; everything the caller
/// cannot meaningfully match on is an [`Error`].
///
/// Watch registration is atomic with the read that arms it: the state
/// returned by [`watch_exists`](ZkClient::watch_exists) is the state the
/// watch observes from, so a change between the read and the registration
/// cannot be lost.
#[async_trait]
pub trait ZkClient: Send + Sync + 'static {
    /// Create a node at `path` with `data` as its contents, returning the
    /// created path (which differs from `path` for sequential modes).
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<Result<String, error::Create>, Error>;

    /// Delete the node at `path`.
    async fn delete(&self, path: &str) -> Result<Result<(), error::Delete>, Error>;

    /// Return the [`Stat`] of the node at `path`, or `None` if it does not
    /// exist.
    async fn exists(&self, path: &str) -> Result<Option<Stat>, Error>;

    /// Like [`exists`](ZkClient::exists), but also leave a one-shot watch on
    /// `path` that fires on the next create, delete, or data change.
    async fn watch_exists(
        &self,
        path: &str,
    ) -> Result<(Option<Stat>, oneshot::Receiver<WatchedEvent>), Error>;

    /// Return the data and the [`Stat`] of the node at `path`, or `None` if
    /// it does not exist.
    async fn get_data(&self, path: &str) -> Result<Option<(Vec<u8>, Stat)>, Error>;

    /// Return the names of the children of the node at `path`, or `None` if
    /// the node does not exist. No ordering is guaranteed.
    async fn get_children(&self, path: &str) -> Result<Option<Vec<String>>, Error>;

    /// Create `path` and any missing ancestors as persistent nodes; existing
    /// nodes along the way are fine.
    async fn mkdir_p(&self, path: &str) -> Result<(), Error>;

    /// Whether the session is currently usable.
    fn connected(&self) -> bool;

    /// A channel tracking the session lifecycle. Waiters `select!` on this
    /// next to their node watches so a dying session interrupts them.
    fn session(&self) -> watch::Receiver<SessionState>;
}
