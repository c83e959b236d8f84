use failure::Fail;

/// Failures surfaced by the locking and election primitives.
#[derive(Debug, Fail)]
pub enum Error {
    /// The client's session ended (expired or explicitly closed) while an
    /// operation was in flight or blocked on a watch.
    ///
    /// Any ephemeral nodes the session created are reclaimed by the server;
    /// the caller must build a fresh client before retrying.
    #[fail(display = "session was interrupted")]
    InterruptedSession,

    /// [`Locker::assert_held`](crate::Locker::assert_held) found one of its
    /// invariants violated.
    #[fail(display = "lock assertion failed: {}", reason)]
    LockAssertionFailed {
        /// The first invariant that did not hold.
        reason: String,
    },

    /// The caller misused the API (empty lock name, double vote, ...).
    #[fail(display = "bad arguments: {}", reason)]
    BadArguments {
        /// What was wrong with the call.
        reason: String,
    },

    /// A timed wait for a requester to enter its blocked state ran out.
    ///
    /// Only produced by [`WaitProbe::wait_until_blocked`] and
    /// [`LockerHandle::wait_until_blocked`]; no other operation in this
    /// crate is bounded by wall-clock time.
    ///
    /// [`WaitProbe::wait_until_blocked`]: crate::WaitProbe::wait_until_blocked
    /// [`LockerHandle::wait_until_blocked`]: crate::LockerHandle::wait_until_blocked
    #[fail(display = "timed out waiting for requester to block")]
    WaitTimeout,

    /// The coordination client failed in a way the recipes cannot recover
    /// from (connection loss, protocol violation, unexpected node state).
    #[fail(display = "coordination client error: {}", _0)]
    Client(failure::Error),
}

impl Error {
    pub(crate) fn assertion(reason: impl Into<String>) -> Self {
        Error::LockAssertionFailed {
            reason: reason.into(),
        }
    }

    pub(crate) fn bad_arguments(reason: impl Into<String>) -> Self {
        Error::BadArguments {
            reason: reason.into(),
        }
    }
}

/// Errors that may cause a create request to fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum Create {
    /// A node with the given `path` already exists.
    #[fail(display = "target node already exists")]
    NodeExists,

    /// The parent node of the given `path` does not exist.
    #[fail(display = "parent node of target does not exist")]
    NoNode,
}

/// Errors that may cause a delete request to fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum Delete {
    /// No node exists with the given `path`.
    #[fail(display = "target node does not exist")]
    NoNode,

    /// The target node has child nodes, and therefore cannot be deleted.
    #[fail(display = "target node has children, and cannot be deleted")]
    NotEmpty,
}
