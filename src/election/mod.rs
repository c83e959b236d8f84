//! Leader election: candidates queue like exclusive lock requesters, and the
//! handover is two-phase.
//!
//! Every candidate creates a sequential ephemeral vote node under the
//! election's parent. The first vote in sequence order is the leader; it
//! runs its winning callbacks and only then publishes the `leader_ack` node,
//! so that losers (and [`Observer`]s) never act on a leader that has not
//! finished initializing. Losers are notified once the ack appears, but
//! remain queued: when the sitting leader's session dies, the next vote in
//! line is promoted and goes through the same winning-callbacks-then-ack
//! sequence.

use std::sync::Arc;

use slog::o;

use crate::client::ZkClient;
use crate::paths;
use crate::Error;

mod candidate;
mod observer;

pub use candidate::{Candidate, CandidatePhase};
pub use observer::Observer;

/// Configuration for election participants sharing a client.
pub struct ElectionBuilder<C> {
    client: Arc<C>,
    root: String,
    data: Vec<u8>,
    logger: slog::Logger,
}

impl<C> std::fmt::Debug for ElectionBuilder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectionBuilder")
            .field("root", &self.root)
            .finish()
    }
}

impl<C: ZkClient> ElectionBuilder<C> {
    /// Build election participants against the given client, rooted at
    /// [`paths::DEFAULT_ELECTION_ROOT`] and with logging disabled.
    pub fn new(client: Arc<C>) -> Self {
        ElectionBuilder {
            client,
            root: paths::DEFAULT_ELECTION_ROOT.to_string(),
            data: Vec::new(),
            logger: slog::Logger::root(slog::Discard, o!()),
        }
    }

    /// Override the root node all elections live under.
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Bytes stored in this candidate's vote node and republished in its
    /// `leader_ack` should it win; typically the address other processes
    /// need to reach the leader.
    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Set the logger used internally. By default, all logging is disabled.
    pub fn logger(mut self, logger: slog::Logger) -> Self {
        self.logger = logger;
        self
    }

    /// A voting participant in the election called `name`.
    pub fn candidate(self, name: &str) -> Result<Candidate<C>, Error> {
        let (parent, ack) = self.paths_for(name)?;
        Ok(Candidate::new(
            self.client,
            name.to_string(),
            parent,
            ack,
            self.data,
            self.logger,
        ))
    }

    /// A non-voting observer of the election called `name`.
    pub fn observer(self, name: &str) -> Result<Observer<C>, Error> {
        let (_, ack) = self.paths_for(name)?;
        Ok(Observer::new(self.client, ack, self.logger))
    }

    fn paths_for(&self, name: &str) -> Result<(String, String), Error> {
        if name.is_empty() {
            return Err(Error::bad_arguments("election name must not be empty"));
        }
        if name.contains('/') {
            return Err(Error::bad_arguments(
                "election name must be a single path component",
            ));
        }
        if !self.root.starts_with('/') {
            return Err(Error::bad_arguments(
                "election root must be an absolute path",
            ));
        }
        let parent = paths::join(&self.root, name);
        let ack = paths::join(&parent, paths::LEADER_ACK_NODE);
        Ok((parent, ack))
    }
}
