//! Blocking on the disappearance of a single node.

use std::sync::Arc;
use std::time::Duration;

use slog::trace;
use tokio::sync::watch;

use crate::client::{SessionState, ZkClient};
use crate::Error;

/// Blocks a caller until a named node no longer exists.
///
/// [`wait`](NodeDeletionWatcher::wait) resolves normally once the target
/// path is gone (whether it was never there, or was deleted while being
/// watched), and fails with [`Error::InterruptedSession`] if the client's
/// session dies first. There is no polling: a single exists watch is armed
/// per pass, and existence is re-checked after every wake-up so that a
/// delete-then-recreate race simply re-arms the watch.
pub struct NodeDeletionWatcher<C> {
    client: Arc<C>,
    path: String,
    blocked: watch::Sender<bool>,
    blocked_rx: watch::Receiver<bool>,
    logger: slog::Logger,
}

impl<C> std::fmt::Debug for NodeDeletionWatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDeletionWatcher")
            .field("path", &self.path)
            .field("blocked", &*self.blocked_rx.borrow())
            .finish()
    }
}

impl<C: ZkClient> NodeDeletionWatcher<C> {
    /// Set up a watcher for the node at `path`. No server communication
    /// happens until [`wait`](NodeDeletionWatcher::wait).
    pub fn new(client: Arc<C>, path: impl Into<String>, logger: slog::Logger) -> Self {
        let (blocked, blocked_rx) = watch::channel(false);
        NodeDeletionWatcher {
            client,
            path: path.into(),
            blocked,
            blocked_rx,
            logger,
        }
    }

    /// The path being watched.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether a [`wait`](NodeDeletionWatcher::wait) call is currently
    /// parked on a watch.
    pub fn blocked(&self) -> bool {
        *self.blocked_rx.borrow()
    }

    /// A cheap observer of the blocked flag, usable from other tasks while
    /// [`wait`](NodeDeletionWatcher::wait) borrows the watcher.
    pub fn probe(&self) -> WaitProbe {
        WaitProbe {
            rx: self.blocked_rx.clone(),
        }
    }

    /// Block until the target node does not exist.
    ///
    /// Returns `Ok(())` as soon as the path is observed absent. Fails with
    /// [`Error::InterruptedSession`] if the session expires or the client is
    /// closed while waiting; any other client failure propagates.
    pub async fn wait(&mut self) -> Result<(), Error> {
        let mut session = self.client.session();
        let res = self.watch_until_gone(&mut session).await;
        self.blocked.send_replace(false);
        res
    }

    async fn watch_until_gone(
        &self,
        session: &mut watch::Receiver<SessionState>,
    ) -> Result<(), Error> {
        loop {
            if !session.borrow_and_update().is_alive() {
                return Err(Error::InterruptedSession);
            }
            let (stat, mut event) = self.client.watch_exists(&self.path).await?;
            if stat.is_none() {
                trace!(self.logger, "target is gone"; "path" => &self.path);
                return Ok(());
            }
            self.blocked.send_replace(true);
            tokio::select! {
                ev = &mut event => {
                    // Deletion, or a recreate that raced our wake-up; either
                    // way the next pass re-checks and re-arms.
                    let ev = ev.ok();
                    trace!(self.logger, "watch fired"; "path" => &self.path, "event" => ?ev);
                }
                changed = session.changed() => {
                    if changed.is_err() || !session.borrow_and_update().is_alive() {
                        return Err(Error::InterruptedSession);
                    }
                }
            }
        }
    }
}

/// Observer for the blocked state of a [`NodeDeletionWatcher`] or a
/// [`Locker`](crate::Locker); a test aid.
#[derive(Clone, Debug)]
pub struct WaitProbe {
    rx: watch::Receiver<bool>,
}

impl WaitProbe {
    /// Whether the watched requester is currently parked.
    pub fn blocked(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the watched requester has entered its blocked state, or
    /// fail with [`Error::WaitTimeout`] after `timeout`.
    pub async fn wait_until_blocked(&mut self, timeout: Duration) -> Result<(), Error> {
        let parked = async {
            loop {
                if *self.rx.borrow_and_update() {
                    return true;
                }
                if self.rx.changed().await.is_err() {
                    // The requester went away without ever blocking.
                    return false;
                }
            }
        };
        match tokio::time::timeout(timeout, parked).await {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(Error::WaitTimeout),
        }
    }
}
