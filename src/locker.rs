//! Distributed locks: fair queueing of exclusive and shared requests.
//!
//! Every lock name maps to a parent node under the lock root. A requester
//! enqueues by creating a sequential ephemeral child of that parent and then
//! decides ownership purely from the sequence-ordered sibling list: an
//! exclusive request owns the lock iff it is first; a shared request owns it
//! iff no exclusive request precedes it. A requester that does not own the
//! lock watches the single predecessor whose deletion can promote it, so
//! there is no herd wake-up and acquisition order follows creation order.
//!
//! Crash safety comes from ephemerality: a requester that dies silently has
//! its child reclaimed by the server, which wakes its successor.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use failure::format_err;
use slog::{debug, o, trace};
use tokio::sync::watch;

use crate::client::{CreateMode, ZkClient};
use crate::error;
use crate::paths;
use crate::watcher::NodeDeletionWatcher;
use crate::Error;

/// The two lock policies, as small strategy records consumed by a single
/// [`Locker`]: each knows its child-name prefix, when a position in the
/// queue owns the lock, and which sibling a non-owner must wait on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    /// At most one holder; the request with the lowest sequence owns the
    /// lock regardless of sibling prefixes.
    Exclusive,
    /// Any number of holders, provided no exclusive request precedes them.
    Shared,
}

impl LockKind {
    pub(crate) fn prefix(&self) -> &'static str {
        match self {
            LockKind::Exclusive => paths::EXCLUSIVE_PREFIX,
            LockKind::Shared => paths::SHARED_PREFIX,
        }
    }

    fn position(ours: &str, ordered: &[String]) -> Option<usize> {
        ordered.iter().position(|c| c == ours)
    }

    /// Does the request named `ours` own the lock, given the sequence-ordered
    /// sibling list?
    pub(crate) fn held(&self, ours: &str, ordered: &[String]) -> bool {
        match Self::position(ours, ordered) {
            None => false,
            Some(0) => true,
            Some(i) => match self {
                LockKind::Exclusive => false,
                LockKind::Shared => !ordered[..i].iter().any(|c| paths::is_exclusive(c)),
            },
        }
    }

    /// The sibling whose deletion can promote `ours`: the immediate
    /// predecessor for exclusive requests, the nearest preceding exclusive
    /// request for shared ones.
    pub(crate) fn blocker<'a>(&self, ours: &str, ordered: &'a [String]) -> Option<&'a str> {
        let i = Self::position(ours, ordered)?;
        match self {
            LockKind::Exclusive => i.checked_sub(1).map(|j| ordered[j].as_str()),
            LockKind::Shared => ordered[..i]
                .iter()
                .rev()
                .find(|c| paths::is_exclusive(c))
                .map(String::as_str),
        }
    }

    /// Would a hypothetical new requester be granted ownership against the
    /// current children?
    pub(crate) fn acquirable(&self, ordered: &[String]) -> bool {
        match self {
            LockKind::Exclusive => ordered.is_empty(),
            LockKind::Shared => !ordered.iter().any(|c| paths::is_exclusive(c)),
        }
    }

    /// The sibling currently considered the lock owner: the head of the
    /// queue for exclusive locks; for shared locks, the writer everyone is
    /// queued behind if there is one, else any holder.
    pub(crate) fn owner<'a>(&self, ordered: &'a [String]) -> Option<&'a str> {
        match self {
            LockKind::Exclusive => ordered.first().map(String::as_str),
            LockKind::Shared => ordered
                .iter()
                .find(|c| paths::is_exclusive(c))
                .map(String::as_str)
                .or_else(|| ordered.first().map(String::as_str)),
        }
    }
}

/// A point-in-time view of a [`Locker`]'s local state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockerStatus {
    /// The instance believes it holds the lock.
    pub locked: bool,
    /// The instance is parked on its blocking predecessor.
    pub waiting: bool,
}

/// Read-only observer of a [`Locker`], usable from other tasks while the
/// locker itself is borrowed by a mutating call.
#[derive(Clone, Debug)]
pub struct LockerHandle {
    rx: watch::Receiver<LockerStatus>,
}

impl LockerHandle {
    /// Does the observed instance believe it holds the lock?
    pub fn locked(&self) -> bool {
        self.rx.borrow().locked
    }

    /// Is the observed instance parked on a predecessor?
    pub fn waiting(&self) -> bool {
        self.rx.borrow().waiting
    }

    /// Resolve once the observed instance has entered its blocked state, or
    /// fail with [`Error::WaitTimeout`] after `timeout`.
    pub async fn wait_until_blocked(&mut self, timeout: Duration) -> Result<(), Error> {
        let parked = async {
            loop {
                if self.rx.borrow_and_update().waiting {
                    return true;
                }
                if self.rx.changed().await.is_err() {
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

/// Configuration for [`Locker`] instances sharing a client.
pub struct LockerBuilder<C> {
    client: Arc<C>,
    root: String,
    data: Vec<u8>,
    logger: slog::Logger,
}

impl<C> std::fmt::Debug for LockerBuilder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockerBuilder")
            .field("root", &self.root)
            .finish()
    }
}

impl<C: ZkClient> LockerBuilder<C> {
    /// Build lockers against the given client, rooted at
    /// [`paths::DEFAULT_LOCK_ROOT`] and with logging disabled.
    pub fn new(client: Arc<C>) -> Self {
        LockerBuilder {
            client,
            root: paths::DEFAULT_LOCK_ROOT.to_string(),
            data: Vec::new(),
            logger: slog::Logger::root(slog::Discard, o!()),
        }
    }

    /// Override the root node all locks live under.
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Bytes to store in this requester's queue node; readable by other
    /// clients through [`Locker::owner_data`].
    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Set the logger used internally. By default, all logging is disabled.
    pub fn logger(mut self, logger: slog::Logger) -> Self {
        self.logger = logger;
        self
    }

    /// An exclusive locker for `name`.
    pub fn exclusive(self, name: &str) -> Result<Locker<C>, Error> {
        self.build(LockKind::Exclusive, name)
    }

    /// A shared locker for `name`.
    pub fn shared(self, name: &str) -> Result<Locker<C>, Error> {
        self.build(LockKind::Shared, name)
    }

    fn build(self, kind: LockKind, name: &str) -> Result<Locker<C>, Error> {
        if name.is_empty() {
            return Err(Error::bad_arguments("lock name must not be empty"));
        }
        if !self.root.starts_with('/') {
            return Err(Error::bad_arguments("lock root must be an absolute path"));
        }
        let parent_path = paths::join(&self.root, &paths::escape_name(name));
        let (status, status_rx) = watch::channel(LockerStatus::default());
        let logger = self.logger.new(o!("lock" => parent_path.clone()));
        Ok(Locker {
            client: self.client,
            kind,
            name: name.to_string(),
            parent_path,
            data: self.data,
            logger,
            lock_path: None,
            parent_ctime: None,
            status,
            status_rx,
        })
    }
}

/// One requester for a named distributed lock.
///
/// Mutating operations ([`lock`](Locker::lock), [`unlock`](Locker::unlock),
/// [`with_lock`](Locker::with_lock)) take `&mut self`: a `Locker` runs at
/// most one acquisition attempt at a time, by construction. Concurrent
/// observation goes through [`handle`](Locker::handle). Locks are not
/// reentrant across instances; a second instance in the same process queues
/// like any other client.
pub struct Locker<C> {
    client: Arc<C>,
    kind: LockKind,
    name: String,
    parent_path: String,
    data: Vec<u8>,
    logger: slog::Logger,
    lock_path: Option<String>,
    parent_ctime: Option<i64>,
    status: watch::Sender<LockerStatus>,
    status_rx: watch::Receiver<LockerStatus>,
}

impl<C> std::fmt::Debug for Locker<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("lock_path", &self.lock_path)
            .field("status", &*self.status_rx.borrow())
            .finish()
    }
}

impl<C: ZkClient> Locker<C> {
    /// The lock name this instance contends for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kind of lock this instance requests.
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// The path of this instance's queue node, while one exists.
    pub fn lock_path(&self) -> Option<&str> {
        self.lock_path.as_deref()
    }

    /// Local view of ownership; no server round-trip.
    pub fn locked(&self) -> bool {
        self.status_rx.borrow().locked
    }

    /// Whether a blocking [`lock`](Locker::lock) is parked on a predecessor.
    pub fn waiting(&self) -> bool {
        self.status_rx.borrow().waiting
    }

    /// A read-only observer of this instance's status.
    pub fn handle(&self) -> LockerHandle {
        LockerHandle {
            rx: self.status_rx.clone(),
        }
    }

    fn set_status(&self, locked: bool, waiting: bool) {
        self.status.send_replace(LockerStatus { locked, waiting });
    }

    /// Attempt to acquire the lock.
    ///
    /// Returns `Ok(true)` once the lock is held. If it is already held by
    /// this instance, that is immediate, and no second queue node is
    /// created. With `blocking` unset, a contended attempt removes its queue
    /// node again and returns `Ok(false)`; with `blocking` set, the call
    /// parks on the blocking predecessor until promoted, failing only on
    /// [`Error::InterruptedSession`] (in which case the queue node is left
    /// for session death to reclaim).
    pub async fn lock(&mut self, blocking: bool) -> Result<bool, Error> {
        if self.locked() {
            return Ok(true);
        }
        debug!(self.logger, "requesting lock"; "blocking" => blocking);
        let (path, parent_ctime) = create_queue_node(
            &*self.client,
            &self.parent_path,
            self.kind.prefix(),
            &self.data,
        )
        .await?;
        let ours = paths::basename(&path).to_string();
        self.lock_path = Some(path);
        self.parent_ctime = Some(parent_ctime);

        loop {
            let children = self.sequence_ordered_children().await?;
            if !children.iter().any(|c| *c == ours) {
                return Err(Error::Client(format_err!(
                    "queue node {} vanished while contending for {}",
                    ours,
                    self.parent_path
                )));
            }
            if self.kind.held(&ours, &children) {
                self.set_status(true, false);
                debug!(self.logger, "lock acquired"; "node" => &ours);
                return Ok(true);
            }
            if !blocking {
                self.abandon_request().await?;
                return Ok(false);
            }
            let blocker = match self.kind.blocker(&ours, &children) {
                Some(b) => paths::join(&self.parent_path, b),
                // our blocker was released between reads; re-evaluate
                None => continue,
            };
            trace!(self.logger, "queued behind predecessor"; "target" => &blocker);
            let mut watcher =
                NodeDeletionWatcher::new(Arc::clone(&self.client), blocker, self.logger.clone());
            self.set_status(false, true);
            let waited = watcher.wait().await;
            self.set_status(false, false);
            waited?;
        }
    }

    /// Release the lock.
    ///
    /// Returns `Ok(true)` if this instance held the lock and cleanup
    /// succeeded. Cleanup deletes the queue node and then best-effort
    /// deletes the (empty) parent, but only when the parent's creation time
    /// still matches the one remembered at acquisition: a parent that was
    /// deleted and recreated by someone else in the meantime is left
    /// untouched and `Ok(false)` is returned. A dead session also yields
    /// `Ok(false)` (the queue node dies with it), so `unlock` is always a
    /// safe cleanup step. Calling it twice is safe; the second call returns
    /// `Ok(false)` with no server side effects.
    pub async fn unlock(&mut self) -> Result<bool, Error> {
        let was_locked = self.locked();
        let cleaned = match self.remove_queue_node().await {
            Ok(cleaned) => cleaned,
            // the session is gone and the ephemeral queue node with it
            Err(Error::InterruptedSession) => false,
            Err(e) => return Err(e),
        };
        self.lock_path = None;
        self.parent_ctime = None;
        self.set_status(false, false);
        Ok(was_locked && cleaned)
    }

    async fn remove_queue_node(&self) -> Result<bool, Error> {
        let (path, remembered) = match (self.lock_path.as_deref(), self.parent_ctime) {
            (Some(path), Some(remembered)) => (path, remembered),
            _ => return Ok(false),
        };
        match self.client.exists(&self.parent_path).await? {
            Some(stat) if stat.ctime == remembered => {
                match self.client.delete(path).await? {
                    Ok(()) | Err(error::Delete::NoNode) => (),
                    Err(e) => {
                        return Err(Error::Client(format_err!(
                            "could not delete lock node {}: {}",
                            path,
                            e
                        )))
                    }
                }
                // tidy up the parent if we were the last one out
                match self.client.delete(&self.parent_path).await? {
                    Ok(()) | Err(error::Delete::NoNode) | Err(error::Delete::NotEmpty) => (),
                }
                debug!(self.logger, "lock released"; "node" => paths::basename(path));
                Ok(true)
            }
            _ => {
                debug!(
                    self.logger,
                    "lock parent was removed or recreated; leaving it alone"
                );
                Ok(false)
            }
        }
    }

    /// Acquire the lock, run `f`, release the lock. The release happens
    /// whatever `f` returns, so an `Err`-returning closure cannot leak the
    /// lock.
    pub async fn with_lock<T, F, Fut>(&mut self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.lock(true).await?;
        let out = f().await;
        self.unlock().await?;
        Ok(out)
    }

    /// Server-side check: would a hypothetical new requester of this kind be
    /// granted the lock right now?
    pub async fn acquirable(&self) -> Result<bool, Error> {
        if self.locked() {
            return Ok(true);
        }
        match self.client.get_children(&self.parent_path).await? {
            None => Ok(true),
            Some(children) => Ok(self.kind.acquirable(&paths::sequence_ordered(children))),
        }
    }

    /// Verify that the lock this instance believes it holds actually holds
    /// up on the server, guarding against silent session loss and
    /// recreated-parent races. Fails with [`Error::LockAssertionFailed`]
    /// naming the first violated invariant.
    pub async fn assert_held(&self) -> Result<(), Error> {
        if !self.locked() {
            return Err(Error::assertion("lock is not held by this instance"));
        }
        if !self.client.connected() {
            return Err(Error::assertion("client is not connected"));
        }
        let path = match self.lock_path.as_deref() {
            Some(p) => p,
            None => return Err(Error::assertion("no lock node is recorded")),
        };
        if self.client.exists(path).await?.is_none() {
            return Err(Error::assertion("lock node no longer exists"));
        }
        match (self.client.exists(&self.parent_path).await?, self.parent_ctime) {
            (Some(stat), Some(remembered)) if stat.ctime == remembered => (),
            _ => return Err(Error::assertion("lock parent was removed or recreated")),
        }
        let children = self.sequence_ordered_children().await?;
        if !self.kind.held(paths::basename(path), &children) {
            return Err(Error::assertion("lock node is not the current owner"));
        }
        Ok(())
    }

    /// The bytes stored in the node currently considered the lock owner, or
    /// `None` if nobody is queued.
    pub async fn owner_data(&self) -> Result<Option<Vec<u8>>, Error> {
        let children = match self.client.get_children(&self.parent_path).await? {
            None => return Ok(None),
            Some(c) => paths::sequence_ordered(c),
        };
        let owner = match self.kind.owner(&children) {
            Some(o) => paths::join(&self.parent_path, o),
            None => return Ok(None),
        };
        Ok(self.client.get_data(&owner).await?.map(|(data, _)| data))
    }

    async fn sequence_ordered_children(&self) -> Result<Vec<String>, Error> {
        match self.client.get_children(&self.parent_path).await? {
            Some(children) => Ok(paths::sequence_ordered(children)),
            None => Err(Error::Client(format_err!(
                "lock parent {} disappeared while in use",
                self.parent_path
            ))),
        }
    }

    async fn abandon_request(&mut self) -> Result<(), Error> {
        if let Some(path) = self.lock_path.take() {
            match self.client.delete(&path).await? {
                Ok(()) | Err(error::Delete::NoNode) => (),
                Err(e) => {
                    return Err(Error::Client(format_err!(
                        "could not remove queue node {}: {}",
                        path,
                        e
                    )))
                }
            }
        }
        self.parent_ctime = None;
        Ok(())
    }
}

/// Enqueue a sequential ephemeral child named `<prefix><seq>` under
/// `parent`, creating the parent chain on demand.
///
/// A missing parent is not an error here: the child creation is retried
/// exactly once after `mkdir_p`. Returns the created path together with the
/// parent's creation time, the identity token later cleanup is gated on.
pub(crate) async fn create_queue_node<C: ZkClient>(
    client: &C,
    parent: &str,
    prefix: &str,
    data: &[u8],
) -> Result<(String, i64), Error> {
    let node = paths::join(parent, prefix);
    let mut attempts = 0;
    let path = loop {
        attempts += 1;
        match client
            .create(&node, data, CreateMode::EphemeralSequential)
            .await?
        {
            Ok(path) => break path,
            Err(error::Create::NoNode) if attempts == 1 => {
                client.mkdir_p(parent).await?;
            }
            Err(e) => {
                return Err(Error::Client(format_err!(
                    "could not enqueue under {}: {}",
                    parent,
                    e
                )))
            }
        }
    };
    match client.exists(parent).await? {
        Some(stat) => Ok((path, stat.ctime)),
        None => Err(Error::Client(format_err!(
            "parent {} disappeared right after enqueueing",
            parent
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryClient, MemoryCluster};

    fn builder(cluster: &MemoryCluster) -> LockerBuilder<MemoryClient> {
        LockerBuilder::new(Arc::new(cluster.client()))
    }

    fn term_logger() -> slog::Logger {
        use slog::Drain;
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, o!())
    }

    #[test]
    fn exclusive_policy() {
        let kind = LockKind::Exclusive;
        let children: Vec<String> = vec!["ex0000000000".into(), "sh0000000001".into(), "ex0000000002".into()];
        assert!(kind.held("ex0000000000", &children));
        assert!(!kind.held("ex0000000002", &children));
        assert_eq!(kind.blocker("ex0000000002", &children), Some("sh0000000001"));
        assert_eq!(kind.blocker("ex0000000000", &children), None);
        assert!(!kind.acquirable(&children));
        assert!(kind.acquirable(&[]));
        assert_eq!(kind.owner(&children), Some("ex0000000000"));
    }

    #[test]
    fn shared_policy() {
        let kind = LockKind::Shared;
        let children: Vec<String> = vec![
            "sh0000000000".into(),
            "sh0000000001".into(),
            "ex0000000002".into(),
            "sh0000000003".into(),
        ];
        // readers ahead of the writer hold together
        assert!(kind.held("sh0000000000", &children));
        assert!(kind.held("sh0000000001", &children));
        // a reader behind the writer waits on that writer specifically
        assert!(!kind.held("sh0000000003", &children));
        assert_eq!(kind.blocker("sh0000000003", &children), Some("ex0000000002"));
        assert_eq!(kind.blocker("sh0000000001", &children), None);
        assert!(!kind.acquirable(&children));
        assert!(kind.acquirable(&["sh0000000000".to_string()]));
        assert_eq!(kind.owner(&children), Some("ex0000000002"));
        assert_eq!(
            kind.owner(&["sh0000000000".to_string()]),
            Some("sh0000000000")
        );
    }

    #[tokio::test]
    async fn exclusive_contention_is_fifo() {
        let cluster = MemoryCluster::new();
        let mut a = builder(&cluster).logger(term_logger()).exclusive("foo").unwrap();
        let mut b = builder(&cluster).logger(term_logger()).exclusive("foo").unwrap();

        assert!(a.lock(false).await.unwrap());
        assert_eq!(a.lock_path(), Some("/_zklocking/foo/ex0000000000"));

        let mut handle = b.handle();
        let queued = tokio::spawn(async move {
            b.lock(true).await.unwrap();
            b
        });
        handle
            .wait_until_blocked(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(handle.waiting());
        assert!(!handle.locked());

        assert!(a.unlock().await.unwrap());
        assert!(!a.locked());

        let b = queued.await.unwrap();
        assert!(b.locked());
        assert_eq!(b.lock_path(), Some("/_zklocking/foo/ex0000000001"));
    }

    #[tokio::test]
    async fn nonblocking_contended_leaves_nothing_behind() {
        let cluster = MemoryCluster::new();
        let external = cluster.client();
        let mut a = builder(&cluster).exclusive("foo").unwrap();
        let mut b = builder(&cluster).exclusive("foo").unwrap();

        assert!(a.lock(false).await.unwrap());
        assert!(!b.lock(false).await.unwrap());
        assert_eq!(b.lock_path(), None);
        assert!(!b.locked());

        // only the holder's node remains queued
        let children = external
            .get_children("/_zklocking/foo")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(children, vec!["ex0000000000".to_string()]);
    }

    #[tokio::test]
    async fn lock_is_reentrant_within_one_instance() {
        let cluster = MemoryCluster::new();
        let mut a = builder(&cluster).exclusive("foo").unwrap();
        assert!(a.lock(false).await.unwrap());
        let path = a.lock_path().map(String::from);
        assert!(a.lock(true).await.unwrap());
        // no second queue node was created
        assert_eq!(a.lock_path().map(String::from), path);
    }

    #[tokio::test]
    async fn unlock_removes_node_and_is_idempotent() {
        let cluster = MemoryCluster::new();
        let external = cluster.client();
        let mut a = builder(&cluster).exclusive("foo").unwrap();
        assert!(a.lock(false).await.unwrap());

        assert!(a.unlock().await.unwrap());
        assert!(!a.locked());
        // neither our node nor the (empty) parent survive
        assert_eq!(external.exists("/_zklocking/foo").await.unwrap(), None);

        // second unlock: no effect, reports false
        assert!(!a.unlock().await.unwrap());
    }

    #[tokio::test]
    async fn unlock_after_session_loss_clears_state() {
        let cluster = MemoryCluster::new();
        let client = Arc::new(cluster.client());
        let mut a = LockerBuilder::new(Arc::clone(&client))
            .exclusive("foo")
            .unwrap();
        assert!(a.lock(false).await.unwrap());

        client.expire();
        // cleanup on a dead session cannot confirm ownership, but must not
        // fail either
        assert!(!a.unlock().await.unwrap());
        assert!(!a.locked());
        assert_eq!(a.lock_path(), None);
    }

    #[tokio::test]
    async fn recreated_parent_is_left_alone_on_unlock() {
        let cluster = MemoryCluster::new();
        let external = cluster.client();
        let mut a = builder(&cluster).exclusive("foo").unwrap();
        assert!(a.lock(false).await.unwrap());

        // externally wipe the parent and rebuild it with an unrelated child
        external
            .delete("/_zklocking/foo/ex0000000000")
            .await
            .unwrap()
            .unwrap();
        external.delete("/_zklocking/foo").await.unwrap().unwrap();
        external.mkdir_p("/_zklocking/foo").await.unwrap();
        external
            .create(
                "/_zklocking/foo/ex0000000000",
                b"not yours",
                CreateMode::Persistent,
            )
            .await
            .unwrap()
            .unwrap();

        assert!(!a.unlock().await.unwrap());
        // the foreign child is untouched
        let (data, _) = external
            .get_data("/_zklocking/foo/ex0000000000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, b"not yours");
    }

    #[tokio::test]
    async fn shared_reader_convoy() {
        let cluster = MemoryCluster::new();
        let mut r1 = builder(&cluster).shared("bar").unwrap();
        let mut r2 = builder(&cluster).shared("bar").unwrap();
        let mut w = builder(&cluster).exclusive("bar").unwrap();

        // readers behind readers acquire immediately
        assert!(r1.lock(false).await.unwrap());
        assert!(r2.lock(false).await.unwrap());

        let mut w_handle = w.handle();
        let writer = tokio::spawn(async move {
            w.lock(true).await.unwrap();
            w
        });
        w_handle
            .wait_until_blocked(Duration::from_secs(1))
            .await
            .unwrap();

        // one reader releasing does not promote the writer
        assert!(r1.unlock().await.unwrap());
        assert!(w_handle.waiting());
        assert!(!w_handle.locked());

        assert!(r2.unlock().await.unwrap());
        let mut w = writer.await.unwrap();
        assert!(w.locked());

        // and a reader behind an exclusive holder blocks
        let mut r3 = builder(&cluster).shared("bar").unwrap();
        assert!(!r3.lock(false).await.unwrap());
        let mut r3_handle = r3.handle();
        let reader = tokio::spawn(async move {
            r3.lock(true).await.unwrap();
            r3
        });
        r3_handle
            .wait_until_blocked(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(w.unlock().await.unwrap());
        let r3 = reader.await.unwrap();
        assert!(r3.locked());
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let cluster = MemoryCluster::new();
        let mut a = builder(&cluster).exclusive("foo").unwrap();

        let out: Result<(), &str> = a.with_lock(|| async { Err("boom") }).await.unwrap();
        assert_eq!(out, Err("boom"));
        assert!(!a.locked());

        // the lock is free again
        let mut b = builder(&cluster).exclusive("foo").unwrap();
        assert!(b.lock(false).await.unwrap());
    }

    #[tokio::test]
    async fn acquirable_reflects_contention() {
        let cluster = MemoryCluster::new();
        let mut holder = builder(&cluster).exclusive("foo").unwrap();
        let probe_ex = builder(&cluster).exclusive("foo").unwrap();
        let probe_sh = builder(&cluster).shared("foo").unwrap();

        // parent does not even exist yet
        assert!(probe_ex.acquirable().await.unwrap());

        assert!(holder.lock(false).await.unwrap());
        assert!(!probe_ex.acquirable().await.unwrap());
        assert!(!probe_sh.acquirable().await.unwrap());
        // the holder itself reports true without a round-trip
        assert!(holder.acquirable().await.unwrap());

        assert!(holder.unlock().await.unwrap());
        let mut reader = builder(&cluster).shared("foo").unwrap();
        assert!(reader.lock(false).await.unwrap());
        // shared holders don't exclude other readers, only writers
        assert!(probe_sh.acquirable().await.unwrap());
        assert!(!probe_ex.acquirable().await.unwrap());
        reader.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn owner_data_reads_the_holder() {
        let cluster = MemoryCluster::new();
        let mut writer = builder(&cluster).data(&b"writer-1"[..]).exclusive("baz").unwrap();
        let probe = builder(&cluster).shared("baz").unwrap();

        assert_eq!(probe.owner_data().await.unwrap(), None);
        assert!(writer.lock(false).await.unwrap());
        assert_eq!(
            probe.owner_data().await.unwrap(),
            Some(b"writer-1".to_vec())
        );
        writer.unlock().await.unwrap();

        let mut reader = builder(&cluster).data(&b"reader-1"[..]).shared("baz").unwrap();
        assert!(reader.lock(false).await.unwrap());
        // no writer queued: any shared holder's data is reported
        assert_eq!(
            probe.owner_data().await.unwrap(),
            Some(b"reader-1".to_vec())
        );
        reader.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn assert_held_catches_session_loss() {
        let cluster = MemoryCluster::new();
        let client = Arc::new(cluster.client());
        let mut a = LockerBuilder::new(Arc::clone(&client))
            .exclusive("foo")
            .unwrap();
        assert!(a.lock(false).await.unwrap());
        a.assert_held().await.unwrap();

        client.expire();
        match a.assert_held().await {
            Err(Error::LockAssertionFailed { .. }) => (),
            other => panic!("expected assertion failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn assert_held_catches_recreated_parent() {
        let cluster = MemoryCluster::new();
        let external = cluster.client();
        let mut a = builder(&cluster).exclusive("foo").unwrap();
        assert!(a.lock(false).await.unwrap());

        // a bogus writer rebuilds the parent and takes our node name
        external
            .delete("/_zklocking/foo/ex0000000000")
            .await
            .unwrap()
            .unwrap();
        external.delete("/_zklocking/foo").await.unwrap().unwrap();
        external.mkdir_p("/_zklocking/foo").await.unwrap();
        external
            .create("/_zklocking/foo/ex0000000000", b"", CreateMode::Persistent)
            .await
            .unwrap()
            .unwrap();

        match a.assert_held().await {
            Err(Error::LockAssertionFailed { reason }) => {
                assert!(reason.contains("parent"), "unexpected reason: {}", reason)
            }
            other => panic!("expected assertion failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn interrupted_blocking_lock_leaves_node_to_session_death() {
        let cluster = MemoryCluster::new();
        let external = cluster.client();
        let mut a = builder(&cluster).exclusive("foo").unwrap();
        assert!(a.lock(false).await.unwrap());

        let b_client = Arc::new(cluster.client());
        let mut b = LockerBuilder::new(Arc::clone(&b_client))
            .exclusive("foo")
            .unwrap();
        let mut handle = b.handle();
        let queued = tokio::spawn(async move { b.lock(true).await });
        handle
            .wait_until_blocked(Duration::from_secs(1))
            .await
            .unwrap();

        b_client.expire();
        match queued.await.unwrap() {
            Err(Error::InterruptedSession) => (),
            other => panic!("expected interrupted session, got {:?}", other),
        }
        // the dead session's queue node was reclaimed by the server
        let children = external
            .get_children("/_zklocking/foo")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(children, vec!["ex0000000000".to_string()]);
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let cluster = MemoryCluster::new();
        match builder(&cluster).exclusive("") {
            Err(Error::BadArguments { .. }) => (),
            other => panic!("expected bad arguments, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn slashes_in_names_are_escaped() {
        let cluster = MemoryCluster::new();
        let external = cluster.client();
        let mut a = builder(&cluster).exclusive("svc/primary").unwrap();
        assert!(a.lock(false).await.unwrap());
        assert!(external
            .exists("/_zklocking/svc__primary")
            .await
            .unwrap()
            .is_some());
        a.unlock().await.unwrap();
    }
}
