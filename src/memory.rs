//! An in-process coordination service for tests and local development.
//!
//! [`MemoryCluster`] holds a node tree shared by any number of sessions;
//! [`MemoryCluster::client`] hands out a [`MemoryClient`] backed by a fresh
//! session. The implementation is deterministic: creation stamps come from a
//! logical transaction counter rather than wall clock, and watch delivery
//! happens synchronously with the mutation that triggers it.
//!
//! Sessions can be killed with [`MemoryClient::expire`] (server-side expiry)
//! or [`MemoryClient::close`] (local close). Both reclaim the session's
//! ephemeral nodes, fire the affected watches, and flip the session channel,
//! which is how crash scenarios are exercised in this crate's tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::oneshot;
use tokio::sync::watch;

use crate::client::{CreateMode, SessionState, Stat, WatchedEvent, WatchedEventType, ZkClient};
use crate::error;
use crate::Error;

#[derive(Debug)]
struct NodeRec {
    data: Vec<u8>,
    ephemeral_owner: Option<u64>,
    czxid: i64,
    version: i32,
    // Counter for sequential children; dies with the node, so a recreated
    // parent restarts its children at 0.
    next_seq: u64,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: HashMap<String, NodeRec>,
    watches: HashMap<String, Vec<oneshot::Sender<WatchedEvent>>>,
    next_zxid: i64,
}

impl Tree {
    fn bump(&mut self) -> i64 {
        self.next_zxid += 1;
        self.next_zxid
    }

    fn stat_of(&self, path: &str) -> Option<Stat> {
        let rec = self.nodes.get(path)?;
        Some(Stat {
            czxid: rec.czxid,
            // The logical clock doubles as the creation timestamp; the
            // recipes only ever compare ctimes for identity.
            ctime: rec.czxid,
            version: rec.version,
            ephemeral_owner: rec.ephemeral_owner.map(|s| s as i64).unwrap_or(0),
            num_children: self.children_of(path).count() as i32,
        })
    }

    fn children_of<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.nodes
            .keys()
            .filter(move |k| parent_of(k) == Some(path))
            .map(|k| basename_of(k))
    }

    fn notify(&mut self, path: &str, event_type: WatchedEventType) {
        if let Some(senders) = self.watches.remove(path) {
            for tx in senders {
                let _ = tx.send(WatchedEvent {
                    event_type,
                    path: path.to_string(),
                });
            }
        }
    }

    fn remove(&mut self, path: &str) {
        self.nodes.remove(path);
        self.notify(path, WatchedEventType::NodeDeleted);
    }
}

fn parent_of(path: &str) -> Option<&str> {
    let i = path.rfind('/')?;
    if i == 0 {
        if path.len() > 1 {
            Some("/")
        } else {
            None
        }
    } else {
        Some(&path[..i])
    }
}

fn basename_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// A shared in-memory node tree that hands out sessions.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    tree: Arc<Mutex<Tree>>,
    next_session: Arc<AtomicU64>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// An empty tree containing only the root node.
    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.nodes.insert(
            "/".to_string(),
            NodeRec {
                data: Vec::new(),
                ephemeral_owner: None,
                czxid: 0,
                version: 0,
                next_seq: 0,
            },
        );
        MemoryCluster {
            tree: Arc::new(Mutex::new(tree)),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a new session against this cluster.
    pub fn client(&self) -> MemoryClient {
        let (state, state_rx) = watch::channel(SessionState::Connected);
        MemoryClient {
            tree: Arc::clone(&self.tree),
            session_id: self.next_session.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(state),
            state_rx,
        }
    }
}

/// One session against a [`MemoryCluster`].
pub struct MemoryClient {
    tree: Arc<Mutex<Tree>>,
    session_id: u64,
    state: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
}

impl std::fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryClient")
            .field("session_id", &self.session_id)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl MemoryClient {
    /// The server-assigned session ID.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Expire this session server-side: its ephemeral nodes are removed (the
    /// affected watches fire) and the session channel reports
    /// [`SessionState::Expired`].
    pub fn expire(&self) {
        self.terminate(SessionState::Expired);
    }

    /// Close the client locally. Same cleanup as [`expire`](Self::expire),
    /// but the session channel reports [`SessionState::Closed`].
    pub fn close(&self) {
        self.terminate(SessionState::Closed);
    }

    fn terminate(&self, state: SessionState) {
        let mut tree = self.lock_tree();
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, rec)| rec.ephemeral_owner == Some(self.session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            tree.remove(&path);
        }
        drop(tree);
        self.state.send_replace(state);
    }

    fn lock_tree(&self) -> MutexGuard<'_, Tree> {
        match self.tree.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn alive_tree(&self) -> Result<MutexGuard<'_, Tree>, Error> {
        if !self.state_rx.borrow().is_alive() {
            return Err(Error::InterruptedSession);
        }
        Ok(self.lock_tree())
    }
}

#[async_trait]
impl ZkClient for MemoryClient {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<Result<String, error::Create>, Error> {
        let mut tree = self.alive_tree()?;
        let parent = match parent_of(path) {
            Some(p) => p.to_string(),
            None => {
                return Err(Error::Client(failure::format_err!(
                    "cannot create node at {:?}: not an absolute path",
                    path
                )))
            }
        };
        let actual = match tree.nodes.get_mut(&parent) {
            None => return Ok(Err(error::Create::NoNode)),
            Some(parent_rec) if mode.is_sequential() => {
                let seq = parent_rec.next_seq;
                parent_rec.next_seq += 1;
                format!("{}{:010}", path, seq)
            }
            Some(_) => path.to_string(),
        };
        if tree.nodes.contains_key(&actual) {
            return Ok(Err(error::Create::NodeExists));
        }
        let zxid = tree.bump();
        tree.nodes.insert(
            actual.clone(),
            NodeRec {
                data: data.to_vec(),
                ephemeral_owner: mode.is_ephemeral().then_some(self.session_id),
                czxid: zxid,
                version: 0,
                next_seq: 0,
            },
        );
        tree.notify(&actual, WatchedEventType::NodeCreated);
        Ok(Ok(actual))
    }

    async fn delete(&self, path: &str) -> Result<Result<(), error::Delete>, Error> {
        let mut tree = self.alive_tree()?;
        if !tree.nodes.contains_key(path) {
            return Ok(Err(error::Delete::NoNode));
        }
        if tree.children_of(path).next().is_some() {
            return Ok(Err(error::Delete::NotEmpty));
        }
        tree.remove(path);
        Ok(Ok(()))
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>, Error> {
        let tree = self.alive_tree()?;
        Ok(tree.stat_of(path))
    }

    async fn watch_exists(
        &self,
        path: &str,
    ) -> Result<(Option<Stat>, oneshot::Receiver<WatchedEvent>), Error> {
        let mut tree = self.alive_tree()?;
        let stat = tree.stat_of(path);
        let (tx, rx) = oneshot::channel();
        tree.watches.entry(path.to_string()).or_default().push(tx);
        Ok((stat, rx))
    }

    async fn get_data(&self, path: &str) -> Result<Option<(Vec<u8>, Stat)>, Error> {
        let tree = self.alive_tree()?;
        match tree.stat_of(path) {
            Some(stat) => {
                let data = tree.nodes[path].data.clone();
                Ok(Some((data, stat)))
            }
            None => Ok(None),
        }
    }

    async fn get_children(&self, path: &str) -> Result<Option<Vec<String>>, Error> {
        let tree = self.alive_tree()?;
        if !tree.nodes.contains_key(path) {
            return Ok(None);
        }
        Ok(Some(tree.children_of(path).map(String::from).collect()))
    }

    async fn mkdir_p(&self, path: &str) -> Result<(), Error> {
        if !path.starts_with('/') {
            return Err(Error::Client(failure::format_err!(
                "cannot mkdir {:?}: not an absolute path",
                path
            )));
        }
        let mut tree = self.alive_tree()?;
        let mut at = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            at.push('/');
            at.push_str(component);
            if tree.nodes.contains_key(&at) {
                continue;
            }
            let zxid = tree.bump();
            tree.nodes.insert(
                at.clone(),
                NodeRec {
                    data: Vec::new(),
                    ephemeral_owner: None,
                    czxid: zxid,
                    version: 0,
                    next_seq: 0,
                },
            );
            tree.notify(&at, WatchedEventType::NodeCreated);
        }
        Ok(())
    }

    fn connected(&self) -> bool {
        self.state_rx.borrow().is_alive()
    }

    fn session(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_exists_delete() {
        let cluster = MemoryCluster::new();
        let client = cluster.client();

        assert_eq!(client.exists("/a").await.unwrap(), None);
        let path = client
            .create("/a", b"hi", CreateMode::Persistent)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path, "/a");
        let stat = client.exists("/a").await.unwrap().unwrap();
        assert_eq!(stat.ephemeral_owner, 0);
        let (data, _) = client.get_data("/a").await.unwrap().unwrap();
        assert_eq!(data, b"hi");

        assert_eq!(
            client.create("/a", b"", CreateMode::Persistent).await.unwrap(),
            Err(error::Create::NodeExists)
        );
        assert_eq!(
            client.create("/a/b/c", b"", CreateMode::Persistent).await.unwrap(),
            Err(error::Create::NoNode)
        );

        client
            .create("/a/b", b"", CreateMode::Persistent)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            client.delete("/a").await.unwrap(),
            Err(error::Delete::NotEmpty)
        );
        client.delete("/a/b").await.unwrap().unwrap();
        client.delete("/a").await.unwrap().unwrap();
        assert_eq!(
            client.delete("/a").await.unwrap(),
            Err(error::Delete::NoNode)
        );
    }

    #[tokio::test]
    async fn sequence_numbers_restart_with_parent() {
        let cluster = MemoryCluster::new();
        let client = cluster.client();
        client.mkdir_p("/locks/foo").await.unwrap();

        let first = client
            .create("/locks/foo/ex", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "/locks/foo/ex0000000000");
        let second = client
            .create("/locks/foo/ex", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, "/locks/foo/ex0000000001");

        let t1 = client.exists("/locks/foo").await.unwrap().unwrap().ctime;
        client.delete(&first).await.unwrap().unwrap();
        client.delete(&second).await.unwrap().unwrap();
        client.delete("/locks/foo").await.unwrap().unwrap();
        client.mkdir_p("/locks/foo").await.unwrap();
        let t2 = client.exists("/locks/foo").await.unwrap().unwrap().ctime;
        assert_ne!(t1, t2);

        // recreated parent restarts the sequence
        let again = client
            .create("/locks/foo/ex", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again, "/locks/foo/ex0000000000");
    }

    #[tokio::test]
    async fn watches_fire_on_create_and_delete() {
        let cluster = MemoryCluster::new();
        let client = cluster.client();

        let (stat, rx) = client.watch_exists("/w").await.unwrap();
        assert!(stat.is_none());
        client
            .create("/w", b"", CreateMode::Persistent)
            .await
            .unwrap()
            .unwrap();
        let ev = rx.await.unwrap();
        assert_eq!(ev.event_type, WatchedEventType::NodeCreated);
        assert_eq!(ev.path, "/w");

        let (stat, rx) = client.watch_exists("/w").await.unwrap();
        assert!(stat.is_some());
        client.delete("/w").await.unwrap().unwrap();
        let ev = rx.await.unwrap();
        assert_eq!(ev.event_type, WatchedEventType::NodeDeleted);
    }

    #[tokio::test]
    async fn expiry_reclaims_ephemerals_and_flags_session() {
        let cluster = MemoryCluster::new();
        let a = cluster.client();
        let b = cluster.client();

        a.create("/eph", b"", CreateMode::Ephemeral)
            .await
            .unwrap()
            .unwrap();
        let (stat, rx) = b.watch_exists("/eph").await.unwrap();
        assert!(stat.is_some());

        assert!(a.connected());
        a.expire();
        assert!(!a.connected());
        assert_eq!(*a.session().borrow(), SessionState::Expired);

        // b observes the ephemeral disappear
        let ev = rx.await.unwrap();
        assert_eq!(ev.event_type, WatchedEventType::NodeDeleted);
        assert_eq!(b.exists("/eph").await.unwrap(), None);

        // further operations on the dead session are refused
        match a.exists("/eph").await {
            Err(Error::InterruptedSession) => (),
            other => panic!("expected interrupted session, got {:?}", other),
        }
    }
}
