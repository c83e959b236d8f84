use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use slog::{debug, error};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::{WatchedEventType, ZkClient};
use crate::Error;

/// Callbacks fire on every transition; they run on the blocking thread
/// pool, sequenced by the watch task.
type Callbacks = Arc<Mutex<Vec<Box<dyn Fn() + Send>>>>;

/// A read-only watcher of a named leader election.
///
/// An observer never votes. It tracks whether an acked leader exists through
/// the election's `leader_ack` node and surfaces the transitions:
/// `on_new_leader` when an ack appears (the winner has finished its winning
/// callbacks), `on_leaders_death` when it disappears. The two strictly
/// alternate; watch-level duplicates are suppressed by gating on the known
/// liveness state.
///
/// Callbacks run on the blocking thread pool and may block. They must not
/// call `&mut self` methods of their own observer.
pub struct Observer<C> {
    client: Arc<C>,
    leader_ack_path: String,
    logger: slog::Logger,
    on_new_leader: Callbacks,
    on_leaders_death: Callbacks,
    alive: Arc<watch::Sender<Option<bool>>>,
    alive_rx: watch::Receiver<Option<bool>>,
    leader_data: Arc<Mutex<Option<Vec<u8>>>>,
    task: Option<JoinHandle<()>>,
}

impl<C> std::fmt::Debug for Observer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("leader_ack_path", &self.leader_ack_path)
            .field("leader_alive", &*self.alive_rx.borrow())
            .finish()
    }
}

impl<C> Drop for Observer<C> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<C: ZkClient> Observer<C> {
    pub(crate) fn new(client: Arc<C>, leader_ack_path: String, logger: slog::Logger) -> Self {
        let (alive, alive_rx) = watch::channel(None);
        let logger = logger.new(slog::o!("observing" => leader_ack_path.clone()));
        Observer {
            client,
            leader_ack_path,
            logger,
            on_new_leader: Arc::new(Mutex::new(Vec::new())),
            on_leaders_death: Arc::new(Mutex::new(Vec::new())),
            alive: Arc::new(alive),
            alive_rx,
            leader_data: Arc::new(Mutex::new(None)),
            task: None,
        }
    }

    /// `None` until the first observation, then whether an acked leader
    /// currently exists.
    pub fn leader_alive(&self) -> Option<bool> {
        *self.alive_rx.borrow()
    }

    /// A channel of liveness transitions, for waiting on election changes
    /// without borrowing the observer.
    pub fn alive_updates(&self) -> watch::Receiver<Option<bool>> {
        self.alive_rx.clone()
    }

    /// The data the current leader published in its `leader_ack`, re-read on
    /// every new-leader transition.
    pub fn leader_data(&self) -> Option<Vec<u8>> {
        lock(&self.leader_data).clone()
    }

    /// Run `f` whenever an acked leader appears. Register before
    /// [`observe`](Observer::observe).
    pub fn on_new_leader<F>(&self, f: F)
    where
        F: Fn() + Send + 'static,
    {
        lock(&self.on_new_leader).push(Box::new(f));
    }

    /// Run `f` whenever the acked leader goes away (including at startup,
    /// when no leader exists yet). Register before
    /// [`observe`](Observer::observe).
    pub fn on_leaders_death<F>(&self, f: F)
    where
        F: Fn() + Send + 'static,
    {
        lock(&self.on_leaders_death).push(Box::new(f));
    }

    /// Start watching the election in the background.
    pub async fn observe(&mut self) -> Result<(), Error> {
        if self.task.is_some() {
            return Err(Error::bad_arguments("observer is already observing"));
        }
        let watch_loop = WatchLoop {
            client: Arc::clone(&self.client),
            leader_ack_path: self.leader_ack_path.clone(),
            on_new_leader: Arc::clone(&self.on_new_leader),
            on_leaders_death: Arc::clone(&self.on_leaders_death),
            alive: Arc::clone(&self.alive),
            leader_data: Arc::clone(&self.leader_data),
            logger: self.logger.clone(),
        };
        self.task = Some(tokio::spawn(watch_loop.run()));
        Ok(())
    }

    /// Stop watching. No further callbacks fire; the last observed state
    /// remains readable.
    pub async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        debug!(self.logger, "observer closed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct WatchLoop<C> {
    client: Arc<C>,
    leader_ack_path: String,
    on_new_leader: Callbacks,
    on_leaders_death: Callbacks,
    alive: Arc<watch::Sender<Option<bool>>>,
    leader_data: Arc<Mutex<Option<Vec<u8>>>>,
    logger: slog::Logger,
}

impl<C: ZkClient> WatchLoop<C> {
    async fn run(self) {
        match self.watch().await {
            Ok(()) | Err(Error::InterruptedSession) => {
                debug!(self.logger, "observation ended");
            }
            Err(e) => {
                error!(self.logger, "observation failed: {}", e);
            }
        }
    }

    async fn watch(&self) -> Result<(), Error> {
        let mut session = self.client.session();
        loop {
            if !session.borrow_and_update().is_alive() {
                return Err(Error::InterruptedSession);
            }
            let (stat, mut event) = self.client.watch_exists(&self.leader_ack_path).await?;
            if stat.is_some() {
                self.leader_appeared().await?;
            } else {
                self.leader_died().await;
            }
            tokio::select! {
                ev = &mut event => {
                    // A deleted ack that is instantly replaced must still
                    // read as one death and one new leader, so transitions
                    // are driven by the event as well as the re-check above.
                    match ev.map(|e| e.event_type) {
                        Ok(WatchedEventType::NodeDeleted) => self.leader_died().await,
                        Ok(WatchedEventType::NodeCreated)
                        | Ok(WatchedEventType::NodeDataChanged) => self.leader_appeared().await?,
                        _ => {}
                    }
                }
                changed = session.changed() => {
                    if changed.is_err() || !session.borrow_and_update().is_alive() {
                        return Err(Error::InterruptedSession);
                    }
                }
            }
        }
    }

    async fn leader_appeared(&self) -> Result<(), Error> {
        if *self.alive.borrow() == Some(true) {
            return Ok(());
        }
        let data = self
            .client
            .get_data(&self.leader_ack_path)
            .await?
            .map(|(data, _)| data);
        *lock(&self.leader_data) = data;
        debug!(self.logger, "leader acked");
        fire(&self.on_new_leader, &self.logger, "new-leader").await;
        self.alive.send_replace(Some(true));
        Ok(())
    }

    async fn leader_died(&self) {
        if *self.alive.borrow() == Some(false) {
            return;
        }
        debug!(self.logger, "no acked leader");
        fire(&self.on_leaders_death, &self.logger, "leader-death").await;
        self.alive.send_replace(Some(false));
    }
}

/// Run a callback batch on the blocking pool, in registration order. A
/// panicking callback is logged and does not stop the batch.
async fn fire(set: &Callbacks, logger: &slog::Logger, stage: &'static str) {
    let set = Arc::clone(set);
    let batch_logger = logger.clone();
    let ran = tokio::task::spawn_blocking(move || {
        for callback in lock(&set).iter() {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                error!(batch_logger, "user callback panicked"; "stage" => stage);
            }
        }
    })
    .await;
    if ran.is_err() {
        error!(logger, "callback batch was cancelled"; "stage" => stage);
    }
}
