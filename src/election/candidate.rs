use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use failure::format_err;
use slog::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::{CreateMode, ZkClient};
use crate::error;
use crate::locker::create_queue_node;
use crate::paths;
use crate::Error;

/// Callbacks fire at most once and may block; they run on the blocking
/// thread pool, sequenced by the resolution task.
type Callbacks = Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>;

/// Where a [`Candidate`] currently stands in its election.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidatePhase {
    /// No vote has been cast (or the candidate was closed).
    Idle,
    /// The vote is in and no outcome has been observed yet.
    Waiting,
    /// This candidate won and its `leader_ack` is published.
    Leading,
    /// The sitting leader acked; this candidate's losing callbacks have
    /// fired. It remains queued and may still be promoted later.
    Lost,
    /// The session died before the election resolved.
    Interrupted,
}

/// A voting participant in a named leader election.
///
/// Register callbacks, then [`vote`](Candidate::vote). Whichever candidate's
/// vote node sorts first runs its `on_winning_election` callbacks and then
/// publishes the election's `leader_ack` node; every other candidate runs
/// its `on_losing_election` callbacks only once that ack exists. A loser
/// stays in the queue: if the leader's session ends, the next vote in line
/// is promoted and runs the winner sequence in turn.
///
/// Callbacks run on the blocking thread pool and may block. They must not
/// call `&mut self` methods of their own candidate.
pub struct Candidate<C> {
    client: Arc<C>,
    name: String,
    data: Vec<u8>,
    parent_path: String,
    leader_ack_path: String,
    logger: slog::Logger,
    vote_path: Option<String>,
    on_win: Callbacks,
    on_lose: Callbacks,
    phase: Arc<watch::Sender<CandidatePhase>>,
    phase_rx: watch::Receiver<CandidatePhase>,
    task: Option<JoinHandle<()>>,
}

impl<C> std::fmt::Debug for Candidate<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("name", &self.name)
            .field("vote_path", &self.vote_path)
            .field("phase", &*self.phase_rx.borrow())
            .finish()
    }
}

impl<C> Drop for Candidate<C> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<C: ZkClient> Candidate<C> {
    pub(crate) fn new(
        client: Arc<C>,
        name: String,
        parent_path: String,
        leader_ack_path: String,
        data: Vec<u8>,
        logger: slog::Logger,
    ) -> Self {
        let (phase, phase_rx) = watch::channel(CandidatePhase::Idle);
        let logger = logger.new(slog::o!("election" => parent_path.clone()));
        Candidate {
            client,
            name,
            data,
            parent_path,
            leader_ack_path,
            logger,
            vote_path: None,
            on_win: Arc::new(Mutex::new(Vec::new())),
            on_lose: Arc::new(Mutex::new(Vec::new())),
            phase: Arc::new(phase),
            phase_rx,
            task: None,
        }
    }

    /// The election name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The path of this candidate's vote node, while one exists.
    pub fn vote_path(&self) -> Option<&str> {
        self.vote_path.as_deref()
    }

    /// This candidate's current phase.
    pub fn phase(&self) -> CandidatePhase {
        *self.phase_rx.borrow()
    }

    /// A channel of phase transitions, for waiting on an outcome without
    /// borrowing the candidate.
    pub fn phase_updates(&self) -> watch::Receiver<CandidatePhase> {
        self.phase_rx.clone()
    }

    /// Run `f` if this candidate wins the election, after which the
    /// `leader_ack` is published. Register before [`vote`](Candidate::vote).
    pub fn on_winning_election<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        push(&self.on_win, f);
    }

    /// Run `f` once a different candidate has won *and* published its
    /// `leader_ack`. Register before [`vote`](Candidate::vote).
    pub fn on_losing_election<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        push(&self.on_lose, f);
    }

    /// Cast this candidate's vote and start resolving the election in the
    /// background. Resolution drives the callbacks; the caller can follow
    /// along through [`phase_updates`](Candidate::phase_updates).
    pub async fn vote(&mut self) -> Result<(), Error> {
        if self.vote_path.is_some() {
            return Err(Error::bad_arguments("candidate has already voted"));
        }
        let (path, _) = create_queue_node(
            &*self.client,
            &self.parent_path,
            paths::EXCLUSIVE_PREFIX,
            &self.data,
        )
        .await?;
        debug!(self.logger, "vote cast"; "node" => paths::basename(&path));
        let resolve = ResolveLoop {
            client: Arc::clone(&self.client),
            parent_path: self.parent_path.clone(),
            leader_ack_path: self.leader_ack_path.clone(),
            ours: paths::basename(&path).to_string(),
            data: self.data.clone(),
            on_win: Arc::clone(&self.on_win),
            on_lose: Arc::clone(&self.on_lose),
            phase: Arc::clone(&self.phase),
            logger: self.logger.clone(),
        };
        self.vote_path = Some(path);
        self.phase.send_replace(CandidatePhase::Waiting);
        self.task = Some(tokio::spawn(resolve.run()));
        Ok(())
    }

    /// Is this candidate's vote currently first in sequence order?
    pub async fn leader(&self) -> Result<bool, Error> {
        let ours = match self.vote_path.as_deref() {
            Some(p) => paths::basename(p),
            None => return Ok(false),
        };
        match self.client.get_children(&self.parent_path).await? {
            None => Ok(false),
            Some(children) => {
                let ordered = paths::sequence_ordered(children);
                Ok(ordered.first().map(String::as_str) == Some(ours))
            }
        }
    }

    /// Does the election's `leader_ack` node currently exist?
    pub async fn leader_acked(&self) -> Result<bool, Error> {
        Ok(self.client.exists(&self.leader_ack_path).await?.is_some())
    }

    /// Withdraw from the election: stop resolution, remove the vote node
    /// and, if this candidate published the `leader_ack`, that too. No
    /// further callbacks fire. The candidate may vote again afterwards.
    pub async fn close(&mut self) -> Result<(), Error> {
        if let Some(task) = self.task.take() {
            task.abort();
            // wait for the abort to land before trusting the phase below
            let _ = task.await;
        }
        // Resolution may have been stopped after publishing the ack but
        // before recording Leading, so a non-Leading phase is confirmed
        // against the server before the ack is left behind.
        let phase = *self.phase_rx.borrow();
        let owns_ack = match phase {
            CandidatePhase::Leading => true,
            _ => self.published_ack().await?,
        };
        if let Some(path) = self.vote_path.take() {
            best_effort_delete(&*self.client, &path).await?;
        }
        if owns_ack {
            best_effort_delete(&*self.client, &self.leader_ack_path).await?;
        }
        self.phase.send_replace(CandidatePhase::Idle);
        debug!(self.logger, "candidate closed");
        Ok(())
    }

    /// Does the extant `leader_ack` belong to this candidate? The ack is
    /// always the first vote's; it is ours iff one exists and our vote is
    /// (still) first in line. A dead session reports `false`, since its
    /// ephemeral ack is already on the way out.
    async fn published_ack(&self) -> Result<bool, Error> {
        match self.leader_acked().await {
            Ok(true) => (),
            Ok(false) | Err(Error::InterruptedSession) => return Ok(false),
            Err(e) => return Err(e),
        }
        match self.leader().await {
            Ok(first) => Ok(first),
            Err(Error::InterruptedSession) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn push<F: FnOnce() + Send + 'static>(set: &Callbacks, f: F) {
    let mut set = match set.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    set.push(Box::new(f));
}

async fn best_effort_delete<C: ZkClient>(client: &C, path: &str) -> Result<(), Error> {
    match client.delete(path).await {
        // the node dies with the session anyway
        Ok(_) | Err(Error::InterruptedSession) => Ok(()),
        Err(e) => Err(e),
    }
}

struct ResolveLoop<C> {
    client: Arc<C>,
    parent_path: String,
    leader_ack_path: String,
    ours: String,
    data: Vec<u8>,
    on_win: Callbacks,
    on_lose: Callbacks,
    phase: Arc<watch::Sender<CandidatePhase>>,
    logger: slog::Logger,
}

impl<C: ZkClient> ResolveLoop<C> {
    async fn run(self) {
        match self.resolve().await {
            Ok(()) => (),
            Err(Error::InterruptedSession) => {
                debug!(self.logger, "election resolution interrupted by session loss");
                self.phase.send_replace(CandidatePhase::Interrupted);
            }
            Err(e) => {
                error!(self.logger, "election resolution failed: {}", e);
                self.phase.send_replace(CandidatePhase::Interrupted);
            }
        }
    }

    async fn resolve(&self) -> Result<(), Error> {
        let mut session = self.client.session();
        let mut lost_fired = false;
        loop {
            if !session.borrow_and_update().is_alive() {
                return Err(Error::InterruptedSession);
            }
            let children = match self.client.get_children(&self.parent_path).await? {
                Some(c) => paths::sequence_ordered(c),
                None => {
                    return Err(Error::Client(format_err!(
                        "election parent {} disappeared",
                        self.parent_path
                    )))
                }
            };
            let pos = match children.iter().position(|c| *c == self.ours) {
                Some(p) => p,
                None => {
                    return Err(Error::Client(format_err!(
                        "vote node {} vanished from {}",
                        self.ours,
                        self.parent_path
                    )))
                }
            };

            if pos == 0 {
                return self.become_leader().await;
            }

            // We are queued. The sitting leader's ack resolves us as a
            // loser; the death of the candidate directly ahead re-opens the
            // race for us.
            let (ack, mut ack_event) = self.client.watch_exists(&self.leader_ack_path).await?;
            if ack.is_some() && !lost_fired {
                info!(self.logger, "lost election"; "vote" => &self.ours);
                fire_once(&self.on_lose, &self.logger, "losing").await;
                lost_fired = true;
                self.phase.send_replace(CandidatePhase::Lost);
            }
            let predecessor = paths::join(&self.parent_path, &children[pos - 1]);
            let (pred, mut pred_event) = self.client.watch_exists(&predecessor).await?;
            if pred.is_none() {
                // died between reads; re-evaluate immediately
                continue;
            }
            tokio::select! {
                _ = &mut ack_event => {}
                _ = &mut pred_event => {}
                changed = session.changed() => {
                    if changed.is_err() || !session.borrow_and_update().is_alive() {
                        return Err(Error::InterruptedSession);
                    }
                }
            }
        }
    }

    async fn become_leader(&self) -> Result<(), Error> {
        info!(self.logger, "won election"; "vote" => &self.ours);
        fire_once(&self.on_win, &self.logger, "winning").await;
        // Losers are gated on the ack, so it must appear even if a winning
        // callback panicked above.
        match self
            .client
            .create(&self.leader_ack_path, &self.data, CreateMode::Ephemeral)
            .await?
        {
            Ok(_) => (),
            Err(error::Create::NodeExists) => {
                warn!(self.logger, "leader ack already present"; "path" => &self.leader_ack_path);
            }
            Err(error::Create::NoNode) => {
                return Err(Error::Client(format_err!(
                    "election parent {} disappeared before ack",
                    self.parent_path
                )))
            }
        }
        self.phase.send_replace(CandidatePhase::Leading);
        Ok(())
    }
}

/// Drain and run a callback batch on the blocking pool, in registration
/// order. A panicking callback is logged and does not stop the batch.
async fn fire_once(set: &Callbacks, logger: &slog::Logger, stage: &'static str) {
    let callbacks: Vec<Box<dyn FnOnce() + Send>> = {
        let mut guard = match set.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.drain(..).collect()
    };
    if callbacks.is_empty() {
        return;
    }
    let batch_logger = logger.clone();
    let ran = tokio::task::spawn_blocking(move || {
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!(batch_logger, "user callback panicked"; "stage" => stage);
            }
        }
    })
    .await;
    if ran.is_err() {
        error!(logger, "callback batch was cancelled"; "stage" => stage);
    }
}
