//! Peer pool: a self-healing set of connections to peers holding a repo.
//!
//! The pool has `cap` slots. Each slot is searching, live (a connection in
//! the ready queue or held by a caller) or dead (discovery came up empty).
//! A background task owns the set of peers already used and services
//! "need a peer" signals by pulling identities from discovery. Returning a
//! connection with a strike frees its slot and sends a new signal, so a
//! failed peer is replaced rather than retried. [`PeerPool::replace`] does
//! the same for a healthy peer that simply lacks what the caller needs; such
//! a peer is kept aside and offered again once discovery has nobody new.
//!
//! Connections ever outstanding never exceed `cap`: a connection only comes
//! from a need signal, and need signals only come from pool creation (`cap`
//! of them) and discarded connections (one each).

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};

use swarmgit_core::Protocol;

use crate::discovery::{ContentKey, Discovery};
use crate::shutdown::Shutdown;
use crate::transport::{BoxStream, PeerId, Transport, TransportError};

/// Handle on one peer for one repo. Streams are opened per exchange.
pub struct PeerConnection {
    peer: PeerId,
    repo_id: String,
    transport: Arc<dyn Transport>,
}

impl PeerConnection {
    pub fn new(peer: PeerId, repo_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            peer,
            repo_id: repo_id.into(),
            transport,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    pub async fn open(&self, protocol: Protocol) -> Result<BoxStream, TransportError> {
        self.transport.open_stream(self.peer, protocol).await
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .field("repo_id", &self.repo_id)
            .finish()
    }
}

/// Snapshot of the pool's slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Distinct peers handed out over the pool's lifetime.
    pub connected: usize,
    /// Discovery has run out of providers we have not seen.
    pub exhausted: bool,
    /// Slots for which discovery found nobody new.
    pub dead: usize,
    /// Need signals not yet resolved.
    pub pending: usize,
}

pub struct PeerPool {
    cap: usize,
    ready_tx: mpsc::Sender<PeerConnection>,
    ready_rx: Mutex<mpsc::Receiver<PeerConnection>>,
    need_tx: mpsc::Sender<Option<PeerId>>,
    pending: Arc<AtomicUsize>,
    status: watch::Receiver<PoolStatus>,
    shutdown: Shutdown,
}

impl PeerPool {
    /// Start a pool of `cap` connections to holders of `repo_id`.
    ///
    /// The pool stops when `shutdown` fires or when it is closed.
    pub fn new(
        repo_id: &str,
        cap: usize,
        find_timeout: Duration,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn Transport>,
        shutdown: &Shutdown,
    ) -> Self {
        let cap = cap.max(1);
        let shutdown = shutdown.child();
        let (ready_tx, ready_rx) = mpsc::channel(cap);
        let (need_tx, need_rx) = mpsc::channel(cap);
        let (status_tx, status) = watch::channel(PoolStatus::default());
        let pending = Arc::new(AtomicUsize::new(cap));

        for _ in 0..cap {
            // fresh channel with capacity `cap`
            let _ = need_tx.try_send(None);
        }

        let replenisher = Replenisher {
            repo_id: repo_id.to_string(),
            key: ContentKey::for_repo(repo_id),
            local: transport.local_peer(),
            discovery,
            transport,
            find_timeout,
            known: HashSet::new(),
            retired: VecDeque::new(),
            feed: None,
            need_rx,
            ready_tx: ready_tx.clone(),
            status_tx,
            pending: pending.clone(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(replenisher.run());

        Self {
            cap,
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
            need_tx,
            pending,
            status,
            shutdown,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            pending: self.pending.load(Ordering::Acquire),
            ..*self.status.borrow()
        }
    }

    /// Wait for a ready connection.
    ///
    /// Returns None once every slot is dead or the pool is cancelled.
    pub async fn get_conn(&self) -> Option<PeerConnection> {
        let mut status = self.status.clone();
        let mut ready = self.ready_rx.lock().await;
        let cap = self.cap;
        tokio::select! {
            biased;
            conn = ready.recv() => conn,
            _ = self.shutdown.cancelled() => None,
            _ = status.wait_for(|s| s.dead >= cap) => ready.try_recv().ok(),
        }
    }

    /// Hand a connection back. With `strike`, it is discarded and replaced.
    pub fn return_conn(&self, conn: PeerConnection, strike: bool) {
        if strike {
            tracing::warn!(peer = %conn.peer, repo = %conn.repo_id, "peer struck, finding replacement");
            self.discard(conn, None);
        } else if self.ready_tx.try_send(conn).is_err() {
            tracing::debug!("pool closed, dropping returned connection");
        }
    }

    /// Give up a connection that did nothing wrong, to make room for a peer
    /// discovery has not offered yet. The peer comes back once discovery has
    /// nobody new.
    pub fn replace(&self, conn: PeerConnection) {
        tracing::debug!(peer = %conn.peer, repo = %conn.repo_id, "rotating peer out");
        let peer = conn.peer;
        self.discard(conn, Some(peer));
    }

    fn discard(&self, conn: PeerConnection, retire: Option<PeerId>) {
        drop(conn);
        self.pending.fetch_add(1, Ordering::AcqRel);
        // at most `cap` signals are ever unresolved
        if self.need_tx.try_send(retire).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Stop background activity and drop every ready connection.
    pub async fn close(&self) {
        self.shutdown.trigger();
        let mut ready = self.ready_rx.lock().await;
        ready.close();
        while ready.try_recv().is_ok() {}
    }
}

impl Drop for PeerPool {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

// ── Background replenishment ─────────────────────────────────────────────────

struct Replenisher {
    repo_id: String,
    key: ContentKey,
    local: PeerId,
    discovery: Arc<dyn Discovery>,
    transport: Arc<dyn Transport>,
    find_timeout: Duration,
    /// Peers already handed out. Owned by this task alone.
    known: HashSet<PeerId>,
    /// Healthy peers rotated out, oldest first.
    retired: VecDeque<PeerId>,
    feed: Option<mpsc::Receiver<PeerId>>,
    need_rx: mpsc::Receiver<Option<PeerId>>,
    ready_tx: mpsc::Sender<PeerConnection>,
    status_tx: watch::Sender<PoolStatus>,
    pending: Arc<AtomicUsize>,
    shutdown: Shutdown,
}

impl Replenisher {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                need = self.need_rx.recv() => match need {
                    Some(retire) => self.retired.extend(retire),
                    None => break,
                },
            }

            let found = match self.next_peer().await {
                Some(peer) => Some(peer),
                None if self.shutdown.is_triggered() => break,
                None => {
                    self.status_tx.send_modify(|s| s.exhausted = true);
                    self.retired.pop_front()
                }
            };

            match found {
                Some(peer) => {
                    let fresh = self.known.insert(peer);
                    let conn = PeerConnection::new(peer, self.repo_id.clone(), self.transport.clone());
                    // connected before pending, so a reader that sees the
                    // search resolved also sees the new peer
                    if fresh {
                        self.status_tx.send_modify(|s| s.connected += 1);
                    }
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    tracing::debug!(repo = %self.repo_id, %peer, fresh, "peer added to pool");
                    if self.ready_tx.send(conn).await.is_err() {
                        break;
                    }
                }
                None => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    self.status_tx.send_modify(|s| s.dead += 1);
                    tracing::warn!(repo = %self.repo_id, "no new provider found, pool slot dead");
                }
            }
        }
        tracing::trace!(repo = %self.repo_id, "pool replenisher exiting");
    }

    /// Next peer that is neither us nor already used.
    ///
    /// An exhausted feed is re-queried once per signal; a second exhaustion
    /// or a timeout means discovery has nothing new.
    async fn next_peer(&mut self) -> Option<PeerId> {
        let mut requeried = false;
        loop {
            let feed = self
                .feed
                .get_or_insert_with(|| self.discovery.find_providers(self.key, 0));
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                r = tokio::time::timeout(self.find_timeout, feed.recv()) => r,
            };
            match next {
                Ok(Some(peer)) if peer == self.local || self.known.contains(&peer) => continue,
                Ok(Some(peer)) => return Some(peer),
                Ok(None) => {
                    self.feed = None;
                    if requeried {
                        return None;
                    }
                    requeried = true;
                }
                Err(_) => {
                    tracing::warn!(
                        repo = %self.repo_id,
                        timeout_secs = self.find_timeout.as_secs(),
                        "provider search timed out"
                    );
                    self.feed = None;
                    return None;
                }
            }
        }
    }
}
