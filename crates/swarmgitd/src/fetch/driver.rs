//! Lane driver: feeds scheduler batches to pool connections.
//!
//! One task owns all bookkeeping (which peers were tried, struck or refused
//! us); transfers run on their own tasks and hand back their connection and
//! an [`Outcome`]. A job a peer could not supply is never offered to that
//! peer again. A peer that can take nothing from its batch is rotated out of
//! the pool for one discovery has not offered yet, or for an earlier rotated
//! peer once discovery runs dry. The lane gives up on a job only when
//! discovery is exhausted and every peer seen so far failed it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use swarmgit_core::{ManifestObjects, Protocol};
use swarmgit_services::{
    Batch, Discovery, Job, JobScheduler, PeerConnection, PeerId, PeerPool, PoolStatus, Shutdown,
    Transport,
};

use super::{FetchError, FetchSettings, Packet};

/// Delay before a job skipped for an ineligible peer is offered again.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// One kind of transfer: how a batch of jobs is fetched from one peer.
#[async_trait]
pub(crate) trait Lane: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn protocol(&self) -> Protocol;

    async fn transfer(
        &self,
        conn: &PeerConnection,
        jobs: Vec<Job>,
        out: &mpsc::Sender<Packet>,
    ) -> Outcome;
}

/// What became of one batch.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    /// Jobs whose bytes were forwarded in full.
    pub delivered: usize,
    /// Jobs the peer does not have.
    pub missing: Vec<Job>,
    /// Jobs cut short by `failure`.
    pub unfinished: Vec<Job>,
    pub failure: Option<FetchError>,
}

impl Outcome {
    pub fn failed(unfinished: Vec<Job>, error: FetchError) -> Self {
        Self {
            unfinished,
            failure: Some(error),
            ..Self::default()
        }
    }
}

pub(super) struct LaneRun {
    pub lane: Arc<dyn Lane>,
    pub repo_id: String,
    pub objects: ManifestObjects,
    pub settings: FetchSettings,
    pub discovery: Arc<dyn Discovery>,
    pub transport: Arc<dyn Transport>,
    pub out: mpsc::Sender<Packet>,
}

#[derive(Default)]
struct Peers {
    tried: HashSet<PeerId>,
    struck: HashSet<PeerId>,
    refused: HashSet<PeerId>,
}

impl Peers {
    /// True when no peer the pool has produced so far can supply `job`.
    fn exhausted_for(&self, job: &Job, status: PoolStatus) -> bool {
        if status.pending > 0 {
            return false;
        }
        let failed = job.failed_peers.union(&self.struck).count();
        failed >= status.connected
    }

    /// Error for a job no peer can supply.
    fn unavailable(&self, repo_id: &str, job: &Job, status: PoolStatus) -> FetchError {
        if status.connected > 0 && self.refused.len() >= status.connected {
            FetchError::Unauthorized(repo_id.to_string())
        } else {
            FetchError::Unavailable(format!("no reachable peer has {}", job.object_id))
        }
    }

    fn give_up(&self, repo_id: &str, status: PoolStatus, outstanding: usize) -> FetchError {
        if status.connected == 0 {
            FetchError::NoProviders(repo_id.to_string())
        } else if self.refused.len() >= status.connected {
            FetchError::Unauthorized(repo_id.to_string())
        } else {
            FetchError::Unavailable(format!(
                "{outstanding} objects of {repo_id} remain after trying {} peers",
                status.connected
            ))
        }
    }
}

/// True once discovery has nobody new, so no future peer can help.
fn discovery_spent(status: PoolStatus) -> bool {
    status.exhausted
}

impl LaneRun {
    pub async fn drive(self, shutdown: &Shutdown) -> Result<(), FetchError> {
        if self.objects.is_empty() {
            return Ok(());
        }
        let shutdown = shutdown.child();
        let jobs: Vec<Job> = self.objects.iter().map(Job::from).collect();
        let conns = self.settings.max_concurrent_peers.max(1);
        let scheduler = Arc::new(JobScheduler::new(
            jobs,
            conns,
            self.settings.batch_timeout,
            &shutdown,
        ));
        let pool = PeerPool::new(
            &self.repo_id,
            conns,
            self.settings.find_provider_timeout,
            self.discovery.clone(),
            self.transport.clone(),
            &shutdown,
        );
        tracing::debug!(
            lane = self.lane.name(),
            repo = %self.repo_id,
            jobs = self.objects.len(),
            conns,
            "lane started"
        );

        let mut peers = Peers::default();
        let mut inflight: JoinSet<(PeerConnection, Outcome)> = JoinSet::new();
        let mut held: Option<PeerConnection> = None;
        let mut pool_dry = false;

        let result = loop {
            if scheduler.is_complete() {
                break Ok(());
            }
            if pool_dry && inflight.is_empty() {
                break Err(peers.give_up(&self.repo_id, pool.status(), scheduler.outstanding()));
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break Err(FetchError::Cancelled),

                Some(joined) = inflight.join_next() => {
                    let (conn, outcome) = match joined {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::error!(lane = self.lane.name(), error = %e, "transfer task died");
                            break Err(FetchError::Protocol(format!("transfer task died: {e}")));
                        }
                    };
                    if let Err(e) = self.settle(conn, outcome, &mut peers, &pool, &scheduler) {
                        break Err(e);
                    }
                }

                conn = pool.get_conn(), if held.is_none() && !pool_dry && inflight.len() < pool.cap() => {
                    match conn {
                        Some(conn) => held = Some(conn),
                        None => {
                            tracing::debug!(lane = self.lane.name(), repo = %self.repo_id, "pool has no more peers");
                            pool_dry = true;
                        }
                    }
                }

                batch = scheduler.next_batch(), if held.is_some() => {
                    let Some(batch) = batch else { continue };
                    let Some(conn) = held.take() else {
                        scheduler.return_failed(batch);
                        continue;
                    };
                    if let Err(e) = self.assign(conn, batch, &mut peers, &pool, &scheduler, &mut inflight) {
                        break Err(e);
                    }
                }
            }
        };

        if let Some(conn) = held.take() {
            pool.return_conn(conn, false);
        }
        inflight.shutdown().await;
        pool.close().await;
        shutdown.trigger();
        result
    }

    /// Start a transfer of the jobs `conn`'s peer has not failed yet.
    fn assign(
        &self,
        conn: PeerConnection,
        batch: Batch,
        peers: &mut Peers,
        pool: &PeerPool,
        scheduler: &Arc<JobScheduler>,
        inflight: &mut JoinSet<(PeerConnection, Outcome)>,
    ) -> Result<(), FetchError> {
        let peer = conn.peer();
        let (eligible, skipped): (Vec<Job>, Vec<Job>) =
            batch.into_iter().partition(|job| job.eligible_for(&peer));

        if !skipped.is_empty() {
            let status = pool.status();
            if discovery_spent(status) {
                if let Some(job) = skipped.iter().find(|j| peers.exhausted_for(j, status)) {
                    return Err(peers.unavailable(&self.repo_id, job, status));
                }
            }
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                tokio::time::sleep(RETRY_BACKOFF).await;
                scheduler.return_failed(skipped);
            });
        }

        if eligible.is_empty() {
            // nothing here for this peer; make room for one that may help
            pool.replace(conn);
            return Ok(());
        }

        peers.tried.insert(peer);
        tracing::debug!(
            lane = self.lane.name(),
            protocol = %self.lane.protocol(),
            %peer,
            jobs = eligible.len(),
            "batch assigned"
        );
        let lane = self.lane.clone();
        let out = self.out.clone();
        inflight.spawn(async move {
            let outcome = lane.transfer(&conn, eligible, &out).await;
            (conn, outcome)
        });
        Ok(())
    }

    /// Account for a finished transfer and put its leftovers back.
    fn settle(
        &self,
        conn: PeerConnection,
        outcome: Outcome,
        peers: &mut Peers,
        pool: &PeerPool,
        scheduler: &JobScheduler,
    ) -> Result<(), FetchError> {
        let peer = conn.peer();
        scheduler.mark_done(outcome.delivered);

        let mut returned = Vec::with_capacity(outcome.missing.len() + outcome.unfinished.len());
        if !outcome.missing.is_empty() {
            tracing::warn!(
                lane = self.lane.name(),
                %peer,
                missing = outcome.missing.len(),
                "peer lacks requested objects"
            );
        }
        returned.extend(outcome.missing);

        let strike = match outcome.failure {
            None => false,
            Some(FetchError::Cancelled) => {
                pool.return_conn(conn, false);
                return Err(FetchError::Cancelled);
            }
            Some(e) if e.strikes_peer() => {
                tracing::warn!(lane = self.lane.name(), %peer, error = %e, "batch failed");
                if matches!(e, FetchError::Unauthorized(_)) {
                    peers.refused.insert(peer);
                }
                peers.struck.insert(peer);
                returned.extend(outcome.unfinished);
                true
            }
            Some(e) => {
                pool.return_conn(conn, false);
                return Err(e);
            }
        };

        for job in &mut returned {
            job.failed_peers.insert(peer);
        }
        pool.return_conn(conn, strike);

        let status = pool.status();
        if discovery_spent(status) {
            if let Some(job) = returned.iter().find(|j| peers.exhausted_for(j, status)) {
                return Err(peers.unavailable(&self.repo_id, job, status));
            }
        }
        scheduler.return_failed(returned);

        if scheduler.batch_size().is_some()
            && status.pending == 0
            && status.connected > 0
            && peers.tried.len() >= status.connected
        {
            scheduler.uncap_batch_size();
        }
        Ok(())
    }
}
