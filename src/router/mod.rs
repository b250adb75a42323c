//! Request routing
//!
//! Writes: resolve each point's shard (creating missing shards through
//! consensus), stamp the request with one version, fan each shard's batch out
//! to its replicas and return once a write quorum acknowledges. A replica that
//! misses its write gets a hint, replayed in the background until it accepts.
//!
//! Queries: read every overlapping shard in parallel from a read quorum of its
//! replicas, sized so that it always meets the write quorum, and keep the
//! newest version of each (series, timestamp).

pub mod hints;

use crate::common::{timestamp_now_nanos, ClusterConfig, Error, NodeId, Peer, Result};
use crate::metadata::{Committed, MetaClient, Resolution, Shard};
use crate::storage::codec::validate_series;
use crate::storage::{LocalShards, SeriesPoint, VersionedPoint};
use crate::transport::{ShardScanRequest, ShardWriteRequest, Transport};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub use hints::{Hint, HintQueue};

/// Hints sent to one node per replay round
const HINT_REPLAY_BATCH: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub database: String,
    pub points: Vec<SeriesPoint>,
}

/// Acknowledgements for one shard's batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAck {
    pub shard: u64,
    pub acked: usize,
    pub replicas: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteSummary {
    pub points: usize,
    pub shards: Vec<ShardAck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub database: String,
    pub series: Vec<String>,
    /// Inclusive
    pub start: i64,
    /// Exclusive
    pub end: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Points per series, ascending by timestamp
    pub series: BTreeMap<String, Vec<SeriesPoint>>,
}

impl QueryResponse {
    pub fn points(&self, series: &str) -> &[SeriesPoint] {
        self.series.get(series).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RequestRouter {
    node_id: NodeId,
    meta: MetaClient,
    shards: Arc<LocalShards>,
    hints: Arc<HintQueue>,
    transport: Arc<dyn Transport>,
    config: ClusterConfig,
    /// Last version handed out; versions never repeat or go backwards
    last_version: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

/// Acks needed out of `replicas`: the configured quorum or a majority
pub fn write_quorum(configured: Option<usize>, replicas: usize) -> usize {
    let replicas = replicas.max(1);
    configured.unwrap_or(replicas / 2 + 1).clamp(1, replicas)
}

/// Replicas a read must hear from so it overlaps every acknowledged write
pub fn read_quorum(configured: Option<usize>, replicas: usize) -> usize {
    let replicas = replicas.max(1);
    replicas - write_quorum(configured, replicas) + 1
}

/// Keep the newest version of each (series, timestamp)
pub fn merge_latest(replies: impl IntoIterator<Item = VersionedPoint>) -> Vec<VersionedPoint> {
    let mut latest: BTreeMap<(String, i64), VersionedPoint> = BTreeMap::new();
    for candidate in replies {
        let key = (candidate.point.series.clone(), candidate.point.timestamp);
        match latest.get(&key) {
            Some(current) if !candidate.supersedes(current) => {}
            _ => {
                latest.insert(key, candidate);
            }
        }
    }
    latest.into_values().collect()
}

impl RequestRouter {
    pub fn new(
        node_id: NodeId,
        meta: MetaClient,
        shards: Arc<LocalShards>,
        hints: Arc<HintQueue>,
        transport: Arc<dyn Transport>,
        config: ClusterConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            node_id,
            meta,
            shards,
            hints,
            transport,
            config,
            last_version: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    pub fn shards(&self) -> &Arc<LocalShards> {
        &self.shards
    }

    pub fn hints(&self) -> &Arc<HintQueue> {
        &self.hints
    }

    /// Start replaying hints in the background
    pub fn start(self: &Arc<Self>) {
        let router = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move { router.run_handoff(shutdown).await });
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn replica_timeout(&self) -> Duration {
        self.config.replica_timeout()
    }

    fn peer(&self, id: NodeId) -> Result<Peer> {
        self.meta
            .store()
            .snapshot()
            .nodes
            .get(&id)
            .map(|n| Peer::new(n.id, n.addr.clone()))
            .ok_or_else(|| Error::ConnectionFailed(format!("unknown node {}", id)))
    }

    /// Wall clock in nanoseconds, bumped past the previous version if needed
    fn next_version(&self) -> u64 {
        let now = timestamp_now_nanos();
        let mut last = self.last_version.load(Ordering::SeqCst);
        loop {
            let next = now.max(last.saturating_add(1));
            match self
                .last_version
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    // === Writes ===

    pub async fn write(&self, request: WriteRequest) -> Result<WriteSummary> {
        let total = request.points.len();
        let mut groups: BTreeMap<u64, (Shard, Vec<SeriesPoint>)> = BTreeMap::new();
        for point in request.points {
            validate_series(&point.series)?;
            let shard = match self.meta.store().resolve(&request.database, point.timestamp)? {
                Resolution::Existing(shard) => shard,
                Resolution::Missing(plan) => self.meta.ensure_shard(&plan).await?,
            };
            groups
                .entry(shard.id)
                .or_insert_with(|| (shard, Vec::new()))
                .1
                .push(point);
        }

        let written_at = self.next_version();
        let writes = groups
            .into_values()
            .map(|(shard, points)| self.write_shard(shard, points, written_at));
        let mut summary = WriteSummary {
            points: total,
            shards: Vec::new(),
        };
        for result in join_all(writes).await {
            summary.shards.push(result?);
        }
        Ok(summary)
    }

    /// Send one shard's batch to every replica; done at quorum.
    /// Each failed replica gets a hint whether or not the quorum holds.
    async fn write_shard(
        &self,
        shard: Shard,
        points: Vec<SeriesPoint>,
        written_at: u64,
    ) -> Result<ShardAck> {
        let replicas = shard.replicas.len();
        let needed = write_quorum(self.config.write_quorum, replicas);
        let points = Arc::new(points);
        let timeout = self.replica_timeout();

        let (tx, mut rx) = mpsc::channel(replicas.max(1));
        for &replica in &shard.replicas {
            let write = self.replica_write(replica, shard.id, points.clone(), written_at);
            let hints = self.hints.clone();
            let points = points.clone();
            let shard_id = shard.id;
            let tx = tx.clone();
            // Detached: stragglers finish after the quorum is reached
            tokio::spawn(async move {
                let result = match tokio::time::timeout(timeout, write).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(format!("replica {} write", replica))),
                };
                if let Err(e) = &result {
                    tracing::warn!(
                        "Write to shard {} on node {} failed, keeping a hint: {}",
                        shard_id,
                        replica,
                        e
                    );
                    let hint = Hint {
                        shard: shard_id,
                        written_at,
                        points: points.as_ref().clone(),
                    };
                    let stored =
                        tokio::task::spawn_blocking(move || hints.push(replica, &hint)).await;
                    if let Err(e) = stored.map_err(Error::from).and_then(|r| r) {
                        tracing::error!("Could not store hint for node {}: {}", replica, e);
                    }
                }
                let _ = tx.send((replica, result.is_ok())).await;
            });
        }
        drop(tx);

        let mut acked = 0;
        let mut failed = 0;
        while let Some((_, ok)) = rx.recv().await {
            if ok {
                acked += 1;
            } else {
                failed += 1;
            }
            if acked >= needed {
                return Ok(ShardAck {
                    shard: shard.id,
                    acked,
                    replicas,
                });
            }
            if replicas - failed < needed {
                break;
            }
        }
        Err(Error::QuorumNotReached {
            shard: shard.id,
            needed,
            acked,
        })
    }

    fn replica_write(
        &self,
        replica: NodeId,
        shard: u64,
        points: Arc<Vec<SeriesPoint>>,
        written_at: u64,
    ) -> BoxFuture<'static, Result<()>> {
        if replica == self.node_id {
            let shards = self.shards.clone();
            return async move {
                tokio::task::spawn_blocking(move || {
                    shards.write_versioned(shard, &points, written_at).map(|_| ())
                })
                .await?
            }
            .boxed();
        }
        match self.peer(replica) {
            Ok(peer) => self.transport.write_points(
                &peer,
                ShardWriteRequest {
                    shard,
                    written_at,
                    points: points.as_ref().clone(),
                },
            ),
            Err(e) => async move { Err(e) }.boxed(),
        }
    }

    /// Apply a replica write sent by a peer
    pub async fn write_local(
        &self,
        shard: u64,
        points: Vec<SeriesPoint>,
        written_at: u64,
    ) -> Result<()> {
        let shards = self.shards.clone();
        tokio::task::spawn_blocking(move || {
            shards.write_versioned(shard, &points, written_at).map(|_| ())
        })
        .await?
    }

    // === Hinted handoff ===

    async fn run_handoff(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.hint_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.replay_hints().await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Delivered {} write hints", n),
                Err(e) => tracing::warn!("Hint replay failed: {}", e),
            }
        }
        tracing::debug!("Hint replay on node {} stopped", self.node_id);
    }

    /// One replay round over every target. Returns hints delivered.
    pub async fn replay_hints(&self) -> Result<usize> {
        let hints = self.hints.clone();
        let targets = tokio::task::spawn_blocking(move || hints.targets()).await??;
        let mut delivered = 0;
        for target in targets {
            delivered += self.replay_target(target).await?;
        }
        Ok(delivered)
    }

    /// Replay `target`'s hints oldest first, stopping at its first failure
    async fn replay_target(&self, target: NodeId) -> Result<usize> {
        let hints = self.hints.clone();
        let pending =
            tokio::task::spawn_blocking(move || hints.pending(target, HINT_REPLAY_BATCH)).await??;

        let mut done = Vec::new();
        let mut delivered = 0;
        for (seq, hint) in pending {
            let still_replica = matches!(
                self.meta.store().shard(hint.shard),
                Ok(shard) if shard.replicas.contains(&target)
            );
            if !still_replica {
                tracing::debug!(
                    "Dropping hint for node {}: no longer a replica of shard {}",
                    target,
                    hint.shard
                );
                done.push(seq);
                continue;
            }
            let write = self.replica_write(target, hint.shard, Arc::new(hint.points), hint.written_at);
            match tokio::time::timeout(self.replica_timeout(), write).await {
                Ok(Ok(())) => {
                    done.push(seq);
                    delivered += 1;
                }
                Ok(Err(e)) => {
                    tracing::debug!("Hints for node {} deferred: {}", target, e);
                    break;
                }
                Err(_) => {
                    tracing::debug!("Hints for node {} deferred: timed out", target);
                    break;
                }
            }
        }

        let hints = self.hints.clone();
        tokio::task::spawn_blocking(move || hints.remove(target, &done)).await??;
        Ok(delivered)
    }

    // === Replica moves ===

    /// Change a shard's replica set. Points are copied to the new replicas
    /// before the change commits, then once more for writes that still went
    /// to the old set while it was in flight.
    pub async fn set_shard_replicas(
        &self,
        shard_id: u64,
        replicas: Vec<NodeId>,
    ) -> Result<Committed> {
        let shard = self.meta.store().shard(shard_id)?;
        let added: Vec<NodeId> = replicas
            .iter()
            .copied()
            .filter(|id| !shard.replicas.contains(id))
            .collect();
        self.copy_shard(&shard, &added).await?;
        let committed = self.meta.set_shard_replicas(shard_id, replicas).await?;
        self.copy_shard(&shard, &added).await?;
        Ok(committed)
    }

    /// Copy every point of `shard` (read at quorum from its replicas) to
    /// `targets`, keeping each point's version
    async fn copy_shard(&self, shard: &Shard, targets: &[NodeId]) -> Result<usize> {
        if targets.is_empty() {
            return Ok(0);
        }
        let stored = self.query_shard(shard, &[], shard.start, shard.end).await?;
        let copied = stored.len();
        let mut by_version: BTreeMap<u64, Vec<SeriesPoint>> = BTreeMap::new();
        for v in stored {
            by_version.entry(v.written_at).or_default().push(v.point);
        }
        for &target in targets {
            for (&written_at, points) in &by_version {
                let write = self.replica_write(target, shard.id, Arc::new(points.clone()), written_at);
                tokio::time::timeout(self.replica_timeout(), write)
                    .await
                    .map_err(|_| {
                        Error::Timeout(format!("copy of shard {} to node {}", shard.id, target))
                    })??;
            }
        }
        tracing::info!(
            "Copied {} points of shard {} to nodes {:?}",
            copied,
            shard.id,
            targets
        );
        Ok(copied)
    }

    // === Queries ===

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        for name in &request.series {
            validate_series(name)?;
        }
        let shards = self
            .meta
            .store()
            .shards_overlapping(&request.database, request.start, request.end)?;
        if request.start >= request.end || request.series.is_empty() {
            return Ok(QueryResponse::default());
        }

        let reads = shards
            .iter()
            .map(|shard| self.query_shard(shard, &request.series, request.start, request.end));
        let mut response = QueryResponse::default();
        for result in join_all(reads).await {
            for stored in result? {
                response
                    .series
                    .entry(stored.point.series.clone())
                    .or_default()
                    .push(stored.point);
            }
        }
        for points in response.series.values_mut() {
            points.sort_by_key(|p| p.timestamp);
        }
        Ok(response)
    }

    /// Read one shard from a read quorum of its replicas and merge.
    /// An empty `series` reads every series.
    async fn query_shard(
        &self,
        shard: &Shard,
        series: &[String],
        start: i64,
        end: i64,
    ) -> Result<Vec<VersionedPoint>> {
        let start = start.max(shard.start);
        let end = end.min(shard.end);
        let replicas = shard.replicas.len();
        let needed = read_quorum(self.config.write_quorum, replicas);
        let timeout = self.replica_timeout();

        let (tx, mut rx) = mpsc::channel(replicas.max(1));
        for &replica in &shard.replicas {
            let scan = self.replica_scan(replica, shard.id, series.to_vec(), start, end);
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = match tokio::time::timeout(timeout, scan).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(format!("replica {} read", replica))),
                };
                let _ = tx.send((replica, result)).await;
            });
        }
        drop(tx);

        let mut answered = 0;
        let mut failed = 0;
        let mut replies = Vec::new();
        while let Some((replica, result)) = rx.recv().await {
            match result {
                Ok(points) => {
                    answered += 1;
                    replies.extend(points);
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!("Read of shard {} from node {} failed: {}", shard.id, replica, e);
                }
            }
            if answered >= needed {
                return Ok(merge_latest(replies));
            }
            if replicas - failed < needed {
                break;
            }
        }
        Err(Error::QuorumNotReached {
            shard: shard.id,
            needed,
            acked: answered,
        })
    }

    fn replica_scan(
        &self,
        replica: NodeId,
        shard: u64,
        series: Vec<String>,
        start: i64,
        end: i64,
    ) -> BoxFuture<'static, Result<Vec<VersionedPoint>>> {
        if replica == self.node_id {
            let shards = self.shards.clone();
            return async move {
                tokio::task::spawn_blocking(move || shards.scan(shard, &series, start, end)).await?
            }
            .boxed();
        }
        match self.peer(replica) {
            Ok(peer) => self.transport.scan(
                &peer,
                ShardScanRequest {
                    shard,
                    series,
                    start,
                    end,
                },
            ),
            Err(e) => async move { Err(e) }.boxed(),
        }
    }

    /// Serve a replica read for a peer
    pub async fn scan_local(
        &self,
        shard: u64,
        series: Vec<String>,
        start: i64,
        end: i64,
    ) -> Result<Vec<VersionedPoint>> {
        let shards = self.shards.clone();
        tokio::task::spawn_blocking(move || shards.scan(shard, &series, start, end)).await?
    }
}
