//! The tablet gateway: health-aware dispatch with bounded retry and
//! failover buffering.
//!
//! `dispatch` is the hot path. Per attempt it consults the failover buffer
//! (primary targets only), takes a health snapshot, selects one candidate
//! via the balancer or the cell-biased shuffle, runs the caller's inner
//! call against the tablet's connection, and classifies the outcome. No
//! lock is held across the inner call; the invalid-set is per-dispatch so a
//! tablet that failed one query keeps serving others.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shrike_common::config::GatewayConfig;
use shrike_common::error::{
    shard_result, GatewayError, GatewayResult, CLUSTER_EVENT_REPARENT, CLUSTER_EVENT_RESHARDING,
};
use shrike_common::throttle::EventThrottle;
use shrike_common::types::{TabletAlias, TabletType, Target};

use crate::balancer::{BalancerSnapshot, TabletBalancer};
use crate::buffer::{FailoverBuffer, RetryPermit};
use crate::events::KeyspaceEventWatcher;
use crate::health::{HealthCheck, TabletCacheStatus, TabletConnection, TabletHealth, TopologyServer};
use crate::status::{TabletStatusAggregator, TargetStatus};

/// Interval between repeated collation-mismatch warnings.
const COLLATION_WARN_INTERVAL: Duration = Duration::from_secs(60);

pub struct TabletGateway {
    hc: Arc<dyn HealthCheck>,
    topo: Option<Arc<dyn TopologyServer>>,
    kev: Option<Arc<dyn KeyspaceEventWatcher>>,
    local_cell: String,
    config: GatewayConfig,

    default_conn_collation: AtomicU32,
    collation_warn: EventThrottle,

    /// Status aggregators keyed by `"{keyspace}/{shard}/{tablet_type}"`.
    /// The mutex covers lookup and insert only.
    aggregators: Mutex<HashMap<String, Arc<TabletStatusAggregator>>>,

    buffer: Option<Arc<FailoverBuffer>>,
    balancer: Option<TabletBalancer>,

    /// Shutdown handle of the keyspace-event consumer task.
    event_task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl TabletGateway {
    /// Build a gateway over the given collaborators. Validates the config,
    /// sets up buffering and balancing when enabled, and starts the
    /// keyspace-event consumer task (cancelled by `close`).
    pub fn new(
        hc: Arc<dyn HealthCheck>,
        topo: Option<Arc<dyn TopologyServer>>,
        kev: Option<Arc<dyn KeyspaceEventWatcher>>,
        local_cell: impl Into<String>,
        config: GatewayConfig,
    ) -> GatewayResult<Arc<Self>> {
        config.validate()?;
        let local_cell = local_cell.into();
        tracing::info!(
            local_cell = %local_cell,
            cells_to_watch = ?config.cells_to_watch,
            retry_count = config.retry_count,
            "tablet gateway starting"
        );

        let buffer = if config.buffer.enabled {
            Some(Arc::new(FailoverBuffer::new(config.buffer.clone())))
        } else {
            tracing::info!("query buffering is disabled");
            None
        };
        let balancer = config
            .balancer
            .enabled
            .then(|| TabletBalancer::new(local_cell.clone(), config.balancer.vtgate_cells.clone()));

        let gw = Arc::new(Self {
            hc,
            topo,
            kev,
            local_cell,
            config,
            default_conn_collation: AtomicU32::new(0),
            collation_warn: EventThrottle::new(COLLATION_WARN_INTERVAL),
            aggregators: Mutex::new(HashMap::new()),
            buffer,
            balancer,
            event_task: Mutex::new(None),
        });

        if let (Some(buffer), Some(kev)) = (&gw.buffer, &gw.kev) {
            let buffer = Arc::clone(buffer);
            let mut events = kev.subscribe();
            let (tx, mut rx) = watch::channel(false);
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = rx.changed() => break,
                        evt = events.recv() => match evt {
                            Some(evt) => buffer.handle_keyspace_event(&evt),
                            None => break,
                        },
                    }
                }
            });
            *gw.event_task.lock() = Some((tx, handle));
        }

        Ok(gw)
    }

    /// Execute `inner` against one healthy tablet serving `target`, retrying
    /// other tablets on retryable failure, at most `retry_count` additional
    /// attempts. The terminal error is decorated with the target identity.
    pub async fn dispatch<F, Fut>(
        &self,
        ctx: &CancellationToken,
        target: &Target,
        in_transaction: bool,
        inner: F,
    ) -> GatewayResult<()>
    where
        F: FnMut(CancellationToken, Target, Arc<dyn TabletConnection>) -> Fut,
        Fut: Future<Output = GatewayResult<()>>,
    {
        shard_result(
            self.dispatch_attempts(ctx, target, in_transaction, inner).await,
            target,
        )
    }

    async fn dispatch_attempts<F, Fut>(
        &self,
        ctx: &CancellationToken,
        target: &Target,
        in_transaction: bool,
        mut inner: F,
    ) -> GatewayResult<()>
    where
        F: FnMut(CancellationToken, Target, Arc<dyn TabletConnection>) -> Fut,
        Fut: Future<Output = GatewayResult<()>>,
    {
        // Transactions are pinned to one tablet by the upper layer; this
        // entry point only load-balances.
        if in_transaction && target.tablet_type != TabletType::Primary {
            return Err(GatewayError::internal(
                "gateway's query service can only be used for non-transactional queries on replicas",
            ));
        }
        if !self.config.allowed_tablet_types.is_empty()
            && !self.config.allowed_tablet_types.contains(&target.tablet_type)
        {
            return Err(GatewayError::failed_precondition(format!(
                "requested tablet type {} is not among the allowed tablet types {:?}",
                target.tablet_type, self.config.allowed_tablet_types
            )));
        }

        let mut err: Option<GatewayError> = None;
        let mut invalid_tablets: HashSet<String> = HashSet::new();
        let mut buffered_once = false;
        // Held until the dispatch finishes so drain accounting sees the
        // retry complete even when the caller cancels mid-attempt.
        let mut _retry_permit: Option<RetryPermit> = None;

        for _ in 0..=self.config.retry_count {
            // The buffer check sits inside the loop so the first in-flight
            // failure can trigger buffering on the next iteration. Only
            // primary-bound, non-transactional requests buffer, once each.
            if let Some(buffer) = &self.buffer {
                if !buffered_once && !in_transaction && target.tablet_type == TabletType::Primary {
                    match buffer
                        .wait_for_failover_end(
                            ctx,
                            &target.keyspace,
                            &target.shard,
                            self.kev.as_ref(),
                            err.as_ref(),
                        )
                        .await
                    {
                        Ok(Some(permit)) => {
                            _retry_permit = Some(permit);
                            buffered_once = true;
                        }
                        Ok(None) => {}
                        Err(buffer_err) => {
                            err = Some(GatewayError::buffer_failed(buffer_err, err.take()));
                            break;
                        }
                    }
                }
            }

            let mut tablets = self.hc.healthy_tablet_stats(target);
            if tablets.is_empty() {
                // When the event watcher can explain the emptiness, surface
                // a cluster event and keep looping so the next iteration can
                // buffer; resharding takes precedence over reparenting.
                if target.tablet_type == TabletType::Primary {
                    if let Some(kev) = &self.kev {
                        if kev.target_is_being_resharded(target) {
                            err = Some(GatewayError::cluster_event(CLUSTER_EVENT_RESHARDING));
                            continue;
                        }
                        let (primary, should_buffer) =
                            kev.should_start_buffering_for_target(target);
                        if should_buffer {
                            err = Some(GatewayError::cluster_event(CLUSTER_EVENT_REPARENT));
                            continue;
                        }
                        if primary.is_some() {
                            err = Some(GatewayError::unavailable(
                                "inconsistent state detected, primary is serving but initially found no available tablet",
                            ));
                            continue;
                        }
                    }
                }
                err = Some(GatewayError::unavailable(format!(
                    "no healthy tablet available for '{}'",
                    target
                )));
                break;
            }

            // Selection is either-or: mixing balancer output with the
            // shuffle would defeat proportionality.
            let chosen = if self.config.balancer.applies_to(&target.keyspace) {
                if !invalid_tablets.is_empty() {
                    tablets.retain(|t| !invalid_tablets.contains(&t.alias_string()));
                }
                self.balancer
                    .as_ref()
                    .and_then(|b| b.pick(target, &tablets))
            } else {
                shuffle_tablets(&self.local_cell, &mut tablets);
                tablets
                    .iter()
                    .find(|t| !invalid_tablets.contains(&t.alias_string()))
                    .cloned()
            };

            let Some(th) = chosen else {
                // Do not override the error from the last attempt.
                if err.is_none() {
                    err = Some(GatewayError::NoAvailableTablet);
                }
                break;
            };

            let Some(conn) = th.conn.clone() else {
                invalid_tablets.insert(th.alias_string());
                err = Some(GatewayError::ConnectionNotFound {
                    alias: th.alias_string(),
                });
                continue;
            };

            self.update_default_conn_collation(&th);

            let start = Instant::now();
            let res = inner(ctx.clone(), target.clone(), conn).await;
            self.record_attempt(target, start.elapsed(), res.is_err());
            match res {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    invalid_tablets.insert(th.alias_string());
                    err = Some(e);
                }
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }

        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Connection to a specific tablet, for callers that pin one tablet
    /// instead of letting the gateway choose. Errors carry the target
    /// identity.
    pub async fn query_service_by_alias(
        &self,
        alias: &TabletAlias,
        target: &Target,
    ) -> GatewayResult<Arc<dyn TabletConnection>> {
        self.hc
            .tablet_connection(alias, target)
            .await
            .map_err(|e| e.with_target(target))
    }

    /// Keyspaces the event watcher currently considers serving.
    pub fn serving_keyspaces(&self) -> Vec<String> {
        match &self.kev {
            Some(kev) => kev.serving_keyspaces(),
            None => Vec::new(),
        }
    }

    /// Startup barrier: wait until every target of the requested types has a
    /// serving tablet, bounded by the configured timeout. A timeout is a
    /// degraded-mode warning, not an error.
    pub async fn wait_for_tablets(
        &self,
        ctx: &CancellationToken,
        tablet_types: &[TabletType],
    ) -> GatewayResult<()> {
        if tablet_types.is_empty() {
            return Ok(());
        }
        let Some(topo) = self.topo.clone() else {
            return Ok(());
        };
        tracing::info!(?tablet_types, "gateway waiting for serving tablets");
        let timeout = self.config.initial_tablet_timeout();
        match tokio::time::timeout(timeout, self.wait_for_tablets_inner(ctx, &topo, tablet_types))
            .await
        {
            Ok(Ok(())) => {
                tracing::info!("waiting for tablets completed");
                Ok(())
            }
            Ok(Err(GatewayError::DeadlineExceeded)) | Err(_) => {
                tracing::warn!(
                    ?tablet_types,
                    timeout_ms = timeout.as_millis() as u64,
                    "timeout waiting for healthy tablets, continuing in degraded mode"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
        }
    }

    async fn wait_for_tablets_inner(
        &self,
        ctx: &CancellationToken,
        topo: &Arc<dyn TopologyServer>,
        tablet_types: &[TabletType],
    ) -> GatewayResult<()> {
        let (targets, keyspaces) = topo
            .find_all_targets_and_keyspaces(&self.local_cell, tablet_types)
            .await?;
        self.hc.wait_for_all_serving_tablets(ctx, &targets).await?;
        // The health stream can be ahead of the event watcher. Waiting for
        // keyspace consistency here means any primary disruption from now on
        // is observed by the watcher and can start buffering.
        if tablet_types.contains(&TabletType::Primary) {
            if let Some(kev) = &self.kev {
                kev.wait_for_consistent_keyspaces(ctx, &keyspaces).await?;
            }
        }
        Ok(())
    }

    /// Shut down: fail buffered requests, stop the event task, close health
    /// connections.
    pub async fn close(&self) -> GatewayResult<()> {
        if let Some(buffer) = &self.buffer {
            buffer.shutdown();
        }
        let task = self.event_task.lock().take();
        if let Some((tx, handle)) = task {
            let _ = tx.send(true);
            let _ = handle.await;
        }
        self.hc.close().await
    }

    /// Sorted snapshot of every status aggregator.
    pub fn cache_status(&self) -> Vec<TargetStatus> {
        let snapshots: Vec<Arc<TabletStatusAggregator>> = {
            let aggregators = self.aggregators.lock();
            aggregators.values().cloned().collect()
        };
        let mut out: Vec<TargetStatus> = snapshots.iter().map(|a| a.snapshot()).collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Displayable health-check cache, all watched tablets.
    pub fn tablets_cache_status(&self) -> Vec<TabletCacheStatus> {
        self.hc.cache_status()
    }

    /// Displayable health-check cache, healthy tablets only.
    pub fn tablets_healthy_status(&self) -> Vec<TabletCacheStatus> {
        self.hc.healthy_status()
    }

    /// The first non-zero default connection collation observed from any
    /// tablet, 0 until one is seen.
    pub fn default_conn_collation(&self) -> u32 {
        self.default_conn_collation.load(Ordering::Acquire)
    }

    /// Balancer allocations for the debug endpoint, `None` when the
    /// balancer is disabled.
    pub fn balancer_snapshot(&self) -> Option<BalancerSnapshot> {
        self.balancer.as_ref().map(|b| b.snapshot())
    }

    fn record_attempt(&self, target: &Target, elapsed: Duration, errored: bool) {
        let aggr = {
            let mut aggregators = self.aggregators.lock();
            aggregators
                .entry(target.status_key())
                .or_insert_with(|| Arc::new(TabletStatusAggregator::new(target)))
                .clone()
        };
        aggr.record(elapsed, errored);
        metrics::counter!(
            "shrike_gateway_attempts_total",
            "tablet_type" => target.tablet_type.to_string(),
            "errored" => if errored { "true" } else { "false" }
        )
        .increment(1);
    }

    fn update_default_conn_collation(&self, th: &TabletHealth) {
        let observed = th.default_conn_collation;
        if observed == 0 {
            return;
        }
        if self
            .default_conn_collation
            .compare_exchange(0, observed, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
        if self.default_conn_collation.load(Ordering::Acquire) != observed
            && self.collation_warn.allow()
        {
            tracing::warn!(
                alias = %th.alias,
                observed_collation = observed,
                "cluster has tablets with different default connection collations"
            );
        }
    }
}

/// Cell-biased reorder: same-cell tablets land in a uniformly shuffled
/// prefix, other-cell tablets in a uniformly shuffled suffix. Two-pointer
/// partition-and-shuffle, `n-1` swaps, in place.
fn shuffle_tablets(local_cell: &str, tablets: &mut [TabletHealth]) {
    let n = tablets.len();
    if n < 2 {
        return;
    }
    let mut rng = rand::thread_rng();
    let mut head = 0;
    let mut tail = n - 1;
    for _ in 0..n - 1 {
        let j = rng.gen_range(head..=tail);
        if tablets[j].cell() == local_cell {
            tablets.swap(head, j);
            head += 1;
        } else {
            tablets.swap(tail, j);
            tail -= 1;
        }
    }
}
