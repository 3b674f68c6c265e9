//! Failover buffer: parks primary-bound requests while their shard has no
//! usable primary, and drains them once the new primary is serving.
//!
//! Per-shard state machine, monotonic within one failover episode:
//!
//! ```text
//!   Passthrough ──► Buffering ──► Draining ──► Passthrough
//!        ▲              │
//!        └──────────────┘  (window exceeded / shutdown)
//! ```
//!
//! - **Passthrough**: requests flow straight through.
//! - **Buffering**: entered when a primary-bound attempt failed with a
//!   cluster-event error, or when the keyspace-event watcher reports a
//!   reparent/reshard for the target. New primary-bound requests park here,
//!   bounded by `max_size` and the buffering window.
//! - **Draining**: a consistent keyspace event showed a serving primary.
//!   Parked requests are released strictly in arrival order; each retries
//!   once and reports back by dropping its `RetryPermit`.
//!
//! The registry mutex is held only to find the per-shard entry; each shard
//! has its own mutex plus a `Notify` for wakeups. No lock is held across an
//! await.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use shrike_common::config::BufferConfig;
use shrike_common::error::{BufferError, GatewayError, GatewayResult};
use shrike_common::types::{TabletType, Target};

use crate::events::{KeyspaceEvent, KeyspaceEventWatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferMode {
    Passthrough,
    Buffering,
    Draining,
}

impl std::fmt::Display for BufferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferMode::Passthrough => write!(f, "passthrough"),
            BufferMode::Buffering => write!(f, "buffering"),
            BufferMode::Draining => write!(f, "draining"),
        }
    }
}

/// Why the last buffering episode ended. Read by parked waiters that wake up
/// in `Passthrough`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Drained,
    WindowExceeded,
    Shutdown,
}

struct ShardSlot {
    mode: BufferMode,
    /// Arrival sequence numbers of currently parked requests. A `BTreeSet`
    /// so cancellation leaves no hole that would stall the drain order.
    parked: BTreeSet<u64>,
    next_seq: u64,
    /// Released-but-not-yet-retried requests (outstanding `RetryPermit`s).
    pending_drains: usize,
    window_start: Option<Instant>,
    window_deadline: Option<Instant>,
    end_reason: Option<EndReason>,
    episode: u64,
}

impl ShardSlot {
    fn new() -> Self {
        Self {
            mode: BufferMode::Passthrough,
            parked: BTreeSet::new(),
            next_seq: 0,
            pending_drains: 0,
            window_start: None,
            window_deadline: None,
            end_reason: None,
            episode: 0,
        }
    }
}

struct ShardBuffer {
    keyspace: String,
    shard: String,
    window: Duration,
    max_size: usize,
    state: Mutex<ShardSlot>,
    notify: Notify,
}

impl ShardBuffer {
    fn start_buffering(&self, slot: &mut ShardSlot, cause: &str) {
        slot.mode = BufferMode::Buffering;
        slot.episode += 1;
        slot.window_start = Some(Instant::now());
        slot.window_deadline = Some(Instant::now() + self.window);
        slot.end_reason = None;
        metrics::counter!("shrike_buffer_starts_total").increment(1);
        tracing::info!(
            keyspace = %self.keyspace,
            shard = %self.shard,
            cause = cause,
            window_ms = self.window.as_millis() as u64,
            "failover detected, buffering primary-bound requests"
        );
    }

    /// End the episode without a drain. Wakes every parked waiter; they
    /// observe `Passthrough` plus the end reason.
    fn end_episode(&self, slot: &mut ShardSlot, reason: EndReason) {
        let duration_ms = slot
            .window_start
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0);
        slot.mode = BufferMode::Passthrough;
        slot.end_reason = Some(reason);
        slot.window_deadline = None;
        match reason {
            EndReason::Drained => {
                metrics::histogram!("shrike_buffer_failover_duration_ms").record(duration_ms as f64);
                tracing::info!(
                    keyspace = %self.keyspace,
                    shard = %self.shard,
                    duration_ms = duration_ms,
                    "failover ended, buffer drained"
                );
            }
            EndReason::WindowExceeded => {
                let evicted = slot.parked.len();
                metrics::counter!("shrike_buffer_evicted_total", "reason" => "window_exceeded")
                    .increment(evicted as u64);
                tracing::warn!(
                    keyspace = %self.keyspace,
                    shard = %self.shard,
                    duration_ms = duration_ms,
                    evicted = evicted,
                    "buffering window exceeded, failing parked requests"
                );
            }
            EndReason::Shutdown => {
                let evicted = slot.parked.len();
                metrics::counter!("shrike_buffer_evicted_total", "reason" => "shutdown")
                    .increment(evicted as u64);
            }
        }
        self.notify.notify_waiters();
    }

    fn start_draining(&self, slot: &mut ShardSlot) {
        if slot.parked.is_empty() && slot.pending_drains == 0 {
            self.end_episode(slot, EndReason::Drained);
            return;
        }
        slot.mode = BufferMode::Draining;
        tracing::info!(
            keyspace = %self.keyspace,
            shard = %self.shard,
            parked = slot.parked.len(),
            "new primary serving, draining buffered requests"
        );
        self.notify.notify_waiters();
    }

    /// Called when a drained request finished its retry (`RetryPermit`
    /// drop).
    fn retry_done(&self) {
        let mut slot = self.state.lock();
        slot.pending_drains = slot.pending_drains.saturating_sub(1);
        self.maybe_finish_drain(&mut slot);
    }

    /// A drain is complete once nothing is parked and every released
    /// request reported back.
    fn maybe_finish_drain(&self, slot: &mut ShardSlot) {
        if slot.mode == BufferMode::Draining
            && slot.parked.is_empty()
            && slot.pending_drains == 0
        {
            self.end_episode(slot, EndReason::Drained);
        }
    }

    async fn wait(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        kev: Option<&Arc<dyn KeyspaceEventWatcher>>,
        prev_err: Option<&GatewayError>,
    ) -> GatewayResult<Option<RetryPermit>> {
        let my_seq;
        {
            let mut slot = self.state.lock();
            match slot.mode {
                BufferMode::Buffering => {}
                BufferMode::Passthrough => {
                    let cause = self.buffering_cause(kev, prev_err);
                    match cause {
                        Some(cause) => self.start_buffering(&mut slot, cause),
                        None => return Ok(None),
                    }
                }
                // A drain is already under way; the failover is over, so new
                // requests go straight to the primary.
                BufferMode::Draining => return Ok(None),
            }

            if slot.parked.len() >= self.max_size {
                metrics::counter!("shrike_buffer_evicted_total", "reason" => "full").increment(1);
                return Err(BufferError::Full {
                    keyspace: self.keyspace.clone(),
                    shard: self.shard.clone(),
                    max_size: self.max_size,
                }
                .into());
            }

            my_seq = slot.next_seq;
            slot.next_seq += 1;
            slot.parked.insert(my_seq);
            metrics::counter!("shrike_buffer_requests_total").increment(1);
            tracing::debug!(
                keyspace = %self.keyspace,
                shard = %self.shard,
                seq = my_seq,
                parked = slot.parked.len(),
                "request parked in failover buffer"
            );
        }

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before re-checking state, so a transition
            // between the check and the await cannot be missed.
            notified.as_mut().enable();

            let deadline;
            {
                let mut slot = self.state.lock();
                match slot.mode {
                    BufferMode::Draining => {
                        if slot.parked.first() == Some(&my_seq) {
                            slot.parked.remove(&my_seq);
                            slot.pending_drains += 1;
                            metrics::counter!("shrike_buffer_drained_total").increment(1);
                            // Hand the turn to the next arrival.
                            self.notify.notify_waiters();
                            return Ok(Some(RetryPermit {
                                shard: Arc::clone(self),
                            }));
                        }
                        deadline = None;
                    }
                    BufferMode::Passthrough => {
                        slot.parked.remove(&my_seq);
                        let err = match slot.end_reason {
                            Some(EndReason::WindowExceeded) => BufferError::WindowExceeded {
                                keyspace: self.keyspace.clone(),
                                shard: self.shard.clone(),
                                window_ms: self.window.as_millis() as u64,
                            },
                            _ => BufferError::ShuttingDown,
                        };
                        return Err(err.into());
                    }
                    BufferMode::Buffering => {
                        let d = slot.window_deadline.unwrap_or_else(Instant::now);
                        if Instant::now() >= d {
                            self.end_episode(&mut slot, EndReason::WindowExceeded);
                            continue;
                        }
                        deadline = Some(d);
                    }
                }
            }

            tokio::select! {
                _ = notified.as_mut() => {}
                _ = ctx.cancelled() => {
                    let mut slot = self.state.lock();
                    slot.parked.remove(&my_seq);
                    metrics::counter!("shrike_buffer_evicted_total", "reason" => "canceled")
                        .increment(1);
                    // The drain turn may now belong to someone else, or the
                    // cancelled request may have been the last thing the
                    // drain was waiting on.
                    self.maybe_finish_drain(&mut slot);
                    self.notify.notify_waiters();
                    return Err(GatewayError::Canceled);
                }
                _ = sleep_until_opt(deadline) => {
                    // Loop re-checks the state and expires the window under
                    // the lock.
                }
            }
        }
    }

    fn buffering_cause(
        &self,
        kev: Option<&Arc<dyn KeyspaceEventWatcher>>,
        prev_err: Option<&GatewayError>,
    ) -> Option<&'static str> {
        if prev_err.is_some_and(|e| e.is_cluster_event()) {
            return Some("failover error from previous attempt");
        }
        if let Some(kev) = kev {
            let target = Target::new(self.keyspace.clone(), self.shard.clone(), TabletType::Primary);
            let (_, should_buffer) = kev.should_start_buffering_for_target(&target);
            if should_buffer {
                return Some("keyspace event watcher reports failover");
            }
        }
        None
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Drain-accounting guard handed to a request released from the buffer.
/// Dropping it tells the buffer the retry finished; it fires exactly once,
/// including when the dispatch is cancelled mid-retry.
pub struct RetryPermit {
    shard: Arc<ShardBuffer>,
}

impl Drop for RetryPermit {
    fn drop(&mut self) {
        self.shard.retry_done();
    }
}

impl std::fmt::Debug for RetryPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPermit")
            .field("keyspace", &self.shard.keyspace)
            .field("shard", &self.shard.shard)
            .finish()
    }
}

/// Registry of per-shard buffers.
pub struct FailoverBuffer {
    config: BufferConfig,
    shards: Mutex<HashMap<(String, String), Arc<ShardBuffer>>>,
    shut_down: AtomicBool,
}

impl FailoverBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            shards: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    fn shard_entry(&self, keyspace: &str, shard: &str) -> Arc<ShardBuffer> {
        let mut shards = self.shards.lock();
        shards
            .entry((keyspace.to_string(), shard.to_string()))
            .or_insert_with(|| {
                Arc::new(ShardBuffer {
                    keyspace: keyspace.to_string(),
                    shard: shard.to_string(),
                    window: self.config.window(),
                    max_size: self.config.max_size,
                    state: Mutex::new(ShardSlot::new()),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// Park the caller if its shard is in a failover, until the failover
    /// ends, the buffer fills, the window expires, or `ctx` is cancelled.
    ///
    /// `Ok(None)` means no failover is in progress and the request should
    /// proceed immediately. `Ok(Some(permit))` means the request was parked
    /// and released for a retry; the caller drops the permit once the retry
    /// completed so drain accounting stays accurate.
    pub async fn wait_for_failover_end(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        shard: &str,
        kev: Option<&Arc<dyn KeyspaceEventWatcher>>,
        prev_err: Option<&GatewayError>,
    ) -> GatewayResult<Option<RetryPermit>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Ok(None);
        }
        let entry = self.shard_entry(keyspace, shard);
        entry.wait(ctx, kev, prev_err).await
    }

    /// Drive state transitions from a keyspace event. A consistent event
    /// with a serving primary moves that shard from buffering to draining.
    pub fn handle_keyspace_event(&self, evt: &KeyspaceEvent) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        for se in &evt.shards {
            let entry = {
                let shards = self.shards.lock();
                shards.get(&(se.keyspace.clone(), se.shard.clone())).cloned()
            };
            let Some(entry) = entry else { continue };
            let mut slot = entry.state.lock();
            if slot.mode == BufferMode::Buffering
                && evt.consistent
                && se.serving
                && se.primary.is_some()
            {
                entry.start_draining(&mut slot);
            }
        }
    }

    /// Move every shard to passthrough and fail all parked waiters with
    /// `ShuttingDown`.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let entries: Vec<_> = self.shards.lock().values().cloned().collect();
        for entry in entries {
            let mut slot = entry.state.lock();
            if slot.mode != BufferMode::Passthrough {
                entry.end_episode(&mut slot, EndReason::Shutdown);
            }
        }
    }
}
