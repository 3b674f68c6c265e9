//! Per-target rolling statistics.
//!
//! One aggregator per `"{keyspace}/{shard}/{tablet_type}"` key, created
//! lazily on first observation and kept for the process lifetime. The
//! gateway's map mutex covers lookup and insert only; counter updates take
//! the aggregator's own mutex for O(1) work.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use shrike_common::types::{TabletType, Target};

#[derive(Debug, Default)]
struct Counters {
    query_count: u64,
    error_count: u64,
    total_latency: Duration,
    last_updated: Option<SystemTime>,
}

/// Rolling counters for one target.
pub struct TabletStatusAggregator {
    keyspace: String,
    shard: String,
    tablet_type: TabletType,
    key: String,
    counters: Mutex<Counters>,
}

impl TabletStatusAggregator {
    pub fn new(target: &Target) -> Self {
        Self {
            keyspace: target.keyspace.clone(),
            shard: target.shard.clone(),
            tablet_type: target.tablet_type,
            key: target.status_key(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Record one completed attempt.
    pub fn record(&self, elapsed: Duration, errored: bool) {
        let mut c = self.counters.lock();
        c.query_count += 1;
        if errored {
            c.error_count += 1;
        }
        c.total_latency += elapsed;
        c.last_updated = Some(SystemTime::now());
    }

    /// Snapshot for display. Holds the counter mutex only for the copy.
    pub fn snapshot(&self) -> TargetStatus {
        let c = self.counters.lock();
        TargetStatus {
            key: self.key.clone(),
            keyspace: self.keyspace.clone(),
            shard: self.shard.clone(),
            tablet_type: self.tablet_type.to_string(),
            query_count: c.query_count,
            error_count: c.error_count,
            avg_latency_us: if c.query_count == 0 {
                0
            } else {
                (c.total_latency.as_micros() / c.query_count as u128) as u64
            },
            seconds_since_last_update: c.last_updated.map(|at| {
                SystemTime::now()
                    .duration_since(at)
                    .unwrap_or_default()
                    .as_secs()
            }),
            last_updated_unix: c.last_updated.and_then(|at| {
                at.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
            }),
        }
    }
}

/// Displayable snapshot of one aggregator.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TargetStatus {
    pub key: String,
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: String,
    pub query_count: u64,
    pub error_count: u64,
    pub avg_latency_us: u64,
    pub seconds_since_last_update: Option<u64>,
    pub last_updated_unix: Option<u64>,
}
