//! ShrikeDB tablet gateway.
//!
//! The request-dispatch layer between the SQL query router and the tablet
//! fleet. For each inbound query the gateway selects one healthy tablet
//! serving the requested `(keyspace, shard, tablet_type)` target, executes
//! against it, and transparently retries other tablets on retryable failure.
//! When a shard's primary is transiently unavailable because of a failover
//! or reshard, primary-bound requests are parked in a bounded per-shard
//! buffer and drained against the new primary once it is serving.
//!
//! Collaborators (health-check collection, topology lookups, the tablet wire
//! protocol, keyspace-event classification) are consumed through traits; the
//! gateway owns only dispatch, selection, buffering, and per-target
//! statistics.

pub mod balancer;
pub mod buffer;
pub mod debug_http;
pub mod events;
pub mod gateway;
pub mod health;
pub mod status;

pub use balancer::TabletBalancer;
pub use buffer::{FailoverBuffer, RetryPermit};
pub use events::{KeyspaceEvent, KeyspaceEventWatcher, ShardEvent};
pub use gateway::TabletGateway;
pub use health::{HealthCheck, TabletCacheStatus, TabletConnection, TabletHealth, TopologyServer};
pub use status::{TabletStatusAggregator, TargetStatus};
