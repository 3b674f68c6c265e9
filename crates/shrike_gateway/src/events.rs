//! Keyspace-event surface consumed by the failover buffer and the
//! dispatcher.
//!
//! A keyspace-event watcher classifies each shard's state from the health
//! stream and the topology: a shard is `normal` when its primary serves,
//! `reparenting` while a new primary is being elected, `resharding` while
//! the shard itself is being split or merged, and a whole keyspace becomes
//! `consistent` once every shard has a serving primary again. The gateway
//! runs a single subscriber task that forwards events to the buffer.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shrike_common::error::GatewayResult;
use shrike_common::types::{TabletAlias, Target};

/// Classified state of one shard within a keyspace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Primary serving, nothing in flight.
    Normal,
    /// Primary gone or demoted; a promotion is expected.
    Reparenting,
    /// The shard is involved in a reshard; its targets may disappear.
    Resharding,
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardState::Normal => write!(f, "normal"),
            ShardState::Reparenting => write!(f, "reparenting"),
            ShardState::Resharding => write!(f, "resharding"),
        }
    }
}

/// Per-shard slice of a keyspace event.
#[derive(Debug, Clone)]
pub struct ShardEvent {
    pub keyspace: String,
    pub shard: String,
    pub state: ShardState,
    /// Whether the shard's primary is currently serving.
    pub serving: bool,
    /// The primary's identity when one is known.
    pub primary: Option<TabletAlias>,
}

/// One broadcast from the watcher: the current classification of every shard
/// in a keyspace, plus whether the keyspace as a whole is consistent again.
#[derive(Debug, Clone)]
pub struct KeyspaceEvent {
    pub keyspace: String,
    /// True once every shard has a serving primary; a consistent event ends
    /// the buffering episode for its serving shards.
    pub consistent: bool,
    pub shards: Vec<ShardEvent>,
}

/// Read-only watcher surface. Implementations must tolerate many concurrent
/// readers; `subscribe` is called once, by the gateway's event task.
#[async_trait]
pub trait KeyspaceEventWatcher: Send + Sync {
    /// True when the target's shard is currently part of a reshard.
    fn target_is_being_resharded(&self, target: &Target) -> bool;

    /// Whether primary-bound requests for this target should start
    /// buffering. Also returns the primary the watcher currently knows
    /// about, serving or not, so the dispatcher can distinguish "no primary
    /// exists" from "primary exists but the health view disagrees".
    fn should_start_buffering_for_target(&self, target: &Target) -> (Option<TabletAlias>, bool);

    /// Block until every named keyspace is consistent or the context is
    /// cancelled.
    async fn wait_for_consistent_keyspaces(
        &self,
        ctx: &CancellationToken,
        keyspaces: &[String],
    ) -> GatewayResult<()>;

    /// Channel of keyspace events. The design has exactly one subscriber
    /// (the gateway's buffer task); the channel closes when the watcher
    /// shuts down.
    fn subscribe(&self) -> mpsc::Receiver<KeyspaceEvent>;

    /// Keyspaces the watcher currently considers serving.
    fn serving_keyspaces(&self) -> Vec<String>;
}
