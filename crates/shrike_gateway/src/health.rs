//! Collaborator seams: the health view, the tablet wire protocol, and the
//! topology server.
//!
//! The gateway never collects health itself; it consumes read-only snapshots
//! from a `HealthCheck` implementation that watches the configured cells.
//! Implementations must be safe for many concurrent readers and return
//! snapshot vectors owned by the caller.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use shrike_common::error::GatewayResult;
use shrike_common::types::{TabletAlias, TabletType, Target};

/// One query against a tablet, as the dispatcher hands it to the inner
/// callback.
#[derive(Debug, Clone)]
pub struct TabletQuery {
    pub sql: String,
    pub bind_vars: Vec<(String, String)>,
}

/// Minimal result surface for the wire protocol. The gateway itself never
/// inspects rows; this exists so `query_service_by_alias` callers and tests
/// have something real to execute against.
#[derive(Debug, Clone, Default)]
pub struct TabletQueryResult {
    pub rows_affected: u64,
}

/// The wire protocol to one tablet. Out of scope for the gateway beyond this
/// interface; the dispatcher only threads the connection through to the
/// caller's inner callback.
#[async_trait]
pub trait TabletConnection: Send + Sync {
    /// The tablet this connection is bound to.
    fn alias(&self) -> &TabletAlias;

    /// Execute one query on the tablet.
    async fn execute(&self, target: &Target, query: &TabletQuery)
        -> GatewayResult<TabletQueryResult>;
}

/// Read-only health snapshot of one tablet for one target.
#[derive(Clone)]
pub struct TabletHealth {
    pub alias: TabletAlias,
    pub tablet_type: TabletType,
    /// Whether the health stream currently reports the tablet as serving.
    pub serving: bool,
    /// Established connection, when the health module has one. A healthy
    /// tablet without a connection is selectable but fails locally with a
    /// connection-not-found error.
    pub conn: Option<Arc<dyn TabletConnection>>,
    /// Default connection collation the tablet reported, 0 if unknown.
    pub default_conn_collation: u32,
}

impl TabletHealth {
    /// The cell this tablet lives in.
    pub fn cell(&self) -> &str {
        &self.alias.cell
    }

    /// The globally unique identity string used in invalid-sets.
    pub fn alias_string(&self) -> String {
        self.alias.to_string()
    }
}

impl fmt::Debug for TabletHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabletHealth")
            .field("alias", &self.alias)
            .field("tablet_type", &self.tablet_type)
            .field("serving", &self.serving)
            .field("has_conn", &self.conn.is_some())
            .finish()
    }
}

/// Displayable entry of the health-check cache, one per watched tablet.
#[derive(Debug, Clone, Serialize)]
pub struct TabletCacheStatus {
    pub cell: String,
    pub target: Target,
    pub alias: String,
    pub serving: bool,
}

/// Continuously updated view of fleet health.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Healthy (serving) tablets for the target. The returned snapshot is
    /// owned by the caller and may be reordered freely.
    fn healthy_tablet_stats(&self, target: &Target) -> Vec<TabletHealth>;

    /// Block until every target has at least one serving tablet, or the
    /// context is cancelled.
    async fn wait_for_all_serving_tablets(
        &self,
        ctx: &CancellationToken,
        targets: &[Target],
    ) -> GatewayResult<()>;

    /// Connection to a specific tablet, for callers that pin one tablet
    /// instead of letting the gateway choose.
    async fn tablet_connection(
        &self,
        alias: &TabletAlias,
        target: &Target,
    ) -> GatewayResult<Arc<dyn TabletConnection>>;

    /// Displayable dump of every watched tablet.
    fn cache_status(&self) -> Vec<TabletCacheStatus>;

    /// Displayable dump restricted to currently healthy tablets.
    fn healthy_status(&self) -> Vec<TabletCacheStatus>;

    /// Close underlying health-stream connections.
    async fn close(&self) -> GatewayResult<()>;
}

/// Topology lookups the startup barrier needs. Everything else about the
/// topology server is out of scope.
#[async_trait]
pub trait TopologyServer: Send + Sync {
    /// All `(keyspace, shard, tablet_type)` targets visible from `cell` for
    /// the given tablet types, plus the distinct keyspaces they span.
    async fn find_all_targets_and_keyspaces(
        &self,
        cell: &str,
        tablet_types: &[TabletType],
    ) -> GatewayResult<(Vec<Target>, Vec<String>)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tablet_health_cell_comes_from_alias() {
        let th = TabletHealth {
            alias: TabletAlias::new("zone2", 12),
            tablet_type: TabletType::Replica,
            serving: true,
            conn: None,
            default_conn_collation: 45,
        };
        assert_eq!(th.cell(), "zone2");
        assert_eq!(th.alias_string(), "zone2-0000000012");
    }

    #[test]
    fn test_debug_format_reports_connection_presence_not_contents() {
        let th = TabletHealth {
            alias: TabletAlias::new("zone1", 1),
            tablet_type: TabletType::Primary,
            serving: true,
            conn: None,
            default_conn_collation: 0,
        };
        let dbg = format!("{:?}", th);
        assert!(dbg.contains("has_conn: false"), "got: {}", dbg);
    }
}
