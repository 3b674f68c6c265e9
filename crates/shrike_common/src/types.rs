//! Identity types for the tablet fleet.
//!
//! A query is routed at a `Target`: the `(keyspace, shard, tablet_type)`
//! triple. Individual tablets are identified by a `TabletAlias`, which is
//! globally unique and carries the cell (locality domain) the tablet lives
//! in.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of a tablet within its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabletType {
    /// The writable leader of the shard.
    Primary,
    /// Read replica eligible for promotion.
    Replica,
    /// Read-only replica excluded from promotion (batch/OLAP traffic).
    Rdonly,
    /// Replica reserved for backups; not serving.
    Backup,
    /// Tablet drained of traffic for maintenance.
    Drained,
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TabletType::Primary => "primary",
            TabletType::Replica => "replica",
            TabletType::Rdonly => "rdonly",
            TabletType::Backup => "backup",
            TabletType::Drained => "drained",
        };
        write!(f, "{}", s)
    }
}

/// Globally unique tablet identity: the cell it lives in plus a uid that is
/// unique within that cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

/// The routing destination of a query: logical database, horizontal
/// partition, and the tablet role the query may run on.
///
/// Immutable for the lifetime of one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
}

impl Target {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>, tablet_type: TabletType) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
            tablet_type,
        }
    }

    /// Key used for per-target state maps (status aggregators, balancer
    /// allocations): `"{keyspace}/{shard}/{tablet_type}"`.
    pub fn status_key(&self) -> String {
        format!("{}/{}/{}", self.keyspace, self.shard, self.tablet_type)
    }

    /// The `(keyspace, shard)` pair, used to key per-shard buffer state.
    pub fn shard_key(&self) -> (String, String) {
        (self.keyspace.clone(), self.shard.clone())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.keyspace, self.shard, self.tablet_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tablet_type_display_lowercase() {
        assert_eq!(TabletType::Primary.to_string(), "primary");
        assert_eq!(TabletType::Replica.to_string(), "replica");
        assert_eq!(TabletType::Rdonly.to_string(), "rdonly");
    }

    #[test]
    fn test_alias_display_is_cell_dash_uid() {
        let alias = TabletAlias::new("zone1", 101);
        assert_eq!(alias.to_string(), "zone1-0000000101");
    }

    #[test]
    fn test_alias_equality_and_hash_by_value() {
        let a = TabletAlias::new("zone1", 7);
        let b = TabletAlias::new("zone1", 7);
        let c = TabletAlias::new("zone2", 7);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_target_display_and_status_key() {
        let t = Target::new("commerce", "-80", TabletType::Primary);
        assert_eq!(t.to_string(), "commerce.-80.primary");
        assert_eq!(t.status_key(), "commerce/-80/primary");
    }

    #[test]
    fn test_shard_key_pairs_keyspace_and_shard() {
        let t = Target::new("commerce", "80-", TabletType::Replica);
        assert_eq!(t.shard_key(), ("commerce".to_string(), "80-".to_string()));
    }
}
