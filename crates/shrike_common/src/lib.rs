//! Shared foundation for the ShrikeDB gateway.
//!
//! Keeps the pieces every gateway crate needs: the error taxonomy with its
//! wire-code classification, the `(keyspace, shard, tablet_type)` identity
//! types, the gateway configuration, and a small event throttle for
//! rate-limited warnings.

pub mod config;
pub mod error;
pub mod throttle;
pub mod types;

pub use config::{BalancerConfig, BufferConfig, GatewayConfig};
pub use error::{BufferError, ErrorCode, GatewayError, GatewayResult};
pub use throttle::EventThrottle;
pub use types::{TabletAlias, TabletType, Target};
