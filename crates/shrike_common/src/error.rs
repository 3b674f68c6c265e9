//! Gateway error taxonomy.
//!
//! Errors are classified by *kind*, not by type, for retry and escalation
//! decisions:
//!
//! - policy violations (transaction on replica, disallowed tablet type) —
//!   fatal, never retried
//! - transient cluster events (resharding, reparenting) — retried inside the
//!   dispatch loop
//! - no healthy tablet — not retried, the candidate set is genuinely empty
//! - tablet-reported errors — retried iff the tablet marked them retryable
//! - buffer failures (full, window exceeded, shutdown) — terminal, wrapping
//!   the prior attempt's error
//!
//! Every terminal error leaving the dispatcher is decorated with the target
//! identity exactly once, at the outermost return point.

use thiserror::Error;

use crate::types::Target;

/// Convenience alias for `Result<T, GatewayError>`.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Sub-reason for a `ClusterEvent` error raised while a reshard is moving
/// the target's shard.
pub const CLUSTER_EVENT_RESHARDING: &str = "resharding in progress";
/// Sub-reason for a `ClusterEvent` error raised while a reparent is electing
/// a new primary for the target's shard.
pub const CLUSTER_EVENT_REPARENT: &str = "reparent in progress";

/// Stable wire-level error code, the part of an error clients may dispatch
/// on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Internal,
    FailedPrecondition,
    Unavailable,
    ClusterEvent,
    Canceled,
    DeadlineExceeded,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::ClusterEvent => "CLUSTER_EVENT",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
        };
        write!(f, "{}", s)
    }
}

/// Failure modes of the failover buffer, surfaced to parked requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer full for {keyspace}/{shard} ({max_size} requests already queued)")]
    Full {
        keyspace: String,
        shard: String,
        max_size: usize,
    },

    #[error("failover buffer window exceeded for {keyspace}/{shard} after {window_ms}ms")]
    WindowExceeded {
        keyspace: String,
        shard: String,
        window_ms: u64,
    },

    #[error("gateway is shutting down, buffered request aborted")]
    ShuttingDown,
}

/// Top-level gateway error.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("internal: {0}")]
    Internal(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A transient cluster topology change (reshard or reparent) explains why
    /// the target cannot be served right now. Upstream callers treat this as
    /// re-resolvable rather than as a hard failure.
    #[error("cluster event: {0}")]
    ClusterEvent(String),

    /// Selection exhausted the candidate list without finding an untried
    /// tablet.
    #[error("no available tablet for query, all candidates tried")]
    NoAvailableTablet,

    /// A healthy tablet was selected but its connection is not established
    /// yet. Retried locally after marking the tablet invalid.
    #[error("no connection for tablet {alias}")]
    ConnectionNotFound { alias: String },

    /// An error reported by the tablet itself, passed through with the
    /// tablet's own retryability verdict.
    #[error("tablet error: {message}")]
    Tablet {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },

    /// A request parked in the failover buffer could not be drained. Wraps
    /// the error from the attempt that triggered buffering, when there was
    /// one.
    #[error("failed to buffer and retry request during failover: {source}{}", prior_suffix(.prior))]
    BufferFailed {
        #[source]
        source: Box<GatewayError>,
        prior: Option<Box<GatewayError>>,
    },

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("request canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Target decoration applied at the dispatcher's outermost return point.
    #[error("target: {target}: {source}")]
    TargetContext {
        target: String,
        #[source]
        source: Box<GatewayError>,
    },
}

fn prior_suffix(prior: &Option<Box<GatewayError>>) -> String {
    match prior {
        Some(e) => format!(" (original error: {})", e),
        None => String::new(),
    }
}

impl GatewayError {
    pub fn internal(msg: impl Into<String>) -> Self {
        GatewayError::Internal(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        GatewayError::FailedPrecondition(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        GatewayError::Unavailable(msg.into())
    }

    pub fn cluster_event(reason: impl Into<String>) -> Self {
        GatewayError::ClusterEvent(reason.into())
    }

    /// Tablet-reported error the tablet marked as safe to retry elsewhere.
    pub fn tablet_retryable(code: ErrorCode, message: impl Into<String>) -> Self {
        GatewayError::Tablet {
            code,
            message: message.into(),
            retryable: true,
        }
    }

    /// Tablet-reported error that must be returned to the caller as-is.
    pub fn tablet_terminal(code: ErrorCode, message: impl Into<String>) -> Self {
        GatewayError::Tablet {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    /// Wrap a buffer failure together with the error from the attempt that
    /// triggered buffering.
    pub fn buffer_failed(source: GatewayError, prior: Option<GatewayError>) -> Self {
        GatewayError::BufferFailed {
            source: Box::new(source),
            prior: prior.map(Box::new),
        }
    }

    /// The stable wire code of this error. Wrappers report the code of the
    /// error they wrap.
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Internal(_) => ErrorCode::Internal,
            GatewayError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            GatewayError::Unavailable(_) => ErrorCode::Unavailable,
            GatewayError::ClusterEvent(_) => ErrorCode::ClusterEvent,
            GatewayError::NoAvailableTablet => ErrorCode::Unavailable,
            GatewayError::ConnectionNotFound { .. } => ErrorCode::Unavailable,
            GatewayError::Tablet { code, .. } => *code,
            GatewayError::BufferFailed { source, .. } => source.code(),
            GatewayError::Buffer(_) => ErrorCode::Unavailable,
            GatewayError::Canceled => ErrorCode::Canceled,
            GatewayError::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            GatewayError::TargetContext { source, .. } => source.code(),
        }
    }

    /// True when the dispatcher may mark the tablet invalid and try another
    /// candidate within the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Tablet { retryable, .. } => *retryable,
            GatewayError::TargetContext { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// True when a transient cluster event (reshard/reparent) caused this
    /// error; such errors justify entering the failover buffer.
    pub fn is_cluster_event(&self) -> bool {
        matches!(self.code(), ErrorCode::ClusterEvent)
    }

    /// Decorate with the target identity. Applied exactly once, at the
    /// outermost return point of the dispatcher; helpers never wrap.
    pub fn with_target(self, target: &Target) -> Self {
        GatewayError::TargetContext {
            target: target.to_string(),
            source: Box::new(self),
        }
    }
}

/// Decorate an optional error with target identity, the outermost-return
/// helper: `Ok` stays `Ok`.
pub fn shard_result(res: GatewayResult<()>, target: &Target) -> GatewayResult<()> {
    res.map_err(|e| e.with_target(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TabletType;

    #[test]
    fn test_error_code_display_is_screaming_snake() {
        assert_eq!(ErrorCode::FailedPrecondition.to_string(), "FAILED_PRECONDITION");
        assert_eq!(ErrorCode::ClusterEvent.to_string(), "CLUSTER_EVENT");
    }

    #[test]
    fn test_cluster_event_carries_sub_reason() {
        let err = GatewayError::cluster_event(CLUSTER_EVENT_RESHARDING);
        assert_eq!(err.code(), ErrorCode::ClusterEvent);
        assert!(err.to_string().contains("resharding in progress"));
    }

    #[test]
    fn test_tablet_retryability_verdict_is_preserved() {
        let r = GatewayError::tablet_retryable(ErrorCode::Unavailable, "connection reset");
        let t = GatewayError::tablet_terminal(ErrorCode::Internal, "bad query");
        assert!(r.is_retryable());
        assert!(!t.is_retryable());
    }

    #[test]
    fn test_policy_errors_are_not_retryable() {
        assert!(!GatewayError::internal("txn on replica").is_retryable());
        assert!(!GatewayError::failed_precondition("type not allowed").is_retryable());
        assert!(!GatewayError::NoAvailableTablet.is_retryable());
    }

    #[test]
    fn test_target_decoration_prefixes_identity() {
        let target = Target::new("commerce", "-80", TabletType::Primary);
        let err = GatewayError::unavailable("no healthy tablet").with_target(&target);
        assert_eq!(
            err.to_string(),
            "target: commerce.-80.primary: unavailable: no healthy tablet"
        );
        assert_eq!(err.code(), ErrorCode::Unavailable);
    }

    #[test]
    fn test_shard_result_leaves_ok_untouched() {
        let target = Target::new("commerce", "0", TabletType::Replica);
        assert!(shard_result(Ok(()), &target).is_ok());
    }

    #[test]
    fn test_buffer_failed_wraps_prior_attempt_error() {
        let prior = GatewayError::cluster_event(CLUSTER_EVENT_REPARENT);
        let err = GatewayError::buffer_failed(
            BufferError::WindowExceeded {
                keyspace: "commerce".into(),
                shard: "0".into(),
                window_ms: 10_000,
            }
            .into(),
            Some(prior),
        );
        let msg = err.to_string();
        assert!(msg.contains("window exceeded"), "got: {}", msg);
        assert!(msg.contains("reparent in progress"), "got: {}", msg);
        assert_eq!(err.code(), ErrorCode::Unavailable);
    }

    #[test]
    fn test_buffer_full_message_names_shard_and_capacity() {
        let err = BufferError::Full {
            keyspace: "commerce".into(),
            shard: "80-".into(),
            max_size: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("commerce/80-"), "got: {}", msg);
        assert!(msg.contains("1000"), "got: {}", msg);
    }

    #[test]
    fn test_retryability_seen_through_target_context() {
        let target = Target::new("commerce", "0", TabletType::Replica);
        let err = GatewayError::tablet_retryable(ErrorCode::Unavailable, "io").with_target(&target);
        assert!(err.is_retryable());
    }
}
