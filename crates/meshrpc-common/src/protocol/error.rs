use thiserror::Error;

use crate::cluster::Node;

/// Description of a request that failed inside the pool layer.
///
/// Attached to pool-level errors so the retry layer can inspect which node
/// failed and how many attempts the request has already made, without the
/// error owning the request's payload or completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRequest {
    /// The node the failing attempt was routed to
    pub node: Node,
    /// 0-based attempt counter of the failing attempt
    pub attempt: u32,
    /// Request name advertised in the frame header, if any
    pub name: Option<String>,
    /// Frame priority of the failing attempt
    pub priority: i32,
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Not connected to a cluster")]
    ClusterDisconnected,

    #[error("Load balancer could not be built from the latest cluster snapshot: {0}")]
    InvalidCluster(String),

    #[error("No nodes available for the requested capability")]
    NoNodesAvailable,

    #[error("Required argument `{0}` was not provided")]
    NullArgument(&'static str),

    #[error("Channel pool for the destination node is closed")]
    PoolClosed { request: Option<FailedRequest> },

    #[error("Timed out opening a connection after {timeout_ms}ms")]
    ConnectTimeout {
        timeout_ms: u64,
        request: Option<FailedRequest>,
    },

    #[error("Failed to open a connection: {source}")]
    ConnectError {
        #[source]
        source: std::io::Error,
        request: Option<FailedRequest>,
    },

    #[error("Write failed: {message}")]
    WriteError {
        message: String,
        request: Option<FailedRequest>,
    },

    #[error("Request waited longer than {timeout_ms}ms for a writable connection")]
    WriteTimeout {
        timeout_ms: u64,
        request: Option<FailedRequest>,
    },

    #[error("Request went stale in the write queue after {age_ms}ms")]
    StaleRequest {
        age_ms: u64,
        request: Option<FailedRequest>,
    },

    #[error("Write queue is full ({limit} waiting writes)")]
    QueueFull { limit: usize },

    #[error("Failed to serialize request payload: {0}")]
    Serialization(String),

    #[error("Failed to deserialize response payload: {0}")]
    Deserialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// The failing request description, when this error came out of the pool
    /// layer. The retry layer pattern-matches on this to decide whether to
    /// re-issue the request against a different node.
    pub fn failed_request(&self) -> Option<&FailedRequest> {
        match self {
            RpcError::PoolClosed { request }
            | RpcError::ConnectTimeout { request, .. }
            | RpcError::ConnectError { request, .. }
            | RpcError::WriteError { request, .. }
            | RpcError::WriteTimeout { request, .. }
            | RpcError::StaleRequest { request, .. } => request.as_ref(),
            _ => None,
        }
    }

    /// Whether re-issuing the request could plausibly succeed.
    ///
    /// Transport-level failures are transient; everything else either
    /// reflects caller error or would fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::PoolClosed { .. }
                | RpcError::ConnectTimeout { .. }
                | RpcError::ConnectError { .. }
                | RpcError::WriteError { .. }
                | RpcError::WriteTimeout { .. }
                | RpcError::StaleRequest { .. }
                | RpcError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
