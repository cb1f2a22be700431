use layermesh_net::NetError;
use layermesh_planner::PlannerError;
use layermesh_types::TypesError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("session error: {0}")]
    Session(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("invalid state transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    #[error("no active plan")]
    NoPlan,

    #[error("planning error: {0}")]
    Planning(#[from] PlannerError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("node {node_id} unreachable: {reason}")]
    NodeUnreachable { node_id: String, reason: String },

    #[error("stage call to node {node_id} timed out after {after_ms} ms")]
    Timeout { node_id: String, after_ms: u64 },

    #[error("stage {stage_index} on node {node_id} failed: {message}")]
    Stage {
        stage_index: usize,
        node_id: String,
        message: String,
    },

    #[error("execution error: {0}")]
    Execution(String),

    #[error("at capacity: {0}")]
    Capacity(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("hardware probe failed: {0}")]
    Probe(String),
}

impl From<TypesError> for PipelineError {
    fn from(e: TypesError) -> Self {
        match e {
            TypesError::ProtocolViolation(msg) => Self::Protocol(msg),
            other => Self::Execution(other.to_string()),
        }
    }
}

impl PipelineError {
    /// Translate a transport failure on a call to `node_id`.
    pub fn from_net(node_id: &str, e: NetError) -> Self {
        match e {
            NetError::Timeout { after_ms, .. } => Self::Timeout {
                node_id: node_id.to_string(),
                after_ms,
            },
            NetError::Unreachable { reason, .. } => Self::NodeUnreachable {
                node_id: node_id.to_string(),
                reason,
            },
            NetError::Closed => Self::NodeUnreachable {
                node_id: node_id.to_string(),
                reason: "connection closed".into(),
            },
            other => Self::Network(other.to_string()),
        }
    }

    /// Failures that make a node unfit for future planning.
    pub fn is_node_health_event(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::NodeUnreachable { .. })
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
