use layermesh_types::TypesError;

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("plan infeasible: {0}")]
    Infeasible(String),

    #[error("no layer costs to plan with")]
    NoLayers,

    #[error("no nodes available for planning")]
    NoNodes,

    #[error("device {device_id} is saturated (load {load:.2})")]
    Saturated { device_id: String, load: f64 },

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("metrics I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TypesError> for PlannerError {
    fn from(e: TypesError) -> Self {
        match e {
            TypesError::Saturated { device_id, load } => Self::Saturated { device_id, load },
            TypesError::InvalidPlan(msg) => Self::InvalidPlan(msg),
            other => Self::InvalidPlan(other.to_string()),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PlannerError>;
