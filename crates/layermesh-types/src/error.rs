// Errors raised by the shared data model.

#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    // ── Wire payloads ─────────────────────────────────────────────────────

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),

    // ── Hardware model ────────────────────────────────────────────────────

    #[error("device {device_id} is saturated (load {load:.2})")]
    Saturated { device_id: String, load: f64 },

    #[error("unknown device type: {0}")]
    UnknownDeviceType(String),

    #[error("invalid node descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("unknown partition strategy: {0}")]
    UnknownStrategy(String),

    // ── Plans ─────────────────────────────────────────────────────────────

    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

pub type Result<T> = std::result::Result<T, TypesError>;
