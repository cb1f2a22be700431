// Stage protocol: every message a coordinator or worker sends or accepts.
//
// Requests and responses are explicit tagged enums, one variant per
// operation. JSON-facing bodies reject unknown fields. Activations travel as
// `TensorData`, whose byte count is checked against its shape and dtype on
// arrival.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};
use crate::hardware::{DeviceSummary, DeviceType, NodeDescriptor};
use crate::metrics::LayerCost;
use crate::plan::{PartitionPlan, PartitionStrategy, PlanSummary};

// ── Tensor Dtype ─────────────────────────────────────────────────────────────

/// Element type of an activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TensorDtype {
    #[serde(rename = "f16", alias = "float16")]
    F16,
    #[serde(rename = "bf16", alias = "bfloat16")]
    BF16,
    #[default]
    #[serde(rename = "f32", alias = "float32")]
    F32,
    #[serde(rename = "i32", alias = "int32")]
    I32,
    #[serde(rename = "i64", alias = "int64")]
    I64,
    #[serde(rename = "u8", alias = "uint8")]
    U8,
}

impl TensorDtype {
    /// Bytes per element for this dtype.
    pub fn element_bytes(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::F16 | Self::BF16 => 2,
            Self::F32 | Self::I32 => 4,
            Self::I64 => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "f16" | "float16" | "fp16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::BF16),
            "f32" | "float32" | "fp32" => Ok(Self::F32),
            "i32" | "int32" => Ok(Self::I32),
            "i64" | "int64" => Ok(Self::I64),
            "u8" | "uint8" => Ok(Self::U8),
            other => Err(TypesError::UnsupportedDtype(other.to_string())),
        }
    }
}

impl fmt::Display for TensorDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Tensor Data ──────────────────────────────────────────────────────────────

/// Activation payload handed between stages.
///
/// `num_bytes` must equal `data.len()`, and `data.len()` must equal
/// `product(shape) * dtype.element_bytes()`. Anything else is a protocol
/// violation. An empty shape denotes a scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TensorData {
    pub dtype: TensorDtype,
    pub shape: Vec<u32>,
    pub data: Vec<u8>,
    pub num_bytes: u64,
}

impl TensorData {
    pub fn new(dtype: TensorDtype, shape: Vec<u32>, data: Vec<u8>) -> Self {
        let num_bytes = data.len() as u64;
        Self {
            dtype,
            shape,
            data,
            num_bytes,
        }
    }

    /// Little-endian f32 payload.
    pub fn from_f32(shape: Vec<u32>, values: &[f32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(TensorDtype::F32, shape, data)
    }

    pub fn to_f32(&self) -> Result<Vec<f32>> {
        if self.dtype != TensorDtype::F32 {
            return Err(TypesError::UnsupportedDtype(format!(
                "expected f32 payload, got {}",
                self.dtype
            )));
        }
        self.validate()?;
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn num_elements(&self) -> u64 {
        self.shape.iter().map(|&d| d as u64).product()
    }

    pub fn size_mb(&self) -> f64 {
        self.data.len() as f64 / (1024.0 * 1024.0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_bytes != self.data.len() as u64 {
            return Err(TypesError::ProtocolViolation(format!(
                "num_bytes {} does not match payload length {}",
                self.num_bytes,
                self.data.len()
            )));
        }
        let expected = self
            .num_elements()
            .checked_mul(self.dtype.element_bytes() as u64)
            .ok_or_else(|| TypesError::ProtocolViolation("tensor shape overflows".into()))?;
        if expected != self.num_bytes {
            return Err(TypesError::ProtocolViolation(format!(
                "shape {:?} of {} needs {expected} bytes, payload has {}",
                self.shape, self.dtype, self.num_bytes
            )));
        }
        Ok(())
    }
}

// ── Shared Records ───────────────────────────────────────────────────────────

/// Per-stage execution report returned with every forward call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionMetadata {
    pub forward_latency_ms: f64,
    pub transfer_latency_ms: f64,
    pub peak_memory_mb: f64,
    pub device: String,
    pub stage_index: u32,
}

/// Stage a session is bound to on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub stage_id: String,
    pub stage_index: u32,
    pub device: String,
    #[serde(default)]
    pub enable_kv_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareInfo {
    pub device_type: DeviceType,
    pub device_name: String,
    pub total_memory_gb: f64,
    pub compute_capability: String,
    pub network_bandwidth_mbps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeInfo {
    pub node_id: String,
    pub device_type: DeviceType,
    pub available_memory_gb: f64,
    /// `active_sessions / max_concurrent_sessions`.
    pub load_factor: f64,
    pub node_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Coordinator,
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinator => f.write_str("coordinator"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

// ── Session Operations ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSessionRequest {
    /// Empty asks the coordinator to generate one.
    pub session_id: String,
    pub stage_config: StageConfig,
    pub layer_names: Vec<String>,
    pub max_sequence_length: u32,
    pub dtype: TensorDtype,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSessionResponse {
    pub success: bool,
    pub session_id: String,
    pub error_message: Option<String>,
    pub node_info: NodeInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteForwardRequest {
    pub session_id: String,
    pub token_index: u64,
    pub input_activations: TensorData,
    /// Stages to run. Empty means every stage bound to the session.
    #[serde(default)]
    pub stage_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteForwardResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub output_activations: Option<TensorData>,
    pub metadata: ExecutionMetadata,
}

impl ExecuteForwardResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            output_activations: None,
            metadata: ExecutionMetadata::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloseSessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloseSessionResponse {
    pub success: bool,
    pub error_message: Option<String>,
}

// ── Liveness and Capabilities ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PingRequest {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PingResponse {
    pub message: String,
    /// RFC 3339.
    pub timestamp: String,
    pub node_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilitiesRequest {
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilitiesResponse {
    pub node_id: String,
    pub hardware: HardwareInfo,
    pub supported_dtypes: Vec<TensorDtype>,
    pub available_memory_gb: f64,
    pub bandwidth_mbps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthResponse {
    pub status: String,
    pub role: NodeRole,
    pub node_id: String,
    pub node_version: String,
    pub active_sessions: u32,
    pub registered_workers: u32,
    pub healthy_workers: u32,
    pub has_plan: bool,
    pub total_requests: u64,
    pub avg_forward_latency_ms: f64,
    /// Matcher view of the roster. Coordinator only.
    pub devices: Option<DeviceSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub active_sessions: u32,
    pub load_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatResponse {
    /// `false` tells the worker to register again.
    pub registered: bool,
}

// ── Planning and Registration ────────────────────────────────────────────────

fn default_activate() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanningRequest {
    pub model_name: String,
    #[serde(default)]
    pub strategy: PartitionStrategy,
    /// Empty plans over the coordinator's healthy registered nodes.
    #[serde(default)]
    pub nodes: Vec<NodeDescriptor>,
    /// Layer costs to plan with. `None` uses the coordinator's loaded profile.
    #[serde(default)]
    pub layers: Option<Vec<LayerCost>>,
    /// Install the result as the coordinator's active plan.
    #[serde(default = "default_activate")]
    pub activate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanningResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub plan: Option<PartitionPlan>,
    pub summary: Option<PlanSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterWorkerResponse {
    pub registration: NodeDescriptor,
    pub healthy: bool,
    pub message: String,
}

// ── Stage Forwarding ─────────────────────────────────────────────────────────

/// Sessionless single-stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageForwardRequest {
    pub session_id: String,
    pub token_index: u64,
    pub stage_id: u32,
    pub activations: TensorData,
    /// Where to push the resulting `ExecutionMetadata`, if anywhere.
    #[serde(default)]
    pub metrics_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagePerformance {
    pub forward_latency_ms: f64,
    pub peak_memory_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageForwardResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub output_activations: Option<TensorData>,
    pub performance: StagePerformance,
}

// ── Central Metrics ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsSubmission {
    /// Reporting node.
    pub source: String,
    pub session_id: Option<String>,
    pub token_index: Option<u64>,
    pub metadata: ExecutionMetadata,
    /// RFC 3339, set by the sender.
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsQuery {
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsReport {
    pub total_records: u64,
    pub filtered_records: u64,
    pub by_source: BTreeMap<String, u64>,
    pub average_latency_ms: f64,
    /// Up to the ten most recent matching records, oldest first.
    pub recent: Vec<MetricsSubmission>,
}

// ── Envelopes ────────────────────────────────────────────────────────────────

/// Every operation a node accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    CreateSession(CreateSessionRequest),
    ExecuteForward(ExecuteForwardRequest),
    CloseSession(CloseSessionRequest),
    Ping(PingRequest),
    ReportCapabilities(CapabilitiesRequest),
    Health,
    GeneratePlan(PlanningRequest),
    RegisterWorker(NodeDescriptor),
    StageForward(StageForwardRequest),
    SubmitMetrics(MetricsSubmission),
    QueryMetrics(MetricsQuery),
    Heartbeat(HeartbeatRequest),
}

impl Request {
    /// Operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateSession(_) => "create_session",
            Self::ExecuteForward(_) => "execute_forward",
            Self::CloseSession(_) => "close_session",
            Self::Ping(_) => "ping",
            Self::ReportCapabilities(_) => "report_capabilities",
            Self::Health => "health",
            Self::GeneratePlan(_) => "generate_plan",
            Self::RegisterWorker(_) => "register_worker",
            Self::StageForward(_) => "stage_forward",
            Self::SubmitMetrics(_) => "submit_metrics",
            Self::QueryMetrics(_) => "query_metrics",
            Self::Heartbeat(_) => "heartbeat",
        }
    }
}

/// One response per request variant, plus a generic error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    CreateSession(CreateSessionResponse),
    ExecuteForward(ExecuteForwardResponse),
    CloseSession(CloseSessionResponse),
    Ping(PingResponse),
    Capabilities(CapabilitiesResponse),
    Health(HealthResponse),
    Plan(PlanningResponse),
    WorkerRegistered(RegisterWorkerResponse),
    StageForward(StageForwardResponse),
    MetricsAccepted { total_records: u64 },
    Metrics(MetricsReport),
    Heartbeat(HeartbeatResponse),
    /// The request was malformed or not supported by this node.
    Error { message: String },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_round_trip_preserves_shape_and_length() {
        let values: Vec<f32> = (0..24).map(|i| i as f32 * 0.5).collect();
        let tensor = TensorData::from_f32(vec![2, 3, 4], &values);
        assert_eq!(tensor.num_bytes, tensor.data.len() as u64);
        tensor.validate().unwrap();

        let json = serde_json::to_string(&tensor).unwrap();
        let back: TensorData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.shape, vec![2, 3, 4]);
        assert_eq!(back.num_bytes, back.data.len() as u64);
        assert_eq!(back.to_f32().unwrap(), values);
    }

    #[test]
    fn byte_count_mismatch_is_violation() {
        let mut tensor = TensorData::from_f32(vec![4], &[1.0, 2.0, 3.0, 4.0]);
        tensor.num_bytes = 12;
        assert!(matches!(tensor.validate(), Err(TypesError::ProtocolViolation(_))));
    }

    #[test]
    fn shape_mismatch_is_violation() {
        let tensor = TensorData::new(TensorDtype::F32, vec![3], vec![0u8; 8]);
        assert!(matches!(tensor.validate(), Err(TypesError::ProtocolViolation(_))));
    }

    #[test]
    fn scalar_tensor_has_one_element() {
        let tensor = TensorData::new(TensorDtype::I64, vec![], vec![0u8; 8]);
        assert_eq!(tensor.num_elements(), 1);
        tensor.validate().unwrap();
    }

    #[test]
    fn to_f32_rejects_other_dtypes() {
        let tensor = TensorData::new(TensorDtype::U8, vec![2], vec![1, 2]);
        assert!(tensor.to_f32().is_err());
    }

    #[test]
    fn dtype_parse_accepts_common_spellings() {
        assert_eq!(TensorDtype::parse("float16").unwrap(), TensorDtype::F16);
        assert_eq!(TensorDtype::parse("FP32").unwrap(), TensorDtype::F32);
        assert!(TensorDtype::parse("complex64").is_err());
    }

    #[test]
    fn planning_request_defaults() {
        let req: PlanningRequest = serde_json::from_str(r#"{"model_name":"gpt2"}"#).unwrap();
        assert_eq!(req.strategy, PartitionStrategy::Balanced);
        assert!(req.nodes.is_empty());
        assert!(req.layers.is_none());
        assert!(req.activate);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<PlanningRequest>(r#"{"model_name":"gpt2","turbo":true}"#);
        assert!(err.is_err());
        let err = serde_json::from_str::<CloseSessionRequest>(r#"{}"#);
        assert!(err.is_err());
    }

    #[test]
    fn request_names() {
        assert_eq!(Request::Health.name(), "health");
        let ping = Request::Ping(PingRequest { message: "hi".into() });
        assert_eq!(ping.name(), "ping");
    }
}
