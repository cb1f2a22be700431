// Hardware model shared by the matcher, the planner and the node runtime.
//
// `HardwareCapability` is the matcher's per-device record, `VirtualNode` is
// the planner's view of a host, and `NodeDescriptor` is what a node sends
// over the wire when it registers or is listed in a planning request.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};

// ── Device Type ──────────────────────────────────────────────────────────────

/// Class of compute device behind a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "cpu")]
    Cpu,
    #[serde(rename = "gpu", alias = "cuda")]
    Gpu,
    #[serde(rename = "igpu", alias = "cuda_integrated")]
    IntegratedGpu,
}

impl DeviceType {
    pub const ALL: [DeviceType; 3] = [Self::Cpu, Self::Gpu, Self::IntegratedGpu];

    /// Planner ordering: discrete GPU before integrated GPU before CPU.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Gpu => 3,
            Self::IntegratedGpu => 2,
            Self::Cpu => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::IntegratedGpu => "igpu",
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Self::Gpu | Self::IntegratedGpu)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" | "cuda" => Ok(Self::Gpu),
            "igpu" | "cuda_integrated" => Ok(Self::IntegratedGpu),
            other => Err(TypesError::UnknownDeviceType(other.to_string())),
        }
    }
}

// ── Hardware Capability ──────────────────────────────────────────────────────

/// Fitness and cost profile of one registered compute device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareCapability {
    pub device_id: String,
    pub device_type: DeviceType,
    pub device_name: String,
    /// Relative throughput; always > 0.
    pub compute_score: f64,
    pub memory_gb: f64,
    /// Never exceeds `memory_gb`.
    pub available_memory_gb: f64,
    pub has_fp16: bool,
    pub has_int8: bool,
    pub network_bandwidth_mbps: f64,
    pub latency_to_coordinator_ms: f64,
    /// Utilisation in `[0, 1)`. A value of 1.0 marks the device saturated.
    pub current_load: f64,
}

impl HardwareCapability {
    pub fn new(device_id: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            device_id: device_id.into(),
            device_type,
            device_name: "unknown".into(),
            compute_score: 1.0,
            memory_gb: 0.0,
            available_memory_gb: 0.0,
            has_fp16: false,
            has_int8: false,
            network_bandwidth_mbps: 1000.0,
            latency_to_coordinator_ms: 1.0,
            current_load: 0.0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn with_compute_score(mut self, score: f64) -> Self {
        self.compute_score = score;
        self
    }

    /// Set total and available memory. Available is clamped to total.
    pub fn with_memory(mut self, total_gb: f64, available_gb: f64) -> Self {
        self.memory_gb = total_gb.max(0.0);
        self.available_memory_gb = available_gb.clamp(0.0, self.memory_gb);
        self
    }

    pub fn with_fp16(mut self, has_fp16: bool) -> Self {
        self.has_fp16 = has_fp16;
        self
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.current_load = load;
        self
    }

    /// Both conditions are hard prerequisites: enough free memory, and fp16
    /// support when the layer demands it.
    pub fn is_suitable_for_layer(&self, requirement: &LayerRequirement) -> bool {
        if self.available_memory_gb < requirement.memory_gb {
            return false;
        }
        !requirement.requires_fp16 || self.has_fp16
    }

    pub fn is_saturated(&self) -> bool {
        self.current_load >= 1.0
    }

    /// `baseline_ms / (compute_score * (1 - current_load))`.
    pub fn estimate_execution_time(&self, baseline_ms: f64) -> Result<f64> {
        if self.is_saturated() {
            return Err(TypesError::Saturated {
                device_id: self.device_id.clone(),
                load: self.current_load,
            });
        }
        let effective = self.compute_score * (1.0 - self.current_load);
        if effective <= 0.0 {
            return Err(TypesError::Saturated {
                device_id: self.device_id.clone(),
                load: self.current_load,
            });
        }
        Ok(baseline_ms / effective)
    }

    /// Memory left after placing `requirement` here.
    pub fn headroom_gb(&self, requirement: &LayerRequirement) -> f64 {
        self.available_memory_gb - requirement.memory_gb
    }
}

// ── Device Summary ───────────────────────────────────────────────────────────

/// Aggregate view of a device registry for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub total_devices: usize,
    pub by_type: BTreeMap<String, usize>,
    pub total_memory_gb: f64,
    pub available_memory_gb: f64,
    pub avg_compute_score: f64,
}

// ── Layer Requirement ────────────────────────────────────────────────────────

/// Resource demand of one unit of work to be placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRequirement {
    pub layer_name: String,
    pub layer_type: String,
    /// Peak footprint.
    pub memory_gb: f64,
    pub compute_millions: f64,
    pub precision: String,
    pub requires_fp16: bool,
    pub is_latency_sensitive: bool,
}

impl LayerRequirement {
    pub fn new(
        layer_name: impl Into<String>,
        layer_type: impl Into<String>,
        memory_gb: f64,
        compute_millions: f64,
    ) -> Self {
        Self {
            layer_name: layer_name.into(),
            layer_type: layer_type.into(),
            memory_gb,
            compute_millions,
            precision: "fp32".into(),
            requires_fp16: false,
            is_latency_sensitive: false,
        }
    }

    pub fn requiring_fp16(mut self) -> Self {
        self.requires_fp16 = true;
        self.precision = "fp16".into();
        self
    }
}

// ── Virtual Node ─────────────────────────────────────────────────────────────

/// The planner's view of one host in the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualNode {
    pub node_id: String,
    pub device_type: DeviceType,
    pub compute_score: f64,
    pub vram_gb: f64,
    pub ram_gb: f64,
    pub memory_bandwidth_gbs: f64,
    /// Round trip to the coordinator.
    pub network_latency_ms: f64,
    pub bandwidth_mbps: f64,
    pub supports_fp16: bool,
    pub current_utilization: f64,
    /// `host:port` of the node's stage endpoint. `None` for the local node.
    pub address: Option<String>,
}

impl VirtualNode {
    pub fn new(node_id: impl Into<String>, device_type: DeviceType, compute_score: f64) -> Self {
        Self {
            node_id: node_id.into(),
            device_type,
            compute_score,
            vram_gb: 0.0,
            ram_gb: 0.0,
            memory_bandwidth_gbs: 100.0,
            network_latency_ms: 0.5,
            bandwidth_mbps: 10_000.0,
            supports_fp16: device_type.is_gpu(),
            current_utilization: 0.0,
            address: None,
        }
    }

    pub fn with_vram(mut self, gb: f64) -> Self {
        self.vram_gb = gb.max(0.0);
        self
    }

    pub fn with_ram(mut self, gb: f64) -> Self {
        self.ram_gb = gb.max(0.0);
        self
    }

    pub fn with_network(mut self, latency_ms: f64, bandwidth_mbps: f64) -> Self {
        self.network_latency_ms = latency_ms;
        self.bandwidth_mbps = bandwidth_mbps;
        self
    }

    pub fn with_utilization(mut self, utilization: f64) -> Self {
        self.current_utilization = utilization;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Memory the node's stages execute in: VRAM on GPUs, RAM on CPUs,
    /// falling back to the other pool when the preferred one is unreported.
    pub fn memory_capacity_gb(&self) -> f64 {
        let (preferred, fallback) = if self.device_type.is_gpu() {
            (self.vram_gb, self.ram_gb)
        } else {
            (self.ram_gb, self.vram_gb)
        };
        if preferred > 0.0 {
            preferred
        } else {
            fallback
        }
    }

    pub fn available_memory_gb(&self) -> f64 {
        self.memory_capacity_gb() * (1.0 - self.current_utilization).max(0.0)
    }

    pub fn can_fit(&self, memory_mb: f64) -> bool {
        memory_mb / 1024.0 <= self.available_memory_gb()
    }

    pub fn is_saturated(&self) -> bool {
        self.current_utilization >= 1.0
    }

    /// Matcher record for this node.
    pub fn to_capability(&self) -> HardwareCapability {
        let mut cap = HardwareCapability::new(self.node_id.clone(), self.device_type)
            .with_compute_score(self.compute_score)
            .with_memory(self.memory_capacity_gb(), self.available_memory_gb())
            .with_fp16(self.supports_fp16)
            .with_load(self.current_utilization);
        cap.device_name = self.node_id.clone();
        cap.network_bandwidth_mbps = self.bandwidth_mbps;
        cap.latency_to_coordinator_ms = self.network_latency_ms;
        cap
    }
}

// ── Node Descriptor ──────────────────────────────────────────────────────────

fn default_network_latency_ms() -> f64 {
    0.5
}

/// Node description carried by registration and planning requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub device_type: DeviceType,
    pub compute_score: f64,
    #[serde(default)]
    pub vram_gb: Option<f64>,
    #[serde(default)]
    pub ram_gb: Option<f64>,
    #[serde(default = "default_network_latency_ms")]
    pub network_latency_ms: f64,
    #[serde(default)]
    pub bandwidth_mbps: Option<f64>,
    #[serde(default)]
    pub supports_fp16: Option<bool>,
    /// `host:port` of the node's stage endpoint.
    pub address: String,
}

impl NodeDescriptor {
    /// Reject descriptors the planner cannot reason about.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(TypesError::InvalidDescriptor("empty node_id".into()));
        }
        if !(self.compute_score > 0.0) {
            return Err(TypesError::InvalidDescriptor(format!(
                "node {}: compute_score must be positive, got {}",
                self.node_id, self.compute_score
            )));
        }
        if self.vram_gb.unwrap_or(0.0) <= 0.0 && self.ram_gb.unwrap_or(0.0) <= 0.0 {
            return Err(TypesError::InvalidDescriptor(format!(
                "node {}: no memory reported",
                self.node_id
            )));
        }
        Ok(())
    }

    pub fn to_virtual_node(&self) -> VirtualNode {
        let mut node = VirtualNode::new(self.node_id.clone(), self.device_type, self.compute_score)
            .with_vram(self.vram_gb.unwrap_or(0.0))
            .with_ram(self.ram_gb.unwrap_or(0.0))
            .with_address(self.address.clone());
        node.network_latency_ms = self.network_latency_ms;
        if let Some(bw) = self.bandwidth_mbps {
            node.bandwidth_mbps = bw;
        }
        if let Some(fp16) = self.supports_fp16 {
            node.supports_fp16 = fp16;
        }
        node
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_time_scales_with_score_and_load() {
        let mut cap = HardwareCapability::new("test", DeviceType::Gpu).with_compute_score(2.0);
        assert_eq!(cap.estimate_execution_time(100.0).unwrap(), 50.0);

        cap.current_load = 0.5;
        assert_eq!(cap.estimate_execution_time(100.0).unwrap(), 100.0);
    }

    #[test]
    fn saturated_device_is_an_error() {
        let cap = HardwareCapability::new("busy", DeviceType::Cpu).with_load(1.0);
        let err = cap.estimate_execution_time(10.0).unwrap_err();
        assert!(matches!(err, TypesError::Saturated { .. }));
    }

    #[test]
    fn suitability_requires_memory_and_fp16() {
        let mut cap = HardwareCapability::new("test", DeviceType::Gpu).with_memory(8.0, 6.0);

        assert!(cap.is_suitable_for_layer(&LayerRequirement::new("a", "Linear", 1.0, 10.0)));
        assert!(!cap.is_suitable_for_layer(&LayerRequirement::new("b", "Linear", 10.0, 10.0)));

        let fp16 = LayerRequirement::new("c", "Linear", 1.0, 10.0).requiring_fp16();
        assert!(!cap.is_suitable_for_layer(&fp16));
        cap.has_fp16 = true;
        assert!(cap.is_suitable_for_layer(&fp16));
    }

    #[test]
    fn available_memory_clamped_to_total() {
        let cap = HardwareCapability::new("x", DeviceType::Cpu).with_memory(4.0, 9.0);
        assert_eq!(cap.available_memory_gb, 4.0);
    }

    #[test]
    fn requirement_defaults_to_fp32() {
        let req = LayerRequirement::new("test_layer", "Linear", 2.0, 1000.0);
        assert_eq!(req.precision, "fp32");
        assert!(!req.requires_fp16);
    }

    #[test]
    fn node_capacity_prefers_device_pool() {
        let gpu = VirtualNode::new("g", DeviceType::Gpu, 100.0).with_vram(24.0).with_ram(64.0);
        assert_eq!(gpu.memory_capacity_gb(), 24.0);

        let cpu = VirtualNode::new("c", DeviceType::Cpu, 10.0).with_ram(64.0);
        assert_eq!(cpu.memory_capacity_gb(), 64.0);

        let igpu_ram_only = VirtualNode::new("i", DeviceType::IntegratedGpu, 25.0).with_ram(6.0);
        assert_eq!(igpu_ram_only.memory_capacity_gb(), 6.0);
    }

    #[test]
    fn utilization_shrinks_available_memory() {
        let node = VirtualNode::new("g", DeviceType::Gpu, 100.0)
            .with_vram(10.0)
            .with_utilization(0.5);
        assert_eq!(node.available_memory_gb(), 5.0);
        assert!(node.can_fit(5.0 * 1024.0));
        assert!(!node.can_fit(5.5 * 1024.0));
    }

    #[test]
    fn device_type_parsing() {
        assert_eq!("GPU".parse::<DeviceType>().unwrap(), DeviceType::Gpu);
        assert_eq!("cuda_integrated".parse::<DeviceType>().unwrap(), DeviceType::IntegratedGpu);
        assert!("tpu".parse::<DeviceType>().is_err());
    }

    #[test]
    fn descriptor_json_rejects_unknown_fields() {
        let json = r#"{"node_id":"n","device_type":"cpu","compute_score":1.0,
                       "ram_gb":8.0,"address":"127.0.0.1:1","colour":"red"}"#;
        assert!(serde_json::from_str::<NodeDescriptor>(json).is_err());
    }

    #[test]
    fn descriptor_to_virtual_node() {
        let json = r#"{"node_id":"gpu-1","device_type":"gpu","compute_score":100.0,
                       "vram_gb":24.0,"address":"10.0.0.2:8082"}"#;
        let desc: NodeDescriptor = serde_json::from_str(json).unwrap();
        desc.validate().unwrap();
        let node = desc.to_virtual_node();
        assert_eq!(node.memory_capacity_gb(), 24.0);
        assert_eq!(node.network_latency_ms, 0.5);
        assert_eq!(node.address.as_deref(), Some("10.0.0.2:8082"));
    }

    #[test]
    fn descriptor_without_memory_is_invalid() {
        let desc = NodeDescriptor {
            node_id: "n".into(),
            device_type: DeviceType::Cpu,
            compute_score: 1.0,
            vram_gb: None,
            ram_gb: None,
            network_latency_ms: 0.5,
            bandwidth_mbps: None,
            supports_fp16: None,
            address: "127.0.0.1:1".into(),
        };
        assert!(desc.validate().is_err());
    }
}
