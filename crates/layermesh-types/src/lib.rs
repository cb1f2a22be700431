//! Shared data model for layermesh.
//!
//! Everything that crosses a crate or process boundary lives here: the
//! hardware model the matcher and planner reason about, per-layer metrics
//! records, partition plans, the stage protocol messages and the runtime
//! configuration structs.

pub mod config;
pub mod error;
pub mod hardware;
pub mod metrics;
pub mod plan;
pub mod protocol;

pub use error::{Result, TypesError};
pub use hardware::{
    DeviceSummary, DeviceType, HardwareCapability, LayerRequirement, NodeDescriptor, VirtualNode,
};
pub use metrics::{LayerCost, LayerMetrics, LayerSummary, TensorValue};
pub use plan::{BottleneckReason, PartitionPlan, PartitionStrategy, PlanSummary, Stage};
pub use protocol::{Request, Response, TensorData};

/// Version string reported by `Ping` and `Health`.
pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");
