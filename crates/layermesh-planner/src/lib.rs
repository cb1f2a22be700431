//! `layermesh-planner` — cost model and partitioning for pipeline inference.
//!
//! Pure and synchronous: nothing here touches the network. The coordinator
//! calls into this crate whenever it needs a device choice or a new plan,
//! and a profiling run uses the metrics collector to produce the per-layer
//! costs the planner consumes.
//!
//! ```text
//!   profiling run ──▶ MetricsCollector ──▶ Vec<LayerCost>
//!                                              │
//!   node roster ──▶ CapabilityMatcher          ▼
//!        │                            ExecutionPlanner ──▶ PartitionPlan
//!        └────────────────────────────────────┘
//! ```

pub mod error;
pub mod matcher;
pub mod metrics;
pub mod planner;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use error::{PlannerError, Result};
pub use matcher::{Assignment, CapabilityMatcher, DeviceSummary};
pub use metrics::{synthetic_layer_costs, MemorySampler, MemorySnapshot, MetricsCollector, ProcMemory};
pub use planner::{load_plan, save_plan, ExecutionPlanner};
