//! `layermesh-pipeline` — coordinator and worker runtime.
//!
//! This crate runs plans, it does not do layer math. Activations go through
//! a pluggable [`ComputeEngine`]; the coordinator decides which node runs
//! which stage and moves activations between them over the stage protocol.
//!
//! # Architecture
//!
//! ```text
//!  client ──ExecuteForward──▶ Coordinator
//!                               │  session lock (token order)
//!                               ▼
//!              ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!              │   Stage 0   │────▶│   Stage 1   │────▶│   Stage 2   │
//!              │  embedded   │     │  Worker B   │     │  Worker C   │
//!              │   worker    │     │  (remote)   │     │  (remote)   │
//!              └─────────────┘     └─────────────┘     └─────────────┘
//!                                        │ metadata push
//!                                        ▼
//!                                 central metrics
//! ```

pub mod central;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod probe;
pub mod registry;
pub mod session;
pub mod worker;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use central::CentralMetrics;
pub use coordinator::Coordinator;
pub use engine::{ComputeEngine, PassthroughEngine};
pub use error::{PipelineError, Result};
pub use heartbeat::HeartbeatMonitor;
pub use probe::{HardwareProbe, HostMemory, StaticProbe, SystemProbe};
pub use registry::{NodeRegistry, RegisteredNode};
pub use session::{Session, SessionHandle, SessionState, SessionTable};
pub use worker::{capabilities_response, descriptor_for, ForwardStats, StageWorker};
