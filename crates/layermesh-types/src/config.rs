// Runtime configuration. Every struct has a usable `Default` and can be
// loaded partially from JSON; missing fields keep their defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hardware::DeviceType;
use crate::plan::PartitionStrategy;

// ── Matcher ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Weight of the normalized latency score under `balanced`.
    pub latency_weight: f64,
    /// Weight of the normalized memory-headroom score under `balanced`.
    pub memory_weight: f64,
    /// Converts `compute_millions` into a baseline time on a score-1 device.
    /// Default: 10 units per ms.
    pub compute_units_per_ms: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            latency_weight: 0.5,
            memory_weight: 0.5,
            compute_units_per_ms: 10.0,
        }
    }
}

// ── Planner ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Compute score of the device the layer costs were measured on.
    pub reference_compute_score: f64,
    /// Upper bound on the number of stages in a plan.
    pub max_stages: usize,
    /// Activation hand-off size used for transfer estimates.
    pub activation_size_mb: f64,
    /// Stage memory utilisation at or above which a bottleneck is memory-bound.
    pub memory_pressure_threshold: f64,
    /// Stage memory utilisation below which a stage is reported as
    /// underutilising its node.
    pub underutilization_threshold: f64,
    /// Load-balance score below which an imbalance note is emitted.
    pub imbalance_threshold: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            reference_compute_score: 100.0,
            max_stages: 8,
            activation_size_mb: 4.0,
            memory_pressure_threshold: 0.9,
            underutilization_threshold: 0.25,
            imbalance_threshold: 0.7,
        }
    }
}

// ── Network ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Deadline for one remote call (connect, send, receive).
    /// Default: 5000 ms.
    pub call_timeout_ms: u64,
    /// Reject any frame larger than this. Default: 128 MiB.
    pub max_frame_bytes: usize,
    /// Extra attempts after a connection failure. Timeouts are never retried.
    pub max_retries: u32,
    /// Back-off before the first retry; doubles per attempt.
    pub retry_backoff_ms: u64,
}

impl NetConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            max_frame_bytes: 128 * 1024 * 1024,
            max_retries: 2,
            retry_backoff_ms: 100,
        }
    }
}

// ── Local Node ───────────────────────────────────────────────────────────────

/// Self-description used when hardware probing is disabled or overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalNodeConfig {
    pub node_id: String,
    /// `None` probes the host.
    pub device_type: Option<DeviceType>,
    pub compute_score: Option<f64>,
    pub memory_gb: Option<f64>,
    pub has_fp16: Option<bool>,
    pub bandwidth_mbps: f64,
}

impl Default for LocalNodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            device_type: None,
            compute_score: None,
            memory_gb: None,
            has_fp16: None,
            bandwidth_mbps: 1_000.0,
        }
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub listen_addr: String,
    pub node: LocalNodeConfig,
    /// Run locally assigned stages in-process and offer this host to the
    /// planner.
    pub participate: bool,
    pub model_name: String,
    pub default_strategy: PartitionStrategy,
    /// JSONL profile to plan with. `None` uses the synthetic demo profile.
    pub profile_path: Option<PathBuf>,
    /// Expected seconds between worker heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Missed intervals before a worker is marked unhealthy.
    pub heartbeat_timeout_factor: u32,
    /// Sessions idle longer than this are closed.
    pub session_timeout_secs: u64,
    /// Central metrics records kept in memory.
    pub max_metrics_records: usize,
    pub net: NetConfig,
    pub planner: PlannerConfig,
    pub matcher: MatcherConfig,
}

impl CoordinatorConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8081".into(),
            node: LocalNodeConfig {
                node_id: "coordinator".into(),
                ..LocalNodeConfig::default()
            },
            participate: true,
            model_name: "model".into(),
            default_strategy: PartitionStrategy::Balanced,
            profile_path: None,
            heartbeat_interval_secs: 5,
            heartbeat_timeout_factor: 3,
            session_timeout_secs: 300,
            max_metrics_records: 10_000,
            net: NetConfig::default(),
            planner: PlannerConfig::default(),
            matcher: MatcherConfig::default(),
        }
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub listen_addr: String,
    /// Address the coordinator should dial. Defaults to `listen_addr`.
    pub advertise_addr: Option<String>,
    /// Coordinator to register with and push metrics to.
    pub coordinator_addr: Option<String>,
    pub node: LocalNodeConfig,
    pub max_concurrent_sessions: u32,
    pub heartbeat_interval_secs: u64,
    /// Sessions without a forward or close for this long are dropped, so a
    /// vanished coordinator cannot hold capacity forever.
    pub session_timeout_secs: u64,
    pub push_metrics: bool,
    pub net: NetConfig,
}

impl WorkerConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8082".into(),
            advertise_addr: None,
            coordinator_addr: None,
            node: LocalNodeConfig {
                node_id: "worker".into(),
                ..LocalNodeConfig::default()
            },
            max_concurrent_sessions: 10,
            heartbeat_interval_secs: 5,
            session_timeout_secs: 300,
            push_metrics: true,
            net: NetConfig::default(),
        }
    }
}
