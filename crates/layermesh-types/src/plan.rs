// Partition plans: the planner's output and the coordinator's routing table.

use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};
use crate::hardware::VirtualNode;

// ── Strategy ─────────────────────────────────────────────────────────────────

/// Objective used by both the matcher and the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PartitionStrategy {
    #[default]
    #[serde(rename = "balanced")]
    Balanced,
    #[serde(rename = "latency", alias = "latency_optimized")]
    Latency,
    #[serde(rename = "memory", alias = "memory_aware")]
    Memory,
}

impl PartitionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Latency => "latency",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionStrategy {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "balanced" => Ok(Self::Balanced),
            "latency" | "latency_optimized" => Ok(Self::Latency),
            "memory" | "memory_aware" => Ok(Self::Memory),
            other => Err(TypesError::UnknownStrategy(other.to_string())),
        }
    }
}

// ── Bottleneck ───────────────────────────────────────────────────────────────

/// Why the slowest stage is slow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckReason {
    ComputeBound,
    MemoryBound,
    NetworkBound,
}

impl fmt::Display for BottleneckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ComputeBound => "compute-bound",
            Self::MemoryBound => "memory-bound",
            Self::NetworkBound => "network-bound",
        };
        f.write_str(s)
    }
}

// ── Stage ────────────────────────────────────────────────────────────────────

/// A contiguous block of layers assigned to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub stage_id: usize,
    pub node: VirtualNode,
    pub layers: Vec<String>,
    /// Estimated compute time on `node`.
    pub expected_latency_ms: f64,
    /// Estimated activation hand-off into this stage. Zero for the first stage.
    pub transfer_latency_ms: f64,
    pub memory_required_mb: f64,
    pub num_parameters: u64,
    pub rationale: String,
}

impl Stage {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn total_latency_ms(&self) -> f64 {
        self.expected_latency_ms + self.transfer_latency_ms
    }

    /// Share of the node's available memory this stage occupies.
    pub fn memory_utilization(&self) -> f64 {
        let available_mb = self.node.available_memory_gb() * 1024.0;
        if available_mb <= 0.0 {
            return f64::INFINITY;
        }
        self.memory_required_mb / available_mb
    }
}

// ── Partition Plan ───────────────────────────────────────────────────────────

/// Ordered stages covering the whole layer sequence exactly once.
///
/// Immutable once produced; re-planning builds a new plan and swaps it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub plan_name: String,
    pub model_name: String,
    /// RFC 3339.
    pub created_at: String,
    pub strategy: PartitionStrategy,
    pub stages: Vec<Stage>,
    /// Sum of stage compute latencies.
    pub total_expected_latency_ms: f64,
    /// Sum of inter-stage transfer estimates, reported separately.
    pub total_transfer_latency_ms: f64,
    pub bottleneck_stage_id: usize,
    pub bottleneck_latency_ms: f64,
    pub bottleneck_reason: BottleneckReason,
    /// `min stage latency / max stage latency`, in `[0, 1]`.
    pub load_balance_score: f64,
    pub optimization_notes: Vec<String>,
}

/// Condensed plan description returned alongside a generated plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub plan_name: String,
    pub model_name: String,
    pub strategy: PartitionStrategy,
    pub num_stages: usize,
    pub num_layers: usize,
    pub total_expected_latency_ms: f64,
    pub total_transfer_latency_ms: f64,
    pub bottleneck_stage_id: usize,
    pub bottleneck_node_id: String,
    pub bottleneck_latency_ms: f64,
    pub bottleneck_reason: BottleneckReason,
    pub load_balance_score: f64,
    pub nodes: Vec<String>,
}

impl PartitionPlan {
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn num_layers(&self) -> usize {
        self.stages.iter().map(Stage::num_layers).sum()
    }

    /// All layer names in execution order.
    pub fn layer_sequence(&self) -> Vec<String> {
        self.stages.iter().flat_map(|s| s.layers.iter().cloned()).collect()
    }

    pub fn get_stage(&self, stage_id: usize) -> Option<&Stage> {
        self.stages.get(stage_id)
    }

    pub fn stages_on_node<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Stage> + 'a {
        self.stages.iter().filter(move |s| s.node.node_id == node_id)
    }

    pub fn bottleneck(&self) -> Option<&Stage> {
        self.stages.get(self.bottleneck_stage_id)
    }

    /// Structural checks: non-empty, consecutive stage ids, no empty stage,
    /// no duplicated layer, every stage fits its node's memory.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(TypesError::InvalidPlan("plan has no stages".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for (expected_id, stage) in self.stages.iter().enumerate() {
            if stage.stage_id != expected_id {
                return Err(TypesError::InvalidPlan(format!(
                    "expected stage id {expected_id}, got {}",
                    stage.stage_id
                )));
            }
            if stage.layers.is_empty() {
                return Err(TypesError::InvalidPlan(format!("stage {} is empty", stage.stage_id)));
            }
            for layer in &stage.layers {
                if !seen.insert(layer.as_str()) {
                    return Err(TypesError::InvalidPlan(format!(
                        "layer {layer} appears more than once"
                    )));
                }
            }
            if !stage.node.can_fit(stage.memory_required_mb) {
                return Err(TypesError::InvalidPlan(format!(
                    "stage {} needs {:.0} MB but node {} has {:.0} MB",
                    stage.stage_id,
                    stage.memory_required_mb,
                    stage.node.node_id,
                    stage.node.available_memory_gb() * 1024.0
                )));
            }
        }

        if self.bottleneck_stage_id >= self.stages.len() {
            return Err(TypesError::InvalidPlan(format!(
                "bottleneck stage {} out of range",
                self.bottleneck_stage_id
            )));
        }
        Ok(())
    }

    pub fn summary(&self) -> PlanSummary {
        let bottleneck_node_id = self
            .bottleneck()
            .map(|s| s.node.node_id.clone())
            .unwrap_or_default();
        PlanSummary {
            plan_name: self.plan_name.clone(),
            model_name: self.model_name.clone(),
            strategy: self.strategy,
            num_stages: self.num_stages(),
            num_layers: self.num_layers(),
            total_expected_latency_ms: self.total_expected_latency_ms,
            total_transfer_latency_ms: self.total_transfer_latency_ms,
            bottleneck_stage_id: self.bottleneck_stage_id,
            bottleneck_node_id,
            bottleneck_latency_ms: self.bottleneck_latency_ms,
            bottleneck_reason: self.bottleneck_reason,
            load_balance_score: self.load_balance_score,
            nodes: self.stages.iter().map(|s| s.node.node_id.clone()).collect(),
        }
    }

    /// Operator-facing table of the plan.
    pub fn visualize(&self) -> String {
        let rule = "=".repeat(78);
        let thin = "-".repeat(78);
        let mut out = String::new();

        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "Partition plan: {} ({})", self.plan_name, self.model_name);
        let _ = writeln!(
            out,
            "Strategy: {}  Stages: {}  Layers: {}",
            self.strategy,
            self.num_stages(),
            self.num_layers()
        );
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(
            out,
            "{:<6} {:<16} {:<5} {:>7} {:>11} {:>11} {:>11}",
            "stage", "node", "type", "layers", "compute ms", "xfer ms", "memory MB"
        );
        let _ = writeln!(out, "{thin}");

        for stage in &self.stages {
            let marker = if stage.stage_id == self.bottleneck_stage_id { " *" } else { "" };
            let _ = writeln!(
                out,
                "{:<6} {:<16} {:<5} {:>7} {:>11.1} {:>11.2} {:>11.0}{}",
                stage.stage_id,
                truncate(&stage.node.node_id, 16),
                stage.node.device_type,
                stage.num_layers(),
                stage.expected_latency_ms,
                stage.transfer_latency_ms,
                stage.memory_required_mb,
                marker
            );
            if let (Some(first), Some(last)) = (stage.layers.first(), stage.layers.last()) {
                let _ = writeln!(out, "       {first} .. {last}");
            }
        }

        let _ = writeln!(out, "{thin}");
        let _ = writeln!(
            out,
            "Expected latency: {:.1} ms compute + {:.2} ms transfer",
            self.total_expected_latency_ms, self.total_transfer_latency_ms
        );
        let _ = writeln!(
            out,
            "Bottleneck: stage {} ({:.1} ms, {})",
            self.bottleneck_stage_id, self.bottleneck_latency_ms, self.bottleneck_reason
        );
        let _ = writeln!(out, "Load balance: {:.2}", self.load_balance_score);
        if !self.optimization_notes.is_empty() {
            let _ = writeln!(out, "Notes:");
            for note in &self.optimization_notes {
                let _ = writeln!(out, "  - {note}");
            }
        }
        let _ = writeln!(out, "{rule}");
        out
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max - 1).chain(std::iter::once('~')).collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::DeviceType;

    fn stage(id: usize, node: &str, layers: &[&str], latency: f64) -> Stage {
        Stage {
            stage_id: id,
            node: VirtualNode::new(node, DeviceType::Gpu, 100.0).with_vram(8.0),
            layers: layers.iter().map(|s| s.to_string()).collect(),
            expected_latency_ms: latency,
            transfer_latency_ms: 0.0,
            memory_required_mb: 1024.0,
            num_parameters: 0,
            rationale: String::new(),
        }
    }

    fn plan(stages: Vec<Stage>) -> PartitionPlan {
        PartitionPlan {
            plan_name: "test".into(),
            model_name: "m".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
            strategy: PartitionStrategy::Balanced,
            total_expected_latency_ms: stages.iter().map(|s| s.expected_latency_ms).sum(),
            total_transfer_latency_ms: 0.0,
            bottleneck_stage_id: 0,
            bottleneck_latency_ms: 0.0,
            bottleneck_reason: BottleneckReason::ComputeBound,
            load_balance_score: 1.0,
            optimization_notes: vec![],
            stages,
        }
    }

    #[test]
    fn layer_sequence_concatenates_stages() {
        let p = plan(vec![stage(0, "a", &["l0", "l1"], 5.0), stage(1, "b", &["l2"], 3.0)]);
        assert_eq!(p.layer_sequence(), vec!["l0", "l1", "l2"]);
        assert_eq!(p.num_layers(), 3);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_layer() {
        let p = plan(vec![stage(0, "a", &["l0", "l1"], 5.0), stage(1, "b", &["l1"], 3.0)]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_rejects_gapped_ids_and_empty() {
        let p = plan(vec![stage(0, "a", &["l0"], 5.0), stage(2, "b", &["l1"], 3.0)]);
        assert!(p.validate().is_err());

        let p = plan(vec![]);
        assert!(p.validate().is_err());

        let p = plan(vec![stage(0, "a", &[], 5.0)]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_rejects_overcommitted_node() {
        let mut s = stage(0, "a", &["l0"], 5.0);
        s.memory_required_mb = 9.0 * 1024.0;
        assert!(plan(vec![s]).validate().is_err());
    }

    #[test]
    fn stages_on_node_filters() {
        let p = plan(vec![stage(0, "a", &["l0"], 5.0), stage(1, "b", &["l1"], 3.0)]);
        let ids: Vec<usize> = p.stages_on_node("b").map(|s| s.stage_id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn visualize_marks_bottleneck() {
        let p = plan(vec![stage(0, "gpu-node", &["l0", "l1"], 5.0)]);
        let text = p.visualize();
        assert!(text.contains("gpu-node"));
        assert!(text.contains("l0 .. l1"));
        assert!(text.contains(" *"));
    }

    #[test]
    fn visualize_lists_each_note_once() {
        let mut p = plan(vec![stage(0, "a", &["l0"], 5.0)]);
        p.optimization_notes = vec!["Average memory per stage: 12.0 MB".into(), "Load balance score 1.00".into()];
        let text = p.visualize();
        assert_eq!(text.matches("Average memory per stage").count(), 1);
        assert_eq!(text.matches("  - ").count(), 2);
    }

    #[test]
    fn strategy_parse_and_serde_names() {
        assert_eq!("memory_aware".parse::<PartitionStrategy>().unwrap(), PartitionStrategy::Memory);
        assert!("fastest".parse::<PartitionStrategy>().is_err());
        let json = serde_json::to_string(&PartitionStrategy::Latency).unwrap();
        assert_eq!(json, "\"latency\"");
    }
}
