//! Registered node roster.
//!
//! Keeps each node's descriptor, health flag and last reported load, and
//! mirrors every node into a [`CapabilityMatcher`] so device selection sees
//! the same roster as the planner. The coordinator owns one registry behind
//! a single `RwLock`.
//!
//! Open sessions reserve their stage memory on the hosting node's matcher
//! record; closing the session releases it. Load comes from heartbeats.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use layermesh_planner::CapabilityMatcher;
use layermesh_types::config::MatcherConfig;
use layermesh_types::protocol::CapabilitiesResponse;
use layermesh_types::{DeviceSummary, NodeDescriptor, VirtualNode};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct RegisteredNode {
    pub descriptor: NodeDescriptor,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub load_factor: f64,
    pub active_sessions: u32,
    /// Stage memory held by this coordinator's open sessions.
    pub reserved_gb: f64,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

impl RegisteredNode {
    /// Planner view with the last reported load applied.
    pub fn virtual_node(&self) -> VirtualNode {
        self.descriptor
            .to_virtual_node()
            .with_utilization(self.load_factor.clamp(0.0, 1.0))
    }
}

pub struct NodeRegistry {
    nodes: HashMap<String, RegisteredNode>,
    /// Registration order.
    order: Vec<String>,
    matcher: CapabilityMatcher,
}

impl NodeRegistry {
    pub fn new(matcher_config: MatcherConfig) -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
            matcher: CapabilityMatcher::new(matcher_config),
        }
    }

    /// Insert or refresh a node and mark it healthy.
    pub fn register(&mut self, descriptor: NodeDescriptor) -> Result<bool> {
        descriptor
            .validate()
            .map_err(|e| PipelineError::Session(e.to_string()))?;

        let node_id = descriptor.node_id.clone();
        let entry = RegisteredNode {
            descriptor,
            healthy: true,
            consecutive_failures: 0,
            last_error: None,
            load_factor: 0.0,
            active_sessions: 0,
            reserved_gb: 0.0,
            registered_at: chrono::Utc::now(),
        };
        self.matcher.register_device(entry.virtual_node().to_capability());
        let is_new = self.nodes.insert(node_id.clone(), entry).is_none();
        if is_new {
            self.order.push(node_id.clone());
        }
        info!(node_id = %node_id, new = is_new, "node registered");
        Ok(is_new)
    }

    /// Refresh matcher data from a node's own capability report.
    pub fn apply_capabilities(&mut self, report: &CapabilitiesResponse) -> Result<()> {
        let node = self
            .nodes
            .get(&report.node_id)
            .ok_or_else(|| PipelineError::Session(format!("unknown node {}", report.node_id)))?;
        let mut cap = node.virtual_node().to_capability();
        cap.device_name = report.hardware.device_name.clone();
        cap.memory_gb = report.hardware.total_memory_gb.max(cap.memory_gb);
        cap.available_memory_gb = (report.available_memory_gb - node.reserved_gb).clamp(0.0, cap.memory_gb);
        cap.has_fp16 = report
            .supported_dtypes
            .iter()
            .any(|d| matches!(d, layermesh_types::protocol::TensorDtype::F16));
        cap.network_bandwidth_mbps = report.bandwidth_mbps;
        self.matcher.register_device(cap);
        Ok(())
    }

    /// Returns `true` when the node was healthy before.
    pub fn mark_unhealthy(&mut self, node_id: &str, reason: &str) -> bool {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return false;
        };
        node.consecutive_failures += 1;
        node.last_error = Some(reason.to_string());
        let was_healthy = node.healthy;
        node.healthy = false;
        if was_healthy {
            warn!(node_id = %node_id, reason = %reason, "node marked unhealthy");
        }
        was_healthy
    }

    pub fn record_success(&mut self, node_id: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.consecutive_failures = 0;
        }
    }

    pub fn update_load(&mut self, node_id: &str, load_factor: f64, active_sessions: u32) {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return;
        };
        node.load_factor = load_factor.max(0.0);
        node.active_sessions = active_sessions;
        if let Err(e) = self.matcher.update_load(node_id, node.load_factor) {
            warn!(node_id = %node_id, error = %e, "matcher load update failed");
        }
    }

    /// Commit `memory_gb` on the node's matcher record to an open session.
    pub fn reserve(&mut self, node_id: &str, memory_gb: f64) -> Result<()> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| PipelineError::Session(format!("unknown node {node_id}")))?;
        let available = self
            .matcher
            .get_device(node_id)
            .map(|d| d.available_memory_gb)
            .unwrap_or(0.0);
        self.matcher.update_available_memory(node_id, available - memory_gb)?;
        node.reserved_gb += memory_gb;
        debug!(node_id = %node_id, memory_gb, reserved_gb = node.reserved_gb, "memory reserved");
        Ok(())
    }

    /// Return memory taken by [`Self::reserve`].
    pub fn release(&mut self, node_id: &str, memory_gb: f64) {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return;
        };
        let returned = memory_gb.min(node.reserved_gb);
        node.reserved_gb -= returned;
        let available = self
            .matcher
            .get_device(node_id)
            .map(|d| d.available_memory_gb)
            .unwrap_or(0.0);
        if let Err(e) = self.matcher.update_available_memory(node_id, available + returned) {
            warn!(node_id = %node_id, error = %e, "matcher memory release failed");
        }
    }

    /// Matcher summary of every registered node.
    pub fn device_summary(&self) -> DeviceSummary {
        self.matcher.get_device_summary()
    }

    pub fn remove(&mut self, node_id: &str) -> Option<RegisteredNode> {
        let removed = self.nodes.remove(node_id)?;
        self.order.retain(|id| id != node_id);
        self.matcher.remove_device(node_id);
        Some(removed)
    }

    pub fn get(&self, node_id: &str) -> Option<&RegisteredNode> {
        self.nodes.get(node_id)
    }

    pub fn is_healthy(&self, node_id: &str) -> bool {
        self.nodes.get(node_id).is_some_and(|n| n.healthy)
    }

    /// Healthy nodes in registration order, as the planner sees them.
    pub fn healthy_nodes(&self) -> Vec<VirtualNode> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.healthy)
            .map(RegisteredNode::virtual_node)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes.values().filter(|n| n.healthy).count()
    }

    pub fn matcher(&self) -> &CapabilityMatcher {
        &self.matcher
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
