//! Device fitness and selection.
//!
//! The matcher keeps devices in registration order. Every selection walks
//! that order and only replaces the current best on a strictly better score,
//! so ties go to the device registered first.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use layermesh_types::config::MatcherConfig;
pub use layermesh_types::DeviceSummary;
use layermesh_types::{HardwareCapability, LayerRequirement, PartitionStrategy};

use crate::error::{PlannerError, Result};

/// `device_id -> layer names`, in assignment order per device.
pub type Assignment = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default)]
pub struct CapabilityMatcher {
    config: MatcherConfig,
    devices: Vec<HardwareCapability>,
    index: HashMap<String, usize>,
}

impl CapabilityMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self {
            config,
            devices: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    // ── Registry ─────────────────────────────────────────────────────────

    /// Insert or replace a device. A replaced device keeps its original
    /// registration position. Returns `true` when the device is new.
    pub fn register_device(&mut self, capability: HardwareCapability) -> bool {
        match self.index.get(&capability.device_id) {
            Some(&pos) => {
                self.devices[pos] = capability;
                false
            }
            None => {
                debug!(device_id = %capability.device_id, device_type = %capability.device_type, "registered device");
                self.index.insert(capability.device_id.clone(), self.devices.len());
                self.devices.push(capability);
                true
            }
        }
    }

    pub fn remove_device(&mut self, device_id: &str) -> Option<HardwareCapability> {
        let pos = self.index.remove(device_id)?;
        let removed = self.devices.remove(pos);
        for (i, dev) in self.devices.iter().enumerate().skip(pos) {
            self.index.insert(dev.device_id.clone(), i);
        }
        Some(removed)
    }

    pub fn get_device(&self, device_id: &str) -> Option<&HardwareCapability> {
        self.index.get(device_id).map(|&pos| &self.devices[pos])
    }

    /// Devices in registration order.
    pub fn devices(&self) -> &[HardwareCapability] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn update_load(&mut self, device_id: &str, load: f64) -> Result<()> {
        let dev = self.device_mut(device_id)?;
        dev.current_load = load.max(0.0);
        Ok(())
    }

    pub fn update_available_memory(&mut self, device_id: &str, available_gb: f64) -> Result<()> {
        let dev = self.device_mut(device_id)?;
        dev.available_memory_gb = available_gb.clamp(0.0, dev.memory_gb);
        Ok(())
    }

    fn device_mut(&mut self, device_id: &str) -> Result<&mut HardwareCapability> {
        let pos = *self
            .index
            .get(device_id)
            .ok_or_else(|| PlannerError::UnknownDevice(device_id.to_string()))?;
        Ok(&mut self.devices[pos])
    }

    // ── Selection ────────────────────────────────────────────────────────

    /// Time on a score-1 idle device for this requirement.
    pub fn baseline_ms(&self, requirement: &LayerRequirement) -> f64 {
        requirement.compute_millions / self.config.compute_units_per_ms
    }

    /// Devices that can host `requirement`. Saturated devices never qualify.
    pub fn filter_by_requirements(&self, requirement: &LayerRequirement) -> Vec<String> {
        self.suitable(requirement, None)
            .map(|d| d.device_id.clone())
            .collect()
    }

    fn suitable<'a>(
        &'a self,
        requirement: &'a LayerRequirement,
        candidates: Option<&'a [String]>,
    ) -> impl Iterator<Item = &'a HardwareCapability> + 'a {
        self.devices.iter().filter(move |d| {
            candidates.map_or(true, |c| c.iter().any(|id| id == &d.device_id))
                && !d.is_saturated()
                && d.is_suitable_for_layer(requirement)
        })
    }

    /// Best device for `requirement` under `strategy`, or `(None, 0.0)` when
    /// nothing fits. `candidates` restricts the search to the listed ids.
    pub fn find_optimal_device(
        &self,
        requirement: &LayerRequirement,
        strategy: PartitionStrategy,
        candidates: Option<&[String]>,
    ) -> (Option<String>, f64) {
        let baseline = self.baseline_ms(requirement);

        // (device, estimated ms, headroom gb)
        let scored: Vec<(&HardwareCapability, f64, f64)> = self
            .suitable(requirement, candidates)
            .filter_map(|d| {
                let time = d.estimate_execution_time(baseline).ok()?;
                Some((d, time, d.headroom_gb(requirement)))
            })
            .collect();

        if scored.is_empty() {
            debug!(layer = %requirement.layer_name, "no device satisfies requirement");
            return (None, 0.0);
        }

        let min_time = scored.iter().map(|s| s.1).fold(f64::INFINITY, f64::min);
        let max_headroom = scored.iter().map(|s| s.2).fold(f64::NEG_INFINITY, f64::max);

        let score_of = |time: f64, headroom: f64| -> f64 {
            match strategy {
                PartitionStrategy::Latency => 1.0 / time.max(f64::EPSILON),
                PartitionStrategy::Memory => headroom,
                PartitionStrategy::Balanced => {
                    let latency_score = if time > 0.0 { min_time / time } else { 1.0 };
                    let memory_score = if max_headroom > 0.0 {
                        headroom / max_headroom
                    } else {
                        1.0
                    };
                    self.config.latency_weight * latency_score
                        + self.config.memory_weight * memory_score
                }
            }
        };

        let mut best: Option<(&str, f64)> = None;
        for (dev, time, headroom) in &scored {
            let score = score_of(*time, *headroom);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((dev.device_id.as_str(), score));
            }
        }

        match best {
            Some((id, score)) => (Some(id.to_string()), score),
            None => (None, 0.0),
        }
    }

    /// Greedy left-to-right placement of `requirements` under the balanced
    /// strategy.
    pub fn can_accommodate_model(&self, requirements: &[LayerRequirement]) -> (bool, Assignment) {
        self.can_accommodate_model_with(requirements, PartitionStrategy::Balanced)
    }

    /// Greedy placement that commits each chosen device's memory before the
    /// next requirement is matched. The registry itself is not modified.
    pub fn can_accommodate_model_with(
        &self,
        requirements: &[LayerRequirement],
        strategy: PartitionStrategy,
    ) -> (bool, Assignment) {
        let mut scratch = self.clone();
        let mut assignment = Assignment::new();

        for req in requirements {
            let (device, _) = scratch.find_optimal_device(req, strategy, None);
            let Some(device_id) = device else {
                debug!(layer = %req.layer_name, "model does not fit registered devices");
                return (false, assignment);
            };
            if let Ok(dev) = scratch.device_mut(&device_id) {
                dev.available_memory_gb = (dev.available_memory_gb - req.memory_gb).max(0.0);
            }
            assignment
                .entry(device_id)
                .or_default()
                .push(req.layer_name.clone());
        }

        (true, assignment)
    }

    pub fn get_device_summary(&self) -> DeviceSummary {
        let mut by_type = BTreeMap::new();
        for dev in &self.devices {
            *by_type.entry(dev.device_type.to_string()).or_insert(0) += 1;
        }
        let avg_compute_score = if self.devices.is_empty() {
            0.0
        } else {
            self.devices.iter().map(|d| d.compute_score).sum::<f64>() / self.devices.len() as f64
        };
        DeviceSummary {
            total_devices: self.devices.len(),
            by_type,
            total_memory_gb: self.devices.iter().map(|d| d.memory_gb).sum(),
            available_memory_gb: self.devices.iter().map(|d| d.available_memory_gb).sum(),
            avg_compute_score,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
