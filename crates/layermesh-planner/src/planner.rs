//! Pipeline partitioning.
//!
//! Algorithm:
//! 1. Drop saturated nodes and nodes without compute or memory.
//!    A block may only go to a node suitable for every layer in it
//!    (fp16 layers need an fp16-capable node).
//! 2. Order nodes: GPU, then iGPU, then CPU; higher compute score first;
//!    node id breaks ties. Stage order follows this node order.
//! 3. Dynamic programme over (nodes considered, layers covered, stages used).
//!    Each node hosts at most one contiguous block and may be skipped.
//!    A block must fit the node's available memory.
//! 4. Pick the best complete partition under the strategy's objective,
//!    then annotate it with bottleneck, balance and notes.
//!
//! Objectives, compared lexicographically:
//! - balanced: (max stage latency, total latency)
//! - latency:  (total latency, max stage latency)
//! - memory:   (max stage memory utilisation, total latency)
//!
//! Stage latency includes the activation transfer into the stage.

use std::path::Path;

use tracing::{debug, info};

use layermesh_types::config::PlannerConfig;
use layermesh_types::{
    BottleneckReason, HardwareCapability, LayerCost, LayerRequirement, PartitionPlan,
    PartitionStrategy, Stage, VirtualNode,
};

use crate::error::{PlannerError, Result};
use crate::metrics::MetricsCollector;

const EPS: f64 = 1e-9;

// ── Planner ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    config: PlannerConfig,
    layers: Vec<LayerCost>,
}

impl ExecutionPlanner {
    pub fn new(layers: Vec<LayerCost>, config: PlannerConfig) -> Self {
        Self { config, layers }
    }

    /// Plan with the cost model of a finished profiling run.
    pub fn from_collector(collector: &MetricsCollector, config: PlannerConfig) -> Self {
        Self::new(collector.layer_costs(), config)
    }

    pub fn layers(&self) -> &[LayerCost] {
        &self.layers
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Compute time of `cost_ms` reference-device work on `node`.
    pub fn stage_compute_ms(&self, node: &VirtualNode, cost_ms: f64) -> Result<f64> {
        self.compute_on(&node.to_capability(), cost_ms)
    }

    fn compute_on(&self, capability: &HardwareCapability, cost_ms: f64) -> Result<f64> {
        let baseline = cost_ms * self.config.reference_compute_score;
        Ok(capability.estimate_execution_time(baseline)?)
    }

    /// Activation hand-off into a stage hosted on `node`.
    pub fn transfer_ms(&self, node: &VirtualNode) -> f64 {
        let wire_ms = if node.bandwidth_mbps > 0.0 {
            self.config.activation_size_mb * 8.0 / node.bandwidth_mbps * 1000.0
        } else {
            0.0
        };
        node.network_latency_ms + wire_ms
    }

    pub fn generate_plan(
        &self,
        available_nodes: &[VirtualNode],
        model_name: &str,
        strategy: PartitionStrategy,
    ) -> Result<PartitionPlan> {
        if self.layers.is_empty() {
            return Err(PlannerError::NoLayers);
        }
        if available_nodes.is_empty() {
            return Err(PlannerError::NoNodes);
        }

        let nodes = eligible_nodes(available_nodes);
        if nodes.is_empty() {
            return Err(PlannerError::Infeasible(format!(
                "all {} nodes are saturated or report no compute/memory",
                available_nodes.len()
            )));
        }

        let requirements: Vec<LayerRequirement> = self.layers.iter().map(LayerCost::requirement).collect();
        if let Some(req) = requirements
            .iter()
            .find(|r| r.requires_fp16 && !nodes.iter().any(|n| n.supports_fp16))
        {
            return Err(PlannerError::Infeasible(format!(
                "layer {} requires fp16 but none of {} eligible nodes supports it",
                req.layer_name,
                nodes.len()
            )));
        }

        let blocks = self.solve(&nodes, &requirements, strategy)?;
        let stages = self.build_stages(&nodes, &blocks, strategy)?;
        let plan = self.finish_plan(stages, nodes.len(), model_name, strategy);

        info!(
            model = %model_name,
            strategy = %strategy,
            nodes = nodes.len(),
            stages = plan.num_stages(),
            expected_latency_ms = plan.total_expected_latency_ms,
            bottleneck_stage = plan.bottleneck_stage_id,
            "partition plan generated"
        );
        Ok(plan)
    }

    // ── Search ───────────────────────────────────────────────────────────

    /// Returns `(node position, first layer, end layer)` per stage.
    fn solve(
        &self,
        nodes: &[VirtualNode],
        requirements: &[LayerRequirement],
        strategy: PartitionStrategy,
    ) -> Result<Vec<(usize, usize, usize)>> {
        let n = self.layers.len();
        let m = nodes.len();
        let max_k = self.config.max_stages.max(1).min(m).min(n);

        let mut lat_prefix = vec![0.0; n + 1];
        let mut mem_prefix = vec![0.0; n + 1];
        for (i, layer) in self.layers.iter().enumerate() {
            lat_prefix[i + 1] = lat_prefix[i] + layer.latency_ms;
            mem_prefix[i + 1] = mem_prefix[i] + layer.memory_mb;
        }

        // table[j][i][k]: best partition of layers [0, i) into k stages
        // using nodes [0, j).
        let mut table: Vec<Vec<Vec<Option<Cell>>>> = vec![vec![vec![None; max_k + 1]; n + 1]; m + 1];
        table[0][0][0] = Some(Cell {
            acc: Acc::default(),
            choice: Choice::Skip,
        });

        for j in 1..=m {
            let node = &nodes[j - 1];
            let capability = node.to_capability();
            let capacity_mb = node.available_memory_gb() * 1024.0;
            let transfer = self.transfer_ms(node);

            // unsuitable[i]: layers in [0, i) this node cannot host.
            let mut unsuitable = vec![0usize; n + 1];
            for (i, req) in requirements.iter().enumerate() {
                unsuitable[i + 1] = unsuitable[i] + usize::from(!capability.is_suitable_for_layer(req));
            }

            for i in 0..=n {
                for k in 0..=max_k {
                    let mut best: Option<Cell> = table[j - 1][i][k].map(|c| Cell {
                        acc: c.acc,
                        choice: Choice::Skip,
                    });

                    if k > 0 && i > 0 {
                        for a in 0..i {
                            let Some(prev) = table[j - 1][a][k - 1] else {
                                continue;
                            };
                            if unsuitable[i] > unsuitable[a] {
                                continue;
                            }
                            let memory = mem_prefix[i] - mem_prefix[a];
                            if memory > capacity_mb + EPS {
                                continue;
                            }
                            let Ok(compute) = self.compute_on(&capability, lat_prefix[i] - lat_prefix[a]) else {
                                continue;
                            };
                            let stage_latency = compute + if a > 0 { transfer } else { 0.0 };
                            let utilization = if capacity_mb > 0.0 { memory / capacity_mb } else { 1.0 };
                            let acc = prev.acc.extend(stage_latency, utilization);

                            let better = match &best {
                                None => true,
                                Some(cur) => lex_less(acc.key(strategy), cur.acc.key(strategy)),
                            };
                            if better {
                                best = Some(Cell {
                                    acc,
                                    choice: Choice::Use(a),
                                });
                            }
                        }
                    }

                    table[j][i][k] = best;
                }
            }
        }

        let mut best_k: Option<(usize, Acc)> = None;
        for k in 1..=max_k {
            if let Some(cell) = table[m][n][k] {
                let better = match &best_k {
                    None => true,
                    Some((_, acc)) => lex_less(cell.acc.key(strategy), acc.key(strategy)),
                };
                if better {
                    best_k = Some((k, cell.acc));
                }
            }
        }

        let Some((mut k, _)) = best_k else {
            let total_mb = mem_prefix[n];
            let capacity_mb: f64 = nodes.iter().map(|nd| nd.available_memory_gb() * 1024.0).sum();
            return Err(PlannerError::Infeasible(format!(
                "{n} layers needing {total_mb:.0} MB do not fit on {m} nodes \
                 ({capacity_mb:.0} MB available, at most {max_k} stages)"
            )));
        };

        let mut blocks = Vec::with_capacity(k);
        let (mut j, mut i) = (m, n);
        while j > 0 && i > 0 {
            let cell = table[j][i][k].ok_or_else(|| {
                PlannerError::Infeasible("partition table inconsistent".into())
            })?;
            if let Choice::Use(a) = cell.choice {
                blocks.push((j - 1, a, i));
                i = a;
                k -= 1;
            }
            j -= 1;
        }
        blocks.reverse();
        debug!(stages = blocks.len(), "partition search finished");
        Ok(blocks)
    }

    // ── Annotation ───────────────────────────────────────────────────────

    fn build_stages(
        &self,
        nodes: &[VirtualNode],
        blocks: &[(usize, usize, usize)],
        strategy: PartitionStrategy,
    ) -> Result<Vec<Stage>> {
        blocks
            .iter()
            .enumerate()
            .map(|(stage_id, &(pos, start, end))| {
                let node = nodes[pos].clone();
                let slice = &self.layers[start..end];
                let cost: f64 = slice.iter().map(|l| l.latency_ms).sum();
                let memory_required_mb: f64 = slice.iter().map(|l| l.memory_mb).sum();
                let expected_latency_ms = self.stage_compute_ms(&node, cost)?;
                let transfer_latency_ms = if stage_id > 0 { self.transfer_ms(&node) } else { 0.0 };
                let rationale = format!(
                    "{} layers on {} node {} (score {:.0}), {:.0} of {:.0} MB, {} objective",
                    slice.len(),
                    node.device_type,
                    node.node_id,
                    node.compute_score,
                    memory_required_mb,
                    node.available_memory_gb() * 1024.0,
                    strategy
                );
                Ok(Stage {
                    stage_id,
                    layers: slice.iter().map(|l| l.name.clone()).collect(),
                    expected_latency_ms,
                    transfer_latency_ms,
                    memory_required_mb,
                    num_parameters: slice.iter().map(|l| l.num_parameters).sum(),
                    rationale,
                    node,
                })
            })
            .collect()
    }

    fn finish_plan(
        &self,
        stages: Vec<Stage>,
        eligible: usize,
        model_name: &str,
        strategy: PartitionStrategy,
    ) -> PartitionPlan {
        let totals: Vec<f64> = stages.iter().map(Stage::total_latency_ms).collect();

        let mut bottleneck_stage_id = 0;
        for (i, &t) in totals.iter().enumerate() {
            if t > totals[bottleneck_stage_id] {
                bottleneck_stage_id = i;
            }
        }
        let bottleneck_latency_ms = totals.get(bottleneck_stage_id).copied().unwrap_or(0.0);
        let bottleneck_reason = stages
            .get(bottleneck_stage_id)
            .map(|s| classify_bottleneck(s, &self.config))
            .unwrap_or(BottleneckReason::ComputeBound);

        let max = totals.iter().copied().fold(0.0, f64::max);
        let min = totals.iter().copied().fold(f64::INFINITY, f64::min);
        let load_balance_score = if max > 0.0 { (min / max).clamp(0.0, 1.0) } else { 1.0 };

        let num_stages = stages.len();
        let mut plan = PartitionPlan {
            plan_name: format!("{model_name}-{strategy}-{num_stages}stage"),
            model_name: model_name.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            strategy,
            total_expected_latency_ms: stages.iter().map(|s| s.expected_latency_ms).sum(),
            total_transfer_latency_ms: stages.iter().map(|s| s.transfer_latency_ms).sum(),
            bottleneck_stage_id,
            bottleneck_latency_ms,
            bottleneck_reason,
            load_balance_score,
            optimization_notes: Vec::new(),
            stages,
        };
        plan.optimization_notes = optimization_notes(&plan, eligible, &self.config);
        plan
    }
}

// ── Search State ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Acc {
    max_latency: f64,
    total_latency: f64,
    max_utilization: f64,
}

impl Acc {
    fn extend(self, stage_latency: f64, utilization: f64) -> Self {
        Self {
            max_latency: self.max_latency.max(stage_latency),
            total_latency: self.total_latency + stage_latency,
            max_utilization: self.max_utilization.max(utilization),
        }
    }

    fn key(&self, strategy: PartitionStrategy) -> (f64, f64) {
        match strategy {
            PartitionStrategy::Balanced => (self.max_latency, self.total_latency),
            PartitionStrategy::Latency => (self.total_latency, self.max_latency),
            PartitionStrategy::Memory => (self.max_utilization, self.total_latency),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Choice {
    Skip,
    /// The node hosts layers `[start, i)`.
    Use(usize),
}

#[derive(Debug, Clone, Copy)]
struct Cell {
    acc: Acc,
    choice: Choice,
}

fn lex_less(a: (f64, f64), b: (f64, f64)) -> bool {
    if (a.0 - b.0).abs() > EPS {
        a.0 < b.0
    } else {
        a.1 < b.1 - EPS
    }
}

fn eligible_nodes(nodes: &[VirtualNode]) -> Vec<VirtualNode> {
    let mut eligible: Vec<VirtualNode> = nodes
        .iter()
        .filter(|n| !n.is_saturated() && n.compute_score > 0.0 && n.memory_capacity_gb() > 0.0)
        .cloned()
        .collect();
    eligible.sort_by(|a, b| {
        b.device_type
            .priority()
            .cmp(&a.device_type.priority())
            .then(b.compute_score.total_cmp(&a.compute_score))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    eligible
}

// ── Diagnostics ──────────────────────────────────────────────────────────────

fn classify_bottleneck(stage: &Stage, config: &PlannerConfig) -> BottleneckReason {
    if stage.transfer_latency_ms > 0.0 && stage.transfer_latency_ms >= stage.expected_latency_ms {
        BottleneckReason::NetworkBound
    } else if stage.memory_utilization() >= config.memory_pressure_threshold {
        BottleneckReason::MemoryBound
    } else {
        BottleneckReason::ComputeBound
    }
}

fn optimization_notes(plan: &PartitionPlan, eligible: usize, config: &PlannerConfig) -> Vec<String> {
    let mut notes = Vec::new();
    let k = plan.stages.len();
    if k == 0 {
        return notes;
    }

    notes.push(format!("Strategy: {}", plan.strategy));
    notes.push(format!("{} layers across {k} stages", plan.num_layers()));

    let avg_memory = plan.stages.iter().map(|s| s.memory_required_mb).sum::<f64>() / k as f64;
    notes.push(format!("Average memory per stage: {avg_memory:.1} MB"));

    let latencies: Vec<f64> = plan.stages.iter().map(Stage::total_latency_ms).collect();
    let mean = latencies.iter().sum::<f64>() / k as f64;
    let std_dev = (latencies.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / k as f64).sqrt();
    notes.push(format!("Stage latency std dev: {std_dev:.1} ms"));

    if plan.load_balance_score < config.imbalance_threshold {
        notes.push(format!(
            "Load imbalance: balance score {:.2} is below {:.2}; consider another strategy or node set",
            plan.load_balance_score, config.imbalance_threshold
        ));
    } else {
        notes.push(format!("Load balance score {:.2}", plan.load_balance_score));
    }

    let used: Vec<&str> = plan.stages.iter().map(|s| s.node.node_id.as_str()).collect();
    notes.push(format!("Nodes utilized: {} of {eligible} ({})", used.len(), used.join(", ")));

    if let Some(b) = plan.bottleneck() {
        notes.push(format!(
            "Bottleneck: stage {} on {} ({:.1} ms, {})",
            b.stage_id, b.node.node_id, plan.bottleneck_latency_ms, plan.bottleneck_reason
        ));
        let end_to_end = plan.total_expected_latency_ms + plan.total_transfer_latency_ms;
        if k > 1 && plan.bottleneck_latency_ms > end_to_end * 0.3 {
            notes.push(format!(
                "Bottleneck is {:.0}% of end-to-end latency; splitting it further would help",
                plan.bottleneck_latency_ms / end_to_end * 100.0
            ));
        }
    }

    for stage in &plan.stages {
        if stage.stage_id == plan.bottleneck_stage_id {
            continue;
        }
        let utilization = stage.memory_utilization();
        if utilization < config.underutilization_threshold
            && stage.total_latency_ms() < plan.bottleneck_latency_ms * 0.5
        {
            notes.push(format!(
                "stage {} underutilizes node {} ({:.0}% memory, {:.1} ms vs {:.1} ms bottleneck)",
                stage.stage_id,
                stage.node.node_id,
                utilization * 100.0,
                stage.total_latency_ms(),
                plan.bottleneck_latency_ms
            ));
        }
    }

    notes
}

// ── Persistence ──────────────────────────────────────────────────────────────

pub fn save_plan(plan: &PartitionPlan, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(plan)?;
    std::fs::write(path, json)?;
    Ok(())
}

pub fn load_plan(path: &Path) -> Result<PartitionPlan> {
    let text = std::fs::read_to_string(path)?;
    let plan: PartitionPlan = serde_json::from_str(&text)?;
    plan.validate()?;
    Ok(plan)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
