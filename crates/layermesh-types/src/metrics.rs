// Per-layer execution records and the cost entries derived from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hardware::LayerRequirement;

// ── Layer Metrics ────────────────────────────────────────────────────────────

/// One observed execution of one layer.
///
/// Opened by the metrics collector before the layer runs and finalized once
/// the forward latency is known. Percentile fields are only filled on the most
/// recent record of a layer once a batch is finalized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerMetrics {
    pub layer_name: String,
    pub layer_type: String,
    pub layer_index: usize,

    pub forward_latency_ms: f64,
    pub p50_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<f64>,

    pub vram_before_mb: f64,
    pub vram_after_mb: f64,
    pub vram_peak_mb: f64,
    pub vram_increase_mb: f64,
    pub ram_before_mb: f64,
    pub ram_after_mb: f64,
    pub ram_increase_mb: f64,

    pub input_shapes: Vec<Vec<usize>>,
    pub output_shapes: Vec<Vec<usize>>,
    pub input_dtypes: Vec<String>,
    pub output_dtypes: Vec<String>,

    pub num_parameters: u64,
    pub parameter_size_mb: f64,
    pub attention_heads: Option<u32>,
    pub hidden_size: Option<u32>,

    pub device: String,
    /// RFC 3339.
    pub timestamp: String,
    pub custom_metrics: BTreeMap<String, f64>,
}

impl LayerMetrics {
    pub fn new(layer_name: impl Into<String>, layer_type: impl Into<String>, layer_index: usize) -> Self {
        Self {
            layer_name: layer_name.into(),
            layer_type: layer_type.into(),
            layer_index,
            ..Self::default()
        }
    }
}

// ── Tensor Values ────────────────────────────────────────────────────────────

/// Shape-level description of a layer input or output.
///
/// Layers may consume nested tuples/lists of tensors as well as scalars or
/// other opaque values; only tensors contribute shape metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    Tensor { shape: Vec<usize>, dtype: String },
    Seq(Vec<TensorValue>),
    Other,
}

impl TensorValue {
    pub fn tensor(shape: impl Into<Vec<usize>>, dtype: impl Into<String>) -> Self {
        Self::Tensor {
            shape: shape.into(),
            dtype: dtype.into(),
        }
    }

    /// Depth-first walk appending every tensor's shape and dtype.
    pub fn collect_into(&self, shapes: &mut Vec<Vec<usize>>, dtypes: &mut Vec<String>) {
        match self {
            Self::Tensor { shape, dtype } => {
                shapes.push(shape.clone());
                dtypes.push(dtype.clone());
            }
            Self::Seq(items) => {
                for item in items {
                    item.collect_into(shapes, dtypes);
                }
            }
            Self::Other => {}
        }
    }
}

// ── Layer Summary ────────────────────────────────────────────────────────────

/// Aggregate over every retained run of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSummary {
    pub layer_type: String,
    pub layer_index: usize,
    pub total_runs: usize,
    pub avg_latency_ms: f64,
    /// p95 from the latest record; `None` when fewer than two runs were seen.
    pub p95_latency_ms: Option<f64>,
    pub total_vram_mb: f64,
    pub vram_increase_mb: f64,
    pub num_parameters: u64,
    pub parameter_size_mb: f64,
}

impl LayerSummary {
    /// Latency used for planning: p95 when available, otherwise the mean.
    pub fn cost_latency_ms(&self) -> f64 {
        self.p95_latency_ms.unwrap_or(self.avg_latency_ms)
    }
}

impl LayerRequirement {
    /// Requirement for placing a profiled layer.
    pub fn from_summary(layer_name: impl Into<String>, summary: &LayerSummary) -> Self {
        let mut req = LayerRequirement::new(
            layer_name,
            summary.layer_type.clone(),
            summary.total_vram_mb / 1024.0,
            summary.avg_latency_ms * 1000.0,
        );
        req.is_latency_sensitive = summary.avg_latency_ms > 100.0;
        req
    }
}

// ── Layer Cost ───────────────────────────────────────────────────────────────

/// Planner input: one layer of the ordered sequence with its cost figures.
///
/// `latency_ms` is measured on the reference device (compute score
/// `PlannerConfig::reference_compute_score`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerCost {
    pub name: String,
    pub layer_type: String,
    pub latency_ms: f64,
    pub memory_mb: f64,
    pub num_parameters: u64,
    /// Only fp16-capable nodes may host this layer.
    #[serde(default)]
    pub requires_fp16: bool,
}

impl LayerCost {
    pub fn new(name: impl Into<String>, latency_ms: f64, memory_mb: f64) -> Self {
        Self {
            name: name.into(),
            layer_type: String::new(),
            latency_ms,
            memory_mb,
            num_parameters: 0,
            requires_fp16: false,
        }
    }

    pub fn requiring_fp16(mut self) -> Self {
        self.requires_fp16 = true;
        self
    }

    /// Placement requirement the matcher and planner check a node against.
    pub fn requirement(&self) -> LayerRequirement {
        let req = LayerRequirement::new(
            self.name.clone(),
            self.layer_type.clone(),
            self.memory_mb / 1024.0,
            self.latency_ms * 1000.0,
        );
        if self.requires_fp16 {
            req.requiring_fp16()
        } else {
            req
        }
    }

    pub fn with_type(mut self, layer_type: impl Into<String>) -> Self {
        self.layer_type = layer_type.into();
        self
    }

    pub fn with_parameters(mut self, num_parameters: u64) -> Self {
        self.num_parameters = num_parameters;
        self
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_values_collect_only_tensors() {
        let value = TensorValue::Seq(vec![
            TensorValue::tensor(vec![1, 16, 768], "float32"),
            TensorValue::Other,
            TensorValue::Seq(vec![TensorValue::tensor(vec![1, 12], "int64")]),
        ]);
        let mut shapes = Vec::new();
        let mut dtypes = Vec::new();
        value.collect_into(&mut shapes, &mut dtypes);

        assert_eq!(shapes, vec![vec![1, 16, 768], vec![1, 12]]);
        assert_eq!(dtypes, vec!["float32", "int64"]);
    }

    #[test]
    fn summary_prefers_p95_for_cost() {
        let mut summary = LayerSummary {
            layer_type: "Linear".into(),
            layer_index: 0,
            total_runs: 1,
            avg_latency_ms: 10.0,
            p95_latency_ms: None,
            total_vram_mb: 512.0,
            vram_increase_mb: 0.0,
            num_parameters: 0,
            parameter_size_mb: 0.0,
        };
        assert_eq!(summary.cost_latency_ms(), 10.0);
        summary.p95_latency_ms = Some(14.0);
        assert_eq!(summary.cost_latency_ms(), 14.0);
    }

    #[test]
    fn cost_carries_precision_into_requirement() {
        let plain = LayerCost::new("mlp", 5.0, 2048.0).requirement();
        assert_eq!(plain.memory_gb, 2.0);
        assert!(!plain.requires_fp16);

        let half = LayerCost::new("attn", 5.0, 512.0).requiring_fp16().requirement();
        assert!(half.requires_fp16);
        assert_eq!(half.precision, "fp16");
    }

    #[test]
    fn requirement_from_summary() {
        let summary = LayerSummary {
            layer_type: "Attention".into(),
            layer_index: 3,
            total_runs: 4,
            avg_latency_ms: 150.0,
            p95_latency_ms: Some(180.0),
            total_vram_mb: 2048.0,
            vram_increase_mb: 64.0,
            num_parameters: 1_000,
            parameter_size_mb: 0.004,
        };
        let req = LayerRequirement::from_summary("h.3.attn", &summary);
        assert_eq!(req.memory_gb, 2.0);
        assert_eq!(req.compute_millions, 150_000.0);
        assert!(req.is_latency_sensitive);
    }

    #[test]
    fn metrics_json_tolerates_missing_fields() {
        let m: LayerMetrics =
            serde_json::from_str(r#"{"layer_name":"lm_head","forward_latency_ms":3.5}"#).unwrap();
        assert_eq!(m.layer_name, "lm_head");
        assert_eq!(m.forward_latency_ms, 3.5);
        assert!(m.p95_latency_ms.is_none());
    }
}
