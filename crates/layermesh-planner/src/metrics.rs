//! Per-layer metrics collection.
//!
//! A profiling run opens a record per layer execution with
//! [`MetricsCollector::start_layer_monitoring`], closes it with
//! [`MetricsCollector::stop_layer_monitoring`] and, once the batch of runs is
//! complete, calls [`MetricsCollector::finalize_batch`] to stamp percentile
//! latencies onto the latest record of each layer. The resulting summaries
//! are the planner's cost model.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use layermesh_types::{LayerCost, LayerMetrics, LayerSummary, TensorValue};

use crate::error::Result;

const MIB: f64 = 1024.0 * 1024.0;

// ── Memory Sampling ──────────────────────────────────────────────────────────

/// Memory figures at one instant, in MB.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemorySnapshot {
    pub vram_mb: f64,
    pub vram_peak_mb: f64,
    pub ram_mb: f64,
}

/// Source of memory snapshots for the device a profiling run executes on.
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> MemorySnapshot;
    fn device(&self) -> String;
}

/// Samples the resident set size of this process. Reports no VRAM.
#[derive(Debug, Clone, Default)]
pub struct ProcMemory;

impl ProcMemory {
    fn rss_mb() -> Option<f64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss_kb(&status).map(|kb| kb as f64 / 1024.0)
    }
}

impl MemorySampler for ProcMemory {
    fn sample(&self) -> MemorySnapshot {
        MemorySnapshot {
            ram_mb: Self::rss_mb().unwrap_or(0.0),
            ..MemorySnapshot::default()
        }
    }

    fn device(&self) -> String {
        "cpu".into()
    }
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

// ── Collector ────────────────────────────────────────────────────────────────

pub struct MetricsCollector {
    sampler: Box<dyn MemorySampler>,
    /// Runs per layer name, oldest first.
    history: HashMap<String, Vec<LayerMetrics>>,
    /// Layer names in first-seen order.
    order: Vec<String>,
    in_flight: usize,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(Box::new(ProcMemory))
    }
}

impl MetricsCollector {
    pub fn new(sampler: Box<dyn MemorySampler>) -> Self {
        Self {
            sampler,
            history: HashMap::new(),
            order: Vec::new(),
            in_flight: 0,
        }
    }

    /// Open a record for one execution of a layer. Memory and device are
    /// snapshotted now.
    pub fn start_layer_monitoring(
        &mut self,
        layer_name: &str,
        layer_type: &str,
        layer_index: usize,
    ) -> LayerMetrics {
        let snap = self.sampler.sample();
        let mut metrics = LayerMetrics::new(layer_name, layer_type, layer_index);
        metrics.vram_before_mb = snap.vram_mb;
        metrics.ram_before_mb = snap.ram_mb;
        metrics.device = self.sampler.device();
        metrics.timestamp = chrono::Utc::now().to_rfc3339();
        self.in_flight += 1;
        metrics
    }

    /// Close a record and file it under its layer name.
    pub fn stop_layer_monitoring(&mut self, mut metrics: LayerMetrics, forward_latency_ms: f64) {
        let snap = self.sampler.sample();
        metrics.forward_latency_ms = forward_latency_ms;
        metrics.vram_after_mb = snap.vram_mb;
        metrics.vram_peak_mb = snap.vram_peak_mb.max(snap.vram_mb);
        metrics.vram_increase_mb = metrics.vram_after_mb - metrics.vram_before_mb;
        metrics.ram_after_mb = snap.ram_mb;
        metrics.ram_increase_mb = metrics.ram_after_mb - metrics.ram_before_mb;
        self.in_flight = self.in_flight.saturating_sub(1);

        debug!(
            layer = %metrics.layer_name,
            latency_ms = forward_latency_ms,
            vram_increase_mb = metrics.vram_increase_mb,
            "layer run recorded"
        );
        self.file(metrics);
    }

    fn file(&mut self, metrics: LayerMetrics) {
        let runs = self.history.entry(metrics.layer_name.clone()).or_insert_with(|| {
            self.order.push(metrics.layer_name.clone());
            Vec::new()
        });
        runs.push(metrics);
    }

    /// Attach input and output shape metadata. Non-tensor values are skipped.
    pub fn record_tensor_metadata(metrics: &mut LayerMetrics, inputs: &TensorValue, outputs: &TensorValue) {
        inputs.collect_into(&mut metrics.input_shapes, &mut metrics.input_dtypes);
        outputs.collect_into(&mut metrics.output_shapes, &mut metrics.output_dtypes);
    }

    pub fn record_parameter_info(metrics: &mut LayerMetrics, num_parameters: u64, parameter_bytes: u64) {
        metrics.num_parameters = num_parameters;
        metrics.parameter_size_mb = parameter_bytes as f64 / MIB;
    }

    /// Records opened but not yet stopped.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Stamp p50/p95/p99 onto the latest record of every layer with more
    /// than one run. Index selection on the sorted latencies, no
    /// interpolation: `sorted[n/2]`, `sorted[floor(n*0.95)]`,
    /// `sorted[floor(n*0.99)]`.
    pub fn finalize_batch(&mut self) {
        let mut finalized = 0usize;
        for runs in self.history.values_mut() {
            let n = runs.len();
            if n <= 1 {
                continue;
            }
            let mut sorted: Vec<f64> = runs.iter().map(|m| m.forward_latency_ms).collect();
            sorted.sort_by(|a, b| a.total_cmp(b));

            let pick = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
            let (p50, p95, p99) = (sorted[n / 2], pick(0.95), pick(0.99));

            if let Some(latest) = runs.last_mut() {
                latest.p50_latency_ms = Some(p50);
                latest.p95_latency_ms = Some(p95);
                latest.p99_latency_ms = Some(p99);
                finalized += 1;
            }
        }
        info!(layers = finalized, "metrics batch finalized");
    }

    /// All runs of one layer, oldest first.
    pub fn runs(&self, layer_name: &str) -> &[LayerMetrics] {
        self.history.get(layer_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn layer_names(&self) -> &[String] {
        &self.order
    }

    pub fn total_records(&self) -> usize {
        self.history.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.order.clear();
        self.in_flight = 0;
    }

    /// One summary per layer, in first-seen order.
    pub fn get_summary(&self) -> Vec<(String, LayerSummary)> {
        self.order
            .iter()
            .filter_map(|name| {
                let runs = self.history.get(name)?;
                let latest = runs.last()?;
                let avg = runs.iter().map(|m| m.forward_latency_ms).sum::<f64>() / runs.len() as f64;
                Some((
                    name.clone(),
                    LayerSummary {
                        layer_type: latest.layer_type.clone(),
                        layer_index: latest.layer_index,
                        total_runs: runs.len(),
                        avg_latency_ms: avg,
                        p95_latency_ms: latest.p95_latency_ms,
                        total_vram_mb: latest.vram_peak_mb.max(latest.vram_after_mb),
                        vram_increase_mb: latest.vram_increase_mb,
                        num_parameters: latest.num_parameters,
                        parameter_size_mb: latest.parameter_size_mb,
                    },
                ))
            })
            .collect()
    }

    /// Planner input, ordered by layer index.
    pub fn layer_costs(&self) -> Vec<LayerCost> {
        let mut summaries = self.get_summary();
        summaries.sort_by_key(|(_, s)| s.layer_index);
        summaries
            .into_iter()
            .map(|(name, s)| LayerCost {
                latency_ms: s.cost_latency_ms(),
                memory_mb: s.total_vram_mb.max(s.parameter_size_mb),
                num_parameters: s.num_parameters,
                layer_type: s.layer_type,
                name,
                requires_fp16: false,
            })
            .collect()
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Append every retained record to `path`, one JSON object per line.
    pub fn export_to_jsonl(&self, path: &Path) -> Result<usize> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut out = BufWriter::new(file);
        let mut written = 0usize;
        for name in &self.order {
            for record in self.runs(name) {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
                written += 1;
            }
        }
        out.flush()?;
        info!(path = %path.display(), records = written, "exported layer metrics");
        Ok(written)
    }

    /// Load records written by [`Self::export_to_jsonl`]. Blank lines are
    /// skipped; a malformed line aborts the import.
    pub fn import_jsonl(&mut self, path: &Path) -> Result<usize> {
        let reader = BufReader::new(File::open(path)?);
        let mut loaded = 0usize;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: LayerMetrics = serde_json::from_str(&line)?;
            if record.layer_name.is_empty() {
                warn!("skipping metrics record without layer name");
                continue;
            }
            self.file(record);
            loaded += 1;
        }
        info!(path = %path.display(), records = loaded, "imported layer metrics");
        Ok(loaded)
    }
}

// ── Synthetic Profile ────────────────────────────────────────────────────────

/// 26-layer demo profile: embeddings, 24 transformer blocks, output head.
/// Latencies are on the reference device.
pub fn synthetic_layer_costs() -> Vec<LayerCost> {
    let mut layers = Vec::with_capacity(26);
    layers.push(
        LayerCost::new("embeddings", 25.0, 300.0)
            .with_type("Embedding")
            .with_parameters(38_597_376),
    );
    for i in 0..24 {
        layers.push(
            LayerCost::new(format!("transformer.h.{i}"), 30.0 + 2.0 * i as f64, 500.0)
                .with_type("TransformerBlock")
                .with_parameters(7_087_872),
        );
    }
    layers.push(
        LayerCost::new("lm_head", 15.0, 200.0)
            .with_type("Linear")
            .with_parameters(38_597_376),
    );
    layers
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Each sample reports 100 MB more VRAM than the last.
    struct Growing(Arc<AtomicU64>);

    impl MemorySampler for Growing {
        fn sample(&self) -> MemorySnapshot {
            let n = self.0.fetch_add(1, Ordering::SeqCst) as f64;
            MemorySnapshot {
                vram_mb: 100.0 * n,
                vram_peak_mb: 100.0 * n,
                ram_mb: 50.0,
            }
        }

        fn device(&self) -> String {
            "gpu:0".into()
        }
    }

    fn collector() -> MetricsCollector {
        MetricsCollector::new(Box::new(Growing(Arc::new(AtomicU64::new(1)))))
    }

    fn record(c: &mut MetricsCollector, name: &str, index: usize, latency: f64) {
        let m = c.start_layer_monitoring(name, "Linear", index);
        c.stop_layer_monitoring(m, latency);
    }

    #[test]
    fn percentiles_use_index_selection() {
        let mut c = collector();
        for latency in [7.0, 3.0, 10.0, 1.0, 5.0, 9.0, 2.0, 8.0, 4.0, 6.0] {
            record(&mut c, "layer", 0, latency);
        }
        c.finalize_batch();

        let runs = c.runs("layer");
        let latest = runs.last().unwrap();
        assert_eq!(latest.p50_latency_ms, Some(6.0));
        assert_eq!(latest.p95_latency_ms, Some(10.0));
        assert_eq!(latest.p99_latency_ms, Some(10.0));
        assert!(runs[0].p50_latency_ms.is_none());
    }

    #[test]
    fn single_run_gets_no_percentiles() {
        let mut c = collector();
        record(&mut c, "once", 0, 4.0);
        c.finalize_batch();
        assert!(c.runs("once")[0].p95_latency_ms.is_none());
    }

    #[test]
    fn stop_computes_memory_increase() {
        let mut c = collector();
        let m = c.start_layer_monitoring("l", "Linear", 0);
        assert_eq!(c.in_flight(), 1);
        assert_eq!(m.device, "gpu:0");
        c.stop_layer_monitoring(m, 2.0);
        assert_eq!(c.in_flight(), 0);

        let run = &c.runs("l")[0];
        assert_eq!(run.vram_before_mb, 100.0);
        assert_eq!(run.vram_after_mb, 200.0);
        assert_eq!(run.vram_increase_mb, 100.0);
        assert_eq!(run.ram_increase_mb, 0.0);
    }

    #[test]
    fn summary_in_first_seen_order() {
        let mut c = collector();
        record(&mut c, "b", 1, 2.0);
        record(&mut c, "a", 0, 4.0);
        record(&mut c, "b", 1, 4.0);
        c.finalize_batch();

        let summary = c.get_summary();
        assert_eq!(summary[0].0, "b");
        assert_eq!(summary[0].1.total_runs, 2);
        assert_eq!(summary[0].1.avg_latency_ms, 3.0);
        assert_eq!(summary[0].1.p95_latency_ms, Some(4.0));

        let costs = c.layer_costs();
        assert_eq!(costs[0].name, "a");
        assert_eq!(costs[1].name, "b");
        assert_eq!(costs[1].latency_ms, 4.0);
    }

    #[test]
    fn tensor_and_parameter_info() {
        let mut m = LayerMetrics::new("attn", "Attention", 3);
        let inputs = TensorValue::Seq(vec![
            TensorValue::tensor(vec![1, 8, 64], "float32"),
            TensorValue::Other,
        ]);
        let outputs = TensorValue::tensor(vec![1, 8, 64], "float32");
        MetricsCollector::record_tensor_metadata(&mut m, &inputs, &outputs);
        MetricsCollector::record_parameter_info(&mut m, 1000, 4 * 1024 * 1024);

        assert_eq!(m.input_shapes, vec![vec![1, 8, 64]]);
        assert_eq!(m.output_dtypes, vec!["float32"]);
        assert_eq!(m.parameter_size_mb, 4.0);
    }

    #[test]
    fn jsonl_export_then_import() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");

        let mut c = collector();
        record(&mut c, "embeddings", 0, 3.0);
        record(&mut c, "lm_head", 1, 1.0);
        record(&mut c, "lm_head", 1, 2.0);
        assert_eq!(c.export_to_jsonl(&path).unwrap(), 3);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);

        let mut loaded = MetricsCollector::new(Box::new(ProcMemory));
        assert_eq!(loaded.import_jsonl(&path).unwrap(), 3);
        assert_eq!(loaded.layer_names(), &["embeddings".to_string(), "lm_head".to_string()]);
        assert_eq!(loaded.runs("lm_head").len(), 2);
    }

    #[test]
    fn export_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let mut c = collector();
        record(&mut c, "l", 0, 1.0);
        c.export_to_jsonl(&path).unwrap();
        c.export_to_jsonl(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn vm_rss_parsing() {
        let status = "Name:\ttest\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\n";
        assert_eq!(parse_vm_rss_kb(status), Some(2048));
        assert_eq!(parse_vm_rss_kb("Name: x\n"), None);
    }

    #[test]
    fn synthetic_profile_shape() {
        let layers = synthetic_layer_costs();
        assert_eq!(layers.len(), 26);
        assert_eq!(layers[0].name, "embeddings");
        assert_eq!(layers[1].latency_ms, 30.0);
        assert_eq!(layers[24].latency_ms, 76.0);
        assert_eq!(layers[25].name, "lm_head");
    }
}
