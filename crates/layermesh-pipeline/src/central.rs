//! Coordinator-side sink for metrics pushed by workers.

use std::collections::{BTreeMap, VecDeque};

use layermesh_types::protocol::{MetricsReport, MetricsSubmission};

/// Records returned in [`MetricsReport::recent`].
const RECENT_RECORDS: usize = 10;

/// Bounded in-memory store. The oldest records are dropped first; the
/// running total keeps counting them.
pub struct CentralMetrics {
    records: VecDeque<MetricsSubmission>,
    capacity: usize,
    total_received: u64,
}

impl CentralMetrics {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
            total_received: 0,
        }
    }

    /// Store one submission. Returns the total received so far.
    pub fn push(&mut self, submission: MetricsSubmission) -> u64 {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(submission);
        self.total_received += 1;
        self.total_received
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    pub fn report(&self, source: Option<&str>) -> MetricsReport {
        let filtered: Vec<&MetricsSubmission> = self
            .records
            .iter()
            .filter(|r| source.map_or(true, |s| r.source == s))
            .collect();

        let mut by_source = BTreeMap::new();
        for record in &self.records {
            *by_source.entry(record.source.clone()).or_insert(0u64) += 1;
        }

        let average_latency_ms = if filtered.is_empty() {
            0.0
        } else {
            filtered.iter().map(|r| r.metadata.forward_latency_ms).sum::<f64>() / filtered.len() as f64
        };

        let skip = filtered.len().saturating_sub(RECENT_RECORDS);
        MetricsReport {
            total_records: self.total_received,
            filtered_records: filtered.len() as u64,
            by_source,
            average_latency_ms,
            recent: filtered.into_iter().skip(skip).cloned().collect(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
