//! Computation seam.
//!
//! The runtime never does layer math itself. A stage hands its activations
//! to a [`ComputeEngine`] and forwards whatever comes back.

use std::time::Duration;

use async_trait::async_trait;

use layermesh_types::TensorData;

use crate::error::Result;

#[async_trait]
pub trait ComputeEngine: Send + Sync + 'static {
    /// Run `layers` of stage `stage_id` over `input`.
    async fn compute(&self, stage_id: &str, layers: &[String], input: TensorData) -> Result<TensorData>;

    /// Device label reported in `ExecutionMetadata`.
    fn device(&self) -> String {
        "cpu".to_string()
    }

    /// Peak memory of the last call, if the engine tracks it.
    fn peak_memory_mb(&self) -> f64 {
        0.0
    }
}

/// Returns its input unchanged, optionally after a fixed delay.
///
/// Used when no model backend is attached, which is enough to exercise the
/// protocol end to end and to measure transport overhead.
#[derive(Debug, Clone, Default)]
pub struct PassthroughEngine {
    delay: Option<Duration>,
    device: Option<String>,
}

impl PassthroughEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }
}

#[async_trait]
impl ComputeEngine for PassthroughEngine {
    async fn compute(&self, _stage_id: &str, _layers: &[String], input: TensorData) -> Result<TensorData> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(input)
    }

    fn device(&self) -> String {
        self.device.clone().unwrap_or_else(|| "cpu".to_string())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_returns_input() {
        let engine = PassthroughEngine::new().with_device("gpu:0");
        let input = TensorData::from_f32(vec![2], &[1.0, 2.0]);
        let out = engine.compute("0", &["layer.0".into()], input.clone()).await.unwrap();
        assert_eq!(out, input);
        assert_eq!(engine.device(), "gpu:0");
        assert_eq!(engine.peak_memory_mb(), 0.0);
    }

    #[tokio::test]
    async fn delay_is_applied() {
        let engine = PassthroughEngine::new().with_delay(Duration::from_millis(20));
        let started = std::time::Instant::now();
        engine
            .compute("0", &[], TensorData::from_f32(vec![1], &[0.0]))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
