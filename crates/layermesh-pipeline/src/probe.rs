//! Local hardware detection.
//!
//! [`SystemProbe`] reads `/proc/meminfo` and the host's available
//! parallelism. It knows nothing about accelerators, so GPU nodes are
//! described through [`LocalNodeConfig`] overrides, which always win over
//! what was probed.

use std::path::{Path, PathBuf};

use tracing::debug;

use layermesh_types::config::LocalNodeConfig;
use layermesh_types::{DeviceType, HardwareCapability};

use crate::error::{PipelineError, Result};

const MEMINFO_PATH: &str = "/proc/meminfo";

pub trait HardwareProbe: Send + Sync {
    fn detect_local_capability(&self) -> Result<HardwareCapability>;
}

/// Host memory as reported by the kernel, in GB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostMemory {
    pub total_gb: f64,
    pub available_gb: f64,
}

impl HostMemory {
    /// Parses `/proc/meminfo`-formatted text. Values are in kB.
    pub fn parse(content: &str) -> Result<Self> {
        let mut total_kb = None;
        let mut available_kb = None;
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let slot = match key {
                "MemTotal:" => &mut total_kb,
                "MemAvailable:" => &mut available_kb,
                _ => continue,
            };
            *slot = Some(value.parse::<u64>().map_err(|_| {
                PipelineError::Probe(format!("expected integer kB value for {key}, got '{value}'"))
            })?);
            if total_kb.is_some() && available_kb.is_some() {
                break;
            }
        }
        let total_kb = total_kb.ok_or_else(|| PipelineError::Probe("MemTotal not found".into()))?;
        let available_kb =
            available_kb.ok_or_else(|| PipelineError::Probe("MemAvailable not found".into()))?;
        let kb_per_gb = 1024.0 * 1024.0;
        Ok(Self {
            total_gb: total_kb as f64 / kb_per_gb,
            available_gb: available_kb.min(total_kb) as f64 / kb_per_gb,
        })
    }
}

pub struct SystemProbe {
    overrides: LocalNodeConfig,
    meminfo: PathBuf,
}

impl SystemProbe {
    pub fn new(overrides: LocalNodeConfig) -> Self {
        Self {
            overrides,
            meminfo: PathBuf::from(MEMINFO_PATH),
        }
    }

    /// Read memory from another file (tests, containers with a bind-mounted
    /// meminfo).
    pub fn with_meminfo(mut self, path: impl AsRef<Path>) -> Self {
        self.meminfo = path.as_ref().to_path_buf();
        self
    }

    fn host_memory(&self) -> Option<HostMemory> {
        let content = std::fs::read_to_string(&self.meminfo).ok()?;
        HostMemory::parse(&content).ok()
    }
}

impl HardwareProbe for SystemProbe {
    fn detect_local_capability(&self) -> Result<HardwareCapability> {
        let cfg = &self.overrides;
        if cfg.node_id.is_empty() {
            return Err(PipelineError::Probe("node_id is not configured".into()));
        }
        let device_type = cfg.device_type.unwrap_or(DeviceType::Cpu);

        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let compute_score = cfg.compute_score.unwrap_or(cores as f64);
        if !(compute_score > 0.0) {
            return Err(PipelineError::Probe(format!(
                "compute_score must be positive, got {compute_score}"
            )));
        }

        let (total_gb, available_gb) = match (cfg.memory_gb, self.host_memory()) {
            (Some(gb), _) => (gb, gb),
            (None, Some(mem)) => (mem.total_gb, mem.available_gb),
            (None, None) => {
                return Err(PipelineError::Probe(format!(
                    "cannot read {} and no memory_gb configured",
                    self.meminfo.display()
                )))
            }
        };

        let mut cap = HardwareCapability::new(cfg.node_id.clone(), device_type)
            .with_name(match device_type {
                DeviceType::Cpu => format!("CPU ({cores} threads)"),
                other => other.as_str().to_uppercase(),
            })
            .with_compute_score(compute_score)
            .with_memory(total_gb, available_gb)
            .with_fp16(cfg.has_fp16.unwrap_or(device_type.is_gpu()));
        cap.has_int8 = true;
        cap.network_bandwidth_mbps = cfg.bandwidth_mbps;
        cap.latency_to_coordinator_ms = 0.1;

        debug!(
            node_id = %cap.device_id,
            device = %cap.device_type,
            compute_score = cap.compute_score,
            memory_gb = cap.memory_gb,
            "local capability detected"
        );
        Ok(cap)
    }
}

/// A fixed capability, for tests and for nodes described entirely in config.
pub struct StaticProbe(pub HardwareCapability);

impl HardwareProbe for StaticProbe {
    fn detect_local_capability(&self) -> Result<HardwareCapability> {
        Ok(self.0.clone())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "MemTotal:       16384000 kB\nMemFree:         1024000 kB\nMemAvailable:    8192000 kB\n";

    fn local(id: &str) -> LocalNodeConfig {
        LocalNodeConfig {
            node_id: id.into(),
            ..LocalNodeConfig::default()
        }
    }

    #[test]
    fn parses_meminfo() {
        let mem = HostMemory::parse(SAMPLE).unwrap();
        assert!((mem.total_gb - 15.625).abs() < 1e-9);
        assert!((mem.available_gb - 7.8125).abs() < 1e-9);
    }

    #[test]
    fn missing_field_is_error() {
        assert!(HostMemory::parse("MemTotal: 1000 kB\n").is_err());
        assert!(HostMemory::parse("MemTotal: lots kB\nMemAvailable: 1 kB\n").is_err());
    }

    #[test]
    fn probe_reads_meminfo_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let cap = SystemProbe::new(local("n1"))
            .with_meminfo(file.path())
            .detect_local_capability()
            .unwrap();
        assert_eq!(cap.device_id, "n1");
        assert_eq!(cap.device_type, DeviceType::Cpu);
        assert!(cap.compute_score >= 1.0);
        assert!((cap.memory_gb - 15.625).abs() < 1e-9);
        assert!(!cap.has_fp16);
    }

    #[test]
    fn overrides_win() {
        let cfg = LocalNodeConfig {
            node_id: "gpu-box".into(),
            device_type: Some(DeviceType::Gpu),
            compute_score: Some(100.0),
            memory_gb: Some(24.0),
            has_fp16: None,
            bandwidth_mbps: 10_000.0,
        };
        let cap = SystemProbe::new(cfg)
            .with_meminfo("/nonexistent/meminfo")
            .detect_local_capability()
            .unwrap();
        assert_eq!(cap.compute_score, 100.0);
        assert_eq!(cap.memory_gb, 24.0);
        assert!(cap.has_fp16);
        assert_eq!(cap.network_bandwidth_mbps, 10_000.0);
    }

    #[test]
    fn unreadable_meminfo_without_override_fails() {
        let err = SystemProbe::new(local("n1"))
            .with_meminfo("/nonexistent/meminfo")
            .detect_local_capability()
            .unwrap_err();
        assert!(matches!(err, PipelineError::Probe(_)));
    }

    #[test]
    fn empty_node_id_fails() {
        let cfg = LocalNodeConfig {
            memory_gb: Some(4.0),
            ..LocalNodeConfig::default()
        };
        assert!(SystemProbe::new(cfg).detect_local_capability().is_err());
    }
}
