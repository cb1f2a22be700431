//! Stage worker.
//!
//! A worker runs exactly one stage per session: it binds the session to a
//! [`StageConfig`], feeds incoming activations through its [`ComputeEngine`]
//! and returns the result with an [`ExecutionMetadata`] report. The same type
//! runs inside the coordinator for stages the planner assigns to it.
//!
//! ```text
//!   CreateSession ──▶ Session{Active, stage, layers}
//!   ExecuteForward ─▶ lock session ─▶ engine.compute ─▶ output + metadata
//!                                                  └──▶ (push to coordinator)
//!   CloseSession ───▶ waits for the in-flight call, then Closed
//!   sweep ──────────▶ drops sessions idle past `session_timeout_secs`
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use layermesh_net::{RequestHandler, StageClient};
use layermesh_types::config::WorkerConfig;
use layermesh_types::protocol::{
    CapabilitiesResponse, CloseSessionResponse, CreateSessionRequest, CreateSessionResponse,
    ExecuteForwardRequest, ExecuteForwardResponse, ExecutionMetadata, HardwareInfo, HealthResponse,
    HeartbeatRequest, MetricsSubmission, NodeInfo, NodeRole, PingResponse, StageForwardRequest,
    StageForwardResponse, StagePerformance, TensorDtype,
};
use layermesh_types::{HardwareCapability, NodeDescriptor, Request, Response, TensorData, NODE_VERSION};

use crate::engine::ComputeEngine;
use crate::error::{PipelineError, Result};
use crate::session::{Session, SessionTable};

// ── Stats ────────────────────────────────────────────────────────────────────

/// Request counters exposed through `Health`.
#[derive(Debug, Default, Clone)]
pub struct ForwardStats {
    pub total_requests: u64,
    pub forward_calls: u64,
    pub total_forward_ms: f64,
}

impl ForwardStats {
    pub fn record_forward(&mut self, latency_ms: f64) {
        self.forward_calls += 1;
        self.total_forward_ms += latency_ms;
    }

    pub fn avg_forward_latency_ms(&self) -> f64 {
        if self.forward_calls == 0 {
            0.0
        } else {
            self.total_forward_ms / self.forward_calls as f64
        }
    }
}

// ── Helpers shared with the coordinator ──────────────────────────────────────

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Dtypes a node with this capability accepts.
pub fn supported_dtypes(capability: &HardwareCapability) -> Vec<TensorDtype> {
    let mut dtypes = vec![TensorDtype::F32];
    if capability.has_fp16 {
        dtypes.extend([TensorDtype::F16, TensorDtype::BF16]);
    }
    dtypes.extend([TensorDtype::I32, TensorDtype::I64, TensorDtype::U8]);
    dtypes
}

pub fn capabilities_response(capability: &HardwareCapability) -> CapabilitiesResponse {
    CapabilitiesResponse {
        node_id: capability.device_id.clone(),
        hardware: HardwareInfo {
            device_type: capability.device_type,
            device_name: capability.device_name.clone(),
            total_memory_gb: capability.memory_gb,
            compute_capability: format!("{:.2}", capability.compute_score),
            network_bandwidth_mbps: capability.network_bandwidth_mbps,
        },
        supported_dtypes: supported_dtypes(capability),
        available_memory_gb: capability.available_memory_gb,
        bandwidth_mbps: capability.network_bandwidth_mbps,
    }
}

/// Registration record for a node with this capability reachable at `address`.
pub fn descriptor_for(capability: &HardwareCapability, address: &str) -> NodeDescriptor {
    let (vram_gb, ram_gb) = if capability.device_type.is_gpu() {
        (Some(capability.memory_gb), None)
    } else {
        (None, Some(capability.memory_gb))
    };
    NodeDescriptor {
        node_id: capability.device_id.clone(),
        device_type: capability.device_type,
        compute_score: capability.compute_score,
        vram_gb,
        ram_gb,
        network_latency_ms: capability.latency_to_coordinator_ms,
        bandwidth_mbps: Some(capability.network_bandwidth_mbps),
        supports_fp16: Some(capability.has_fp16),
        address: address.to_string(),
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

pub struct StageWorker {
    config: WorkerConfig,
    capability: HardwareCapability,
    engine: Arc<dyn ComputeEngine>,
    sessions: SessionTable,
    stats: Mutex<ForwardStats>,
    /// Where forward metadata is pushed, if anywhere.
    metrics_sink: Option<StageClient>,
}

impl StageWorker {
    pub fn new(config: WorkerConfig, capability: HardwareCapability, engine: Arc<dyn ComputeEngine>) -> Self {
        let metrics_sink = match (&config.coordinator_addr, config.push_metrics) {
            (Some(addr), true) => Some(StageClient::new(addr.clone(), config.net.clone())),
            _ => None,
        };
        Self {
            config,
            capability,
            engine,
            sessions: SessionTable::new(),
            stats: Mutex::new(ForwardStats::default()),
            metrics_sink,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.capability.device_id
    }

    pub fn capability(&self) -> &HardwareCapability {
        &self.capability
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn descriptor(&self, address: &str) -> NodeDescriptor {
        descriptor_for(&self.capability, address)
    }

    pub async fn active_sessions(&self) -> u32 {
        self.sessions.len().await as u32
    }

    /// `active_sessions / max_concurrent_sessions`.
    pub async fn load_factor(&self) -> f64 {
        let max = self.config.max_concurrent_sessions.max(1);
        self.active_sessions().await as f64 / max as f64
    }

    pub async fn stats(&self) -> ForwardStats {
        self.stats.lock().await.clone()
    }

    async fn node_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id().to_string(),
            device_type: self.capability.device_type,
            available_memory_gb: self.capability.available_memory_gb,
            load_factor: self.load_factor().await,
            node_version: NODE_VERSION.to_string(),
        }
    }

    // ── Session operations ───────────────────────────────────────────────

    pub async fn create_session(&self, req: CreateSessionRequest) -> CreateSessionResponse {
        let CreateSessionRequest {
            session_id,
            stage_config,
            layer_names,
            max_sequence_length,
            dtype,
        } = req;
        let session_id = if session_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            session_id
        };

        let result: Result<()> = async {
            let mut session = Session::new(session_id.clone(), max_sequence_length, dtype)
                .with_stage(stage_config.clone(), layer_names);
            session.activate()?;
            let limit = self.config.max_concurrent_sessions as usize;
            self.sessions.insert_within(session, limit).await.map_err(|e| match e {
                PipelineError::Capacity(_) => PipelineError::Capacity(format!(
                    "worker {} already serves {limit} sessions",
                    self.node_id()
                )),
                other => other,
            })?;
            Ok(())
        }
        .await;

        let error_message = match result {
            Ok(()) => {
                info!(
                    session_id = %session_id,
                    stage_id = %stage_config.stage_id,
                    stage_index = stage_config.stage_index,
                    "stage session created"
                );
                None
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "create_session refused");
                Some(e.to_string())
            }
        };
        CreateSessionResponse {
            success: error_message.is_none(),
            session_id,
            error_message,
            node_info: self.node_info().await,
        }
    }

    /// Run this worker's stage of `session_id` over `input`.
    ///
    /// An engine failure closes the session with the error recorded.
    pub async fn forward(
        &self,
        session_id: &str,
        token_index: u64,
        input: TensorData,
        stage_ids: &[String],
    ) -> Result<(TensorData, ExecutionMetadata)> {
        input.validate()?;
        let handle = self.sessions.get(session_id).await?;
        let mut session = handle.lock().await;
        session.ensure_active()?;

        let stage = session
            .stage_config
            .clone()
            .ok_or_else(|| PipelineError::Session(format!("session {session_id} has no stage bound")))?;
        if !stage_ids.is_empty() && !stage_ids.iter().any(|id| *id == stage.stage_id) {
            return Err(PipelineError::Execution(format!(
                "session {session_id} is bound to stage {}, not {stage_ids:?}",
                stage.stage_id
            )));
        }

        let started = Instant::now();
        let result = self
            .engine
            .compute(&stage.stage_id, &session.layer_names, input)
            .await;
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                warn!(session_id = %session_id, stage_index = stage.stage_index, error = %e, "stage compute failed");
                session.close(Some(e.to_string()));
                drop(session);
                self.sessions.remove(session_id).await;
                return Err(e);
            }
        };
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        session.record_forward(token_index);
        drop(session);

        self.stats.lock().await.record_forward(latency_ms);
        let metadata = ExecutionMetadata {
            forward_latency_ms: latency_ms,
            transfer_latency_ms: 0.0,
            peak_memory_mb: self.engine.peak_memory_mb(),
            device: self.engine.device(),
            stage_index: stage.stage_index,
        };
        debug!(session_id = %session_id, token_index, latency_ms, "stage forward done");
        Ok((output, metadata))
    }

    pub async fn execute_forward(&self, req: ExecuteForwardRequest) -> ExecuteForwardResponse {
        match self
            .forward(&req.session_id, req.token_index, req.input_activations, &req.stage_ids)
            .await
        {
            Ok((output, metadata)) => {
                if let Some(sink) = &self.metrics_sink {
                    self.push_metrics(sink.clone(), Some(req.session_id), Some(req.token_index), metadata.clone());
                }
                ExecuteForwardResponse {
                    success: true,
                    error_message: None,
                    output_activations: Some(output),
                    metadata,
                }
            }
            Err(e) => ExecuteForwardResponse::failure(e.to_string()),
        }
    }

    /// Idempotent. Waits for an in-flight forward call on the session.
    pub async fn close_session(&self, session_id: &str) -> CloseSessionResponse {
        let Some(handle) = self.sessions.remove(session_id).await else {
            return CloseSessionResponse {
                success: true,
                error_message: Some(format!("session not found: {session_id}")),
            };
        };
        let mut session = handle.lock().await;
        session.close(None);
        info!(session_id = %session_id, tokens = session.tokens_processed, "stage session closed");
        CloseSessionResponse {
            success: true,
            error_message: None,
        }
    }

    /// Close sessions idle past the configured timeout. Returns their ids.
    pub async fn sweep(&self) -> Vec<String> {
        let idle = self.sessions.idle(self.config.session_timeout()).await;
        for session_id in &idle {
            let Some(handle) = self.sessions.remove(session_id).await else {
                continue;
            };
            handle.lock().await.close(Some("idle timeout".into()));
            info!(session_id = %session_id, "closed idle stage session");
        }
        idle
    }

    /// Run [`Self::sweep`] every heartbeat interval until `shutdown`.
    pub async fn run_maintenance<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = &mut shutdown => return,
            }
        }
    }

    // ── Sessionless stage execution ──────────────────────────────────────

    /// Run `layers` as stage `stage_id` without a session, pushing metadata
    /// to `metrics_url` when given.
    pub async fn run_stage(&self, req: StageForwardRequest, layers: &[String]) -> StageForwardResponse {
        let stage_id = req.stage_id.to_string();
        let started = Instant::now();
        let result = match req.activations.validate() {
            Ok(()) => self.engine.compute(&stage_id, layers, req.activations).await,
            Err(e) => Err(e.into()),
        };
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(output) => {
                self.stats.lock().await.record_forward(latency_ms);
                let performance = StagePerformance {
                    forward_latency_ms: latency_ms,
                    peak_memory_mb: self.engine.peak_memory_mb(),
                };
                if let Some(url) = req.metrics_url {
                    let metadata = ExecutionMetadata {
                        forward_latency_ms: latency_ms,
                        transfer_latency_ms: 0.0,
                        peak_memory_mb: performance.peak_memory_mb,
                        device: self.engine.device(),
                        stage_index: req.stage_id,
                    };
                    let sink = StageClient::new(url, self.config.net.clone());
                    self.push_metrics(sink, Some(req.session_id), Some(req.token_index), metadata);
                }
                StageForwardResponse {
                    success: true,
                    error_message: None,
                    output_activations: Some(output),
                    performance,
                }
            }
            Err(e) => StageForwardResponse {
                success: false,
                error_message: Some(e.to_string()),
                output_activations: None,
                performance: StagePerformance::default(),
            },
        }
    }

    pub async fn stage_forward(&self, req: StageForwardRequest) -> StageForwardResponse {
        // Reuse the layer list of a matching session when there is one.
        let layers = match self.sessions.get(&req.session_id).await {
            Ok(handle) => handle.lock().await.layer_names.clone(),
            Err(_) => Vec::new(),
        };
        self.run_stage(req, &layers).await
    }

    fn push_metrics(
        &self,
        sink: StageClient,
        session_id: Option<String>,
        token_index: Option<u64>,
        metadata: ExecutionMetadata,
    ) {
        let submission = MetricsSubmission {
            source: self.node_id().to_string(),
            session_id,
            token_index,
            metadata,
            timestamp: now_rfc3339(),
        };
        tokio::spawn(async move {
            if let Err(e) = sink.submit_metrics(submission).await {
                debug!(addr = %sink.addr(), error = %e, "metrics push failed");
            }
        });
    }

    // ── Liveness ─────────────────────────────────────────────────────────

    pub fn ping(&self, message: &str) -> PingResponse {
        PingResponse {
            message: format!("Worker {} is alive: {message}", self.node_id()),
            timestamp: now_rfc3339(),
            node_version: NODE_VERSION.to_string(),
        }
    }

    pub fn report_capabilities(&self) -> CapabilitiesResponse {
        capabilities_response(&self.capability)
    }

    pub async fn health(&self) -> HealthResponse {
        let stats = self.stats().await;
        HealthResponse {
            status: "healthy".into(),
            role: NodeRole::Worker,
            node_id: self.node_id().to_string(),
            node_version: NODE_VERSION.to_string(),
            active_sessions: self.active_sessions().await,
            registered_workers: 0,
            healthy_workers: 0,
            has_plan: false,
            total_requests: stats.total_requests,
            avg_forward_latency_ms: stats.avg_forward_latency_ms(),
            devices: None,
        }
    }

    // ── Registration ─────────────────────────────────────────────────────

    /// Register with the coordinator, then heartbeat until `shutdown`.
    ///
    /// Registers again whenever the coordinator stops recognising this
    /// worker or a heartbeat fails.
    pub async fn run_registration<F>(self: Arc<Self>, advertise_addr: String, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Some(coordinator) = self.config.coordinator_addr.clone() else {
            return;
        };
        let client = StageClient::new(coordinator, self.config.net.clone());
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_secs.max(1)));
        let mut registered = false;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => return,
            }

            if !registered {
                match client.register_worker(self.descriptor(&advertise_addr)).await {
                    Ok(resp) if resp.healthy => {
                        info!(coordinator = %client.addr(), node_id = %self.node_id(), "registered with coordinator");
                        registered = true;
                    }
                    Ok(resp) => warn!(coordinator = %client.addr(), message = %resp.message, "registration not healthy"),
                    Err(e) => warn!(coordinator = %client.addr(), error = %e, "registration failed"),
                }
                continue;
            }

            let beat = HeartbeatRequest {
                node_id: self.node_id().to_string(),
                active_sessions: self.active_sessions().await,
                load_factor: self.load_factor().await,
            };
            match client.heartbeat(beat).await {
                Ok(resp) if resp.registered => {}
                Ok(_) => {
                    info!(node_id = %self.node_id(), "coordinator asked for re-registration");
                    registered = false;
                }
                Err(e) => {
                    warn!(error = %e, "heartbeat failed");
                    registered = false;
                }
            }
        }
    }
}

#[async_trait]
impl RequestHandler for StageWorker {
    async fn handle(&self, request: Request) -> Response {
        self.stats.lock().await.total_requests += 1;
        match request {
            Request::CreateSession(req) => Response::CreateSession(self.create_session(req).await),
            Request::ExecuteForward(req) => Response::ExecuteForward(self.execute_forward(req).await),
            Request::CloseSession(req) => Response::CloseSession(self.close_session(&req.session_id).await),
            Request::Ping(req) => Response::Ping(self.ping(&req.message)),
            Request::ReportCapabilities(_) => Response::Capabilities(self.report_capabilities()),
            Request::Health => Response::Health(self.health().await),
            Request::StageForward(req) => Response::StageForward(self.stage_forward(req).await),
            other => Response::error(format!("{} is not served by a worker", other.name())),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PassthroughEngine;
    use layermesh_types::protocol::{MetricsQuery, StageConfig};
    use layermesh_types::DeviceType;

    fn worker(max_sessions: u32) -> StageWorker {
        let config = WorkerConfig {
            max_concurrent_sessions: max_sessions,
            push_metrics: false,
            ..WorkerConfig::default()
        };
        let cap = HardwareCapability::new("w1", DeviceType::Gpu)
            .with_compute_score(50.0)
            .with_memory(8.0, 6.0)
            .with_fp16(true);
        StageWorker::new(config, cap, Arc::new(PassthroughEngine::new()))
    }

    fn create(id: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            session_id: id.into(),
            stage_config: StageConfig {
                stage_id: "1".into(),
                stage_index: 1,
                device: "gpu".into(),
                enable_kv_cache: false,
            },
            layer_names: vec!["h.0".into(), "h.1".into()],
            max_sequence_length: 128,
            dtype: TensorDtype::F32,
        }
    }

    fn forward(id: &str, token: u64) -> ExecuteForwardRequest {
        ExecuteForwardRequest {
            session_id: id.into(),
            token_index: token,
            input_activations: TensorData::from_f32(vec![1, 4], &[1.0, 2.0, 3.0, 4.0]),
            stage_ids: vec![],
        }
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let w = worker(4);
        let created = w.create_session(create("s1")).await;
        assert!(created.success, "{:?}", created.error_message);
        assert_eq!(created.node_info.load_factor, 0.25);

        let resp = w.execute_forward(forward("s1", 0)).await;
        assert!(resp.success);
        assert_eq!(resp.metadata.stage_index, 1);
        assert_eq!(
            resp.output_activations.unwrap().to_f32().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0]
        );

        let closed = w.close_session("s1").await;
        assert!(closed.success && closed.error_message.is_none());
        let again = w.close_session("s1").await;
        assert!(again.success);
        assert!(again.error_message.unwrap().contains("not found"));

        let after = w.execute_forward(forward("s1", 1)).await;
        assert!(!after.success);
    }

    #[tokio::test]
    async fn concurrent_creates_respect_capacity() {
        let w = Arc::new(worker(2));
        let attempts: Vec<_> = (0..6)
            .map(|i| {
                let w = Arc::clone(&w);
                tokio::spawn(async move { w.create_session(create(&format!("s{i}"))).await.success })
            })
            .collect();
        let mut accepted = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 2);
        assert_eq!(w.active_sessions().await, 2);
    }

    #[tokio::test]
    async fn idle_session_is_swept_and_slot_reused() {
        let config = WorkerConfig {
            max_concurrent_sessions: 1,
            session_timeout_secs: 0,
            push_metrics: false,
            ..WorkerConfig::default()
        };
        let cap = HardwareCapability::new("w1", DeviceType::Cpu)
            .with_compute_score(10.0)
            .with_memory(8.0, 8.0);
        let w = StageWorker::new(config, cap, Arc::new(PassthroughEngine::new()));

        assert!(w.create_session(create("orphan")).await.success);
        assert!(!w.create_session(create("next")).await.success);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(w.sweep().await, vec!["orphan".to_string()]);
        assert_eq!(w.active_sessions().await, 0);
        assert!(!w.execute_forward(forward("orphan", 0)).await.success);

        let reused = w.create_session(create("next")).await;
        assert!(reused.success, "{:?}", reused.error_message);
    }

    #[tokio::test]
    async fn active_sessions_survive_sweep() {
        let w = worker(4);
        w.create_session(create("s")).await;
        assert!(w.sweep().await.is_empty());
        assert_eq!(w.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn empty_session_id_is_generated() {
        let w = worker(4);
        let created = w.create_session(create("")).await;
        assert!(created.success);
        assert!(!created.session_id.is_empty());
    }

    #[tokio::test]
    async fn refuses_beyond_capacity() {
        let w = worker(1);
        assert!(w.create_session(create("a")).await.success);
        let refused = w.create_session(create("b")).await;
        assert!(!refused.success);
        assert!(refused.error_message.unwrap().contains("capacity"));
    }

    #[tokio::test]
    async fn byte_mismatch_is_rejected() {
        let w = worker(4);
        w.create_session(create("s")).await;
        let mut req = forward("s", 0);
        req.input_activations.num_bytes += 4;
        let resp = w.execute_forward(req).await;
        assert!(!resp.success);
        assert!(resp.error_message.unwrap().contains("protocol violation"));
    }

    #[tokio::test]
    async fn wrong_stage_id_is_rejected() {
        let w = worker(4);
        w.create_session(create("s")).await;
        let mut req = forward("s", 0);
        req.stage_ids = vec!["7".into()];
        assert!(!w.execute_forward(req).await.success);
    }

    #[tokio::test]
    async fn stats_and_health() {
        let w = worker(4);
        w.create_session(create("s")).await;
        w.execute_forward(forward("s", 0)).await;
        w.handle(Request::Health).await;
        let health = w.health().await;
        assert_eq!(health.role, NodeRole::Worker);
        assert_eq!(health.active_sessions, 1);
        assert_eq!(health.total_requests, 1);
        assert_eq!(w.stats().await.forward_calls, 1);
    }

    #[tokio::test]
    async fn sessionless_stage_forward() {
        let w = worker(4);
        let resp = w
            .stage_forward(StageForwardRequest {
                session_id: "adhoc".into(),
                token_index: 3,
                stage_id: 0,
                activations: TensorData::from_f32(vec![2], &[5.0, 6.0]),
                metrics_url: None,
            })
            .await;
        assert!(resp.success);
        assert!(resp.performance.forward_latency_ms >= 0.0);
    }

    #[tokio::test]
    async fn coordinator_operations_are_refused() {
        let w = worker(4);
        let resp = w.handle(Request::QueryMetrics(MetricsQuery { source: None })).await;
        assert!(matches!(resp, Response::Error { message } if message.contains("query_metrics")));
    }

    #[test]
    fn capability_report_and_descriptor() {
        let w = worker(4);
        let report = w.report_capabilities();
        assert_eq!(report.node_id, "w1");
        assert!(report.supported_dtypes.contains(&TensorDtype::F16));
        assert_eq!(report.available_memory_gb, 6.0);

        let d = w.descriptor("10.0.0.2:8082");
        assert_eq!(d.vram_gb, Some(8.0));
        assert_eq!(d.ram_gb, None);
        d.validate().unwrap();
    }

    #[test]
    fn ping_message() {
        assert_eq!(worker(1).ping("hi").message, "Worker w1 is alive: hi");
    }
}
