//! Pipeline coordinator.
//!
//! Owns the node registry, the active plan, the session table and the
//! central metrics sink. A forward call walks the plan's stages in order:
//! stages assigned to this node run on the embedded [`StageWorker`], all
//! others go to the owning worker over the stage protocol. The output of
//! stage *i* is the input of stage *i + 1*.
//!
//! Any failure during a forward call closes that session with the error
//! recorded. Timeouts and unreachable workers additionally mark the node
//! unhealthy, which keeps it out of planning until it registers again.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use layermesh_net::{RequestHandler, StageClient};
use layermesh_planner::ExecutionPlanner;
use layermesh_types::config::{CoordinatorConfig, WorkerConfig};
use layermesh_types::protocol::{
    CapabilitiesResponse, CloseSessionResponse, CreateSessionRequest, CreateSessionResponse,
    ExecuteForwardRequest, ExecuteForwardResponse, ExecutionMetadata, HealthResponse,
    HeartbeatRequest, HeartbeatResponse, MetricsReport, MetricsSubmission, NodeInfo, NodeRole,
    PingResponse, PlanningRequest, PlanningResponse, RegisterWorkerResponse, StageConfig,
    StageForwardRequest, StageForwardResponse, StagePerformance,
};
use layermesh_types::{
    HardwareCapability, LayerCost, NodeDescriptor, PartitionPlan, Request, Response, Stage, TensorData,
    VirtualNode, NODE_VERSION,
};

use crate::central::CentralMetrics;
use crate::engine::ComputeEngine;
use crate::error::{PipelineError, Result};
use crate::heartbeat::HeartbeatMonitor;
use crate::registry::NodeRegistry;
use crate::session::{Session, SessionTable};
use crate::worker::{capabilities_response, descriptor_for, now_rfc3339, ForwardStats, StageWorker};

pub struct Coordinator {
    config: CoordinatorConfig,
    capability: HardwareCapability,
    registry: RwLock<NodeRegistry>,
    plan: RwLock<Option<Arc<PartitionPlan>>>,
    /// Layer costs used when a planning request brings none.
    profile: RwLock<Vec<LayerCost>>,
    sessions: SessionTable,
    heartbeats: Mutex<HeartbeatMonitor>,
    metrics: Mutex<CentralMetrics>,
    stats: Mutex<ForwardStats>,
    /// Runs locally assigned stages. `None` when the coordinator does not
    /// participate in execution.
    local: Option<Arc<StageWorker>>,
}

impl Coordinator {
    /// `advertise_addr` is where workers and clients reach this node; it is
    /// also the address recorded for the coordinator's own registry entry.
    pub fn new(
        config: CoordinatorConfig,
        capability: HardwareCapability,
        engine: Arc<dyn ComputeEngine>,
        profile: Vec<LayerCost>,
        advertise_addr: &str,
    ) -> Result<Self> {
        let mut registry = NodeRegistry::new(config.matcher.clone());
        let local = if config.participate {
            registry.register(descriptor_for(&capability, advertise_addr))?;
            let worker_config = WorkerConfig {
                listen_addr: config.listen_addr.clone(),
                advertise_addr: Some(advertise_addr.to_string()),
                coordinator_addr: None,
                node: config.node.clone(),
                max_concurrent_sessions: u32::MAX,
                heartbeat_interval_secs: config.heartbeat_interval_secs,
                session_timeout_secs: config.session_timeout_secs,
                push_metrics: false,
                net: config.net.clone(),
            };
            Some(Arc::new(StageWorker::new(worker_config, capability.clone(), engine)))
        } else {
            None
        };

        let heartbeats = HeartbeatMonitor::new(config.heartbeat_interval_secs, config.heartbeat_timeout_factor);
        let metrics = CentralMetrics::new(config.max_metrics_records);
        info!(
            node_id = %capability.device_id,
            participate = config.participate,
            profile_layers = profile.len(),
            "coordinator initialised"
        );
        Ok(Self {
            config,
            capability,
            registry: RwLock::new(registry),
            plan: RwLock::new(None),
            profile: RwLock::new(profile),
            sessions: SessionTable::new(),
            heartbeats: Mutex::new(heartbeats),
            metrics: Mutex::new(metrics),
            stats: Mutex::new(ForwardStats::default()),
            local,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.capability.device_id
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn registry(&self) -> &RwLock<NodeRegistry> {
        &self.registry
    }

    pub async fn active_plan(&self) -> Option<Arc<PartitionPlan>> {
        self.plan.read().await.clone()
    }

    /// Make `plan` the plan new sessions bind to. Existing sessions keep
    /// the plan they opened with.
    pub async fn install_plan(&self, plan: PartitionPlan) -> Result<Arc<PartitionPlan>> {
        plan.validate()?;
        let plan = Arc::new(plan);
        *self.plan.write().await = Some(Arc::clone(&plan));
        info!(plan = %plan.plan_name, stages = plan.num_stages(), "plan activated");
        Ok(plan)
    }

    fn is_local(&self, stage: &Stage) -> bool {
        self.local.is_some() && stage.node.node_id == self.node_id()
    }

    fn client_for(&self, node: &VirtualNode) -> Result<StageClient> {
        let addr = node.address.clone().ok_or_else(|| PipelineError::NodeUnreachable {
            node_id: node.node_id.clone(),
            reason: "no address known".into(),
        })?;
        Ok(StageClient::new(addr, self.config.net.clone()))
    }

    // ── Planning ─────────────────────────────────────────────────────────

    pub async fn generate_plan(&self, req: PlanningRequest) -> Result<PartitionPlan> {
        let nodes: Vec<VirtualNode> = if req.nodes.is_empty() {
            self.registry.read().await.healthy_nodes()
        } else {
            req.nodes
                .iter()
                .map(|d| d.validate().map(|()| d.to_virtual_node()))
                .collect::<std::result::Result<_, _>>()?
        };
        let layers = match req.layers {
            Some(layers) => layers,
            None => self.profile.read().await.clone(),
        };

        let planner = ExecutionPlanner::new(layers, self.config.planner.clone());
        let plan = planner.generate_plan(&nodes, &req.model_name, req.strategy)?;
        if req.activate {
            self.install_plan(plan.clone()).await?;
        }
        Ok(plan)
    }

    async fn planning_response(&self, req: PlanningRequest) -> PlanningResponse {
        match self.generate_plan(req).await {
            Ok(plan) => PlanningResponse {
                success: true,
                error_message: None,
                summary: Some(plan.summary()),
                plan: Some(plan),
            },
            Err(e) => {
                warn!(error = %e, "plan generation failed");
                PlanningResponse {
                    success: false,
                    error_message: Some(e.to_string()),
                    plan: None,
                    summary: None,
                }
            }
        }
    }

    // ── Registration and liveness ────────────────────────────────────────

    /// Store the registration, then confirm the worker answers a
    /// capability query. A worker that does not answer stays registered
    /// but unhealthy.
    pub async fn register_worker(&self, descriptor: NodeDescriptor) -> Result<RegisterWorkerResponse> {
        let node_id = descriptor.node_id.clone();
        if self.local.is_some() && node_id == self.node_id() {
            return Err(PipelineError::Session(format!(
                "node id {node_id} is taken by the coordinator"
            )));
        }
        self.registry.write().await.register(descriptor.clone())?;
        self.heartbeats.lock().await.record_heartbeat(&node_id);

        let probe = match StageClient::new(descriptor.address.clone(), self.config.net.clone())
            .report_capabilities(&node_id)
            .await
        {
            Ok(report) => self.registry.write().await.apply_capabilities(&report),
            Err(e) => Err(PipelineError::from_net(&node_id, e)),
        };

        let (healthy, message) = match probe {
            Ok(()) => {
                info!(node_id = %node_id, addr = %descriptor.address, "worker registered");
                (true, format!("worker {node_id} registered"))
            }
            Err(e) => {
                self.registry.write().await.mark_unhealthy(&node_id, &e.to_string());
                (false, format!("worker {node_id} registered but failed health check: {e}"))
            }
        };
        Ok(RegisterWorkerResponse {
            registration: descriptor,
            healthy,
            message,
        })
    }

    pub async fn heartbeat(&self, req: HeartbeatRequest) -> HeartbeatResponse {
        let mut registry = self.registry.write().await;
        if !registry.is_healthy(&req.node_id) {
            debug!(node_id = %req.node_id, "heartbeat from unregistered or unhealthy node");
            return HeartbeatResponse { registered: false };
        }
        registry.update_load(&req.node_id, req.load_factor, req.active_sessions);
        drop(registry);
        self.heartbeats.lock().await.record_heartbeat(&req.node_id);
        HeartbeatResponse { registered: true }
    }

    async fn mark_unhealthy(&self, node_id: &str, reason: &str) {
        self.registry.write().await.mark_unhealthy(node_id, reason);
        self.heartbeats.lock().await.remove(node_id);
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    async fn node_info(&self) -> NodeInfo {
        let load_factor = match &self.local {
            Some(worker) => worker.load_factor().await,
            None => 0.0,
        };
        NodeInfo {
            node_id: self.node_id().to_string(),
            device_type: self.capability.device_type,
            available_memory_gb: self.capability.available_memory_gb,
            load_factor,
            node_version: NODE_VERSION.to_string(),
        }
    }

    /// Open a session on the active plan, setting up every stage.
    ///
    /// The request's stage binding is ignored; the plan decides it.
    pub async fn create_session(&self, req: CreateSessionRequest) -> Result<String> {
        let plan = self.active_plan().await.ok_or(PipelineError::NoPlan)?;
        let session_id = if req.session_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            req.session_id.clone()
        };

        let session = Session::new(session_id.clone(), req.max_sequence_length, req.dtype).with_plan(Arc::clone(&plan));
        let handle = self.sessions.insert(session).await?;
        let mut session = handle.lock().await;

        let mut opened: Vec<&Stage> = Vec::with_capacity(plan.num_stages());
        for stage in &plan.stages {
            if let Err(e) = self.open_stage(stage, &session_id, &req).await {
                warn!(session_id = %session_id, stage_index = stage.stage_id, error = %e, "stage setup failed");
                if e.is_node_health_event() {
                    self.mark_unhealthy(&stage.node.node_id, &e.to_string()).await;
                }
                session.close(Some(e.to_string()));
                drop(session);
                self.sessions.remove(&session_id).await;
                self.close_stages(opened, &session_id).await;
                return Err(e);
            }
            opened.push(stage);
        }

        session.activate()?;
        self.reserve_stages(&plan).await;
        info!(session_id = %session_id, plan = %plan.plan_name, stages = plan.num_stages(), "session created");
        Ok(session_id)
    }

    async fn reserve_stages(&self, plan: &PartitionPlan) {
        let mut registry = self.registry.write().await;
        for stage in &plan.stages {
            if let Err(e) = registry.reserve(&stage.node.node_id, stage.memory_required_mb / 1024.0) {
                warn!(node_id = %stage.node.node_id, error = %e, "stage memory not reserved");
            }
        }
    }

    async fn release_stages(&self, plan: &PartitionPlan) {
        let mut registry = self.registry.write().await;
        for stage in &plan.stages {
            registry.release(&stage.node.node_id, stage.memory_required_mb / 1024.0);
        }
    }

    async fn open_stage(&self, stage: &Stage, session_id: &str, req: &CreateSessionRequest) -> Result<()> {
        let create = CreateSessionRequest {
            session_id: session_id.to_string(),
            stage_config: StageConfig {
                stage_id: stage.stage_id.to_string(),
                stage_index: stage.stage_id as u32,
                device: stage.node.device_type.as_str().to_string(),
                enable_kv_cache: req.stage_config.enable_kv_cache,
            },
            layer_names: stage.layers.clone(),
            max_sequence_length: req.max_sequence_length,
            dtype: req.dtype,
        };

        let resp = match (&self.local, self.is_local(stage)) {
            (Some(worker), true) => worker.create_session(create).await,
            _ => self
                .client_for(&stage.node)?
                .create_session(create)
                .await
                .map_err(|e| PipelineError::from_net(&stage.node.node_id, e))?,
        };
        if resp.success {
            Ok(())
        } else {
            Err(PipelineError::Stage {
                stage_index: stage.stage_id,
                node_id: stage.node.node_id.clone(),
                message: resp.error_message.unwrap_or_else(|| "create_session refused".into()),
            })
        }
    }

    /// Best-effort close of every listed stage, concurrently.
    async fn close_stages<'a, I>(&self, stages: I, session_id: &str)
    where
        I: IntoIterator<Item = &'a Stage>,
    {
        join_all(stages.into_iter().map(|stage| self.close_stage(stage, session_id))).await;
    }

    async fn close_stage(&self, stage: &Stage, session_id: &str) {
        if let (Some(worker), true) = (&self.local, self.is_local(stage)) {
            worker.close_session(session_id).await;
            return;
        }
        let result = match self.client_for(&stage.node) {
            Ok(client) => client.close_session(session_id).await.map(|_| ()).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = result {
            debug!(session_id = %session_id, node_id = %stage.node.node_id, error = %e, "stage close failed");
        }
    }

    /// Run one token through every stage of the session's plan, in order.
    pub async fn execute_forward(&self, req: ExecuteForwardRequest) -> Result<(TensorData, ExecutionMetadata)> {
        req.input_activations.validate()?;
        let handle = self.sessions.get(&req.session_id).await?;
        let mut session = handle.lock().await;
        session.ensure_active()?;
        let plan = session.plan.clone().ok_or(PipelineError::NoPlan)?;

        let stages: Vec<&Stage> = plan
            .stages
            .iter()
            .filter(|s| req.stage_ids.is_empty() || req.stage_ids.contains(&s.stage_id.to_string()))
            .collect();
        if stages.is_empty() {
            return Err(PipelineError::Execution(format!("no stage matches {:?}", req.stage_ids)));
        }

        let started = Instant::now();
        let mut activations = req.input_activations;
        let mut total = ExecutionMetadata::default();
        let mut devices: Vec<String> = Vec::new();

        for stage in &stages {
            match self.run_stage(stage, &req.session_id, req.token_index, activations).await {
                Ok((output, meta)) => {
                    activations = output;
                    total.forward_latency_ms += meta.forward_latency_ms;
                    total.transfer_latency_ms += meta.transfer_latency_ms;
                    total.peak_memory_mb = total.peak_memory_mb.max(meta.peak_memory_mb);
                    total.stage_index = meta.stage_index;
                    if !devices.contains(&meta.device) {
                        devices.push(meta.device.clone());
                    }
                    self.record_metrics(&stage.node.node_id, &req.session_id, req.token_index, meta)
                        .await;
                }
                Err(e) => {
                    error!(
                        session_id = %req.session_id,
                        token_index = req.token_index,
                        stage_index = stage.stage_id,
                        node_id = %stage.node.node_id,
                        error = %e,
                        "forward failed; closing session"
                    );
                    if e.is_node_health_event() {
                        self.mark_unhealthy(&stage.node.node_id, &e.to_string()).await;
                    }
                    session.close(Some(e.to_string()));
                    drop(session);
                    self.sessions.remove(&req.session_id).await;
                    self.release_stages(&plan).await;
                    let others = plan.stages.iter().filter(|s| s.node.node_id != stage.node.node_id);
                    self.close_stages(others, &req.session_id).await;
                    return Err(e);
                }
            }
        }

        session.record_forward(req.token_index);
        drop(session);

        total.device = devices.join(",");
        let wall_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.lock().await.record_forward(wall_ms);
        debug!(session_id = %req.session_id, token_index = req.token_index, wall_ms, "forward done");
        Ok((activations, total))
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        session_id: &str,
        token_index: u64,
        input: TensorData,
    ) -> Result<(TensorData, ExecutionMetadata)> {
        if let (Some(worker), true) = (&self.local, self.is_local(stage)) {
            return worker.forward(session_id, token_index, input, &[]).await;
        }

        let node_id = &stage.node.node_id;
        let client = self.client_for(&stage.node)?;
        let started = Instant::now();
        let resp = client
            .execute_forward(ExecuteForwardRequest {
                session_id: session_id.to_string(),
                token_index,
                input_activations: input,
                stage_ids: vec![stage.stage_id.to_string()],
            })
            .await
            .map_err(|e| PipelineError::from_net(node_id, e))?;
        let round_trip_ms = started.elapsed().as_secs_f64() * 1000.0;

        if !resp.success {
            return Err(PipelineError::Stage {
                stage_index: stage.stage_id,
                node_id: node_id.clone(),
                message: resp.error_message.unwrap_or_else(|| "forward failed".into()),
            });
        }
        let output = resp
            .output_activations
            .ok_or_else(|| PipelineError::Protocol(format!("stage {} returned no activations", stage.stage_id)))?;
        output.validate()?;

        let mut meta = resp.metadata;
        meta.transfer_latency_ms = (round_trip_ms - meta.forward_latency_ms).max(0.0);
        self.registry.write().await.record_success(node_id);
        Ok((output, meta))
    }

    /// Idempotent. Waits for an in-flight forward call, then tears down
    /// every stage.
    pub async fn close_session(&self, session_id: &str) -> CloseSessionResponse {
        self.close_session_with(session_id, None).await
    }

    async fn close_session_with(&self, session_id: &str, reason: Option<String>) -> CloseSessionResponse {
        let Some(handle) = self.sessions.remove(session_id).await else {
            return CloseSessionResponse {
                success: true,
                error_message: Some(format!("session not found: {session_id}")),
            };
        };
        let mut session = handle.lock().await;
        session.close(reason);
        if let Some(plan) = session.plan.clone() {
            self.release_stages(&plan).await;
            self.close_stages(&plan.stages, session_id).await;
        }
        info!(session_id = %session_id, tokens = session.tokens_processed, "session closed");
        CloseSessionResponse {
            success: true,
            error_message: None,
        }
    }

    // ── Stage forwarding and metrics ─────────────────────────────────────

    /// Sessionless execution of a stage the active plan assigns to this node.
    pub async fn stage_forward(&self, req: StageForwardRequest) -> Result<StageForwardResponse> {
        let plan = self.active_plan().await.ok_or(PipelineError::NoPlan)?;
        let stage = plan
            .get_stage(req.stage_id as usize)
            .ok_or_else(|| PipelineError::Execution(format!("plan has no stage {}", req.stage_id)))?;
        match (&self.local, self.is_local(stage)) {
            (Some(worker), true) => Ok(worker.run_stage(req, &stage.layers).await),
            _ => Err(PipelineError::Execution(format!(
                "stage {} is assigned to {}, not this coordinator",
                stage.stage_id, stage.node.node_id
            ))),
        }
    }

    async fn record_metrics(&self, source: &str, session_id: &str, token_index: u64, metadata: ExecutionMetadata) {
        self.metrics.lock().await.push(MetricsSubmission {
            source: source.to_string(),
            session_id: Some(session_id.to_string()),
            token_index: Some(token_index),
            metadata,
            timestamp: now_rfc3339(),
        });
    }

    pub async fn submit_metrics(&self, submission: MetricsSubmission) -> u64 {
        self.metrics.lock().await.push(submission)
    }

    pub async fn query_metrics(&self, source: Option<&str>) -> MetricsReport {
        self.metrics.lock().await.report(source)
    }

    // ── Liveness ─────────────────────────────────────────────────────────

    pub fn ping(&self, message: &str) -> PingResponse {
        PingResponse {
            message: format!("Coordinator {} is alive: {message}", self.node_id()),
            timestamp: now_rfc3339(),
            node_version: NODE_VERSION.to_string(),
        }
    }

    pub fn report_capabilities(&self) -> CapabilitiesResponse {
        capabilities_response(&self.capability)
    }

    pub async fn health(&self) -> HealthResponse {
        let (registered, healthy, devices) = {
            let registry = self.registry.read().await;
            (
                registry.len() as u32,
                registry.healthy_count() as u32,
                registry.device_summary(),
            )
        };
        let stats = self.stats.lock().await.clone();
        HealthResponse {
            status: "healthy".into(),
            role: NodeRole::Coordinator,
            node_id: self.node_id().to_string(),
            node_version: NODE_VERSION.to_string(),
            active_sessions: self.sessions.len().await as u32,
            registered_workers: registered,
            healthy_workers: healthy,
            has_plan: self.plan.read().await.is_some(),
            total_requests: stats.total_requests,
            avg_forward_latency_ms: stats.avg_forward_latency_ms(),
            devices: Some(devices),
        }
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// One pass of heartbeat expiry and idle-session expiry.
    pub async fn sweep(&self) {
        let expired = self.heartbeats.lock().await.check_timeouts();
        for node_id in expired {
            warn!(node_id = %node_id, "heartbeat timeout");
            self.mark_unhealthy(&node_id, "heartbeat timeout").await;
        }

        for session_id in self.sessions.idle(self.config.session_timeout()).await {
            info!(session_id = %session_id, "closing idle session");
            self.close_session_with(&session_id, Some("idle timeout".into())).await;
        }
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
                _ = ticker.tick() => self.sweep().await,
                _ = &mut shutdown => return,
            }
        }
    }
}

#[async_trait]
impl RequestHandler for Coordinator {
    async fn handle(&self, request: Request) -> Response {
        self.stats.lock().await.total_requests += 1;
        match request {
            Request::CreateSession(req) => {
                let id = req.session_id.clone();
                let node_info = self.node_info().await;
                let resp = match self.create_session(req).await {
                    Ok(session_id) => CreateSessionResponse {
                        success: true,
                        session_id,
                        error_message: None,
                        node_info,
                    },
                    Err(e) => CreateSessionResponse {
                        success: false,
                        session_id: id,
                        error_message: Some(e.to_string()),
                        node_info,
                    },
                };
                Response::CreateSession(resp)
            }
            Request::ExecuteForward(req) => {
                let resp = match self.execute_forward(req).await {
                    Ok((output, metadata)) => ExecuteForwardResponse {
                        success: true,
                        error_message: None,
                        output_activations: Some(output),
                        metadata,
                    },
                    Err(e) => ExecuteForwardResponse::failure(e.to_string()),
                };
                Response::ExecuteForward(resp)
            }
            Request::CloseSession(req) => Response::CloseSession(self.close_session(&req.session_id).await),
            Request::Ping(req) => Response::Ping(self.ping(&req.message)),
            Request::ReportCapabilities(_) => Response::Capabilities(self.report_capabilities()),
            Request::Health => Response::Health(self.health().await),
            Request::GeneratePlan(req) => Response::Plan(self.planning_response(req).await),
            Request::RegisterWorker(descriptor) => match self.register_worker(descriptor).await {
                Ok(resp) => Response::WorkerRegistered(resp),
                Err(e) => Response::error(e.to_string()),
            },
            Request::StageForward(req) => match self.stage_forward(req).await {
                Ok(resp) => Response::StageForward(resp),
                Err(e) => Response::StageForward(StageForwardResponse {
                    success: false,
                    error_message: Some(e.to_string()),
                    output_activations: None,
                    performance: StagePerformance::default(),
                }),
            },
            Request::SubmitMetrics(submission) => Response::MetricsAccepted {
                total_records: self.submit_metrics(submission).await,
            },
            Request::QueryMetrics(query) => Response::Metrics(self.query_metrics(query.source.as_deref()).await),
            Request::Heartbeat(req) => Response::Heartbeat(self.heartbeat(req).await),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PassthroughEngine;
    use layermesh_planner::synthetic_layer_costs;
    use layermesh_types::protocol::TensorDtype;
    use layermesh_types::{DeviceType, PartitionStrategy};

    fn coordinator(participate: bool) -> Coordinator {
        let config = CoordinatorConfig {
            participate,
            ..CoordinatorConfig::default()
        };
        let cap = HardwareCapability::new("coordinator", DeviceType::Gpu)
            .with_compute_score(100.0)
            .with_memory(24.0, 24.0)
            .with_fp16(true);
        Coordinator::new(
            config,
            cap,
            Arc::new(PassthroughEngine::new()),
            synthetic_layer_costs(),
            "127.0.0.1:1",
        )
        .unwrap()
    }

    fn planning(activate: bool) -> PlanningRequest {
        PlanningRequest {
            model_name: "gpt2".into(),
            strategy: PartitionStrategy::Balanced,
            nodes: vec![],
            layers: None,
            activate,
        }
    }

    fn open(id: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            session_id: id.into(),
            stage_config: StageConfig {
                stage_id: String::new(),
                stage_index: 0,
                device: String::new(),
                enable_kv_cache: false,
            },
            layer_names: vec![],
            max_sequence_length: 64,
            dtype: TensorDtype::F32,
        }
    }

    fn forward(id: &str, token: u64) -> ExecuteForwardRequest {
        ExecuteForwardRequest {
            session_id: id.into(),
            token_index: token,
            input_activations: TensorData::from_f32(vec![2], &[0.5, 1.5]),
            stage_ids: vec![],
        }
    }

    #[tokio::test]
    async fn plans_over_itself_when_alone() {
        let c = coordinator(true);
        let plan = c.generate_plan(planning(true)).await.unwrap();
        assert_eq!(plan.num_stages(), 1);
        assert_eq!(plan.stages[0].node.node_id, "coordinator");
        assert_eq!(plan.num_layers(), 26);
        assert!(c.active_plan().await.is_some());
    }

    #[tokio::test]
    async fn dry_run_plan_is_not_activated() {
        let c = coordinator(true);
        c.generate_plan(planning(false)).await.unwrap();
        assert!(c.active_plan().await.is_none());
    }

    #[tokio::test]
    async fn planning_failure_is_structured() {
        let c = coordinator(false);
        let resp = c.planning_response(planning(true)).await;
        assert!(!resp.success);
        assert!(resp.error_message.unwrap().contains("no nodes"));
    }

    #[tokio::test]
    async fn local_session_round_trip() {
        let c = coordinator(true);
        c.generate_plan(planning(true)).await.unwrap();

        let id = c.create_session(open("")).await.unwrap();
        let (out, meta) = c.execute_forward(forward(&id, 0)).await.unwrap();
        assert_eq!(out.to_f32().unwrap(), vec![0.5, 1.5]);
        assert_eq!(meta.stage_index, 0);

        let report = c.query_metrics(Some("coordinator")).await;
        assert_eq!(report.filtered_records, 1);

        assert!(c.close_session(&id).await.error_message.is_none());
        assert!(c.close_session(&id).await.error_message.is_some());
        assert!(matches!(
            c.execute_forward(forward(&id, 1)).await,
            Err(PipelineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn session_requires_plan() {
        let c = coordinator(true);
        assert!(matches!(c.create_session(open("s")).await, Err(PipelineError::NoPlan)));
    }

    #[tokio::test]
    async fn unreachable_stage_closes_session_and_marks_node() {
        let c = coordinator(false);
        // Nothing listens on port 1.
        let dead = NodeDescriptor {
            node_id: "dead".into(),
            device_type: DeviceType::Cpu,
            compute_score: 10.0,
            vram_gb: None,
            ram_gb: Some(32.0),
            network_latency_ms: 0.5,
            bandwidth_mbps: None,
            supports_fp16: None,
            address: "127.0.0.1:1".into(),
        };
        c.registry.write().await.register(dead).unwrap();
        c.generate_plan(planning(true)).await.unwrap();

        let err = c.create_session(open("s")).await.unwrap_err();
        assert!(err.is_node_health_event(), "{err}");
        assert!(!c.registry.read().await.is_healthy("dead"));
        assert!(c.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_node_asks_for_registration() {
        let c = coordinator(true);
        let resp = c
            .heartbeat(HeartbeatRequest {
                node_id: "ghost".into(),
                active_sessions: 0,
                load_factor: 0.0,
            })
            .await;
        assert!(!resp.registered);
    }

    #[tokio::test]
    async fn stage_forward_runs_local_stage() {
        let c = coordinator(true);
        c.generate_plan(planning(true)).await.unwrap();
        let resp = c
            .stage_forward(StageForwardRequest {
                session_id: "x".into(),
                token_index: 0,
                stage_id: 0,
                activations: TensorData::from_f32(vec![1], &[1.0]),
                metrics_url: None,
            })
            .await
            .unwrap();
        assert!(resp.success);
        assert!(c.stage_forward(StageForwardRequest {
            session_id: "x".into(),
            token_index: 0,
            stage_id: 9,
            activations: TensorData::from_f32(vec![1], &[1.0]),
            metrics_url: None,
        })
        .await
        .is_err());
    }

    #[tokio::test]
    async fn idle_sessions_are_swept() {
        let config = CoordinatorConfig {
            session_timeout_secs: 0,
            ..CoordinatorConfig::default()
        };
        let cap = HardwareCapability::new("coordinator", DeviceType::Cpu)
            .with_compute_score(10.0)
            .with_memory(16.0, 16.0);
        let c = Coordinator::new(config, cap, Arc::new(PassthroughEngine::new()), synthetic_layer_costs(), "127.0.0.1:1")
            .unwrap();
        c.generate_plan(planning(true)).await.unwrap();
        c.create_session(open("idle")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        c.sweep().await;
        assert!(c.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn health_counts() {
        let c = coordinator(true);
        c.handle(Request::Health).await;
        let h = c.health().await;
        assert_eq!(h.role, NodeRole::Coordinator);
        assert_eq!(h.registered_workers, 1);
        assert_eq!(h.healthy_workers, 1);
        assert!(!h.has_plan);
        assert_eq!(h.total_requests, 1);
        let devices = h.devices.unwrap();
        assert_eq!(devices.total_devices, 1);
        assert_eq!(devices.by_type.get("gpu"), Some(&1));
    }

    #[tokio::test]
    async fn open_sessions_hold_matcher_memory() {
        let c = coordinator(true);
        let plan = c.generate_plan(planning(true)).await.unwrap();
        let stage_gb = plan.stages[0].memory_required_mb / 1024.0;
        let available = |c: &Coordinator| {
            let registry = c.registry.try_read().unwrap();
            let gb = registry.matcher().get_device("coordinator").unwrap().available_memory_gb;
            gb
        };
        let before = available(&c);
        assert!(stage_gb > 0.0 && stage_gb < before);

        let id = c.create_session(open("a")).await.unwrap();
        assert!((available(&c) - (before - stage_gb)).abs() < 1e-9);
        let summary = c.health().await.devices.unwrap();
        assert!((summary.available_memory_gb - (before - stage_gb)).abs() < 1e-9);

        c.close_session(&id).await;
        assert!((available(&c) - before).abs() < 1e-9);
    }
}
