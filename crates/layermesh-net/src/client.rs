//! Client side of the stage protocol.
//!
//! One TCP connection per call. The whole round trip (connect, send,
//! receive) is bounded by `NetConfig::call_timeout`. Connection failures may
//! be retried with [`StageClient::call_with_retry`]; a timeout never is.
//! Operations that must not run twice (session setup, forward calls) only
//! retry when the connection was never established: a peer that closes
//! after reading the request may already have acted on it.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use layermesh_types::config::NetConfig;
use layermesh_types::protocol::{
    CapabilitiesRequest, CapabilitiesResponse, CloseSessionRequest, CloseSessionResponse,
    CreateSessionRequest, CreateSessionResponse, ExecuteForwardRequest, ExecuteForwardResponse,
    HealthResponse, HeartbeatRequest, HeartbeatResponse, MetricsQuery, MetricsReport,
    MetricsSubmission, PingRequest, PingResponse, PlanningRequest, PlanningResponse,
    RegisterWorkerResponse, StageForwardRequest, StageForwardResponse,
};
use layermesh_types::{NodeDescriptor, Request, Response};

use crate::codec::{read_message, write_message};
use crate::error::{NetError, Result};

#[derive(Debug, Clone)]
pub struct StageClient {
    addr: String,
    config: NetConfig,
}

impl StageClient {
    pub fn new(addr: impl Into<String>, config: NetConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Single attempt.
    pub async fn call(&self, request: &Request) -> Result<Response> {
        let timeout = self.config.call_timeout();
        match tokio::time::timeout(timeout, self.round_trip(request)).await {
            Ok(result) => result,
            Err(_) => Err(NetError::Timeout {
                addr: self.addr.clone(),
                after_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Retry connection-level failures up to `max_retries` extra times,
    /// doubling the back-off each attempt.
    pub async fn call_with_retry(&self, request: &Request) -> Result<Response> {
        self.retrying(request, NetError::is_retryable).await
    }

    /// Like [`Self::call_with_retry`], but only connect failures are retried.
    pub async fn call_with_connect_retry(&self, request: &Request) -> Result<Response> {
        self.retrying(request, NetError::is_connect_failure).await
    }

    async fn retrying(&self, request: &Request, retry_on: fn(&NetError) -> bool) -> Result<Response> {
        let mut backoff = self.config.retry_backoff();
        let mut attempt = 0u32;
        loop {
            match self.call(request).await {
                Err(e) if retry_on(&e) && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(addr = %self.addr, attempt, error = %e, "retrying stage call");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
                }
                other => return other,
            }
        }
    }

    async fn round_trip(&self, request: &Request) -> Result<Response> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| NetError::Unreachable {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, op = request.name(), "stage call");
        write_message(&mut stream, request).await?;
        read_message(&mut stream, self.config.max_frame_bytes).await
    }

    // ── Typed operations ─────────────────────────────────────────────────

    pub async fn create_session(&self, req: CreateSessionRequest) -> Result<CreateSessionResponse> {
        match self.call_with_connect_retry(&Request::CreateSession(req)).await? {
            Response::CreateSession(r) => Ok(r),
            other => Err(unexpected("create_session", other)),
        }
    }

    pub async fn execute_forward(&self, req: ExecuteForwardRequest) -> Result<ExecuteForwardResponse> {
        match self.call_with_connect_retry(&Request::ExecuteForward(req)).await? {
            Response::ExecuteForward(r) => Ok(r),
            other => Err(unexpected("execute_forward", other)),
        }
    }

    pub async fn close_session(&self, session_id: &str) -> Result<CloseSessionResponse> {
        let req = Request::CloseSession(CloseSessionRequest {
            session_id: session_id.to_string(),
        });
        match self.call_with_retry(&req).await? {
            Response::CloseSession(r) => Ok(r),
            other => Err(unexpected("close_session", other)),
        }
    }

    pub async fn ping(&self, message: &str) -> Result<PingResponse> {
        let req = Request::Ping(PingRequest {
            message: message.to_string(),
        });
        match self.call(&req).await? {
            Response::Ping(r) => Ok(r),
            other => Err(unexpected("ping", other)),
        }
    }

    pub async fn report_capabilities(&self, node_id: &str) -> Result<CapabilitiesResponse> {
        let req = Request::ReportCapabilities(CapabilitiesRequest {
            node_id: node_id.to_string(),
        });
        match self.call_with_retry(&req).await? {
            Response::Capabilities(r) => Ok(r),
            other => Err(unexpected("report_capabilities", other)),
        }
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        match self.call(&Request::Health).await? {
            Response::Health(r) => Ok(r),
            other => Err(unexpected("health", other)),
        }
    }

    pub async fn generate_plan(&self, req: PlanningRequest) -> Result<PlanningResponse> {
        match self.call_with_retry(&Request::GeneratePlan(req)).await? {
            Response::Plan(r) => Ok(r),
            other => Err(unexpected("generate_plan", other)),
        }
    }

    pub async fn register_worker(&self, descriptor: NodeDescriptor) -> Result<RegisterWorkerResponse> {
        match self.call_with_retry(&Request::RegisterWorker(descriptor)).await? {
            Response::WorkerRegistered(r) => Ok(r),
            other => Err(unexpected("register_worker", other)),
        }
    }

    pub async fn stage_forward(&self, req: StageForwardRequest) -> Result<StageForwardResponse> {
        match self.call_with_connect_retry(&Request::StageForward(req)).await? {
            Response::StageForward(r) => Ok(r),
            other => Err(unexpected("stage_forward", other)),
        }
    }

    pub async fn submit_metrics(&self, submission: MetricsSubmission) -> Result<u64> {
        match self.call(&Request::SubmitMetrics(submission)).await? {
            Response::MetricsAccepted { total_records } => Ok(total_records),
            other => Err(unexpected("submit_metrics", other)),
        }
    }

    pub async fn query_metrics(&self, source: Option<String>) -> Result<MetricsReport> {
        match self.call(&Request::QueryMetrics(MetricsQuery { source })).await? {
            Response::Metrics(r) => Ok(r),
            other => Err(unexpected("query_metrics", other)),
        }
    }

    pub async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        match self.call(&Request::Heartbeat(req)).await? {
            Response::Heartbeat(r) => Ok(r),
            other => Err(unexpected("heartbeat", other)),
        }
    }
}

fn unexpected(expected: &'static str, got: Response) -> NetError {
    match got {
        Response::Error { message } => NetError::Remote(message),
        other => NetError::UnexpectedResponse {
            expected,
            got: format!("{other:?}").chars().take(80).collect(),
        },
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    use crate::codec::read_frame;
    use layermesh_types::TensorData;

    /// Reads each request, then hangs up without answering.
    async fn hang_up_after_read() -> (String, Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let task = tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                if read_frame(&mut sock, 1 << 20).await.is_ok() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        (addr, seen, task)
    }

    fn fast() -> NetConfig {
        NetConfig {
            call_timeout_ms: 200,
            retry_backoff_ms: 10,
            ..NetConfig::default()
        }
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = StageClient::new(addr, fast());
        let err = client.call_with_retry(&Request::Health).await.unwrap_err();
        assert!(matches!(err, NetError::Unreachable { .. }), "{err}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let hold = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let client = StageClient::new(addr, fast());
        let err = client.call_with_retry(&Request::Health).await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert!(!err.is_retryable());
        hold.abort();
    }

    #[tokio::test]
    async fn forward_is_not_resent_after_peer_hangs_up() {
        let (addr, seen, task) = hang_up_after_read().await;
        let client = StageClient::new(addr, fast());
        let err = client
            .execute_forward(ExecuteForwardRequest {
                session_id: "s".into(),
                token_index: 0,
                input_activations: TensorData::from_f32(vec![1], &[1.0]),
                stage_ids: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Closed), "{err}");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        task.abort();
    }

    #[tokio::test]
    async fn idempotent_calls_retry_after_hang_up() {
        let (addr, seen, task) = hang_up_after_read().await;
        let client = StageClient::new(addr, fast());
        let err = client.close_session("s").await.unwrap_err();
        assert!(matches!(err, NetError::Closed), "{err}");
        assert_eq!(seen.load(Ordering::SeqCst), 1 + fast().max_retries as usize);
        task.abort();
    }

    #[tokio::test]
    async fn forward_retries_refused_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let client = StageClient::new(addr, fast());
        let err = client
            .call_with_connect_retry(&Request::Health)
            .await
            .unwrap_err();
        assert!(err.is_connect_failure());
    }

    #[test]
    fn error_response_maps_to_remote() {
        let err = unexpected("ping", Response::error("not a coordinator"));
        assert!(matches!(err, NetError::Remote(m) if m == "not a coordinator"));
    }
}
