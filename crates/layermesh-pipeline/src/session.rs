use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use layermesh_types::protocol::{StageConfig, TensorDtype};
use layermesh_types::PartitionPlan;

use crate::error::{PipelineError, Result};

// ── Session State Machine ────────────────────────────────────────────────────

/// Created → Active → Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered but its stages are not yet set up.
    Created,
    /// Accepting forward calls.
    Active,
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Active  => write!(f, "Active"),
            Self::Closed  => write!(f, "Closed"),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub state: SessionState,
    pub max_sequence_length: u32,
    pub dtype: TensorDtype,
    /// Coordinator sessions: the plan in force when the session opened.
    pub plan: Option<Arc<PartitionPlan>>,
    /// Worker sessions: the stage this worker runs.
    pub stage_config: Option<StageConfig>,
    pub layer_names: Vec<String>,
    pub tokens_processed: u64,
    pub last_token_index: Option<u64>,
    /// Set when the session closed because of a failure.
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    last_active: Instant,
}

impl Session {
    pub fn new(session_id: impl Into<String>, max_sequence_length: u32, dtype: TensorDtype) -> Self {
        Self {
            session_id: session_id.into(),
            state: SessionState::Created,
            max_sequence_length,
            dtype,
            plan: None,
            stage_config: None,
            layer_names: Vec::new(),
            tokens_processed: 0,
            last_token_index: None,
            error: None,
            created_at: chrono::Utc::now(),
            last_active: Instant::now(),
        }
    }

    pub fn with_plan(mut self, plan: Arc<PartitionPlan>) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_stage(mut self, stage_config: StageConfig, layer_names: Vec<String>) -> Self {
        self.stage_config = Some(stage_config);
        self.layer_names = layer_names;
        self
    }

    /// Transition `Created → Active`.
    pub fn activate(&mut self) -> Result<()> {
        if self.state != SessionState::Created {
            return Err(PipelineError::InvalidTransition {
                from: self.state.to_string(),
                to: SessionState::Active.to_string(),
            });
        }
        self.state = SessionState::Active;
        self.touch();
        Ok(())
    }

    /// Fails unless the session accepts forward calls.
    pub fn ensure_active(&self) -> Result<()> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::Closed => Err(PipelineError::SessionClosed(self.session_id.clone())),
            SessionState::Created => Err(PipelineError::InvalidTransition {
                from: self.state.to_string(),
                to: "executing forward".into(),
            }),
        }
    }

    pub fn record_forward(&mut self, token_index: u64) {
        self.tokens_processed += 1;
        self.last_token_index = Some(token_index);
        self.touch();
    }

    /// Move to `Closed`. Returns `false` when it already was.
    pub fn close(&mut self, error: Option<String>) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        if error.is_some() {
            self.error = error;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}

// ── Session Table ────────────────────────────────────────────────────────────

/// One session behind its own lock.
///
/// `tokio::sync::Mutex` queues waiters in FIFO order, so forward calls on a
/// session run in the order they arrive, and a close issued during a forward
/// call waits for that call to finish.
pub type SessionHandle = Arc<Mutex<Session>>;

/// Live sessions keyed by id. Closed sessions are removed.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Session) -> Result<SessionHandle> {
        self.insert_within(session, usize::MAX).await
    }

    /// Insert unless `limit` sessions are already open. The check and the
    /// insert happen under one write lock.
    pub async fn insert_within(&self, session: Session, limit: usize) -> Result<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_id) {
            return Err(PipelineError::Session(format!(
                "session {} already exists",
                session.session_id
            )));
        }
        if sessions.len() >= limit {
            return Err(PipelineError::Capacity(format!("{limit} sessions already open")));
        }
        let id = session.session_id.clone();
        let handle = Arc::new(Mutex::new(session));
        sessions.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))
    }

    pub async fn remove(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Sessions idle longer than `timeout`. Sessions busy with a forward
    /// call are never idle.
    pub async fn idle(&self, timeout: Duration) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter_map(|(id, handle)| {
                let session = handle.try_lock().ok()?;
                (session.idle_for() > timeout).then(|| id.clone())
            })
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> Session {
        Session::new(id, 512, TensorDtype::F32)
    }

    #[test]
    fn lifecycle() {
        let mut s = session("s1");
        assert_eq!(s.state, SessionState::Created);
        assert!(s.ensure_active().is_err());

        s.activate().unwrap();
        s.ensure_active().unwrap();
        s.record_forward(0);
        s.record_forward(1);
        assert_eq!(s.tokens_processed, 2);
        assert_eq!(s.last_token_index, Some(1));

        assert!(s.close(None));
        assert!(!s.close(None));
        assert!(matches!(s.ensure_active(), Err(PipelineError::SessionClosed(_))));
    }

    #[test]
    fn cannot_reactivate() {
        let mut s = session("s1");
        s.activate().unwrap();
        assert!(matches!(s.activate(), Err(PipelineError::InvalidTransition { .. })));
        s.close(None);
        assert!(s.activate().is_err());
    }

    #[test]
    fn failure_reason_is_kept() {
        let mut s = session("s1");
        s.activate().unwrap();
        s.close(Some("stage 1 timed out".into()));
        assert_eq!(s.error.as_deref(), Some("stage 1 timed out"));
    }

    #[tokio::test]
    async fn table_insert_get_remove() {
        let table = SessionTable::new();
        table.insert(session("a")).await.unwrap();
        assert!(table.insert(session("a")).await.is_err());
        assert_eq!(table.len().await, 1);

        let handle = table.get("a").await.unwrap();
        handle.lock().await.activate().unwrap();

        assert!(table.remove("a").await.is_some());
        assert!(matches!(table.get("a").await, Err(PipelineError::SessionNotFound(_))));
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn bounded_insert_holds_the_limit_under_contention() {
        let table = Arc::new(SessionTable::new());
        let attempts: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                tokio::spawn(async move { table.insert_within(session(&format!("s{i}")), 3).await.is_ok() })
            })
            .collect();
        let mut accepted = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 3);
        assert_eq!(table.len().await, 3);
        assert!(matches!(
            table.insert_within(session("late"), 3).await,
            Err(PipelineError::Capacity(_))
        ));
    }

    #[tokio::test]
    async fn busy_sessions_are_not_idle() {
        let table = SessionTable::new();
        let handle = table.insert(session("busy")).await.unwrap();
        table.insert(session("quiet")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _guard = handle.lock().await;
        let idle = table.idle(Duration::from_millis(5)).await;
        assert_eq!(idle, vec!["quiet".to_string()]);
    }

    #[tokio::test]
    async fn close_waits_for_inflight_call() {
        let table = SessionTable::new();
        let handle = table.insert(session("s")).await.unwrap();
        handle.lock().await.activate().unwrap();

        let forward = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let mut s = handle.lock().await;
                tokio::time::sleep(Duration::from_millis(30)).await;
                s.ensure_active().map(|_| s.record_forward(0))
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut s = handle.lock().await;
        assert_eq!(s.tokens_processed, 1);
        assert!(s.close(None));
        drop(s);
        assert!(forward.await.unwrap().is_ok());
    }
}
