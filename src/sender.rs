//! Delayed message sender.
//!
//! Interactive terminals misorder pasted content and the terminating
//! newline under load, so delivery is two-phase: send the literal content,
//! wait, then send a discrete Enter keystroke. A pool of workers drains
//! two FIFO queues (priority before normal) while holding an exclusive
//! per-session lease for each request's full lifetime, so deliveries to
//! one session never interleave. Phase A runs behind a global circuit
//! breaker with retries.

pub mod breaker;
pub mod metrics;

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::tmux::{SendTarget, TmuxClient, TmuxError};
use breaker::{BreakerConfig, CircuitBreaker};
use metrics::{MetricsCounters, MetricsSnapshot};

/// Longest accepted Phase-B delay
const MAX_DELAY: Duration = Duration::from_secs(300);
/// Longest accepted message content
const MAX_CONTENT_LEN: usize = 5000;

/// Sender tuning
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Phase-B delay applied when the request does not specify one
    pub default_delay: Duration,
    /// Hard cap on total enqueued requests across both queues
    pub max_queue: usize,
    /// Worker pool size; also the max concurrently-leased sessions
    pub max_concurrent_sessions: usize,
    pub phase_a_retries: usize,
    pub phase_a_base_delay: Duration,
    pub phase_a_max_delay: Duration,
    pub phase_b_retries: usize,
    pub phase_b_base_delay: Duration,
    pub phase_b_max_delay: Duration,
    pub breaker: BreakerConfig,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            default_delay: Duration::from_secs(10),
            max_queue: 1000,
            max_concurrent_sessions: 10,
            phase_a_retries: 2,
            phase_a_base_delay: Duration::from_millis(500),
            phase_a_max_delay: Duration::from_secs(5),
            phase_b_retries: 1,
            phase_b_base_delay: Duration::from_millis(200),
            phase_b_max_delay: Duration::from_secs(2),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Delivery priority; High and Urgent drain before Low and Normal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl SendPriority {
    fn is_priority(self) -> bool {
        matches!(self, SendPriority::High | SendPriority::Urgent)
    }
}

impl FromStr for SendPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(SendPriority::Low),
            "normal" => Ok(SendPriority::Normal),
            "high" => Ok(SendPriority::High),
            "urgent" => Ok(SendPriority::Urgent),
            other => Err(format!("invalid priority: {other}")),
        }
    }
}

/// Delivery state of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    MessageSent,
    EnterScheduled,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

/// One queued delivery
#[derive(Debug, Clone)]
struct SendRequest {
    request_id: String,
    session_name: String,
    content: String,
    delay: Duration,
    priority: SendPriority,
    window: Option<u32>,
    pane: Option<u32>,
}

/// Status copy returned to callers
#[derive(Debug, Clone, Serialize)]
pub struct RequestStatus {
    pub request_id: String,
    pub session_name: String,
    pub state: RequestState,
    pub priority: SendPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub estimated_completion: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_a_ms: Option<f64>,
}

/// Callback fired when a request reaches Completed or Failed
pub type CompletionHook = Arc<dyn Fn(&RequestStatus) + Send + Sync>;

struct SenderState {
    priority_queue: VecDeque<SendRequest>,
    normal_queue: VecDeque<SendRequest>,
    leased: HashSet<String>,
    statuses: HashMap<String, RequestStatus>,
}

struct SenderInner {
    tmux: Arc<dyn TmuxClient>,
    config: SenderConfig,
    state: Mutex<SenderState>,
    metrics: Mutex<MetricsCounters>,
    breaker: CircuitBreaker,
    notify: Notify,
    shutdown: AtomicBool,
    completion_hook: Option<CompletionHook>,
}

/// Two-phase delayed sender with bounded concurrency
pub struct DelayedSender {
    inner: Arc<SenderInner>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DelayedSender {
    pub fn new(tmux: Arc<dyn TmuxClient>, config: SenderConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker.clone());
        Self {
            inner: Arc::new(SenderInner {
                tmux,
                config,
                state: Mutex::new(SenderState {
                    priority_queue: VecDeque::new(),
                    normal_queue: VecDeque::new(),
                    leased: HashSet::new(),
                    statuses: HashMap::new(),
                }),
                metrics: Mutex::new(MetricsCounters::default()),
                breaker,
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
                completion_hook: None,
            }),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Install a hook fired with the final request status on completion
    pub fn with_completion_hook(
        tmux: Arc<dyn TmuxClient>,
        config: SenderConfig,
        hook: CompletionHook,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.breaker.clone());
        Self {
            inner: Arc::new(SenderInner {
                tmux,
                config,
                state: Mutex::new(SenderState {
                    priority_queue: VecDeque::new(),
                    normal_queue: VecDeque::new(),
                    leased: HashSet::new(),
                    statuses: HashMap::new(),
                }),
                metrics: Mutex::new(MetricsCounters::default()),
                breaker,
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
                completion_hook: Some(hook),
            }),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);
        let mut workers = self.workers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for _ in 0..self.inner.config.max_concurrent_sessions {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                SenderInner::worker_loop(inner).await;
            }));
        }
        info!(
            workers = self.inner.config.max_concurrent_sessions,
            "Delayed sender started"
        );
    }

    /// Signal workers to stop after their current request. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        self.running.store(false, Ordering::SeqCst);
    }

    /// Enqueue a two-phase delivery; returns the request id.
    pub fn enqueue(
        &self,
        session_name: &str,
        content: &str,
        delay: Option<Duration>,
        priority: SendPriority,
        window: Option<u32>,
        pane: Option<u32>,
    ) -> Result<String, CoordinatorError> {
        let session_name = session_name.trim();
        if session_name.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "session name cannot be empty".to_string(),
            ));
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "message content cannot be empty".to_string(),
            ));
        }
        if content.len() > MAX_CONTENT_LEN {
            return Err(CoordinatorError::InvalidArgument(format!(
                "message content exceeds {MAX_CONTENT_LEN} bytes"
            )));
        }
        let delay = delay.unwrap_or(self.inner.config.default_delay);
        if delay > MAX_DELAY {
            return Err(CoordinatorError::InvalidArgument(format!(
                "delay exceeds maximum of {MAX_DELAY:?}"
            )));
        }

        let request = SendRequest {
            request_id: Uuid::new_v4().to_string(),
            session_name: session_name.to_string(),
            content: content.to_string(),
            delay,
            priority,
            window,
            pane,
        };
        let request_id = request.request_id.clone();
        let now = Utc::now();
        let status = RequestStatus {
            request_id: request_id.clone(),
            session_name: request.session_name.clone(),
            state: RequestState::Pending,
            priority,
            error: None,
            created_at: now,
            estimated_completion: now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            phase_a_ms: None,
        };

        {
            let mut state = self.inner.lock_state();
            let queued = state.priority_queue.len() + state.normal_queue.len();
            if queued >= self.inner.config.max_queue {
                self.inner
                    .lock_metrics()
                    .rejected_queue_full += 1;
                return Err(CoordinatorError::ResourceExhausted(format!(
                    "sender queue is full ({queued} requests)"
                )));
            }
            // Drop terminal records older than an hour to bound the map
            let cutoff = now - chrono::Duration::hours(1);
            state
                .statuses
                .retain(|_, s| !(s.state.is_terminal() && s.created_at < cutoff));

            state.statuses.insert(request_id.clone(), status);
            if priority.is_priority() {
                state.priority_queue.push_back(request);
            } else {
                state.normal_queue.push_back(request);
            }
        }
        self.inner.lock_metrics().enqueued += 1;
        self.inner.notify.notify_one();

        debug!(request = %request_id, session = %session_name, ?delay, "Enqueued delayed send");
        Ok(request_id)
    }

    /// Best-effort cancellation. A request mid-Phase-A completes Phase A
    /// but skips Phase B. Returns false for unknown or finished requests.
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut state = self.inner.lock_state();
        let Some(status) = state.statuses.get_mut(request_id) else {
            return false;
        };
        if status.state.is_terminal() {
            return false;
        }
        status.state = RequestState::Cancelled;
        state
            .priority_queue
            .retain(|r| r.request_id != request_id);
        state.normal_queue.retain(|r| r.request_id != request_id);
        self.inner.lock_metrics().cancelled += 1;
        info!(request = %request_id, "Cancelled delayed send");
        true
    }

    /// Status copy for one request
    pub fn status(&self, request_id: &str) -> Option<RequestStatus> {
        self.inner.lock_state().statuses.get(request_id).cloned()
    }

    /// Aggregate delivery metrics
    pub fn metrics(&self) -> MetricsSnapshot {
        let state = self.inner.lock_state();
        let pending = state
            .statuses
            .values()
            .filter(|s| s.state == RequestState::Pending)
            .count();
        let in_flight = state
            .statuses
            .values()
            .filter(|s| {
                matches!(
                    s.state,
                    RequestState::MessageSent | RequestState::EnterScheduled
                )
            })
            .count();
        drop(state);

        let counters = self.inner.lock_metrics();
        let finished = counters.completed + counters.failed;
        MetricsSnapshot {
            enqueued: counters.enqueued,
            pending,
            in_flight,
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            rejected_queue_full: counters.rejected_queue_full,
            rejected_breaker_open: counters.rejected_breaker_open,
            success_rate: if finished == 0 {
                0.0
            } else {
                counters.completed as f64 / finished as f64
            },
            phase_a_avg_ms: counters.phase_a_duration.avg_ms(),
            phase_a_min_ms: counters.phase_a_duration.min_ms,
            phase_a_max_ms: counters.phase_a_duration.max_ms,
            phase_a_retries: counters.phase_a_retries,
            phase_b_retries: counters.phase_b_retries,
            breaker: self.inner.breaker.snapshot(),
        }
    }
}

impl SenderInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, SenderState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, MetricsCounters> {
        self.metrics.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn worker_loop(inner: Arc<SenderInner>) {
        loop {
            if inner.shutdown.load(Ordering::SeqCst) {
                break;
            }
            // Create the wakeup future before checking the queues so an
            // enqueue between check and await is not lost
            let notified = inner.notify.notified();
            if let Some(request) = inner.take_next() {
                inner.process(request).await;
                // A released lease may unblock a skipped request
                inner.notify.notify_one();
            } else {
                tokio::select! {
                    () = notified => {}
                    () = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }
        }
    }

    /// Pop the next eligible request: priority queue first, skipping
    /// requests whose session is leased (skipped entries rotate to the
    /// tail of their own queue to preserve fairness).
    fn take_next(&self) -> Option<SendRequest> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        for queue in [&mut state.priority_queue, &mut state.normal_queue] {
            let mut rotations = queue.len();
            while rotations > 0 {
                rotations -= 1;
                let Some(request) = queue.pop_front() else {
                    break;
                };
                // Drop requests cancelled while queued
                if state
                    .statuses
                    .get(&request.request_id)
                    .is_some_and(|s| s.state == RequestState::Cancelled)
                {
                    continue;
                }
                if state.leased.contains(&request.session_name) {
                    queue.push_back(request);
                    continue;
                }
                state.leased.insert(request.session_name.clone());
                return Some(request);
            }
        }
        None
    }

    fn set_state(&self, request_id: &str, new_state: RequestState, error: Option<String>) {
        let mut state = self.lock_state();
        if let Some(status) = state.statuses.get_mut(request_id) {
            // Cancellation wins races with the worker
            if status.state == RequestState::Cancelled && new_state != RequestState::Cancelled {
                return;
            }
            status.state = new_state;
            if error.is_some() {
                status.error = error;
            }
        }
    }

    fn is_cancelled(&self, request_id: &str) -> bool {
        self.lock_state()
            .statuses
            .get(request_id)
            .is_some_and(|s| s.state == RequestState::Cancelled)
    }

    fn release_lease(&self, session_name: &str) {
        self.lock_state().leased.remove(session_name);
    }

    fn fire_hook(&self, request_id: &str) {
        if let Some(hook) = &self.completion_hook {
            let status = self.lock_state().statuses.get(request_id).cloned();
            if let Some(status) = status {
                hook(&status);
            }
        }
    }

    async fn process(&self, request: SendRequest) {
        if self.is_cancelled(&request.request_id) {
            self.release_lease(&request.session_name);
            return;
        }

        let target = SendTarget {
            session: request.session_name.clone(),
            window: request.window,
            pane: request.pane,
        };

        // Phase A: literal content behind the circuit breaker
        if self.breaker.try_acquire().is_err() {
            warn!(
                request = %request.request_id,
                session = %request.session_name,
                "Circuit breaker open, rejecting delivery"
            );
            {
                let mut counters = self.lock_metrics();
                counters.rejected_breaker_open += 1;
                counters.failed += 1;
            }
            self.set_state(
                &request.request_id,
                RequestState::Failed,
                Some("circuit breaker open".to_string()),
            );
            self.release_lease(&request.session_name);
            self.fire_hook(&request.request_id);
            return;
        }

        let started = Instant::now();
        let phase_a = {
            let tmux = &self.tmux;
            let target = &target;
            let content = &request.content;
            (|| async move { tmux.send_literal(target, content).await })
                .retry(
                    ExponentialBuilder::default()
                        .with_min_delay(self.config.phase_a_base_delay)
                        .with_max_delay(self.config.phase_a_max_delay)
                        .with_max_times(self.config.phase_a_retries)
                        .with_jitter(),
                )
                .notify(|err: &TmuxError, retry_after: Duration| {
                    warn!(error = %err, ?retry_after, "Retrying content delivery");
                    self.lock_metrics().phase_a_retries += 1;
                })
                .await
        };

        match phase_a {
            Ok(()) => {
                self.breaker.record_success();
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                {
                    let mut state = self.lock_state();
                    if let Some(status) = state.statuses.get_mut(&request.request_id) {
                        status.phase_a_ms = Some(elapsed_ms);
                    }
                }
                self.lock_metrics().phase_a_duration.record(elapsed_ms);
                self.set_state(&request.request_id, RequestState::MessageSent, None);
                self.set_state(&request.request_id, RequestState::EnterScheduled, None);
            }
            Err(e) => {
                self.breaker.record_failure();
                self.lock_metrics().failed += 1;
                self.set_state(&request.request_id, RequestState::Failed, Some(e.to_string()));
                self.release_lease(&request.session_name);
                self.fire_hook(&request.request_id);
                return;
            }
        }

        // Phase B after the configured pause
        tokio::time::sleep(request.delay).await;

        if self.is_cancelled(&request.request_id) {
            debug!(request = %request.request_id, "Cancelled during delay, skipping Enter");
            self.release_lease(&request.session_name);
            return;
        }

        let phase_b = {
            let tmux = &self.tmux;
            let target = &target;
            (|| async move { tmux.send_enter(target).await })
                .retry(
                    ExponentialBuilder::default()
                        .with_min_delay(self.config.phase_b_base_delay)
                        .with_max_delay(self.config.phase_b_max_delay)
                        .with_max_times(self.config.phase_b_retries)
                        .with_jitter(),
                )
                .notify(|err: &TmuxError, retry_after: Duration| {
                    warn!(error = %err, ?retry_after, "Retrying Enter delivery");
                    self.lock_metrics().phase_b_retries += 1;
                })
                .await
        };

        match phase_b {
            Ok(()) => {
                self.lock_metrics().completed += 1;
                self.set_state(&request.request_id, RequestState::Completed, None);
                info!(
                    request = %request.request_id,
                    session = %request.session_name,
                    "Delayed send completed"
                );
                self.release_lease(&request.session_name);
                self.fire_hook(&request.request_id);
            }
            Err(e) => {
                self.lock_metrics().failed += 1;
                self.set_state(&request.request_id, RequestState::Failed, Some(e.to_string()));
                self.release_lease(&request.session_name);
                self.fire_hook(&request.request_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::MockTmuxClient;

    fn fast_config() -> SenderConfig {
        SenderConfig {
            default_delay: Duration::from_millis(10),
            phase_a_base_delay: Duration::from_millis(1),
            phase_a_max_delay: Duration::from_millis(5),
            phase_b_base_delay: Duration::from_millis(1),
            phase_b_max_delay: Duration::from_millis(5),
            breaker: BreakerConfig {
                open_timeout: Duration::from_millis(50),
                ..BreakerConfig::default()
            },
            ..SenderConfig::default()
        }
    }

    async fn wait_terminal(sender: &DelayedSender, request_id: &str) -> RequestState {
        for _ in 0..300 {
            if let Some(status) = sender.status(request_id) {
                if status.state.is_terminal() {
                    return status.state;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("request {request_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_two_phase_delivery() {
        let tmux = Arc::new(MockTmuxClient::new());
        tmux.add_session("parallel_P_task_child_X", "/tmp");
        let sender = DelayedSender::new(tmux.clone(), fast_config());
        sender.start();

        let id = sender
            .enqueue(
                "parallel_P_task_child_X",
                "hello",
                Some(Duration::from_millis(20)),
                SendPriority::Normal,
                None,
                None,
            )
            .unwrap();

        assert_eq!(wait_terminal(&sender, &id).await, RequestState::Completed);
        assert_eq!(
            tmux.keys_sent("parallel_P_task_child_X"),
            vec!["-l hello".to_string(), "Enter".to_string()]
        );
        sender.stop();
    }

    #[tokio::test]
    async fn test_priority_queue_drained_first() {
        let tmux = Arc::new(MockTmuxClient::new());
        tmux.add_session("s1", "/tmp");
        tmux.add_session("s2", "/tmp");
        let config = SenderConfig {
            max_concurrent_sessions: 1,
            ..fast_config()
        };
        let sender = DelayedSender::new(tmux.clone(), config);

        // Enqueue before starting so ordering is decided by the queues
        let low = sender
            .enqueue("s1", "low", Some(Duration::from_millis(1)), SendPriority::Low, None, None)
            .unwrap();
        let urgent = sender
            .enqueue("s2", "urgent", Some(Duration::from_millis(1)), SendPriority::Urgent, None, None)
            .unwrap();
        sender.start();

        wait_terminal(&sender, &low).await;
        wait_terminal(&sender, &urgent).await;

        let commands = tmux.commands();
        let sends: Vec<&str> = commands
            .iter()
            .filter(|c| c.operation == "send_literal")
            .map(|c| c.args[1].as_str())
            .collect();
        assert_eq!(sends, vec!["urgent", "low"]);
        sender.stop();
    }

    #[tokio::test]
    async fn test_same_session_serialized_by_lease() {
        let tmux = Arc::new(MockTmuxClient::new());
        tmux.add_session("s", "/tmp");
        let sender = DelayedSender::new(tmux.clone(), fast_config());

        let a = sender
            .enqueue("s", "a", Some(Duration::from_millis(20)), SendPriority::Normal, None, None)
            .unwrap();
        let b = sender
            .enqueue("s", "b", Some(Duration::from_millis(20)), SendPriority::Normal, None, None)
            .unwrap();
        sender.start();

        wait_terminal(&sender, &a).await;
        wait_terminal(&sender, &b).await;

        // Phase A and Enter never interleave across the two requests
        assert_eq!(
            tmux.keys_sent("s"),
            vec![
                "-l a".to_string(),
                "Enter".to_string(),
                "-l b".to_string(),
                "Enter".to_string()
            ]
        );
        sender.stop();
    }

    #[tokio::test]
    async fn test_queue_full() {
        let tmux = Arc::new(MockTmuxClient::new());
        let config = SenderConfig {
            max_queue: 2,
            ..fast_config()
        };
        let sender = DelayedSender::new(tmux, config);

        sender
            .enqueue("s", "1", None, SendPriority::Normal, None, None)
            .unwrap();
        sender
            .enqueue("s", "2", None, SendPriority::Normal, None, None)
            .unwrap();
        let err = sender
            .enqueue("s", "3", None, SendPriority::Normal, None, None)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ResourceExhausted(_)));
        assert_eq!(sender.metrics().rejected_queue_full, 1);
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let tmux = Arc::new(MockTmuxClient::new());
        let sender = DelayedSender::new(tmux, fast_config());

        assert!(sender
            .enqueue("", "x", None, SendPriority::Normal, None, None)
            .is_err());
        assert!(sender
            .enqueue("s", "   ", None, SendPriority::Normal, None, None)
            .is_err());
        assert!(sender
            .enqueue("s", "x", Some(Duration::from_secs(301)), SendPriority::Normal, None, None)
            .is_err());
        let oversized = "x".repeat(MAX_CONTENT_LEN + 1);
        assert!(sender
            .enqueue("s", &oversized, None, SendPriority::Normal, None, None)
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_during_delay_skips_enter() {
        let tmux = Arc::new(MockTmuxClient::new());
        tmux.add_session("s", "/tmp");
        let sender = DelayedSender::new(tmux.clone(), fast_config());
        sender.start();

        let id = sender
            .enqueue("s", "never-entered", Some(Duration::from_millis(300)), SendPriority::Normal, None, None)
            .unwrap();

        // Wait for Phase A to land
        for _ in 0..100 {
            if !tmux.keys_sent("s").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(sender.cancel(&id));
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(sender.status(&id).unwrap().state, RequestState::Cancelled);
        assert_eq!(tmux.keys_sent("s"), vec!["-l never-entered".to_string()]);
        sender.stop();
    }

    #[tokio::test]
    async fn test_cancel_unknown_or_finished() {
        let tmux = Arc::new(MockTmuxClient::new());
        tmux.add_session("s", "/tmp");
        let sender = DelayedSender::new(tmux, fast_config());
        sender.start();

        assert!(!sender.cancel("no-such-request"));

        let id = sender
            .enqueue("s", "x", Some(Duration::from_millis(1)), SendPriority::Normal, None, None)
            .unwrap();
        wait_terminal(&sender, &id).await;
        assert!(!sender.cancel(&id));
        sender.stop();
    }

    #[tokio::test]
    async fn test_phase_a_retry_then_success() {
        let tmux = Arc::new(MockTmuxClient::new());
        tmux.add_session("s", "/tmp");
        tmux.fail_next_sends(1);
        let sender = DelayedSender::new(tmux.clone(), fast_config());
        sender.start();

        let id = sender
            .enqueue("s", "retry-me", Some(Duration::from_millis(1)), SendPriority::Normal, None, None)
            .unwrap();
        assert_eq!(wait_terminal(&sender, &id).await, RequestState::Completed);

        let metrics = sender.metrics();
        assert_eq!(metrics.phase_a_retries, 1);
        assert_eq!(metrics.completed, 1);
        assert!(metrics.success_rate > 0.99);
        sender.stop();
    }

    #[tokio::test]
    async fn test_breaker_opens_and_rejects_without_executor() {
        let tmux = Arc::new(MockTmuxClient::new());
        // No sessions exist, so every send fails even past injected ones.
        // The default 60 s open window keeps the breaker from slipping
        // into half-open mid-test.
        let config = SenderConfig {
            max_concurrent_sessions: 1,
            breaker: BreakerConfig::default(),
            ..fast_config()
        };
        let sender = DelayedSender::new(tmux.clone(), config);
        sender.start();

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                sender
                    .enqueue(
                        &format!("missing-{i}"),
                        "x",
                        Some(Duration::from_millis(1)),
                        SendPriority::Normal,
                        None,
                        None,
                    )
                    .unwrap(),
            );
        }
        for id in &ids {
            assert_eq!(wait_terminal(&sender, id).await, RequestState::Failed);
        }

        // Breaker is now open; the next request must fail without any
        // further executor invocation
        let commands_before = tmux
            .commands()
            .iter()
            .filter(|c| c.operation == "send_literal")
            .count();
        let id = sender
            .enqueue("missing-6", "x", Some(Duration::from_millis(1)), SendPriority::Normal, None, None)
            .unwrap();
        assert_eq!(wait_terminal(&sender, &id).await, RequestState::Failed);

        let commands_after = tmux
            .commands()
            .iter()
            .filter(|c| c.operation == "send_literal")
            .count();
        assert_eq!(commands_before, commands_after);
        let metrics = sender.metrics();
        assert_eq!(metrics.rejected_breaker_open, 1);
        assert_eq!(
            metrics.breaker.state,
            breaker::CircuitState::Open
        );
        sender.stop();
    }

    #[tokio::test]
    async fn test_completion_hook_fires() {
        let tmux = Arc::new(MockTmuxClient::new());
        tmux.add_session("s", "/tmp");
        let seen: Arc<Mutex<Vec<(String, RequestState)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_hook = Arc::clone(&seen);
        let sender = DelayedSender::with_completion_hook(
            tmux,
            fast_config(),
            Arc::new(move |status: &RequestStatus| {
                seen_hook
                    .lock()
                    .unwrap()
                    .push((status.request_id.clone(), status.state));
            }),
        );
        sender.start();

        let id = sender
            .enqueue("s", "x", Some(Duration::from_millis(1)), SendPriority::Normal, None, None)
            .unwrap();
        wait_terminal(&sender, &id).await;

        let calls = seen.lock().unwrap().clone();
        assert_eq!(calls, vec![(id, RequestState::Completed)]);
        sender.stop();
    }
}
