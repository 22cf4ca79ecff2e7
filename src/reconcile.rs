//! Reconciliation loop.
//!
//! A periodic task that lists live tmux sessions and patches the registry
//! to match reality: externally created sessions matching the grammar are
//! adopted as Unknown-status stubs, sessions absent from tmux for two
//! consecutive ticks are evicted, and expired messages are swept. After
//! each tick an updated child roster is published for observers.
//!
//! Ticks never overlap — a tick that runs long delays the next one; the
//! loop does not queue ticks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::{SessionRecord, SessionRole};
use crate::naming::{self, ParsedSession};
use crate::registry::SessionRegistry;
use crate::tmux::TmuxClient;

/// Roster of child sessions published after each tick
pub type ChildRoster = Vec<SessionRecord>;

/// Periodic registry/tmux reconciler
pub struct Reconciler {
    tmux: Arc<dyn TmuxClient>,
    registry: Arc<SessionRegistry>,
    tick_interval: Duration,
    shutdown: Arc<Notify>,
    running: AtomicBool,
    roster_tx: watch::Sender<ChildRoster>,
    roster_rx: watch::Receiver<ChildRoster>,
}

impl Reconciler {
    pub fn new(
        tmux: Arc<dyn TmuxClient>,
        registry: Arc<SessionRegistry>,
        tick_interval: Duration,
    ) -> Self {
        let (roster_tx, roster_rx) = watch::channel(Vec::new());
        Self {
            tmux,
            registry,
            tick_interval,
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            roster_tx,
            roster_rx,
        }
    }

    /// Watch handle for the published child roster
    pub fn roster(&self) -> watch::Receiver<ChildRoster> {
        self.roster_rx.clone()
    }

    /// Run one reconciliation pass immediately
    pub async fn tick_once(&self) {
        // Empty output or a tmux error both mean "no live sessions"
        let live_names = self.tmux.list_sessions().await.unwrap_or_default();

        // Only grammar-matching sessions participate; anything else is not
        // ours to manage
        let live: HashSet<String> = live_names
            .iter()
            .filter(|name| naming::parse(name) != ParsedSession::Unknown)
            .cloned()
            .collect();

        // Adopt externally created sessions absent from the registry
        let known = self.registry.query_all();
        for name in &live {
            if !known.contains_key(name) {
                match self.registry.adopt_session(name) {
                    Ok(true) => debug!(session = %name, "Adopted live session"),
                    Ok(false) => {}
                    Err(e) => warn!(session = %name, error = %e, "Adoption failed"),
                }
            }
        }

        // Mark absences, evict after two consecutive misses
        let report = self.registry.sync_with_live(&live);
        if !report.evicted.is_empty() {
            info!(evicted = ?report.evicted, "Evicted sessions absent from tmux");
        }

        let swept = self.registry.sweep(Utc::now());
        if swept > 0 {
            debug!(swept, "Reconciliation sweep removed expired messages");
        }

        self.publish_roster();
    }

    fn publish_roster(&self) {
        let mut roster: ChildRoster = self
            .registry
            .query_all()
            .into_values()
            .filter(|record| record.role == SessionRole::Child)
            .collect();
        roster.sort_by(|a, b| a.session_name.cmp(&b.session_name));
        // Send only fails when every receiver is gone, which is fine
        let _ = self.roster_tx.send(roster);
    }

    /// Start the periodic loop. Idempotent: a second start while running
    /// is a no-op returning None.
    pub fn start(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        info!(interval = ?self.tick_interval, "Reconciliation loop started");
        let reconciler = self;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconciler.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        reconciler.tick_once().await;
                    }
                    () = reconciler.shutdown.notified() => {
                        break;
                    }
                }
            }
            reconciler.running.store(false, Ordering::SeqCst);
            info!("Reconciliation loop stopped");
        }))
    }

    /// Request shutdown; the loop exits within one tick period. Idempotent.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionStatus;
    use crate::registry::RegistryLimits;
    use crate::tmux::MockTmuxClient;

    fn fixture() -> (Arc<MockTmuxClient>, Arc<SessionRegistry>, Arc<Reconciler>) {
        let tmux = Arc::new(MockTmuxClient::new());
        let registry = Arc::new(SessionRegistry::new(RegistryLimits::default()));
        let reconciler = Arc::new(Reconciler::new(
            tmux.clone(),
            registry.clone(),
            Duration::from_millis(20),
        ));
        (tmux, registry, reconciler)
    }

    #[tokio::test]
    async fn test_adopts_external_session() {
        let (tmux, registry, reconciler) = fixture();
        tmux.add_session("parallel_P_task_child_T2", "/tmp");

        reconciler.tick_once().await;

        let record = registry.query_status("parallel_P_task_child_T2").unwrap();
        assert_eq!(record.role, SessionRole::Child);
        assert_eq!(record.project_id, "P");
        assert_eq!(record.task_id.as_deref(), Some("T2"));
        assert_eq!(record.status, SessionStatus::Unknown);
        assert!(record.tmux_present);
    }

    #[tokio::test]
    async fn test_ignores_non_grammar_sessions() {
        let (tmux, registry, reconciler) = fixture();
        tmux.add_session("someones-editor", "/tmp");
        tmux.add_session("parallel_bad name_task_master", "/tmp");

        reconciler.tick_once().await;

        assert!(registry.query_all().is_empty());
    }

    #[tokio::test]
    async fn test_evicts_after_two_ticks() {
        let (tmux, registry, reconciler) = fixture();
        tmux.add_session("parallel_P_task_child_T3", "/tmp");
        reconciler.tick_once().await;
        assert!(registry.query_status("parallel_P_task_child_T3").is_ok());

        // Session dies externally
        tmux.drop_session("parallel_P_task_child_T3");

        reconciler.tick_once().await;
        let record = registry.query_status("parallel_P_task_child_T3").unwrap();
        assert!(!record.tmux_present);

        reconciler.tick_once().await;
        assert!(registry.query_status("parallel_P_task_child_T3").is_err());
        assert!(registry.parent_of("parallel_P_task_child_T3").is_none());
    }

    #[tokio::test]
    async fn test_tmux_error_treated_as_no_sessions() {
        let (tmux, registry, reconciler) = fixture();
        registry
            .register_relationship(
                "parallel_P_task_master",
                "parallel_P_task_child_T1",
                "T1",
                "P",
            )
            .unwrap();
        *tmux.installed.lock().unwrap() = false;

        reconciler.tick_once().await;
        reconciler.tick_once().await;

        // Two ticks of "no sessions" evicts everything
        assert!(registry.query_all().is_empty());
    }

    #[tokio::test]
    async fn test_roster_published() {
        let (tmux, _registry, reconciler) = fixture();
        tmux.add_session("parallel_P_task_child_T1", "/tmp");
        tmux.add_session("parallel_P_task_master", "/tmp");

        let roster = reconciler.roster();
        reconciler.tick_once().await;

        let published = roster.borrow();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].session_name, "parallel_P_task_child_T1");
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (tmux, registry, reconciler) = fixture();
        tmux.add_session("parallel_P_task_child_T9", "/tmp");

        let handle = reconciler.clone().start().unwrap();
        // Second start is a no-op while running
        assert!(reconciler.clone().start().is_none());

        // Wait for at least one tick
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.query_status("parallel_P_task_child_T9").is_ok());

        reconciler.stop();
        reconciler.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop within the tick period")
            .unwrap();
    }
}
