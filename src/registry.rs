//! Session registry — the in-memory source of truth.
//!
//! Owns the maps of sessions, relationships, and per-session message
//! queues. One mutex serializes every mutation; everything handed back to
//! callers is a value copy. Nothing here performs I/O.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::error::CoordinatorError;
use crate::model::{
    ChildInfo, Message, MessageType, RegistrySnapshot, Relationship, SessionRecord, SessionRole,
    SessionStatus, StatusNotification,
};
use crate::naming::{self, ParsedSession};

/// Bounds applied to message retention
#[derive(Debug, Clone)]
pub struct RegistryLimits {
    /// Per-session queue cap; oldest entries are dropped on overflow
    pub max_messages_per_session: usize,
    /// Messages older than this are removed by the sweep
    pub max_message_age_hours: i64,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_messages_per_session: 100,
            max_message_age_hours: 24,
        }
    }
}

/// Outcome of one reconciliation sync against the live tmux session set
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Sessions newly marked `tmux_present = false`
    pub marked_absent: Vec<String>,
    /// Sessions removed after two consecutive absent ticks
    pub evicted: Vec<String>,
    /// Sessions confirmed live this tick
    pub live: usize,
}

/// Cleanup plan collected when a session is marked for termination
#[derive(Debug, Clone)]
pub struct TerminationPlan {
    pub existed: bool,
    pub role: SessionRole,
    pub worktree_path: Option<PathBuf>,
    /// Child sessions of a master, to be cascade-removed in the registry
    pub children: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, SessionRecord>,
    relationships: HashMap<String, Relationship>,
    messages: HashMap<String, VecDeque<Message>>,
    /// Consecutive reconciliation ticks a session has been absent from tmux
    miss_counts: HashMap<String, u32>,
    last_sweep: DateTime<Utc>,
}

/// In-memory registry of sessions, relationships, and message queues
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    limits: RegistryLimits,
}

impl SessionRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                last_sweep: Utc::now(),
                ..RegistryState::default()
            }),
            limits,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        // Registry operations never perform I/O while holding the lock, so
        // a poisoned mutex can only come from a panic in pure map code.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ========== session materialization ==========

    fn make_record(name: &str, parsed: &ParsedSession, status: SessionStatus) -> SessionRecord {
        SessionRecord {
            session_name: name.to_string(),
            role: parsed.role(),
            project_id: parsed.project_id().unwrap_or_default().to_string(),
            task_id: parsed.task_id().map(str::to_string),
            status,
            progress: 0,
            details: String::new(),
            last_update: Utc::now(),
            worktree_path: None,
            branch: None,
            tmux_present: false,
        }
    }

    fn ensure_session(state: &mut RegistryState, name: &str, status: SessionStatus) {
        if !state.sessions.contains_key(name) {
            let parsed = naming::parse(name);
            state
                .sessions
                .insert(name.to_string(), Self::make_record(name, &parsed, status));
        }
        state.messages.entry(name.to_string()).or_default();
    }

    /// Insert (or refresh) the master record for a project. Used by the
    /// lifecycle controller after the tmux session is up.
    pub fn insert_master(&self, project_id: &str) -> Result<SessionRecord, CoordinatorError> {
        let name = naming::master_name(project_id)?;
        let mut state = self.lock();
        Self::ensure_session(&mut state, &name, SessionStatus::Started);
        let record = state
            .sessions
            .get_mut(&name)
            .ok_or_else(|| CoordinatorError::Internal(format!("missing record for {name}")))?;
        record.status = SessionStatus::Started;
        record.tmux_present = true;
        record.last_update = Utc::now();
        Ok(record.clone())
    }

    /// Insert the child record plus its relationship, auto-materializing
    /// the parent master record if absent.
    pub fn insert_child(
        &self,
        project_id: &str,
        task_id: &str,
        worktree_path: PathBuf,
        branch: String,
    ) -> Result<SessionRecord, CoordinatorError> {
        let parent = naming::master_name(project_id)?;
        let child = naming::child_name(project_id, task_id)?;

        let mut state = self.lock();
        Self::ensure_session(&mut state, &parent, SessionStatus::Started);
        Self::ensure_session(&mut state, &child, SessionStatus::Started);

        state.relationships.insert(
            child.clone(),
            Relationship {
                parent_session: parent,
                child_session: child.clone(),
                task_id: task_id.to_string(),
                project_id: project_id.to_string(),
                created_at: Utc::now(),
                active: true,
            },
        );

        let record = state
            .sessions
            .get_mut(&child)
            .ok_or_else(|| CoordinatorError::Internal(format!("missing record for {child}")))?;
        record.status = SessionStatus::Started;
        record.tmux_present = true;
        record.worktree_path = Some(worktree_path);
        record.branch = Some(branch);
        record.last_update = Utc::now();
        Ok(record.clone())
    }

    // ========== relationship management ==========

    /// Register a parent/child relationship.
    ///
    /// Idempotent when called again with the identical tuple; conflicts
    /// when the child is already bound elsewhere.
    pub fn register_relationship(
        &self,
        parent_session: &str,
        child_session: &str,
        task_id: &str,
        project_id: &str,
    ) -> Result<(), CoordinatorError> {
        let parent_info = naming::parse(parent_session);
        let child_info = naming::parse(child_session);

        let ParsedSession::Master {
            project_id: parent_project,
        } = parent_info
        else {
            return Err(CoordinatorError::InvalidArgument(format!(
                "parent must be a master session: {parent_session}"
            )));
        };
        let ParsedSession::Child {
            project_id: child_project,
            ..
        } = child_info
        else {
            return Err(CoordinatorError::InvalidArgument(format!(
                "child must be a child session: {child_session}"
            )));
        };
        if parent_project != child_project {
            return Err(CoordinatorError::InvalidArgument(format!(
                "project_id mismatch between parent and child: {parent_project} != {child_project}"
            )));
        }
        if parent_project != project_id {
            return Err(CoordinatorError::InvalidArgument(format!(
                "project_id mismatch: {parent_project} != {project_id}"
            )));
        }

        let mut state = self.lock();
        if let Some(existing) = state.relationships.get(child_session) {
            if existing.active
                && existing.parent_session == parent_session
                && existing.task_id == task_id
                && existing.project_id == project_id
            {
                debug!(child = %child_session, "Relationship already registered, no-op");
                return Ok(());
            }
            return Err(CoordinatorError::Conflict(format!(
                "child session already bound: {child_session} -> {}",
                existing.parent_session
            )));
        }

        Self::ensure_session(&mut state, parent_session, SessionStatus::Started);
        Self::ensure_session(&mut state, child_session, SessionStatus::Started);

        state.relationships.insert(
            child_session.to_string(),
            Relationship {
                parent_session: parent_session.to_string(),
                child_session: child_session.to_string(),
                task_id: task_id.to_string(),
                project_id: project_id.to_string(),
                created_at: Utc::now(),
                active: true,
            },
        );

        info!(parent = %parent_session, child = %child_session, task = %task_id, "Registered session relationship");
        Ok(())
    }

    /// Parent of a child session, if a relationship is registered
    pub fn parent_of(&self, child_session: &str) -> Option<String> {
        let state = self.lock();
        state
            .relationships
            .get(child_session)
            .filter(|r| r.active)
            .map(|r| r.parent_session.clone())
    }

    // ========== status management ==========

    /// Apply a status report, enforcing the transition table.
    ///
    /// A rejected transition leaves the stored status untouched. A report
    /// for an unregistered session creates its record with the reported
    /// status. Significant child transitions (Completed, Blocked, Error)
    /// enqueue a StatusUpdate message to the parent.
    pub fn upsert_session_status(
        &self,
        session_name: &str,
        status: SessionStatus,
        progress: u8,
        details: &str,
    ) -> Result<SessionRecord, CoordinatorError> {
        if progress > 100 {
            return Err(CoordinatorError::InvalidArgument(format!(
                "progress must be in [0, 100]: {progress}"
            )));
        }

        let mut state = self.lock();

        if let Some(current) = state.sessions.get(session_name) {
            if !current.status.can_transition_to(status) {
                warn!(
                    session = %session_name,
                    from = current.status.as_str(),
                    to = status.as_str(),
                    "Rejected illegal status transition"
                );
                return Err(CoordinatorError::Conflict(format!(
                    "illegal status transition for {session_name}: {} -> {}",
                    current.status.as_str(),
                    status.as_str()
                )));
            }
        } else {
            let parsed = naming::parse(session_name);
            state.sessions.insert(
                session_name.to_string(),
                Self::make_record(session_name, &parsed, status),
            );
        }

        let record = state
            .sessions
            .get_mut(session_name)
            .ok_or_else(|| CoordinatorError::Internal(format!("missing record for {session_name}")))?;
        record.status = status;
        record.progress = progress;
        record.details = details.to_string();
        record.last_update = Utc::now();
        let record = record.clone();

        // Route significant child transitions to the parent
        if record.role == SessionRole::Child
            && matches!(
                status,
                SessionStatus::Completed | SessionStatus::Blocked | SessionStatus::Error
            )
        {
            let parent = state
                .relationships
                .get(session_name)
                .filter(|r| r.active)
                .map(|r| r.parent_session.clone());
            if let Some(parent) = parent {
                let body = StatusNotification {
                    child_session: session_name.to_string(),
                    status,
                    progress,
                    details: details.to_string(),
                    timestamp: Utc::now(),
                };
                let content = serde_json::to_string(&body).map_err(|e| {
                    CoordinatorError::Internal(format!("failed to encode status notification: {e}"))
                })?;
                Self::push_message(
                    &mut state,
                    Message::new(session_name, &parent, MessageType::StatusUpdate, content),
                    self.limits.max_messages_per_session,
                );
            }
        }

        info!(
            session = %session_name,
            status = status.as_str(),
            progress,
            "Session status updated"
        );
        Ok(record)
    }

    // ========== queries ==========

    /// Value copy of one session record
    pub fn query_status(&self, session_name: &str) -> Result<SessionRecord, CoordinatorError> {
        let state = self.lock();
        state
            .sessions
            .get(session_name)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(format!("session not found: {session_name}")))
    }

    /// Value copies of all session records
    pub fn query_all(&self) -> HashMap<String, SessionRecord> {
        self.lock().sessions.clone()
    }

    /// Children of a master session, with computed health scores
    pub fn list_children(&self, parent_session: &str) -> Result<Vec<ChildInfo>, CoordinatorError> {
        let state = self.lock();
        if !state.sessions.contains_key(parent_session) {
            return Err(CoordinatorError::NotFound(format!(
                "parent session not found: {parent_session}"
            )));
        }

        let now = Utc::now();
        let mut children: Vec<ChildInfo> = state
            .relationships
            .values()
            .filter(|r| r.active && r.parent_session == parent_session)
            .map(|r| {
                let record = state.sessions.get(&r.child_session);
                ChildInfo {
                    session_name: r.child_session.clone(),
                    task_id: r.task_id.clone(),
                    status: record.map_or(SessionStatus::Unknown, |s| s.status),
                    progress: record.map_or(0, |s| s.progress),
                    details: record.map(|s| s.details.clone()).unwrap_or_default(),
                    last_update: record.map_or(now, |s| s.last_update),
                    health_score: record.map_or(0.5, |s| s.health_score(now)),
                }
            })
            .collect();
        children.sort_by(|a, b| a.session_name.cmp(&b.session_name));
        Ok(children)
    }

    // ========== termination ==========

    /// Mark a session Terminated and collect what cleanup it needs.
    ///
    /// Returns a plan even for unknown sessions (`existed = false`) so
    /// repeated termination stays a no-op success.
    pub fn mark_terminated(&self, session_name: &str) -> TerminationPlan {
        let mut state = self.lock();
        let Some(record) = state.sessions.get_mut(session_name) else {
            return TerminationPlan {
                existed: false,
                role: naming::parse(session_name).role(),
                worktree_path: None,
                children: Vec::new(),
            };
        };
        record.status = SessionStatus::Terminated;
        record.last_update = Utc::now();
        let role = record.role;
        let worktree_path = record.worktree_path.clone();

        let children = if role == SessionRole::Master {
            state
                .relationships
                .values()
                .filter(|r| r.parent_session == session_name)
                .map(|r| r.child_session.clone())
                .collect()
        } else {
            Vec::new()
        };

        TerminationPlan {
            existed: true,
            role,
            worktree_path,
            children,
        }
    }

    /// Remove a session, its relationship, and (for masters) all child
    /// records — registry-side only, never touching tmux.
    ///
    /// Returns the cascade-removed child session names.
    pub fn remove_session(&self, session_name: &str) -> Vec<String> {
        let mut state = self.lock();
        state.sessions.remove(session_name);
        state.relationships.remove(session_name);
        state.messages.remove(session_name);
        state.miss_counts.remove(session_name);

        let cascaded: Vec<String> = state
            .relationships
            .values()
            .filter(|r| r.parent_session == session_name)
            .map(|r| r.child_session.clone())
            .collect();
        for child in &cascaded {
            state.sessions.remove(child);
            state.relationships.remove(child);
            state.messages.remove(child);
            state.miss_counts.remove(child);
        }
        if !cascaded.is_empty() {
            info!(
                session = %session_name,
                count = cascaded.len(),
                "Cascade-removed child records from registry"
            );
        }
        cascaded
    }

    // ========== messaging ==========

    fn push_message(state: &mut RegistryState, message: Message, cap: usize) {
        let queue = state.messages.entry(message.to_session.clone()).or_default();
        queue.push_back(message);
        let mut dropped = 0;
        while queue.len() > cap {
            queue.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, cap, "Message queue overflow, dropped oldest entries");
        }
    }

    /// Append a message to the target's queue and return its id.
    ///
    /// Endpoints are not required to exist; the cap applies to the target
    /// queue only.
    pub fn enqueue_message(
        &self,
        from_session: &str,
        to_session: &str,
        message_type: MessageType,
        content: &str,
    ) -> Result<String, CoordinatorError> {
        if to_session.trim().is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "to_session cannot be empty".to_string(),
            ));
        }
        let message = Message::new(from_session, to_session, message_type, content.to_string());
        let id = message.message_id.clone();
        let mut state = self.lock();
        Self::push_message(&mut state, message, self.limits.max_messages_per_session);
        Ok(id)
    }

    /// Return all unread messages for a session, marking them read.
    /// Read messages stay queued until the sweep removes them.
    pub fn drain_unread(&self, session_name: &str) -> Vec<Message> {
        let mut state = self.lock();
        let Some(queue) = state.messages.get_mut(session_name) else {
            return Vec::new();
        };
        let mut drained = Vec::new();
        for message in queue.iter_mut() {
            if !message.read {
                message.read = true;
                drained.push(message.clone());
            }
        }
        drained
    }

    /// Remove messages older than the retention window
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::hours(self.limits.max_message_age_hours);
        let mut state = self.lock();
        let mut removed = 0;
        for queue in state.messages.values_mut() {
            let before = queue.len();
            queue.retain(|m| m.created_at > cutoff);
            removed += before - queue.len();
        }
        state.last_sweep = now;
        if removed > 0 {
            info!(removed, "Swept expired messages");
        }
        removed
    }

    // ========== reconciliation support ==========

    /// Diff the registry against the live tmux session set.
    ///
    /// Sessions absent from tmux are marked `tmux_present = false`; after
    /// two consecutive absent ticks they are removed together with their
    /// relationship.
    pub fn sync_with_live(&self, live: &HashSet<String>) -> SyncReport {
        let mut state = self.lock();
        let mut report = SyncReport::default();

        let names: Vec<String> = state.sessions.keys().cloned().collect();
        for name in names {
            if live.contains(&name) {
                if let Some(record) = state.sessions.get_mut(&name) {
                    record.tmux_present = true;
                }
                state.miss_counts.insert(name, 0);
                report.live += 1;
            } else {
                let misses = state.miss_counts.entry(name.clone()).or_insert(0);
                *misses += 1;
                let misses = *misses;
                if let Some(record) = state.sessions.get_mut(&name) {
                    if record.tmux_present {
                        report.marked_absent.push(name.clone());
                    }
                    record.tmux_present = false;
                }
                if misses >= 2 {
                    state.sessions.remove(&name);
                    state.relationships.remove(&name);
                    state.messages.remove(&name);
                    state.miss_counts.remove(&name);
                    report.evicted.push(name);
                }
            }
        }

        // A child record always implies a master record; re-materialize a
        // stub if eviction just broke that.
        let missing_masters: Vec<String> = state
            .sessions
            .values()
            .filter(|r| r.role == SessionRole::Child)
            .filter_map(|r| {
                naming::master_name(&r.project_id)
                    .ok()
                    .filter(|m| !state.sessions.contains_key(m))
            })
            .collect();
        for master in missing_masters {
            let parsed = naming::parse(&master);
            Self::ensure_session(&mut state, &master, SessionStatus::Unknown);
            debug!(session = %master, role = ?parsed.role(), "Re-materialized master stub");
        }

        report
    }

    /// Adopt an externally created tmux session as an Unknown-status stub.
    ///
    /// Only names matching the grammar are adopted. Child adoption also
    /// materializes the master stub and relationship. Returns false when
    /// the session is already registered.
    pub fn adopt_session(&self, session_name: &str) -> Result<bool, CoordinatorError> {
        let parsed = naming::parse(session_name);
        if parsed == ParsedSession::Unknown {
            return Err(CoordinatorError::InvalidArgument(format!(
                "session name does not match the grammar: {session_name}"
            )));
        }

        let mut state = self.lock();
        if state.sessions.contains_key(session_name) {
            return Ok(false);
        }

        let mut record = Self::make_record(session_name, &parsed, SessionStatus::Unknown);
        record.tmux_present = true;
        state.sessions.insert(session_name.to_string(), record);
        state.messages.entry(session_name.to_string()).or_default();
        state.miss_counts.insert(session_name.to_string(), 0);

        if let ParsedSession::Child {
            project_id,
            task_id,
        } = &parsed
        {
            let parent = naming::master_name(project_id)?;
            Self::ensure_session(&mut state, &parent, SessionStatus::Unknown);
            state
                .relationships
                .entry(session_name.to_string())
                .or_insert_with(|| Relationship {
                    parent_session: parent,
                    child_session: session_name.to_string(),
                    task_id: task_id.clone(),
                    project_id: project_id.clone(),
                    created_at: Utc::now(),
                    active: true,
                });
        }

        info!(session = %session_name, "Adopted externally created session");
        Ok(true)
    }

    /// Consistent full-state copy for diagnostics
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.lock();
        let total_messages = state.messages.values().map(VecDeque::len).sum();
        let unread_messages = state
            .messages
            .values()
            .flat_map(|q| q.iter())
            .filter(|m| !m.read)
            .count();
        RegistrySnapshot {
            sessions: state.sessions.clone(),
            relationships: state.relationships.clone(),
            total_messages,
            unread_messages,
            last_sweep: state.last_sweep,
        }
    }
}
