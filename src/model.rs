//! Data model for the session coordinator.
//!
//! Sessions, relationships, and inter-session messages, plus the status
//! state machine and health scoring. All types returned to callers are
//! value copies — nothing here hands out references into registry state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a session within a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Master,
    Child,
    Unknown,
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Unknown,
    Starting,
    Started,
    Working,
    Blocked,
    Error,
    Completed,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Unknown => "UNKNOWN",
            SessionStatus::Starting => "STARTING",
            SessionStatus::Started => "STARTED",
            SessionStatus::Working => "WORKING",
            SessionStatus::Blocked => "BLOCKED",
            SessionStatus::Error => "ERROR",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Terminated => "TERMINATED",
        }
    }

    /// Whether a transition from `self` to `next` is allowed.
    ///
    /// Terminated is frozen. Working may repeat (progress updates); no
    /// other state transitions to itself.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::{
            Blocked, Completed, Error, Started, Starting, Terminated, Unknown, Working,
        };
        match self {
            Unknown => matches!(next, Starting | Started | Working | Terminated),
            Starting => matches!(next, Started | Error | Terminated),
            Started | Working => {
                matches!(next, Working | Blocked | Error | Completed | Terminated)
            }
            Blocked => matches!(next, Working | Error | Completed | Terminated),
            Error => matches!(next, Starting | Working | Terminated),
            Completed => matches!(next, Working | Terminated),
            Terminated => false,
        }
    }

    /// Baseline health contribution of this status
    fn base_health(&self) -> f64 {
        match self {
            SessionStatus::Working | SessionStatus::Completed => 1.0,
            SessionStatus::Started => 0.8,
            SessionStatus::Unknown | SessionStatus::Starting => 0.5,
            SessionStatus::Blocked => 0.3,
            SessionStatus::Error => 0.1,
            SessionStatus::Terminated => 0.0,
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(SessionStatus::Unknown),
            "STARTING" => Ok(SessionStatus::Starting),
            "STARTED" => Ok(SessionStatus::Started),
            "WORKING" => Ok(SessionStatus::Working),
            "BLOCKED" => Ok(SessionStatus::Blocked),
            "ERROR" => Ok(SessionStatus::Error),
            "COMPLETED" => Ok(SessionStatus::Completed),
            "TERMINATED" => Ok(SessionStatus::Terminated),
            other => Err(format!("invalid status value: {other}")),
        }
    }
}

/// Type tag carried by inter-session messages; content is opaque
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    StatusUpdate,
    TaskCompleted,
    Instruction,
    Query,
    Response,
    Error,
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STATUS_UPDATE" => Ok(MessageType::StatusUpdate),
            "TASK_COMPLETED" => Ok(MessageType::TaskCompleted),
            "INSTRUCTION" => Ok(MessageType::Instruction),
            "QUERY" => Ok(MessageType::Query),
            "RESPONSE" => Ok(MessageType::Response),
            "ERROR" => Ok(MessageType::Error),
            other => Err(format!("invalid message type: {other}")),
        }
    }
}

/// Authoritative record for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_name: String,
    pub role: SessionRole,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub status: SessionStatus,
    pub progress: u8,
    pub details: String,
    pub last_update: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub tmux_present: bool,
}

impl SessionRecord {
    /// Health score in [0, 1]: status baseline scaled by a staleness
    /// factor that decays linearly to 0.2 over 60 minutes past
    /// `last_update`.
    pub fn health_score(&self, now: DateTime<Utc>) -> f64 {
        let base = self.status.base_health();
        let stale_minutes = (now - self.last_update).num_seconds().max(0) as f64 / 60.0;
        let staleness = (1.0 - 0.8 * (stale_minutes / 60.0)).max(0.2);
        (base * staleness).clamp(0.0, 1.0)
    }
}

/// Parent/child link; at most one active relationship per child
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub parent_session: String,
    pub child_session: String,
    pub task_id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

/// Inter-session message; endpoints need not exist in the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub from_session: String,
    pub to_session: String,
    pub message_type: MessageType,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    pub fn new(from: &str, to: &str, message_type: MessageType, content: String) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            from_session: from.to_string(),
            to_session: to.to_string(),
            message_type,
            content,
            created_at: Utc::now(),
            read: false,
        }
    }
}

/// JSON body of the StatusUpdate message routed to a parent when a child
/// reaches a significant status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusNotification {
    pub child_session: String,
    pub status: SessionStatus,
    pub progress: u8,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

/// Child entry returned by `list_children`, with computed health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildInfo {
    pub session_name: String,
    pub task_id: String,
    pub status: SessionStatus,
    pub progress: u8,
    pub details: String,
    pub last_update: DateTime<Utc>,
    pub health_score: f64,
}

/// Consistent full-state copy for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub sessions: HashMap<String, SessionRecord>,
    pub relationships: HashMap<String, Relationship>,
    pub total_messages: usize,
    pub unread_messages: usize,
    pub last_sweep: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_fsm_allows_documented_transitions() {
        use SessionStatus::*;
        assert!(Unknown.can_transition_to(Starting));
        assert!(Unknown.can_transition_to(Started));
        assert!(Unknown.can_transition_to(Working));
        assert!(Unknown.can_transition_to(Terminated));
        assert!(Starting.can_transition_to(Started));
        assert!(Starting.can_transition_to(Error));
        assert!(Started.can_transition_to(Completed));
        assert!(Working.can_transition_to(Working));
        assert!(Blocked.can_transition_to(Working));
        assert!(Error.can_transition_to(Starting));
        assert!(Completed.can_transition_to(Working));
    }

    #[test]
    fn test_fsm_rejects_illegal_transitions() {
        use SessionStatus::*;
        assert!(!Unknown.can_transition_to(Blocked));
        assert!(!Unknown.can_transition_to(Completed));
        assert!(!Starting.can_transition_to(Working));
        assert!(!Started.can_transition_to(Starting));
        assert!(!Blocked.can_transition_to(Blocked));
        assert!(!Error.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Blocked));
        // Terminated is frozen
        for next in [
            Unknown, Starting, Started, Working, Blocked, Error, Completed, Terminated,
        ] {
            assert!(!Terminated.can_transition_to(next));
        }
    }

    #[test]
    fn test_status_round_trip_str() {
        for status in [
            SessionStatus::Unknown,
            SessionStatus::Working,
            SessionStatus::Terminated,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert_eq!(
            "working".parse::<SessionStatus>().unwrap(),
            SessionStatus::Working
        );
        assert!("BUSY".parse::<SessionStatus>().is_err());
    }

    fn record_with(status: SessionStatus, age_minutes: i64) -> SessionRecord {
        SessionRecord {
            session_name: "parallel_P_task_child_T".to_string(),
            role: SessionRole::Child,
            project_id: "P".to_string(),
            task_id: Some("T".to_string()),
            status,
            progress: 0,
            details: String::new(),
            last_update: Utc::now() - Duration::minutes(age_minutes),
            worktree_path: None,
            branch: None,
            tmux_present: true,
        }
    }

    #[test]
    fn test_health_score_fresh() {
        let now = Utc::now();
        assert!((record_with(SessionStatus::Working, 0).health_score(now) - 1.0).abs() < 0.01);
        assert!((record_with(SessionStatus::Started, 0).health_score(now) - 0.8).abs() < 0.01);
        assert!((record_with(SessionStatus::Error, 0).health_score(now) - 0.1).abs() < 0.01);
        assert_eq!(record_with(SessionStatus::Terminated, 0).health_score(now), 0.0);
    }

    #[test]
    fn test_health_score_staleness_floor() {
        let now = Utc::now();
        // Past 60 minutes the staleness factor bottoms out at 0.2
        let stale = record_with(SessionStatus::Working, 120).health_score(now);
        assert!((stale - 0.2).abs() < 0.01);
        // Halfway decayed at 30 minutes
        let halfway = record_with(SessionStatus::Working, 30).health_score(now);
        assert!((halfway - 0.6).abs() < 0.02);
    }

    #[test]
    fn test_message_type_parse() {
        assert_eq!(
            "STATUS_UPDATE".parse::<MessageType>().unwrap(),
            MessageType::StatusUpdate
        );
        assert_eq!(
            "instruction".parse::<MessageType>().unwrap(),
            MessageType::Instruction
        );
        assert!("PING".parse::<MessageType>().is_err());
    }
}
