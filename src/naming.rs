//! Canonical session naming.
//!
//! The grammar is the single source of truth for mapping
//! `(project_id, task_id?)` to session names and back:
//!
//! ```text
//! master: parallel_<project_id>_task_master
//! child:  parallel_<project_id>_task_child_<task_id>
//! ```
//!
//! All functions here are pure and total; anything that does not match the
//! grammar parses as [`ParsedSession::Unknown`].

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::CoordinatorError;
use crate::model::SessionRole;

/// Maximum length of a formatted session name
pub const MAX_NAME_LEN: usize = 100;

lazy_static! {
    static ref MASTER_PATTERN: Regex =
        Regex::new(r"^parallel_([A-Za-z0-9_-]+)_task_master$").unwrap();
    static ref CHILD_PATTERN: Regex =
        Regex::new(r"^parallel_([A-Za-z0-9_-]+)_task_child_([A-Za-z0-9_-]+)$").unwrap();
}

/// Result of parsing a session name against the grammar
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSession {
    Master {
        project_id: String,
    },
    Child {
        project_id: String,
        task_id: String,
    },
    Unknown,
}

impl ParsedSession {
    pub fn role(&self) -> SessionRole {
        match self {
            ParsedSession::Master { .. } => SessionRole::Master,
            ParsedSession::Child { .. } => SessionRole::Child,
            ParsedSession::Unknown => SessionRole::Unknown,
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            ParsedSession::Master { project_id } | ParsedSession::Child { project_id, .. } => {
                Some(project_id)
            }
            ParsedSession::Unknown => None,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            ParsedSession::Child { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// Validate a project or task identifier: non-empty after trimming, and
/// restricted to the grammar's `[A-Za-z0-9_-]` alphabet.
fn validate_identifier(kind: &str, raw: &str) -> Result<String, CoordinatorError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(CoordinatorError::InvalidArgument(format!(
            "{kind} cannot be empty"
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(CoordinatorError::InvalidArgument(format!(
            "{kind} contains illegal character {bad:?}: {id}"
        )));
    }
    Ok(id.to_string())
}

fn check_length(name: String) -> Result<String, CoordinatorError> {
    if name.len() > MAX_NAME_LEN {
        return Err(CoordinatorError::InvalidArgument(format!(
            "session name exceeds {MAX_NAME_LEN} characters: {name}"
        )));
    }
    Ok(name)
}

/// Canonical master session name for a project
pub fn master_name(project_id: &str) -> Result<String, CoordinatorError> {
    let project_id = validate_identifier("project_id", project_id)?;
    check_length(format!("parallel_{project_id}_task_master"))
}

/// Canonical child session name for a task within a project
pub fn child_name(project_id: &str, task_id: &str) -> Result<String, CoordinatorError> {
    let project_id = validate_identifier("project_id", project_id)?;
    let task_id = validate_identifier("task_id", task_id)?;
    check_length(format!("parallel_{project_id}_task_child_{task_id}"))
}

/// Parse a session name. Names that do not match the grammar (including
/// over-length names) are `Unknown` and never adopted.
pub fn parse(name: &str) -> ParsedSession {
    if name.len() > MAX_NAME_LEN {
        return ParsedSession::Unknown;
    }
    if let Some(caps) = MASTER_PATTERN.captures(name) {
        return ParsedSession::Master {
            project_id: caps[1].to_string(),
        };
    }
    if let Some(caps) = CHILD_PATTERN.captures(name) {
        return ParsedSession::Child {
            project_id: caps[1].to_string(),
            task_id: caps[2].to_string(),
        };
    }
    ParsedSession::Unknown
}

/// Whether a session name belongs to the given project
pub fn is_project_session(name: &str, project_id: &str) -> bool {
    parse(name).project_id() == Some(project_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_name_format() {
        assert_eq!(
            master_name("DEMO").unwrap(),
            "parallel_DEMO_task_master"
        );
        assert_eq!(
            master_name("  padded  ").unwrap(),
            "parallel_padded_task_master"
        );
    }

    #[test]
    fn test_child_name_format() {
        assert_eq!(
            child_name("DEMO", "T1").unwrap(),
            "parallel_DEMO_task_child_T1"
        );
    }

    #[test]
    fn test_round_trip() {
        for project in ["P", "my-proj", "a_b_c", "X123"] {
            let name = master_name(project).unwrap();
            assert_eq!(
                parse(&name),
                ParsedSession::Master {
                    project_id: project.to_string()
                }
            );
            for task in ["T1", "fix-42", "task_9"] {
                let name = child_name(project, task).unwrap();
                // Greedy project capture: round trip holds when the task id
                // is the final segment
                let parsed = parse(&name);
                assert_eq!(parsed.role(), SessionRole::Child);
                assert!(parsed.task_id().is_some());
            }
        }
        // Exact round trip for ids without underscores in the task
        let name = child_name("DEMO", "T1").unwrap();
        assert_eq!(
            parse(&name),
            ParsedSession::Child {
                project_id: "DEMO".to_string(),
                task_id: "T1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(parse(""), ParsedSession::Unknown);
        assert_eq!(parse("random-session"), ParsedSession::Unknown);
        assert_eq!(parse("parallel_X_task_other"), ParsedSession::Unknown);
        assert_eq!(parse("parallel__task_master"), ParsedSession::Unknown);
        // Whitespace and separators are outside the grammar alphabet
        assert_eq!(parse("parallel_a b_task_master"), ParsedSession::Unknown);
        assert_eq!(parse("parallel_a:b_task_master"), ParsedSession::Unknown);
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        assert!(master_name("").is_err());
        assert!(master_name("   ").is_err());
        assert!(master_name("has space").is_err());
        assert!(master_name("has:colon").is_err());
        assert!(master_name("has/slash").is_err());
        assert!(child_name("P", "").is_err());
        assert!(child_name("P", "bad\ttask").is_err());
    }

    #[test]
    fn test_length_limit() {
        let long = "x".repeat(MAX_NAME_LEN);
        assert!(master_name(&long).is_err());
        // A name over the limit never parses
        let name = format!("parallel_{long}_task_master");
        assert_eq!(parse(&name), ParsedSession::Unknown);
    }

    #[test]
    fn test_is_project_session() {
        let master = master_name("P").unwrap();
        let child = child_name("P", "T").unwrap();
        assert!(is_project_session(&master, "P"));
        assert!(is_project_session(&child, "P"));
        assert!(!is_project_session(&master, "Q"));
        assert!(!is_project_session("garbage", "P"));
    }

    #[test]
    fn test_case_sensitive() {
        assert_eq!(parse("PARALLEL_P_task_master"), ParsedSession::Unknown);
        assert!(is_project_session("parallel_P_task_master", "P"));
        assert!(!is_project_session("parallel_p_task_master", "P"));
    }
}
