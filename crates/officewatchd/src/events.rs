use chrono::{DateTime, Utc};
use officewatch_core::{IdentityId, Transition, TransitionKind};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    Entered,
    Exited,
}

impl PresenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceKind::Entered => "entered",
            PresenceKind::Exited => "exited",
        }
    }
}

impl From<TransitionKind> for PresenceKind {
    fn from(kind: TransitionKind) -> Self {
        match kind {
            TransitionKind::Entered => PresenceKind::Entered,
            TransitionKind::Exited => PresenceKind::Exited,
        }
    }
}

/// An entry or exit that was committed to the attendance store.
///
/// Delivery is at-least-once from the consumer's point of view: a transition whose
/// store write is retried may surface again after a restart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEvent {
    pub kind: PresenceKind,
    pub identity_id: IdentityId,
    pub display_name: Option<String>,
    pub at: DateTime<Utc>,
    pub session_id: Option<i64>,
    /// Whole seconds between entry and exit; set on exits that closed a session.
    pub stayed_secs: Option<i64>,
}

impl PresenceEvent {
    pub fn from_transition(transition: &Transition, display_name: Option<String>) -> Self {
        Self {
            kind: transition.kind.into(),
            identity_id: transition.identity_id,
            display_name,
            at: transition.at,
            session_id: transition.session.as_ref().map(|s| s.id),
            stayed_secs: transition
                .session
                .as_ref()
                .and_then(|s| s.duration())
                .map(|d| d.num_seconds()),
        }
    }

    /// Display name, or `#<id>` when the directory had none.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| format!("#{}", self.identity_id))
    }
}

impl fmt::Display for PresenceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} has {} the office", self.label(), self.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use officewatch_core::{AttendanceSession, SessionStatus};

    fn transition(kind: TransitionKind) -> Transition {
        Transition {
            kind,
            identity_id: 3,
            at: Utc::now(),
            session: None,
        }
    }

    #[test]
    fn test_display_messages() {
        let entered = PresenceEvent::from_transition(
            &transition(TransitionKind::Entered),
            Some("Alice".into()),
        );
        assert_eq!(entered.to_string(), "Alice has entered the office");

        let exited = PresenceEvent::from_transition(&transition(TransitionKind::Exited), None);
        assert_eq!(exited.to_string(), "#3 has exited the office");
        assert_eq!(exited.session_id, None);
    }

    #[test]
    fn test_serializes_lowercase_kind() {
        let event = PresenceEvent::from_transition(&transition(TransitionKind::Entered), None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "entered");
        assert_eq!(json["identity_id"], 3);
        assert!(json["display_name"].is_null());
        assert!(json["stayed_secs"].is_null());
    }

    #[test]
    fn test_exit_reports_time_inside() {
        let entry = Utc::now() - chrono::TimeDelta::minutes(42);
        let mut exit = transition(TransitionKind::Exited);
        exit.session = Some(AttendanceSession {
            id: 11,
            identity_id: 3,
            entry_time: entry,
            exit_time: Some(entry + chrono::TimeDelta::minutes(42)),
            status: SessionStatus::Exited,
            date: entry.date_naive(),
            action: "Unknown".into(),
        });
        let event = PresenceEvent::from_transition(&exit, Some("Bob".into()));
        assert_eq!(event.session_id, Some(11));
        assert_eq!(event.stayed_secs, Some(42 * 60));

        let entered = PresenceEvent::from_transition(&transition(TransitionKind::Entered), None);
        assert_eq!(entered.stayed_secs, None);
    }
}
